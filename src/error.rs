/// Errors returned by [`crate::Heap`] operations. Nothing here is retried
/// internally, and none of them leave the heap in a different state than it
/// was before the failed call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AllocError {
    /// The growth provider refused to extend the heap.
    #[error("out of memory: heap cannot grow by {requested} bytes")]
    OutOfMemory { requested: usize },

    /// The request plus tags and alignment doesn't fit in a block.
    #[error("requested size overflows the maximum block size")]
    SizeOverflow,

    /// Deallocation of an address that is not the payload of a block.
    #[error("invalid free of {address:#x}: not a block allocated by this heap")]
    InvalidFree { address: usize },

    /// Deallocation of a block that is already free.
    #[error("double free of {address:#x}")]
    DoubleFree { address: usize },

    /// Alignment is not a power of two.
    #[error("invalid alignment {align}: must be a power of two")]
    InvalidAlignment { align: usize },
}
