use std::ptr::NonNull;

/// Word size of this allocator in bytes. Boundary tags and free list links are
/// one word wide regardless of the machine pointer size, see
/// [`crate::block::Link`] for why that matters.
pub(crate) const WSIZE: usize = 4;

/// Double word size in bytes. Every payload address is aligned to this value
/// and every block pays exactly this much in tags (header + footer).
pub(crate) const DSIZE: usize = 8;

/// Low bits of a tag that don't belong to the size. Sizes are always multiples
/// of [`DSIZE`], so the 3 lowest bits are free to hold flags, and we only need
/// one of them.
const FLAGS_MASK: u32 = 0x7;

/// Allocated flag.
const ALLOCATED: u32 = 0x1;

/// Boundary tag. Every block starts with one of these (the header) and ends
/// with an identical copy (the footer):
///
/// ```text
///              +---------------------------+
/// header   ->  | size (29 bits) | 0 0 | a  |  <- 4 bytes
///              +---------------------------+
/// payload  ->  |                           |
///              |         ........          |
///              |                           |
///              +---------------------------+
/// footer   ->  | size (29 bits) | 0 0 | a  |  <- 4 bytes
///              +---------------------------+
/// ```
///
/// The size includes both tags. Having the footer means that given any block
/// we can read the word right above its header and obtain the size of the
/// previous block, so we can walk the heap backwards without storing any
/// pointers. That's what makes coalescing constant time.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(transparent)]
pub(crate) struct Tag(u32);

impl Tag {
    /// Zero sized, allocated. Marks the end of the heap so that the last
    /// block never tries to merge with whatever comes after it.
    pub const EPILOGUE: Self = Self::pack(0, true);

    /// Packs `size` and the allocated bit into one word. `size` must be a
    /// multiple of [`DSIZE`] and fit in 32 bits, see
    /// [`crate::block::MAX_BLOCK_SIZE`].
    #[inline]
    pub const fn pack(size: usize, allocated: bool) -> Self {
        debug_assert!(size % DSIZE == 0);
        debug_assert!(size <= u32::MAX as usize);

        Self(size as u32 | if allocated { ALLOCATED } else { 0 })
    }

    /// Block size in bytes, tags included.
    #[inline]
    pub const fn size(self) -> usize {
        (self.0 & !FLAGS_MASK) as usize
    }

    #[inline]
    pub const fn is_allocated(self) -> bool {
        self.0 & ALLOCATED != 0
    }

    /// Reads the tag stored at `address`.
    ///
    /// # Safety
    ///
    /// `address` must be valid for reads of [`WSIZE`] bytes and 4-aligned.
    /// All tag locations inside the heap are, because payloads are
    /// [`DSIZE`]-aligned and tags sit at `payload - 4` and
    /// `payload + size - 8`.
    #[inline]
    pub unsafe fn read(address: NonNull<u8>) -> Self {
        Self(read_word(address))
    }

    /// Writes this tag at `address`. Same requirements as [`Tag::read`].
    #[inline]
    pub unsafe fn write(self, address: NonNull<u8>) {
        write_word(address, self.0);
    }
}

/// Reads one word at `address`.
#[inline]
pub(crate) unsafe fn read_word(address: NonNull<u8>) -> u32 {
    address.as_ptr().cast::<u32>().read()
}

/// Writes one word at `address`.
#[inline]
pub(crate) unsafe fn write_word(address: NonNull<u8>, value: u32) {
    address.as_ptr().cast::<u32>().write(value)
}
