use std::ptr::NonNull;

use crate::block::Block;

/// This is used to carry realloc metadata around the code as we don't want to
/// pass the same parameters over and over again. Built after validating the
/// source block, see [`crate::Heap::reallocate`] and
/// [`crate::Heap::reallocate_aligned`].
pub(crate) struct Realloc {
    /// Source block, or the block whose contents we are trying to reallocate.
    pub block: Block,
    /// Current user pointer. This is located somewhere in the payload of
    /// `block`, depends on alignment.
    pub address: NonNull<u8>,
    /// Bytes that can be read at `address` before the end of the payload.
    pub old_size: usize,
    /// Bytes requested by the caller.
    pub new_size: usize,
    pub method: ReallocMethod,
}

/// Whether the new allocation is smaller than what the old one can hold.
/// Same size counts as growing, everything gets copied either way.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ReallocMethod {
    Shrink,
    Grow,
}

impl Realloc {
    /// Caller must ensure that `block` is an allocated block and `address`
    /// points into its payload.
    pub unsafe fn new(block: Block, address: NonNull<u8>, new_size: usize) -> Self {
        let payload_end = block.payload().as_ptr() as usize + block.payload_size();
        let old_size = payload_end - address.as_ptr() as usize;

        let method = if new_size < old_size {
            ReallocMethod::Shrink
        } else {
            ReallocMethod::Grow
        };

        Self {
            block,
            address,
            old_size,
            new_size,
            method,
        }
    }

    /// Number of bytes that should be copied from the previous allocation. If
    /// we are shrinking, we only need to copy enough bytes to fill the new
    /// allocation, otherwise we'll copy everything the old one could hold.
    pub fn count(&self) -> usize {
        match self.method {
            ReallocMethod::Shrink => self.new_size,
            ReallocMethod::Grow => self.old_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::DSIZE;

    #[test]
    fn count_depends_on_method() {
        let mut words = [0u64; 8];
        let base = NonNull::new(words.as_mut_ptr().cast::<u8>()).unwrap();

        unsafe {
            let block = Block::from_payload(NonNull::new_unchecked(base.as_ptr().add(DSIZE)));
            block.encode(48, true);

            let shrink = Realloc::new(block, block.payload(), 10);
            assert_eq!(shrink.method, ReallocMethod::Shrink);
            assert_eq!(shrink.old_size, 40);
            assert_eq!(shrink.count(), 10);

            let grow = Realloc::new(block, block.payload(), 100);
            assert_eq!(grow.method, ReallocMethod::Grow);
            assert_eq!(grow.count(), 40);

            // User pointer moved forward by an alignment offset.
            let inner = NonNull::new_unchecked(block.payload().as_ptr().add(16));
            let aligned = Realloc::new(block, inner, 64);
            assert_eq!(aligned.old_size, 24);
            assert_eq!(aligned.count(), 24);
            assert_eq!(aligned.block, block);
            assert_eq!(aligned.address, inner);
        }
    }
}
