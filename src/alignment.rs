//! Support for alignments bigger than the double word. Every payload returned
//! by [`Heap::allocate`] is 8-aligned, which is enough for almost everything,
//! but [`std::alloc::GlobalAlloc`] callers can ask for any power of two. See
//! [`BackPointer`] to understand how we deal with this.

use std::ptr::{self, NonNull};

use crate::{
    block::{Block, Link},
    error::AllocError,
    event::Event,
    header::{DSIZE, WSIZE},
    heap::{Heap, FIRST_BLOCK},
    realloc::Realloc,
    region::GrowHeap,
    AllocResult,
};

/// This is needed to satisfy alignment constraints. Quick reminder of how
/// memory alignment works: an address A is N-aligned if A is a multiple of N,
/// where N is a power of 2. Payload addresses are always 8-aligned because
/// the heap starts at an 8-aligned address and every block size is a multiple
/// of 8, so requests with alignment 8 or less need nothing special.
///
/// For bigger alignments we allocate `size + align` bytes and return an
/// address inside the payload. Suppose we need 96 bytes aligned to 32 and we
/// got this block:
///
/// ```text
///            payload (40)         user address (64)
///                 |                      |
///                 v                      v
/// +--------+------+---------------+------+-------------------------+--------+
/// | Header | ...  |               | Back |  96 bytes               | Footer |
/// +--------+------+---------------+------+-------------------------+--------+
///                 <----------- 24 ------->
/// ```
///
/// The payload address is 40 in decimal, so to make it 32-aligned we add 24
/// bytes, which gives us the address 64. This address can fit 96 bytes for
/// sure because the block can fit 96 + 32 in total. Starting at an 8-aligned
/// address `A`, the padding is always `8 * P` bytes where P is in the range
/// `1..=(align / 8)`. If the payload is already 32-aligned we skip to the next
/// aligned address, because the 4 bytes right below the user address must be
/// ours: that's where the back pointer goes. The back pointer is a [`Link`] to
/// the block, the same offset representation used by the free lists.
///
/// Callers give us the alignment again when deallocating (that's part of the
/// [`std::alloc::GlobalAlloc`] contract), so we know that all alignments
/// greater than 8 contain a back pointer and the rest don't.
pub(crate) type BackPointer = Link;

/// Padding added to the 8-aligned `payload` to reach the next `align`-aligned
/// address strictly above it. `align` must be a power of two greater than 8.
#[inline]
pub(crate) fn padding_for(payload: usize, align: usize) -> usize {
    align - (payload & (align - 1))
}

impl<G: GrowHeap> Heap<G> {
    /// Like [`Heap::allocate`] but the returned address is a multiple of
    /// `align`, which must be a power of two.
    pub fn allocate_aligned(&mut self, size: usize, align: usize) -> AllocResult {
        if !align.is_power_of_two() {
            return Err(AllocError::InvalidAlignment { align });
        }

        if align <= DSIZE {
            return self.allocate(size);
        }

        if size == 0 {
            return Ok(None);
        }

        let padded = size.checked_add(align).ok_or(AllocError::SizeOverflow)?;

        let Some(payload) = self.allocate(padded)? else {
            return Ok(None);
        };

        unsafe {
            let block = Block::from_payload(payload);
            let padding = padding_for(payload.as_ptr() as usize, align);
            let address = NonNull::new_unchecked(payload.as_ptr().add(padding));

            let origin = self.origin().unwrap_unchecked();
            BackPointer::encode(origin, Some(block)).write(back_pointer_slot(address));

            self.record(Event::AllocatedAligned {
                size,
                align,
                address: address.as_ptr() as usize,
            });

            Ok(Some(address))
        }
    }

    /// Deallocates an address returned by [`Heap::allocate_aligned`] with the
    /// same `align`.
    ///
    /// # Safety
    ///
    /// `address` must be null or a live allocation of this heap made with
    /// `align`.
    pub unsafe fn deallocate_aligned(
        &mut self,
        address: *mut u8,
        align: usize,
    ) -> Result<(), AllocError> {
        if align <= DSIZE {
            return self.deallocate(address);
        }

        let Some(address) = NonNull::new(address) else {
            return Ok(());
        };

        let block = self.follow_back_pointer(address, align)?;

        self.deallocate(block.payload().as_ptr())
    }

    /// Reallocation that keeps the alignment. Same rules as
    /// [`Heap::reallocate`] otherwise.
    ///
    /// # Safety
    ///
    /// Same as [`Heap::deallocate_aligned`].
    pub unsafe fn reallocate_aligned(
        &mut self,
        address: *mut u8,
        align: usize,
        size: usize,
    ) -> AllocResult {
        if align <= DSIZE {
            return self.reallocate(address, size);
        }

        let Some(address) = NonNull::new(address) else {
            return self.allocate_aligned(size, align);
        };

        if size == 0 {
            self.deallocate_aligned(address.as_ptr(), align)?;
            return Ok(None);
        }

        let block = self.follow_back_pointer(address, align)?;
        let realloc = Realloc::new(self.validate(block.payload())?, address, size);

        let new_address = self.allocate_aligned(size, align)?;

        if let Some(new_address) = new_address {
            ptr::copy_nonoverlapping(
                realloc.address.as_ptr(),
                new_address.as_ptr(),
                realloc.count(),
            );
        }

        self.deallocate(realloc.block.payload().as_ptr())?;

        Ok(new_address)
    }

    /// Reads the back pointer stored below `address` and checks that it leads
    /// to a block whose payload starts at most `align` bytes before it.
    unsafe fn follow_back_pointer(
        &mut self,
        address: NonNull<u8>,
        align: usize,
    ) -> Result<Block, AllocError> {
        let addr = address.as_ptr() as usize;
        let invalid = AllocError::InvalidFree { address: addr };

        let Some(origin) = self.origin() else {
            return Err(invalid);
        };

        // The slot has to be inside some payload, past the first block start.
        let start = origin.as_ptr() as usize + FIRST_BLOCK + DSIZE;
        let end = origin.as_ptr() as usize + self.heap_size();

        if addr < start || addr >= end || addr & (align - 1) != 0 {
            return Err(self.reject(invalid, "not an aligned allocation of this heap"));
        }

        let link = BackPointer::read(back_pointer_slot(address));
        let block = if link.offset() < self.heap_size() {
            link.decode(origin)
        } else {
            None
        };

        match block {
            Some(block)
                if (block.payload().as_ptr() as usize) < addr
                    && addr - block.payload().as_ptr() as usize <= align =>
            {
                Ok(block)
            }
            _ => Err(self.reject(invalid, "corrupted back pointer")),
        }
    }
}

/// Where the back pointer of an aligned `address` lives.
#[inline]
unsafe fn back_pointer_slot(address: NonNull<u8>) -> NonNull<u8> {
    NonNull::new_unchecked(address.as_ptr().sub(WSIZE))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Config;

    fn heap() -> Heap {
        Heap::with_config(Config::new().with_arena_capacity(1 << 20))
    }

    #[test]
    fn padding() {
        assert_eq!(padding_for(40, 32), 24);
        assert_eq!(padding_for(48, 32), 16);
        assert_eq!(padding_for(56, 32), 8);
        assert_eq!(padding_for(64, 32), 32);
        assert_eq!(padding_for(4096, 4096), 4096);
    }

    #[test]
    fn aligned_allocations() {
        let mut heap = heap();
        let mut addresses = Vec::new();

        for (i, align) in [16, 32, 64, 128, 256, 512, 1024, 4096].iter().enumerate() {
            let size = 24 + i * 40;
            let address = heap.allocate_aligned(size, *align).unwrap().unwrap();
            assert_eq!(address.as_ptr() as usize % align, 0);

            unsafe {
                address.as_ptr().write_bytes(i as u8, size);
                let block = heap.follow_back_pointer(address, *align).unwrap();
                assert!(block.is_allocated());
                assert!(heap.usable_size(block.payload()) >= size + align);
            }

            addresses.push((address, *align, size, i as u8));
        }

        heap.check_heap().unwrap();

        for (address, align, size, byte) in addresses {
            unsafe {
                let bytes = std::slice::from_raw_parts(address.as_ptr(), size);
                assert!(bytes.iter().all(|b| *b == byte));
                heap.deallocate_aligned(address.as_ptr(), align).unwrap();
            }
        }

        let stats = heap.check_heap().unwrap();
        assert_eq!(stats.free_blocks, 1);
    }

    #[test]
    fn small_alignments_are_plain_allocations() {
        let mut heap = heap();

        for align in [1, 2, 4, 8] {
            let address = heap.allocate_aligned(10, align).unwrap().unwrap();
            unsafe {
                assert_eq!(Block::from_payload(address).size(), 24);
                heap.deallocate_aligned(address.as_ptr(), align).unwrap();
            }
        }
    }

    #[test]
    fn invalid_alignment() {
        let mut heap = heap();
        assert_eq!(
            heap.allocate_aligned(8, 24),
            Err(AllocError::InvalidAlignment { align: 24 })
        );
        assert_eq!(
            heap.allocate_aligned(8, 0),
            Err(AllocError::InvalidAlignment { align: 0 })
        );
    }

    #[test]
    fn reallocate_keeps_alignment_and_content() {
        let mut heap = heap();

        unsafe {
            let address = heap.allocate_aligned(32, 64).unwrap().unwrap();
            for i in 0..32 {
                *address.as_ptr().add(i) = i as u8;
            }

            let grown = heap.reallocate_aligned(address.as_ptr(), 64, 300).unwrap().unwrap();
            assert_eq!(grown.as_ptr() as usize % 64, 0);
            for i in 0..32 {
                assert_eq!(*grown.as_ptr().add(i), i as u8);
            }

            let shrunk = heap.reallocate_aligned(grown.as_ptr(), 64, 8).unwrap().unwrap();
            assert_eq!(shrunk.as_ptr() as usize % 64, 0);
            for i in 0..8 {
                assert_eq!(*shrunk.as_ptr().add(i), i as u8);
            }

            assert_eq!(heap.reallocate_aligned(shrunk.as_ptr(), 64, 0), Ok(None));
        }

        assert_eq!(heap.check_heap().unwrap().free_blocks, 1);
    }

    #[test]
    fn corrupted_back_pointer_is_rejected() {
        let mut heap = heap();

        let address = heap.allocate_aligned(64, 32).unwrap().unwrap();
        unsafe {
            let slot = back_pointer_slot(address);
            let saved = BackPointer::read(slot);

            BackPointer::NULL.write(slot);
            assert!(matches!(
                heap.deallocate_aligned(address.as_ptr(), 32),
                Err(AllocError::InvalidFree { .. })
            ));

            saved.write(slot);
            heap.deallocate_aligned(address.as_ptr(), 32).unwrap();
        }

        heap.check_heap().unwrap();
    }
}
