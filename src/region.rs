use std::ptr::NonNull;

use crate::{
    platform::{page_size, request_memory, return_memory},
    Pointer,
};

/// Heap growth provider. Behaves like `sbrk`: one region that only grows at
/// the end and never moves.
///
/// # Safety
///
/// Implementors must guarantee that:
///
/// - Every successful [`GrowHeap::grow`] returns the address right after the
///   last byte handed out by the previous call, so all the returned memory is
///   one contiguous region.
/// - The first address returned is aligned to 8 bytes.
/// - The memory stays valid, writable and exclusively owned by the caller for
///   as long as the implementor lives.
pub unsafe trait GrowHeap {
    /// Extends the region by `increment` bytes and returns the start of the new
    /// space (the previous end of the region), or `None` if it can't grow.
    /// A failed call doesn't change anything.
    fn grow(&mut self, increment: usize) -> Pointer<u8>;
}

/// Default [`GrowHeap`] implementation. Reserves `capacity` bytes from the
/// kernel on the first call to [`GrowHeap::grow`] and then moves a break
/// pointer forward:
///
/// ```text
/// base                        base + brk               base + capacity
///   |                             |                            |
///   v                             v                            v
///   +-----------------------------+----------------------------+
///   |        handed out           |         reserved           |
///   +-----------------------------+----------------------------+
/// ```
///
/// Nothing is given back until the arena is dropped. Alternatively the arena
/// can manage a buffer owned by someone else, see [`Arena::from_raw_parts`].
#[derive(Debug)]
pub struct Arena {
    /// Start of the reservation, `None` until the first growth.
    base: Pointer<u8>,
    /// Bytes that can be handed out in total.
    capacity: usize,
    /// Bytes handed out so far.
    brk: usize,
    /// Whether we requested the memory ourselves and have to return it.
    owned: bool,
}

// The arena owns its memory exclusively, nothing else points into it.
unsafe impl Send for Arena {}

impl Arena {
    /// Arena that will reserve `capacity` bytes (rounded up to the page size)
    /// once it's needed. Building it does not touch the OS.
    pub const fn with_capacity(capacity: usize) -> Self {
        Self {
            base: None,
            capacity,
            brk: 0,
            owned: true,
        }
    }

    /// Arena over an existing buffer, for example a `static` array in
    /// environments without `mmap`. The buffer is not released on drop.
    ///
    /// # Safety
    ///
    /// `base` must be aligned to 8 bytes and valid for reads and writes of
    /// `capacity` bytes for the whole life of the arena, and nothing else may
    /// access that memory in the meantime.
    pub const unsafe fn from_raw_parts(base: NonNull<u8>, capacity: usize) -> Self {
        Self {
            base: Some(base),
            capacity,
            brk: 0,
            owned: false,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes handed out so far.
    pub fn used(&self) -> usize {
        self.brk
    }

    /// Requests the reservation from the kernel.
    fn reserve(&mut self) -> Pointer<u8> {
        let length = reservation_length(self.capacity)?;
        let base = unsafe { request_memory(length)? };

        self.capacity = length;
        self.base = Some(base);

        Some(base)
    }
}

unsafe impl GrowHeap for Arena {
    fn grow(&mut self, increment: usize) -> Pointer<u8> {
        let base = match self.base {
            Some(base) => base,
            None => self.reserve()?,
        };

        let new_brk = self.brk.checked_add(increment)?;
        if new_brk > self.capacity {
            return None;
        }

        let address = unsafe { NonNull::new_unchecked(base.as_ptr().add(self.brk)) };
        self.brk = new_brk;

        Some(address)
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        if let (true, Some(base)) = (self.owned, self.base) {
            unsafe { return_memory(base, self.capacity) };
        }
    }
}

/// Length of the reservation needed for `capacity` bytes: rounded up to
/// whole pages, and at least one page. `None` on overflow.
pub(crate) fn reservation_length(capacity: usize) -> Option<usize> {
    let page_size = page_size();
    let pages = capacity.checked_add(page_size - 1)? / page_size;

    pages.max(1).checked_mul(page_size)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reservation_is_rounded_to_pages() {
        let page = page_size();

        assert_eq!(reservation_length(0), Some(page));
        assert_eq!(reservation_length(1), Some(page));
        assert_eq!(reservation_length(page), Some(page));
        assert_eq!(reservation_length(page + 1), Some(2 * page));
        for i in 1..=100 {
            assert_eq!(reservation_length(page * i - 8), Some(page * i));
        }
        assert_eq!(reservation_length(usize::MAX), None);
    }

    #[test]
    fn grows_contiguously() {
        let mut arena = Arena::with_capacity(page_size() * 2);

        let first = arena.grow(72).unwrap();
        let second = arena.grow(256).unwrap();
        let third = arena.grow(16).unwrap();

        assert_eq!(first.as_ptr() as usize % 8, 0);
        assert_eq!(second.as_ptr() as usize, first.as_ptr() as usize + 72);
        assert_eq!(third.as_ptr() as usize, second.as_ptr() as usize + 256);
        assert_eq!(arena.used(), 72 + 256 + 16);

        // Memory is usable.
        unsafe {
            first.as_ptr().write_bytes(1, 72 + 256 + 16);
            assert_eq!(*third.as_ptr().add(15), 1);
        }
    }

    #[test]
    fn fails_past_capacity() {
        let mut arena = Arena::with_capacity(page_size());
        let capacity = arena.capacity();

        assert!(arena.grow(capacity - 8).is_some());
        assert!(arena.grow(16).is_none());
        // A failed growth doesn't move the break.
        assert_eq!(arena.used(), capacity - 8);
        assert!(arena.grow(8).is_some());
        assert!(arena.grow(1).is_none());
        assert!(arena.grow(usize::MAX).is_none());
    }

    #[test]
    fn borrowed_buffer() {
        let mut buffer = vec![0u64; 64];
        let base = NonNull::new(buffer.as_mut_ptr().cast::<u8>()).unwrap();
        let mut arena = unsafe { Arena::from_raw_parts(base, 64 * 8) };

        assert_eq!(arena.grow(128), Some(base));
        assert!(arena.grow(512).is_none());
        assert!(arena.grow(384).is_some());
        drop(arena);

        // Still ours after the arena is gone.
        buffer[63] = 1;
        assert_eq!(buffer[63], 1);
    }
}
