use std::{
    alloc::{GlobalAlloc, Layout},
    cell::Cell,
    ptr,
    sync::{Mutex, PoisonError},
};

use crate::{
    check::{report, HeapStats, Inconsistency},
    config::Config,
    error::AllocError,
    heap::Heap,
    region::Arena,
    Pointer,
};

/// Thread safe front end over one [`Heap`] backed by an [`Arena`]. It
/// implements [`GlobalAlloc`], so it can replace the system allocator.
///
/// # Examples
///
/// ## Global allocator
///
/// ```no_run
/// use segalloc::SegAlloc;
///
/// #[global_allocator]
/// static ALLOCATOR: SegAlloc = SegAlloc::new();
///
/// fn main() {
///     let num = Box::new(5);
///     assert_eq!(*num, 5);
///
///     let mut vec = Vec::with_capacity(100);
///     vec.extend(0..100);
///     assert_eq!(vec.iter().sum::<i32>(), 4950);
/// }
/// ```
///
/// ## Standalone
///
/// ```rust
/// use std::alloc::{GlobalAlloc, Layout};
///
/// use segalloc::SegAlloc;
///
/// let allocator = SegAlloc::new();
///
/// unsafe {
///     let layout = Layout::from_size_align(256, 64).unwrap();
///     let address = allocator.alloc(layout);
///     assert_eq!(address as usize % 64, 0);
///     allocator.dealloc(address, layout);
/// }
///
/// assert_eq!(allocator.check_heap().unwrap().free_blocks, 1);
/// ```
///
/// # Logging
///
/// The heap logs through the [`log`] facade, `trace` for every operation,
/// `debug` for growth and `warn` for failures and rejected frees. None of it
/// is emitted while the heap is locked: records are buffered and logged after
/// the lock is released, so a logger is free to allocate even when this is
/// the global allocator. Allocations made by the logger itself are not
/// logged again.
pub struct SegAlloc {
    /// Every call goes through one [`Mutex`]. The heap has a single break
    /// pointer and one set of free lists, there's nothing to split the lock
    /// on.
    heap: Mutex<Heap<Arena>>,
}

thread_local! {
    /// Set while this thread is emitting log records.
    static LOGGING: Cell<bool> = const { Cell::new(false) };
}

/// Runs `log` unless this thread is already inside a logger call, which
/// means we are serving an allocation made by the logger.
fn outside_logger(log: impl FnOnce()) {
    let _ = LOGGING.try_with(|logging| {
        if !logging.replace(true) {
            log();
            logging.set(false);
        }
    });
}

impl SegAlloc {
    /// Allocator with the default [`Config`]. Doesn't touch the OS until the
    /// first allocation.
    pub const fn new() -> Self {
        Self::with_config(Config::new())
    }

    pub const fn with_config(config: Config) -> Self {
        Self {
            heap: Mutex::new(Heap::deferred(config)),
        }
    }

    /// Runs [`Heap::check_heap`] on the underlying heap. A poisoned lock is
    /// ignored, the checker doesn't trust the heap anyway.
    pub fn check_heap(&self) -> Result<HeapStats, Inconsistency> {
        let result = self
            .heap
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .verify();

        if let Err(finding) = result {
            outside_logger(|| {
                report(finding);
            });
        }

        result
    }

    /// Runs `operation` with the heap locked and logs what happened once the
    /// lock is released. A poisoned lock counts as a failed operation.
    fn with_heap<T>(
        &self,
        operation: impl FnOnce(&mut Heap<Arena>) -> Result<T, AllocError>,
    ) -> Option<T> {
        let (result, pending) = {
            let mut heap = self.heap.lock().ok()?;
            let result = operation(&mut *heap);
            (result, heap.take_events())
        };

        outside_logger(|| {
            pending.log();
            if let Err(err) = &result {
                log::trace!("request failed: {err}");
            }
        });

        result.ok()
    }

    fn address(result: Option<Pointer<u8>>) -> *mut u8 {
        match result {
            Some(Some(address)) => address.as_ptr(),
            _ => ptr::null_mut(),
        }
    }
}

impl Default for SegAlloc {
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl GlobalAlloc for SegAlloc {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        Self::address(self.with_heap(|heap| heap.allocate_aligned(layout.size(), layout.align())))
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let address = self.alloc(layout);
        if !address.is_null() {
            address.write_bytes(0, layout.size());
        }

        address
    }

    unsafe fn dealloc(&self, address: *mut u8, layout: Layout) {
        self.with_heap(|heap| heap.deallocate_aligned(address, layout.align()));
    }

    unsafe fn realloc(&self, address: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        Self::address(
            self.with_heap(|heap| heap.reallocate_aligned(address, layout.align(), new_size)),
        )
    }
}

#[cfg(test)]
mod tests {
    use std::{sync, thread};

    use super::*;

    #[test]
    fn alloc_and_dealloc() {
        let allocator = SegAlloc::with_config(Config::new().with_arena_capacity(1 << 20));

        unsafe {
            let small = Layout::array::<u8>(8).unwrap();
            let first = allocator.alloc(small);
            first.write_bytes(69, 8);

            let big = Layout::array::<u64>(1024).unwrap();
            let second = allocator.alloc(big);
            second.write_bytes(42, big.size());

            assert_eq!(*first.add(7), 69);
            assert_eq!(*second.add(big.size() - 1), 42);

            allocator.dealloc(first, small);
            allocator.dealloc(second, big);
        }

        let stats = allocator.check_heap().unwrap();
        assert_eq!(stats.free_blocks, 1);
    }

    #[test]
    fn alloc_zeroed_and_realloc() {
        let allocator = SegAlloc::new();

        unsafe {
            let layout = Layout::from_size_align(100, 32).unwrap();
            let address = allocator.alloc_zeroed(layout);
            assert_eq!(address as usize % 32, 0);
            assert!(std::slice::from_raw_parts(address, 100).iter().all(|b| *b == 0));

            address.write_bytes(3, 100);

            let grown = allocator.realloc(address, layout, 1000);
            assert_eq!(grown as usize % 32, 0);
            assert!(std::slice::from_raw_parts(grown, 100).iter().all(|b| *b == 3));

            allocator.dealloc(grown, Layout::from_size_align(1000, 32).unwrap());
        }

        allocator.check_heap().unwrap();
    }

    #[test]
    fn out_of_memory_is_null() {
        let allocator = SegAlloc::with_config(Config::new().with_arena_capacity(4096));

        unsafe {
            let layout = Layout::array::<u8>(1 << 20).unwrap();
            assert!(allocator.alloc(layout).is_null());
        }

        allocator.check_heap().unwrap();
    }

    #[test]
    fn records_are_emitted_after_unlocking() {
        let allocator = SegAlloc::with_config(Config::new().with_arena_capacity(1 << 16));

        unsafe {
            let layout = Layout::array::<u8>(32).unwrap();
            let address = allocator.alloc(layout);
            allocator.dealloc(address, layout);
            allocator.dealloc(address, layout);
            assert!(allocator.alloc(Layout::array::<u8>(1 << 20).unwrap()).is_null());
        }

        // Everything was handed out before the lock was released.
        let mut heap = allocator.heap.lock().unwrap();
        assert_eq!(heap.take_events().iter().count(), 0);
    }

    /// We'll make all the threads do only allocs at the same time, then wait
    /// and do only deallocs at the same time.
    #[test]
    fn multiple_threads_synchronized_allocs_and_deallocs() {
        let allocator = SegAlloc::new();

        let num_threads = 8;

        let barrier = sync::Barrier::new(num_threads);

        thread::scope(|scope| {
            for t in 0..num_threads {
                let allocator = &allocator;
                let barrier = &barrier;
                scope.spawn(move || unsafe {
                    let num_elements = 1024;
                    let layout = Layout::array::<usize>(num_elements).unwrap();
                    let address = allocator.alloc(layout).cast::<usize>();

                    for i in 0..num_elements {
                        *address.add(i) = t;
                    }

                    barrier.wait();

                    // Check memory corruption.
                    for i in 0..num_elements {
                        assert_eq!(*address.add(i), t);
                    }

                    allocator.dealloc(address.cast(), layout);
                });
            }
        });

        assert_eq!(allocator.check_heap().unwrap().free_blocks, 1);
    }

    /// In this case we'll make the threads do allocs and deallocs
    /// interchangeably, with different sizes and alignments.
    #[test]
    fn multiple_threads_unsynchronized_allocs_and_deallocs() {
        let allocator = SegAlloc::new();

        let num_threads = 8;

        let barrier = sync::Barrier::new(num_threads);

        thread::scope(|scope| {
            for _ in 0..num_threads {
                scope.spawn(|| unsafe {
                    let layouts = [(16, 8), (100, 16), (256, 8), (1024, 64), (2048, 8), (4096, 4096)]
                        .map(|(size, align)| Layout::from_size_align(size, align).unwrap());

                    let num_allocs = if cfg!(miri) { 20 } else { 200 };

                    for layout in layouts {
                        barrier.wait();
                        for _ in 0..num_allocs {
                            let address = allocator.alloc(layout);
                            assert_eq!(address as usize % layout.align(), 0);
                            for i in 0..layout.size() {
                                *address.add(i) = (i % 256) as u8;
                            }
                            for i in 0..layout.size() {
                                assert_eq!(*address.add(i), (i % 256) as u8);
                            }
                            allocator.dealloc(address, layout);
                        }
                    }
                });
            }
        });

        assert_eq!(allocator.check_heap().unwrap().free_blocks, 1);
    }
}
