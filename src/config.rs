use crate::{
    block::{align_up, MIN_BLOCK_SIZE},
    header::DSIZE,
};

/// Default amount of bytes requested from the growth provider when no free
/// block can fit a request. Bigger requests grow the heap by exactly what
/// they need.
pub const DEFAULT_CHUNK_SIZE: usize = 1 << 8;

/// Default capacity of the [`crate::Arena`] reserved by [`crate::SegAlloc`]
/// and [`crate::Heap::new`]. Pages are only committed when touched.
pub const DEFAULT_ARENA_CAPACITY: usize = 64 << 20;

/// Free list links are 32 bit offsets from the start of the heap, so the heap
/// can't be bigger than this.
pub const MAX_HEAP_SIZE: usize = u32::MAX as usize & !(DSIZE - 1);

/// Heap configuration. All the methods are `const` so that a configured
/// allocator can be built in a `static`:
///
/// ```rust
/// use segalloc::{Config, SegAlloc};
///
/// static ALLOCATOR: SegAlloc = SegAlloc::with_config(
///     Config::new()
///         .with_chunk_size(4096)
///         .with_arena_capacity(16 << 20),
/// );
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Config {
    chunk_size: usize,
    arena_capacity: usize,
}

impl Config {
    pub const fn new() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            arena_capacity: DEFAULT_ARENA_CAPACITY,
        }
    }

    /// Minimum growth increment. Rounded up to a double word and never smaller
    /// than the minimum block size.
    pub const fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = match align_up(chunk_size, DSIZE) {
            Some(size) if size >= MIN_BLOCK_SIZE => size,
            Some(_) => MIN_BLOCK_SIZE,
            None => MAX_HEAP_SIZE,
        };
        self
    }

    /// Size of the arena that backs the heap, capped at [`MAX_HEAP_SIZE`].
    pub const fn with_arena_capacity(mut self, capacity: usize) -> Self {
        self.arena_capacity = if capacity > MAX_HEAP_SIZE {
            MAX_HEAP_SIZE
        } else {
            capacity
        };
        self
    }

    pub const fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub const fn arena_capacity(&self) -> usize {
        self.arena_capacity
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}
