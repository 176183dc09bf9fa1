//! Boundary tag memory allocator with segregated free lists.
//!
//! The heap is one contiguous region that only grows at the end (see
//! [`GrowHeap`]). It's split into blocks, each one with a 4 byte header and a
//! 4 byte footer holding its size and whether it's allocated:
//!
//! ```text
//! +--------+---------------------------------------+--------+
//! | Header |               Payload                 | Footer |
//! +--------+---------------------------------------+--------+
//!          ^
//!          | address returned to the caller, 8-aligned
//! ```
//!
//! Free blocks are indexed in 14 lists by size class, sorted by size, with the
//! links stored inside their own payload. Freed blocks are merged with their
//! free neighbours immediately. [`Heap`] is the single threaded engine and
//! [`SegAlloc`] wraps it in a lock and implements
//! [`std::alloc::GlobalAlloc`].

use std::ptr::NonNull;

mod alignment;
mod allocator;
mod block;
mod bucket;
mod check;
mod config;
mod error;
mod event;
mod freelist;
mod header;
mod heap;
mod list;
mod platform;
mod realloc;
mod region;

/// Non-null pointer to `T`. We use this in most cases instead of `*mut T`
/// because the compiler will yell at us if we don't write code for the `None`
/// case.
pub type Pointer<T> = Option<NonNull<T>>;

/// Shorter syntax for allocation/reallocation return types. `Ok(None)` means
/// that nothing was allocated, which only happens for zero sized requests.
pub type AllocResult = Result<Pointer<u8>, AllocError>;

pub use allocator::SegAlloc;
pub use check::{HeapStats, Inconsistency};
pub use config::{Config, DEFAULT_ARENA_CAPACITY, DEFAULT_CHUNK_SIZE, MAX_HEAP_SIZE};
pub use error::AllocError;
pub use heap::Heap;
pub use region::{Arena, GrowHeap};
