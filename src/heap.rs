use std::{cmp, ptr, ptr::NonNull};

use crate::{
    block::{adjusted_size, align_up, Block, MIN_BLOCK_SIZE},
    bucket::{bucket_for, CLASS_COUNT},
    config::{Config, MAX_HEAP_SIZE},
    error::AllocError,
    event::{Event, Events, Pending},
    freelist::{FreeLists, HEADS_SIZE},
    header::{write_word, Tag, DSIZE, WSIZE},
    realloc::Realloc,
    region::{Arena, GrowHeap},
    AllocResult, Pointer,
};

/// Offset of the prologue payload from the heap origin.
pub(crate) const PROLOGUE: usize = HEADS_SIZE + DSIZE;

/// Offset of the first real block payload from the heap origin.
pub(crate) const FIRST_BLOCK: usize = PROLOGUE + DSIZE;

/// Bytes requested from the growth provider by [`Heap::init`] before the
/// first chunk: free list heads, padding, prologue and epilogue.
const INITIAL_SIZE: usize = HEADS_SIZE + 4 * WSIZE;

/// One heap. This is where everything comes together: the heap region is
/// obtained from a [`GrowHeap`], formatted with the free list heads and two
/// sentinel blocks, and then carved into blocks on demand:
///
/// ```text
/// +-------+-----+----------+----------+----------+-- ... --+----------+
/// | heads | pad | prologue | block    | block    |         | epilogue |
/// |       |     | 8, alloc | 40, free | 16, alloc|         | 0, alloc |
/// +-------+-----+----------+----------+----------+-- ... --+----------+
/// ```
///
/// The prologue and epilogue are always allocated, so coalescing never has to
/// check whether it reached the edges of the heap.
///
/// Allocation uses segregated fit: starting at the size class of the request,
/// take the first block that fits (lists are sorted, so that's the smallest
/// one in that class), split it if the remainder can be a block on its own,
/// and grow the heap if no class has anything big enough. Deallocation merges
/// the block with its free neighbours right away, so there are never two
/// adjacent free blocks.
///
/// The heap is not thread safe, every mutation goes through `&mut self`. See
/// [`crate::SegAlloc`] for a global allocator built on top of it.
pub struct Heap<G: GrowHeap = Arena> {
    grower: G,
    config: Config,
    /// First byte of the heap region. `None` until initialized.
    origin: Pointer<u8>,
    /// Bytes obtained from the grower so far.
    size: usize,
    events: Events,
}

// All the raw pointers point into memory owned by the grower.
unsafe impl<G: GrowHeap + Send> Send for Heap<G> {}

impl Heap<Arena> {
    /// Heap backed by an [`Arena`] with the default [`Config`].
    pub const fn new() -> Self {
        Self::with_config(Config::new())
    }

    pub const fn with_config(config: Config) -> Self {
        Self::with_grower(Arena::with_capacity(config.arena_capacity()), config)
    }

    /// Heap whose log records are buffered until [`Heap::take_events`]. Used
    /// when the heap is behind a lock that the logger might need.
    pub(crate) const fn deferred(config: Config) -> Self {
        Self {
            grower: Arena::with_capacity(config.arena_capacity()),
            config,
            origin: None,
            size: 0,
            events: Events::deferred(),
        }
    }
}

impl Default for Heap<Arena> {
    fn default() -> Self {
        Self::new()
    }
}

impl<G: GrowHeap> Heap<G> {
    /// Heap backed by a custom growth provider. Nothing is requested from it
    /// until the first allocation or [`Heap::init`].
    pub const fn with_grower(grower: G, config: Config) -> Self {
        Self {
            grower,
            config,
            origin: None,
            size: 0,
            events: Events::direct(),
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.origin.is_some()
    }

    /// Total bytes obtained from the growth provider, including all the
    /// bookkeeping.
    pub fn heap_size(&self) -> usize {
        self.size
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Creates the initial heap: list heads, prologue, epilogue and one free
    /// block of [`Config::chunk_size`] bytes. Called automatically when
    /// needed, calling it again does nothing.
    pub fn init(&mut self) -> Result<(), AllocError> {
        if self.is_initialized() {
            return Ok(());
        }

        let Some(origin) = self.grower.grow(INITIAL_SIZE) else {
            self.events.record(Event::GrowthFailed {
                requested: INITIAL_SIZE,
                reason: "growth provider failed",
            });
            return Err(AllocError::OutOfMemory {
                requested: INITIAL_SIZE,
            });
        };

        debug_assert_eq!(origin.as_ptr() as usize % DSIZE, 0);

        unsafe {
            FreeLists::format(origin);

            let padding = NonNull::new_unchecked(origin.as_ptr().add(HEADS_SIZE));
            write_word(padding, 0);

            let prologue = Block::from_payload(NonNull::new_unchecked(
                origin.as_ptr().add(PROLOGUE),
            ));
            prologue.encode(DSIZE, true);
            Tag::EPILOGUE.write(prologue.next().header());
        }

        self.origin = Some(origin);
        self.size = INITIAL_SIZE;

        self.events.record(Event::Created {
            origin: origin.as_ptr() as usize,
        });

        unsafe { self.extend(self.config.chunk_size()) }.map(|_| ())
    }

    /// Allocates a block that can hold at least `size` bytes and returns its
    /// payload address, aligned to 8 bytes. Zero sized requests return
    /// `Ok(None)` without touching the heap.
    pub fn allocate(&mut self, size: usize) -> AllocResult {
        if size == 0 {
            return Ok(None);
        }

        let asize = adjusted_size(size).ok_or(AllocError::SizeOverflow)?;

        self.init()?;

        unsafe {
            let block = match self.find_fit(asize) {
                Some(block) => block,
                None => self.extend(cmp::max(asize, self.config.chunk_size()))?,
            };

            let block = self.place(block, asize);
            self.events.record(Event::Allocated {
                size,
                address: block.payload().as_ptr() as usize,
            });

            Ok(Some(block.payload()))
        }
    }

    /// Deallocates the block at `address`. Null pointers are ignored.
    ///
    /// The address is validated before touching anything: pointers that are
    /// not payload addresses of allocated blocks are rejected with
    /// [`AllocError::InvalidFree`] or [`AllocError::DoubleFree`] and the heap is
    /// left as it was. Validation is best effort though, it can be fooled by a
    /// pointer into the middle of a payload that happens to contain something
    /// that looks like a block.
    ///
    /// # Safety
    ///
    /// `address` must be null or a pointer returned by this heap that hasn't
    /// been deallocated yet.
    pub unsafe fn deallocate(&mut self, address: *mut u8) -> Result<(), AllocError> {
        let Some(address) = NonNull::new(address) else {
            return Ok(());
        };

        self.init()?;

        let block = self.validate(address)?;

        block.encode(block.size(), false);
        block.clear_links();
        self.free_lists().insert(block);
        self.coalesce(block);

        self.events.record(Event::Deallocated {
            address: address.as_ptr() as usize,
        });

        Ok(())
    }

    /// Moves the allocation at `address` to a block that can hold `size`
    /// bytes, copying as much of the old content as fits. A null `address`
    /// behaves like [`Heap::allocate`] and a zero `size` like
    /// [`Heap::deallocate`], returning `Ok(None)`. If the new allocation
    /// fails the old block is left untouched.
    ///
    /// # Safety
    ///
    /// Same as [`Heap::deallocate`].
    pub unsafe fn reallocate(&mut self, address: *mut u8, size: usize) -> AllocResult {
        let Some(address) = NonNull::new(address) else {
            return self.allocate(size);
        };

        if size == 0 {
            self.deallocate(address.as_ptr())?;
            return Ok(None);
        }

        let realloc = Realloc::new(self.validate(address)?, address, size);
        let new_address = self.allocate(size)?;

        if let Some(new_address) = new_address {
            ptr::copy_nonoverlapping(
                realloc.address.as_ptr(),
                new_address.as_ptr(),
                realloc.count(),
            );
        }

        self.deallocate(realloc.block.payload().as_ptr())?;

        self.events.record(Event::Reallocated {
            address: address.as_ptr() as usize,
            size,
            new_address: new_address.map_or(0, |address| address.as_ptr() as usize),
        });

        Ok(new_address)
    }

    /// Allocates `count * size` bytes set to zero.
    pub fn zero_allocate(&mut self, count: usize, size: usize) -> AllocResult {
        let bytes = count.checked_mul(size).ok_or(AllocError::SizeOverflow)?;
        let address = self.allocate(bytes)?;

        if let Some(address) = address {
            unsafe { address.as_ptr().write_bytes(0, bytes) };
        }

        Ok(address)
    }

    /// Number of bytes that can be written at `address`, at least the size
    /// requested when it was allocated.
    ///
    /// # Safety
    ///
    /// `address` must be a live allocation of this heap.
    pub unsafe fn usable_size(&self, address: NonNull<u8>) -> usize {
        Block::from_payload(address).payload_size()
    }

    /// View over the free list heads. Only valid once initialized.
    #[inline]
    pub(crate) unsafe fn free_lists(&self) -> FreeLists {
        FreeLists::at(self.origin.unwrap_unchecked())
    }

    pub(crate) fn origin(&self) -> Pointer<u8> {
        self.origin
    }

    /// Prologue block. Only valid once initialized.
    pub(crate) unsafe fn prologue(&self) -> Block {
        Block::from_payload(NonNull::new_unchecked(
            self.origin.unwrap_unchecked().as_ptr().add(PROLOGUE),
        ))
    }

    /// Offset of `block` from the heap origin.
    pub(crate) unsafe fn offset_of(&self, block: Block) -> usize {
        block.payload().as_ptr() as usize - self.origin.unwrap_unchecked().as_ptr() as usize
    }

    /// Grows the heap by `bytes` (rounded up to a double word). The new space
    /// becomes a free block where the old epilogue was, followed by a new
    /// epilogue, and is merged with the last block if that one is free.
    /// Returns the resulting free block, which is already in the free lists.
    unsafe fn extend(&mut self, bytes: usize) -> Result<Block, AllocError> {
        let out_of_memory = AllocError::OutOfMemory { requested: bytes };

        let size = align_up(bytes, DSIZE).ok_or(out_of_memory)?;

        if self.size.checked_add(size).map_or(true, |total| total > MAX_HEAP_SIZE) {
            self.events.record(Event::GrowthFailed {
                requested: size,
                reason: "offset range exhausted",
            });
            return Err(out_of_memory);
        }

        let Some(address) = self.grower.grow(size) else {
            self.events.record(Event::GrowthFailed {
                requested: size,
                reason: "growth provider failed",
            });
            return Err(out_of_memory);
        };

        debug_assert_eq!(
            address.as_ptr() as usize,
            self.origin.unwrap_unchecked().as_ptr() as usize + self.size
        );

        self.size += size;

        // The header of the new block overwrites the old epilogue.
        let block = Block::from_payload(address);
        block.encode(size, false);
        block.clear_links();
        Tag::EPILOGUE.write(block.next().header());

        self.events.record(Event::Grown {
            by: size,
            total: self.size,
        });

        self.free_lists().insert(block);

        Ok(self.coalesce(block))
    }

    /// Segregated fit. Scans size classes upwards starting at the class of
    /// `asize` and returns the first block big enough. Since every list is
    /// sorted, the first match of a list is its smallest block that fits.
    pub(crate) unsafe fn find_fit(&self, asize: usize) -> Option<Block> {
        let free_lists = self.free_lists();

        for class in bucket_for(asize)..CLASS_COUNT {
            if let Some(block) = free_lists.iter(class).find(|block| block.size() >= asize) {
                return Some(block);
            }
        }

        None
    }

    /// Marks `block` as allocated with `asize` bytes. If what's left is big
    /// enough to be a block, it's split off and goes back to the free lists:
    ///
    /// ```text
    /// Before:  +------------------------------------------+
    ///          |               Free, size                 |
    ///          +------------------------------------------+
    ///
    /// After:   +-----------------+------------------------+
    ///          | Alloc, asize    | Free, size - asize     |
    ///          +-----------------+------------------------+
    /// ```
    ///
    /// Otherwise the whole block is used. The remainder can't be merged with
    /// anything because the next block of a free block is never free.
    unsafe fn place(&mut self, block: Block, asize: usize) -> Block {
        let size = block.size();
        let free_lists = self.free_lists();

        free_lists.remove(block);

        if size - asize >= MIN_BLOCK_SIZE {
            block.encode(asize, true);

            let remainder = block.next();
            remainder.encode(size - asize, false);
            remainder.clear_links();
            free_lists.insert(remainder);
        } else {
            block.encode(size, true);
        }

        block
    }

    /// Merges the free `block` with its free neighbours, if any. `block` must
    /// be in the free lists already. Returns the merged block, which is also
    /// in the free lists.
    ///
    /// ```text
    ///            prev        block        next
    /// Case 1:  [ alloc ]  [  free   ]  [ alloc ]   nothing to do
    /// Case 2:  [ alloc ]  [  free   ]  [ free  ]   block absorbs next
    /// Case 3:  [ free  ]  [  free   ]  [ alloc ]   prev absorbs block
    /// Case 4:  [ free  ]  [  free   ]  [ free  ]   prev absorbs both
    /// ```
    unsafe fn coalesce(&mut self, block: Block) -> Block {
        let prev = block.prev();
        let next = block.next();
        let free_lists = self.free_lists();

        let merged = match (prev.is_allocated(), next.is_allocated()) {
            (true, true) => return block,
            (true, false) => {
                free_lists.remove(block);
                free_lists.remove(next);
                block.encode(block.size() + next.size(), false);
                block
            }
            (false, true) => {
                free_lists.remove(block);
                free_lists.remove(prev);
                prev.encode(prev.size() + block.size(), false);
                prev
            }
            (false, false) => {
                free_lists.remove(prev);
                free_lists.remove(block);
                free_lists.remove(next);
                prev.encode(prev.size() + block.size() + next.size(), false);
                prev
            }
        };

        free_lists.insert(merged);

        merged
    }

    /// Checks that `address` is the payload of an allocated block of this
    /// heap without trusting anything but the heap bounds.
    pub(crate) unsafe fn validate(&mut self, address: NonNull<u8>) -> Result<Block, AllocError> {
        let addr = address.as_ptr() as usize;
        let invalid = AllocError::InvalidFree { address: addr };

        let Some(origin) = self.origin else {
            return Err(invalid);
        };

        // Payloads go from the first block up to the epilogue, which sits at
        // the very end of the heap.
        let start = origin.as_ptr() as usize + FIRST_BLOCK;
        let end = origin.as_ptr() as usize + self.size;

        if addr < start || addr >= end || addr % DSIZE != 0 {
            return Err(self.reject(invalid, "outside of the heap or misaligned"));
        }

        let block = Block::from_payload(address);
        let tag = block.tag();

        if tag.size() < MIN_BLOCK_SIZE || tag.size() > end - addr {
            return Err(self.reject(invalid, "not a block header"));
        }

        if Tag::read(block.footer()) != tag {
            return Err(self.reject(invalid, "header and footer don't match"));
        }

        if !tag.is_allocated() {
            let double_free = AllocError::DoubleFree { address: addr };
            return Err(self.reject(double_free, "block is already free"));
        }

        Ok(block)
    }

    /// Records why a free was refused and hands the error back.
    pub(crate) fn reject(&mut self, err: AllocError, reason: &'static str) -> AllocError {
        if let AllocError::InvalidFree { address } | AllocError::DoubleFree { address } = err {
            self.events.record(Event::Rejected { address, reason });
        }

        err
    }

    pub(crate) fn record(&mut self, event: Event) {
        self.events.record(event);
    }

    /// Log records buffered so far. Always empty unless the heap was built
    /// with [`Heap::deferred`].
    pub(crate) fn take_events(&mut self) -> Pending {
        self.events.take()
    }
}
