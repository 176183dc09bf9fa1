use std::ptr::NonNull;

use crate::header::{read_word, write_word, Tag, DSIZE, WSIZE};

/// Minimum block size in bytes: header, predecessor link, successor link and
/// footer. A block smaller than this could not go back into the free lists
/// once deallocated.
pub(crate) const MIN_BLOCK_SIZE: usize = 2 * DSIZE;

/// Largest size a [`Tag`] can encode.
pub(crate) const MAX_BLOCK_SIZE: usize = u32::MAX as usize & !(DSIZE - 1);

/// Handle to a block, represented by its payload address. Blocks don't have a
/// Rust struct that maps their memory, everything is read and written through
/// the tags and link words at fixed offsets of the payload:
///
/// ```text
///               Allocated block                    Free block
///
///             +-----------------+              +-----------------+
///    header   | size        | 1 |              | size        | 0 |
///             +-----------------+              +-----------------+
///   payload ->|                 |   payload -> | pred link       |
///             |                 |              +-----------------+
///             |    User data    |              | succ link       |
///             |                 |              +-----------------+
///             |                 |              |   (unused)      |
///             +-----------------+              +-----------------+
///    footer   | size        | 1 |              | size        | 0 |
///             +-----------------+              +-----------------+
/// ```
///
/// The payload address is what the allocator hands out, so converting a user
/// pointer into a [`Block`] is free.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(transparent)]
pub(crate) struct Block(NonNull<u8>);

impl Block {
    /// # Safety
    ///
    /// `payload` must be the payload address of a block inside the heap, or
    /// the address right after the last block (epilogue) when only the header
    /// is going to be touched.
    #[inline]
    pub unsafe fn from_payload(payload: NonNull<u8>) -> Self {
        Self(payload)
    }

    #[inline]
    pub fn payload(self) -> NonNull<u8> {
        self.0
    }

    /// Address of the header tag, one word before the payload.
    #[inline]
    pub unsafe fn header(self) -> NonNull<u8> {
        NonNull::new_unchecked(self.0.as_ptr().sub(WSIZE))
    }

    /// Address of the footer tag. Depends on the size currently stored in the
    /// header.
    #[inline]
    pub unsafe fn footer(self) -> NonNull<u8> {
        self.footer_for(self.size())
    }

    #[inline]
    unsafe fn footer_for(self, size: usize) -> NonNull<u8> {
        NonNull::new_unchecked(self.0.as_ptr().add(size - DSIZE))
    }

    #[inline]
    pub unsafe fn tag(self) -> Tag {
        Tag::read(self.header())
    }

    /// Block size including tags.
    #[inline]
    pub unsafe fn size(self) -> usize {
        self.tag().size()
    }

    #[inline]
    pub unsafe fn is_allocated(self) -> bool {
        self.tag().is_allocated()
    }

    /// Writes header and footer. The footer position is computed from the new
    /// `size`, so this is also how blocks grow (merge) and shrink (split).
    #[inline]
    pub unsafe fn encode(self, size: usize, allocated: bool) {
        let tag = Tag::pack(size, allocated);
        tag.write(self.header());
        tag.write(self.footer_for(size));
    }

    /// Usable bytes of an allocated block.
    #[inline]
    pub unsafe fn payload_size(self) -> usize {
        self.size() - DSIZE
    }

    /// Physically next block. For the last block this is the epilogue.
    #[inline]
    pub unsafe fn next(self) -> Self {
        Self(NonNull::new_unchecked(self.0.as_ptr().add(self.size())))
    }

    /// Physically previous block. The word right above our header is the
    /// footer of the previous block, which tells us how far back to go.
    #[inline]
    pub unsafe fn prev(self) -> Self {
        let footer = NonNull::new_unchecked(self.0.as_ptr().sub(DSIZE));
        let size = Tag::read(footer).size();

        Self(NonNull::new_unchecked(self.0.as_ptr().sub(size)))
    }

    /// Address of the predecessor link of a free block.
    #[inline]
    pub fn pred_slot(self) -> NonNull<u8> {
        self.0
    }

    /// Address of the successor link of a free block.
    #[inline]
    pub unsafe fn succ_slot(self) -> NonNull<u8> {
        NonNull::new_unchecked(self.0.as_ptr().add(WSIZE))
    }

    /// Sets both links to null.
    #[inline]
    pub unsafe fn clear_links(self) {
        Link::NULL.write(self.pred_slot());
        Link::NULL.write(self.succ_slot());
    }
}

/// Free list link. Instead of storing absolute addresses, which would take 8
/// bytes each on 64 bit machines and push the minimum block size to 24 bytes,
/// we store the distance in bytes from the heap origin (the first byte of the
/// heap region) to the payload of the linked block:
///
/// ```text
/// origin
///   |
///   v
///   +--------+-----+-----------+-----------+-----------+-----+
///   | heads  | ... |   Block   |   Free A  |   Free B  | ... |
///   +--------+-----+-----------+-----------+-----------+-----+
///   |<------------ A.succ = offset of B ---->|
/// ```
///
/// Offset 0 is one of the free list heads, never a payload, so it doubles as
/// the null link. The heap size is capped at [`crate::config::MAX_HEAP_SIZE`]
/// to make sure every offset fits.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
#[repr(transparent)]
pub(crate) struct Link(u32);

impl Link {
    pub const NULL: Self = Self(0);

    /// Encodes `block` relative to `origin`.
    #[inline]
    pub fn encode(origin: NonNull<u8>, block: Option<Block>) -> Self {
        match block {
            None => Self::NULL,
            Some(block) => {
                let offset = block.payload().as_ptr() as usize - origin.as_ptr() as usize;
                debug_assert!(offset > 0 && offset <= u32::MAX as usize);
                Self(offset as u32)
            }
        }
    }

    /// Turns the offset back into a block.
    ///
    /// # Safety
    ///
    /// `origin` must be the same origin used to encode this link.
    #[inline]
    pub unsafe fn decode(self, origin: NonNull<u8>) -> Option<Block> {
        match self.0 {
            0 => None,
            offset => Some(Block(NonNull::new_unchecked(
                origin.as_ptr().add(offset as usize),
            ))),
        }
    }

    #[inline]
    pub const fn offset(self) -> usize {
        self.0 as usize
    }

    #[inline]
    pub unsafe fn read(address: NonNull<u8>) -> Self {
        Self(read_word(address))
    }

    #[inline]
    pub unsafe fn write(self, address: NonNull<u8>) {
        write_word(address, self.0)
    }
}

/// Rounds `value` up to the next multiple of `align`, which must be a power
/// of two. Returns `None` on overflow.
#[inline]
pub(crate) const fn align_up(value: usize, align: usize) -> Option<usize> {
    match value.checked_add(align - 1) {
        Some(value) => Some(value & !(align - 1)),
        None => None,
    }
}

/// Block size needed to serve a request of `size` bytes: payload rounded up
/// to [`DSIZE`] plus tags, never below [`MIN_BLOCK_SIZE`]. `None` if the
/// result can't be represented in a [`Tag`].
#[inline]
pub(crate) const fn adjusted_size(size: usize) -> Option<usize> {
    if size <= DSIZE {
        return Some(MIN_BLOCK_SIZE);
    }

    match size.checked_add(DSIZE) {
        Some(total) => match align_up(total, DSIZE) {
            Some(asize) if asize <= MAX_BLOCK_SIZE => Some(asize),
            _ => None,
        },
        None => None,
    }
}
