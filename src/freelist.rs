use std::ptr::NonNull;

use crate::{
    block::{align_up, Block, Link},
    bucket::{bucket_for, CLASS_COUNT},
    header::{DSIZE, WSIZE},
    list::{self, Chain, Iter},
};

/// Segregated free lists. There's one list per size class (see
/// [`crate::bucket`]) and all of them live inside the heap: the heads are
/// stored in the first words of the heap region and the links are stored in
/// the payload of the free blocks, since nobody else is using that memory.
///
/// ```text
///    origin
///      |
///      v
///      +----+----+----+-- ... --+----+-----+--------------------------------+
///      | h0 | h1 | h2 |         | hN | pad | prologue | blocks ... | epilog |
///      +----+----+----+-- ... --+----+-----+--------------------------------+
///             |
///             |      +-------------+      +-------------+
///             +----> | Free, 16    | ---> | Free, 16    | ---> null
///                    +-------------+      +-------------+
/// ```
///
/// Every list is kept sorted by block size, smallest first. Blocks of equal
/// size keep their insertion order. So the first block in a list that can
/// fit a request is also the smallest block of that list that can fit it.
///
/// This struct is only a view over the heap memory, copying it around is
/// fine.
#[derive(Clone, Copy, Debug)]
pub(crate) struct FreeLists {
    origin: NonNull<u8>,
}

/// Bytes reserved at the beginning of the heap for the list heads, padded so
/// that whatever comes next is double word aligned.
pub(crate) const HEADS_SIZE: usize = match align_up(CLASS_COUNT * WSIZE, DSIZE) {
    Some(size) => size,
    None => panic!("heads don't fit"),
};

impl FreeLists {
    /// Writes empty heads at `origin`.
    ///
    /// # Safety
    ///
    /// `origin` must be valid for writes of [`HEADS_SIZE`] bytes.
    pub unsafe fn format(origin: NonNull<u8>) -> Self {
        let free_lists = Self { origin };
        for class in 0..CLASS_COUNT {
            Link::NULL.write(free_lists.head_slot(class));
        }

        free_lists
    }

    /// View over heads that have already been formatted.
    pub unsafe fn at(origin: NonNull<u8>) -> Self {
        Self { origin }
    }

    #[inline]
    fn head_slot(self, class: usize) -> NonNull<u8> {
        unsafe { NonNull::new_unchecked(self.origin.as_ptr().add(class * WSIZE)) }
    }

    /// List of the given size class.
    #[inline]
    pub fn class(self, class: usize) -> ClassList {
        ClassList {
            origin: self.origin,
            slot: self.head_slot(class),
        }
    }

    /// Raw head of the given size class, without decoding it.
    #[inline]
    pub unsafe fn head_link(self, class: usize) -> Link {
        Link::read(self.head_slot(class))
    }

    /// Inserts `block` in the list matching its size, before the first block
    /// whose size is greater or equal.
    ///
    /// # Safety
    ///
    /// `block` must be free, its header must hold its final size and it must
    /// not be in any list already.
    pub unsafe fn insert(self, block: Block) {
        let size = block.size();
        let mut list = self.class(bucket_for(size));

        let mut pred = None;
        let mut succ = list.head();

        while let Some(node) = succ {
            if node.size() >= size {
                break;
            }
            pred = Some(node);
            succ = list.succ(node);
        }

        list::link(&mut list, pred, block, succ);
    }

    /// Removes `block` from its list. The list is found using the size stored
    /// in the header, so this must be called before changing the size.
    ///
    /// # Safety
    ///
    /// `block` must currently be in the list matching its size.
    pub unsafe fn remove(self, block: Block) {
        let mut list = self.class(bucket_for(block.size()));
        list::unlink(&mut list, block);
    }

    /// Blocks of one size class, smallest first.
    pub unsafe fn iter(self, class: usize) -> Iter<ClassList> {
        Iter::new(self.class(class))
    }
}

/// One size class list. Implements [`Chain`] by reading and writing link
/// offsets directly in the heap.
#[derive(Clone, Copy, Debug)]
pub(crate) struct ClassList {
    origin: NonNull<u8>,
    slot: NonNull<u8>,
}

impl Chain for ClassList {
    type Node = Block;

    unsafe fn head(&self) -> Option<Block> {
        Link::read(self.slot).decode(self.origin)
    }

    unsafe fn set_head(&mut self, head: Option<Block>) {
        Link::encode(self.origin, head).write(self.slot);
    }

    unsafe fn pred(&self, node: Block) -> Option<Block> {
        Link::read(node.pred_slot()).decode(self.origin)
    }

    unsafe fn succ(&self, node: Block) -> Option<Block> {
        Link::read(node.succ_slot()).decode(self.origin)
    }

    unsafe fn set_pred(&mut self, node: Block, pred: Option<Block>) {
        Link::encode(self.origin, pred).write(node.pred_slot());
    }

    unsafe fn set_succ(&mut self, node: Block, succ: Option<Block>) {
        Link::encode(self.origin, succ).write(node.succ_slot());
    }
}
