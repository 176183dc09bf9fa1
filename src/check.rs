//! Heap consistency checker. Walks every block and every free list looking for
//! corrupted tags, missed merges and list entries that don't belong where they
//! are. Mostly useful in tests, after each mutation.

use std::ptr::NonNull;

use crate::{
    block::{Block, Link, MIN_BLOCK_SIZE},
    bucket::{bucket_for, CLASS_COUNT},
    freelist::FreeLists,
    header::{Tag, DSIZE},
    heap::{Heap, FIRST_BLOCK, PROLOGUE},
    region::GrowHeap,
};

/// Summary of a consistent heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeapStats {
    /// Total bytes obtained from the growth provider.
    pub heap_size: usize,
    /// Number of blocks between the prologue and the epilogue.
    pub blocks: usize,
    pub free_blocks: usize,
    /// Sum of the sizes of all free blocks, tags included.
    pub free_bytes: usize,
}

/// Problems found by [`Heap::check_heap`]. Offsets are payload offsets from
/// the start of the heap region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Inconsistency {
    #[error("prologue block is corrupted")]
    Prologue,

    #[error("epilogue expected at the end of the heap, found at {offset}")]
    Epilogue { offset: usize },

    #[error("block at {offset} is not double word aligned")]
    Misaligned { offset: usize },

    #[error("block at {offset} has invalid size {size}")]
    BadSize { offset: usize, size: usize },

    #[error("block at {offset} extends past the end of the heap")]
    OutOfBounds { offset: usize },

    #[error("header and footer of block at {offset} don't match")]
    TagMismatch { offset: usize },

    #[error("free blocks at {offset} and {next} were not merged")]
    AdjacentFree { offset: usize, next: usize },

    #[error("bucket {bucket} points to {offset}, which is not a free block")]
    Unreachable { bucket: usize, offset: usize },

    #[error("block at {offset} of size {size} is in bucket {bucket}, expected {expected}")]
    WrongBucket {
        offset: usize,
        size: usize,
        bucket: usize,
        expected: usize,
    },

    #[error("bucket {bucket} is not sorted at block {offset}")]
    Unsorted { bucket: usize, offset: usize },

    #[error("predecessor link of block at {offset} is broken")]
    BrokenLink { offset: usize },

    #[error("{on_heap} free blocks on the heap but {indexed} in the free lists")]
    CountMismatch { on_heap: usize, indexed: usize },
}

impl<G: GrowHeap> Heap<G> {
    /// Verifies every invariant of the heap: sentinels, tags, merges and free
    /// lists. Returns the first problem found, which is also logged. The
    /// checker never allocates, so it can run while the heap backs the global
    /// allocator.
    pub fn check_heap(&self) -> Result<HeapStats, Inconsistency> {
        self.verify().map_err(report)
    }

    /// [`Heap::check_heap`] without logging.
    pub(crate) fn verify(&self) -> Result<HeapStats, Inconsistency> {
        let Some(origin) = self.origin() else {
            return Ok(HeapStats::default());
        };

        let checker = Checker {
            origin,
            size: self.heap_size(),
            free_lists: unsafe { self.free_lists() },
        };

        unsafe {
            let stats = checker.walk_blocks()?;
            checker.walk_buckets(&stats)?;
            Ok(stats)
        }
    }
}

pub(crate) fn report(finding: Inconsistency) -> Inconsistency {
    log::error!("heap check failed: {finding}");
    finding
}

struct Checker {
    origin: NonNull<u8>,
    size: usize,
    free_lists: FreeLists,
}

impl Checker {
    #[inline]
    unsafe fn block(&self, offset: usize) -> Block {
        Block::from_payload(NonNull::new_unchecked(self.origin.as_ptr().add(offset)))
    }

    /// Walks the blocks in address order. Each header is checked against the
    /// heap bounds before following it.
    unsafe fn walk_blocks(&self) -> Result<HeapStats, Inconsistency> {
        let prologue = self.block(PROLOGUE);
        let expected = Tag::pack(DSIZE, true);

        if prologue.tag() != expected || Tag::read(prologue.footer()) != expected {
            return Err(Inconsistency::Prologue);
        }

        let mut stats = HeapStats {
            heap_size: self.size,
            ..Default::default()
        };

        let mut offset = FIRST_BLOCK;
        let mut prev_free: Option<usize> = None;

        loop {
            if offset % DSIZE != 0 {
                return Err(Inconsistency::Misaligned { offset });
            }

            let block = self.block(offset);
            let tag = block.tag();

            if tag.size() == 0 {
                if !tag.is_allocated() || offset != self.size {
                    return Err(Inconsistency::Epilogue { offset });
                }
                break;
            }

            if tag.size() < MIN_BLOCK_SIZE {
                return Err(Inconsistency::BadSize {
                    offset,
                    size: tag.size(),
                });
            }

            if offset + tag.size() > self.size {
                return Err(Inconsistency::OutOfBounds { offset });
            }

            if Tag::read(block.footer()) != tag {
                return Err(Inconsistency::TagMismatch { offset });
            }

            stats.blocks += 1;

            if tag.is_allocated() {
                prev_free = None;
            } else {
                if let Some(prev) = prev_free {
                    return Err(Inconsistency::AdjacentFree { offset: prev, next: offset });
                }
                stats.free_blocks += 1;
                stats.free_bytes += tag.size();
                prev_free = Some(offset);
            }

            offset += tag.size();
        }

        Ok(stats)
    }

    /// Walks every bucket by index. Links are checked against the heap bounds
    /// and the block chain before being followed, and the walk stops as soon as it has
    /// seen more entries than free blocks exist, so cycles end too.
    unsafe fn walk_buckets(&self, stats: &HeapStats) -> Result<(), Inconsistency> {
        let mut indexed = 0;

        for bucket in 0..CLASS_COUNT {
            let mut pred = Link::NULL;
            let mut link = self.free_lists.head_link(bucket);
            let mut last_size = 0;

            while link != Link::NULL {
                let offset = link.offset();

                if indexed == stats.free_blocks {
                    return Err(Inconsistency::CountMismatch {
                        on_heap: stats.free_blocks,
                        indexed: indexed + 1,
                    });
                }

                if !self.in_bounds(offset) || !self.is_free_block(offset) {
                    return Err(Inconsistency::Unreachable { bucket, offset });
                }

                let block = self.block(offset);
                let size = block.size();
                let expected = bucket_for(size);

                if expected != bucket {
                    return Err(Inconsistency::WrongBucket {
                        offset,
                        size,
                        bucket,
                        expected,
                    });
                }

                if Link::read(block.pred_slot()) != pred {
                    return Err(Inconsistency::BrokenLink { offset });
                }

                if size < last_size {
                    return Err(Inconsistency::Unsorted { bucket, offset });
                }

                indexed += 1;
                last_size = size;
                pred = link;
                link = Link::read(block.succ_slot());
            }
        }

        if indexed != stats.free_blocks {
            return Err(Inconsistency::CountMismatch {
                on_heap: stats.free_blocks,
                indexed,
            });
        }

        Ok(())
    }

    /// Whether `offset` could be a payload offset at all.
    fn in_bounds(&self, offset: usize) -> bool {
        offset >= FIRST_BLOCK && offset < self.size && offset % DSIZE == 0
    }

    /// Whether a free block starts at `offset`. Only valid after
    /// [`Checker::walk_blocks`] succeeded.
    unsafe fn is_free_block(&self, offset: usize) -> bool {
        let mut current = FIRST_BLOCK;

        while current < offset && current < self.size {
            current += self.block(current).size();
        }

        current == offset && current < self.size && !self.block(current).is_allocated()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{list::Chain, Config};

    /// Heap with blocks of 80, 80, 96 and 16 bytes allocated, followed by a
    /// free block of 240.
    fn heap() -> (Heap, [NonNull<u8>; 4]) {
        let mut heap = Heap::with_config(Config::new().with_arena_capacity(1 << 20));
        let addresses = [72, 72, 88, 8].map(|size| heap.allocate(size).unwrap().unwrap());
        (heap, addresses)
    }

    unsafe fn offset(heap: &Heap, address: NonNull<u8>) -> usize {
        heap.offset_of(Block::from_payload(address))
    }

    #[test]
    fn healthy_heap() {
        let (mut heap, [a, _, c, _]) = heap();

        assert_eq!(
            heap.check_heap(),
            Ok(HeapStats {
                heap_size: 72 + 512,
                blocks: 5,
                free_blocks: 1,
                free_bytes: 240,
            })
        );

        unsafe {
            heap.deallocate(a.as_ptr()).unwrap();
            heap.deallocate(c.as_ptr()).unwrap();
        }

        let stats = heap.check_heap().unwrap();
        assert_eq!(stats.free_blocks, 3);
        assert_eq!(stats.free_bytes, 80 + 96 + 240);
    }

    #[test]
    fn uninitialized_heap_is_empty() {
        let heap = Heap::new();
        assert_eq!(heap.check_heap(), Ok(HeapStats::default()));
    }

    #[test]
    fn tag_mismatch() {
        let (heap, [_, b, _, _]) = heap();

        unsafe {
            let block = Block::from_payload(b);
            Tag::pack(72, true).write(block.footer());
            assert_eq!(
                heap.check_heap(),
                Err(Inconsistency::TagMismatch {
                    offset: offset(&heap, b)
                })
            );
        }
    }

    #[test]
    fn bad_size_and_bounds() {
        let (heap, [a, b, _, _]) = heap();

        unsafe {
            let block = Block::from_payload(b);
            Tag::pack(8, true).write(block.header());
            assert_eq!(
                heap.check_heap(),
                Err(Inconsistency::BadSize {
                    offset: offset(&heap, b),
                    size: 8
                })
            );

            Tag::pack(1 << 20, true).write(Block::from_payload(a).header());
            assert_eq!(
                heap.check_heap(),
                Err(Inconsistency::OutOfBounds {
                    offset: offset(&heap, a)
                })
            );
        }
    }

    #[test]
    fn corrupted_sentinels() {
        let (heap, _) = heap();

        unsafe {
            let prologue = heap.prologue();
            Tag::pack(DSIZE, false).write(prologue.header());
            assert_eq!(heap.check_heap(), Err(Inconsistency::Prologue));
            Tag::pack(DSIZE, true).write(prologue.header());

            let origin = heap.origin().unwrap();
            let epilogue = Block::from_payload(NonNull::new_unchecked(
                origin.as_ptr().add(heap.heap_size()),
            ));
            Tag::pack(0, false).write(epilogue.header());
            assert_eq!(
                heap.check_heap(),
                Err(Inconsistency::Epilogue {
                    offset: heap.heap_size()
                })
            );
        }
    }

    #[test]
    fn unindexed_free_block() {
        let (heap, [_, b, _, _]) = heap();

        unsafe {
            Block::from_payload(b).encode(80, false);
            assert_eq!(
                heap.check_heap(),
                Err(Inconsistency::CountMismatch {
                    on_heap: 2,
                    indexed: 1
                })
            );
        }
    }

    #[test]
    fn missed_merge() {
        let (mut heap, [a, b, _, _]) = heap();

        unsafe {
            heap.deallocate(a.as_ptr()).unwrap();
            Block::from_payload(b).encode(80, false);
            assert_eq!(
                heap.check_heap(),
                Err(Inconsistency::AdjacentFree {
                    offset: offset(&heap, a),
                    next: offset(&heap, b)
                })
            );
        }
    }

    #[test]
    fn list_points_to_allocated_block() {
        let (heap, [a, _, _, _]) = heap();

        unsafe {
            let mut list = heap.free_lists().class(bucket_for(80));
            list.set_head(Some(Block::from_payload(a)));
            assert_eq!(
                heap.check_heap(),
                Err(Inconsistency::Unreachable {
                    bucket: bucket_for(80),
                    offset: offset(&heap, a)
                })
            );
        }
    }

    #[test]
    fn block_in_wrong_bucket() {
        let (mut heap, [_, b, _, _]) = heap();

        unsafe {
            heap.deallocate(b.as_ptr()).unwrap();
            let block = Block::from_payload(b);

            // Move it by hand to the 16 byte list.
            heap.free_lists().remove(block);
            let mut list = heap.free_lists().class(1);
            crate::list::link(&mut list, None, block, None);

            assert_eq!(
                heap.check_heap(),
                Err(Inconsistency::WrongBucket {
                    offset: offset(&heap, b),
                    size: 80,
                    bucket: 1,
                    expected: bucket_for(80)
                })
            );
        }
    }

    #[test]
    fn unsorted_bucket_and_broken_links() {
        let (mut heap, [a, _, c, _]) = heap();

        unsafe {
            heap.deallocate(a.as_ptr()).unwrap();
            heap.deallocate(c.as_ptr()).unwrap();

            let small = Block::from_payload(a);
            let big = Block::from_payload(c);
            assert_eq!(bucket_for(80), bucket_for(96));

            let mut list = heap.free_lists().class(bucket_for(80));
            assert_eq!(list.head(), Some(small));

            // Swap them: big -> small.
            list.set_head(Some(big));
            list.set_pred(big, None);
            list.set_succ(big, Some(small));
            list.set_pred(small, Some(big));
            list.set_succ(small, None);

            assert_eq!(
                heap.check_heap(),
                Err(Inconsistency::Unsorted {
                    bucket: bucket_for(80),
                    offset: offset(&heap, a)
                })
            );

            // Restore the order but forget one predecessor.
            list.set_head(Some(small));
            list.set_pred(small, None);
            list.set_succ(small, Some(big));
            list.set_succ(big, None);

            assert_eq!(
                heap.check_heap(),
                Err(Inconsistency::BrokenLink {
                    offset: offset(&heap, c)
                })
            );

            list.set_pred(big, Some(small));
            heap.check_heap().unwrap();
        }
    }

    #[test]
    fn links_outside_the_heap() {
        let (mut heap, [a, _, _, _]) = heap();

        unsafe {
            heap.deallocate(a.as_ptr()).unwrap();
            let block = Block::from_payload(a);
            let bucket = bucket_for(80);

            for offset in [0x0010_0000, heap.heap_size(), FIRST_BLOCK + 4, DSIZE] {
                block.succ_slot().as_ptr().cast::<u32>().write(offset as u32);

                assert_eq!(
                    heap.check_heap(),
                    Err(Inconsistency::Unreachable { bucket, offset })
                );
            }

            Link::NULL.write(block.succ_slot());
            heap.check_heap().unwrap();
        }
    }

    #[test]
    fn cycles_terminate() {
        let (mut heap, [a, _, _, _]) = heap();

        unsafe {
            heap.deallocate(a.as_ptr()).unwrap();
            let block = Block::from_payload(a);
            let mut list = heap.free_lists().class(bucket_for(80));
            list.set_succ(block, Some(block));

            assert!(heap.check_heap().is_err());
        }
    }
}
