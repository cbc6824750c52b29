//! Segregated free lists
//!
//! One intrusive doubly-linked list per [`SizeClass`]. The list heads live in
//! the bucket table at the start of the heap and the links live inside the
//! free blocks themselves, all stored as heap-relative offsets. The prologue
//! offset ([`BORDER_OFFSET`]) terminates every list, and since its status is
//! `Border` a walk stops as soon as it reaches a non-free block.
//!
//! Everything here goes through [`WordMemory`], so the lists do not care
//! whether they sit on a real heap or a plain buffer.

#[cfg(feature = "log")]
use log::error;

use super::{
    layout::{
        is_free, next_link_offset, prev_link_offset, size, WordMemory, BORDER_OFFSET,
        MIN_BLOCK_SIZE, WORD_SIZE,
    },
    size_class::SizeClass,
};

const fn bucket_offset(class: SizeClass) -> u32 {
    class.to_index() as u32 * WORD_SIZE
}

/// Mark every list empty
pub fn init<M: WordMemory + ?Sized>(mem: &mut M) {
    for class in SizeClass::ALL {
        mem.write_word(bucket_offset(class), BORDER_OFFSET);
    }
}

/// First block of `class`, or [`BORDER_OFFSET`] when empty
pub fn head<M: WordMemory + ?Sized>(mem: &M, class: SizeClass) -> u32 {
    mem.read_word(bucket_offset(class))
}

pub fn next<M: WordMemory + ?Sized>(mem: &M, p: u32) -> u32 {
    mem.read_word(next_link_offset(p))
}

pub fn prev<M: WordMemory + ?Sized>(mem: &M, p: u32) -> u32 {
    mem.read_word(prev_link_offset(p, size(mem, p)))
}

fn set_next<M: WordMemory + ?Sized>(mem: &mut M, p: u32, next: u32) {
    mem.write_word(next_link_offset(p), next);
}

fn set_prev<M: WordMemory + ?Sized>(mem: &mut M, p: u32, prev: u32) {
    let offset = prev_link_offset(p, size(mem, p));
    mem.write_word(offset, prev);
}

/// Link the free block `p` in at the head of `class`.
///
/// `p` must already carry its final size in the header, since the back link
/// is stored relative to the block end.
pub fn push<M: WordMemory + ?Sized>(mem: &mut M, p: u32, class: SizeClass) {
    let old_head = head(mem, class);
    if is_free(mem, old_head) {
        set_prev(mem, old_head, p);
    }
    set_next(mem, p, old_head);
    set_prev(mem, p, BORDER_OFFSET);
    mem.write_word(bucket_offset(class), p);
}

/// Unlink `p` from `class`; its size must be the one it was pushed with.
pub fn remove<M: WordMemory + ?Sized>(mem: &mut M, p: u32, class: SizeClass) {
    let prev_block = prev(mem, p);
    let next_block = next(mem, p);
    if is_free(mem, prev_block) {
        set_next(mem, prev_block, next_block);
    }
    if is_free(mem, next_block) {
        set_prev(mem, next_block, prev_block);
    }
    if head(mem, class) == p {
        mem.write_word(bucket_offset(class), next_block);
    }
}

/// First block in `class` of at least `min_size` bytes.
///
/// `limit` bounds the walk; a longer list can only be a corrupted one.
pub fn find_fit<M: WordMemory + ?Sized>(
    mem: &M,
    class: SizeClass,
    min_size: u32,
    limit: usize,
) -> Option<u32> {
    iter(mem, class, limit).find(|&p| size(mem, p) >= min_size)
}

/// Walk the list of `class`
pub fn iter<M: WordMemory + ?Sized>(mem: &M, class: SizeClass, limit: usize) -> FreeListIter<'_, M> {
    FreeListIter {
        mem,
        current: head(mem, class),
        remaining: limit,
    }
}

/// Upper bound on the number of free blocks a heap of `heap_size` bytes holds
pub const fn walk_limit(heap_size: usize) -> usize {
    heap_size / MIN_BLOCK_SIZE as usize + 1
}

/// Iterator over the blocks of one free list
pub struct FreeListIter<'a, M: WordMemory + ?Sized> {
    mem: &'a M,
    current: u32,
    remaining: usize,
}

impl<M: WordMemory + ?Sized> Iterator for FreeListIter<'_, M> {
    type Item = u32;

    fn next(&mut self) -> Option<Self::Item> {
        if !is_free(self.mem, self.current) {
            return None;
        }
        if self.remaining == 0 {
            error!("Potential cycle detected in free list at {:#x}", self.current);
            return None;
        }
        self.remaining -= 1;
        let p = self.current;
        self.current = next(self.mem, p);
        Some(p)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::boundary_tag::{BlockStatus, BoundaryTag};
    use crate::heap::layout::{header_offset, write_tags, FIRST_BLOCK_OFFSET};
    use alloc::vec;
    use alloc::vec::Vec;

    /// Plain word buffer standing in for a heap
    struct WordBuf(Vec<u32>);

    impl WordBuf {
        /// Bucket table, prologue and `sizes.len()` free blocks, then epilogue
        fn with_free_blocks(sizes: &[u32]) -> (Self, Vec<u32>) {
            let total = FIRST_BLOCK_OFFSET + sizes.iter().sum::<u32>();
            let mut buf = WordBuf(vec![0; total as usize / 4]);
            init(&mut buf);
            buf.write_word(
                header_offset(BORDER_OFFSET),
                BoundaryTag::new(WORD_SIZE, BlockStatus::Border).raw(),
            );
            let mut blocks = Vec::new();
            let mut p = FIRST_BLOCK_OFFSET;
            for &block_size in sizes {
                write_tags(&mut buf, p, block_size, BlockStatus::Free);
                blocks.push(p);
                p += block_size;
            }
            buf.write_word(
                header_offset(p),
                BoundaryTag::new(0, BlockStatus::Border).raw(),
            );
            (buf, blocks)
        }

        fn list(&self, class: SizeClass) -> Vec<u32> {
            iter(self, class, 64).collect()
        }
    }

    impl WordMemory for WordBuf {
        fn read_word(&self, offset: u32) -> u32 {
            self.0[offset as usize / 4]
        }

        fn write_word(&mut self, offset: u32, value: u32) {
            self.0[offset as usize / 4] = value;
        }
    }

    #[test]
    fn test_empty_lists() {
        let (buf, _) = WordBuf::with_free_blocks(&[]);
        for class in SizeClass::ALL {
            assert_eq!(head(&buf, class), BORDER_OFFSET);
            assert!(buf.list(class).is_empty());
            assert_eq!(find_fit(&buf, class, 16, 64), None);
        }
    }

    #[test]
    fn test_push_is_lifo_with_back_links() {
        let (mut buf, blocks) = WordBuf::with_free_blocks(&[32, 48, 64]);
        let class = SizeClass::UpTo256;
        for &p in &blocks {
            push(&mut buf, p, class);
        }
        assert_eq!(buf.list(class), [blocks[2], blocks[1], blocks[0]]);
        assert_eq!(prev(&buf, blocks[2]), BORDER_OFFSET);
        assert_eq!(prev(&buf, blocks[1]), blocks[2]);
        assert_eq!(prev(&buf, blocks[0]), blocks[1]);
        assert_eq!(next(&buf, blocks[0]), BORDER_OFFSET);
    }

    #[test]
    fn test_remove_everywhere() {
        let (mut buf, blocks) = WordBuf::with_free_blocks(&[16, 24, 32, 40]);
        let class = SizeClass::UpTo256;
        for &p in &blocks {
            push(&mut buf, p, class);
        }
        // list: 3 2 1 0
        remove(&mut buf, blocks[1], class);
        assert_eq!(buf.list(class), [blocks[3], blocks[2], blocks[0]]);
        assert_eq!(prev(&buf, blocks[0]), blocks[2]);

        remove(&mut buf, blocks[3], class);
        assert_eq!(head(&buf, class), blocks[2]);
        assert_eq!(prev(&buf, blocks[2]), BORDER_OFFSET);

        remove(&mut buf, blocks[0], class);
        assert_eq!(buf.list(class), [blocks[2]]);
        assert_eq!(next(&buf, blocks[2]), BORDER_OFFSET);

        remove(&mut buf, blocks[2], class);
        assert!(buf.list(class).is_empty());
        assert_eq!(head(&buf, class), BORDER_OFFSET);
    }

    #[test]
    fn test_find_fit_is_first_fit() {
        let (mut buf, blocks) = WordBuf::with_free_blocks(&[64, 32, 128]);
        let class = SizeClass::UpTo256;
        for &p in &blocks {
            push(&mut buf, p, class);
        }
        // list: 128 32 64
        assert_eq!(find_fit(&buf, class, 16, 64), Some(blocks[2]));
        assert_eq!(find_fit(&buf, class, 200, 64), None);
        remove(&mut buf, blocks[2], class);
        assert_eq!(find_fit(&buf, class, 48, 64), Some(blocks[0]));
        assert_eq!(find_fit(&buf, class, 16, 64), Some(blocks[1]));
    }

    #[test]
    fn test_lists_are_independent() {
        let (mut buf, blocks) = WordBuf::with_free_blocks(&[32, 512, 2048]);
        push(&mut buf, blocks[0], SizeClass::UpTo256);
        push(&mut buf, blocks[1], SizeClass::UpTo512);
        push(&mut buf, blocks[2], SizeClass::Larger);
        assert_eq!(buf.list(SizeClass::UpTo256), [blocks[0]]);
        assert_eq!(buf.list(SizeClass::UpTo512), [blocks[1]]);
        assert!(buf.list(SizeClass::UpTo1024).is_empty());
        assert_eq!(buf.list(SizeClass::Larger), [blocks[2]]);

        remove(&mut buf, blocks[1], SizeClass::UpTo512);
        assert!(buf.list(SizeClass::UpTo512).is_empty());
        assert_eq!(buf.list(SizeClass::Larger), [blocks[2]]);
    }

    #[test]
    fn test_walk_limit_stops_cycles() {
        let (mut buf, blocks) = WordBuf::with_free_blocks(&[16, 16]);
        let class = SizeClass::UpTo256;
        push(&mut buf, blocks[0], class);
        push(&mut buf, blocks[1], class);
        // corrupt: point the tail back at the head
        buf.write_word(next_link_offset(blocks[0]), blocks[1]);
        assert_eq!(iter(&buf, class, 5).count(), 5);
    }
}
