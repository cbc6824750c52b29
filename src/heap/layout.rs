//! Heap layout and block addressing
//!
//! All positions are byte offsets from the heap base, so nothing here depends
//! on where the heap lives in memory. A block is addressed by its payload
//! offset `p`:
//!
//! ```text
//!  p-4        p                           p+size-12   p+size-8
//!  | header   | next link | ...           | prev link | footer |
//! ```
//!
//! The heap itself starts with the bucket-head table, followed by the
//! prologue (a lone header of size one word) and ends with the epilogue
//! header:
//!
//! ```text
//!  0             16         20          24                      size-4
//!  | bucket heads | prologue | block ... | block ... | epilogue |
//! ```

use super::boundary_tag::{BlockStatus, BoundaryTag};
use super::size_class::SizeClass;

/// Width of a tag or link word
pub const WORD_SIZE: u32 = 4;

/// Payload alignment; every block size is a multiple of it
pub const ALIGNMENT: u32 = 8;

/// Header plus footer
pub const META_SIZE: u32 = 2 * WORD_SIZE;

/// Header, two links and footer
pub const MIN_BLOCK_SIZE: u32 = 4 * WORD_SIZE;

/// Payload offset of the prologue, doubling as the "empty list" marker
pub const BORDER_OFFSET: u32 =
    crate::align_up(SizeClass::COUNT * WORD_SIZE as usize, ALIGNMENT as usize) as u32 + WORD_SIZE;

/// Payload offset of the first real block
pub const FIRST_BLOCK_OFFSET: u32 = BORDER_OFFSET + WORD_SIZE;

/// Size of a heap holding no blocks: bucket table, prologue, epilogue
pub const EMPTY_HEAP_SIZE: u32 = FIRST_BLOCK_OFFSET;

/// Word-level access to heap memory.
///
/// Implementations panic on offsets outside the current heap.
pub trait WordMemory {
    fn read_word(&self, offset: u32) -> u32;
    fn write_word(&mut self, offset: u32, value: u32);
}

/// Block size (header plus payload plus footer) needed for a `size`-byte
/// request, or `None` if it does not fit in a tag.
pub fn adjusted_size(size: usize) -> Option<u32> {
    let padded = size.checked_add(META_SIZE as usize + ALIGNMENT as usize - 1)?;
    let aligned = padded & !(ALIGNMENT as usize - 1);
    let aligned = u32::try_from(aligned).ok()?;
    Some(aligned.max(MIN_BLOCK_SIZE))
}

#[inline]
pub const fn header_offset(p: u32) -> u32 {
    p - WORD_SIZE
}

#[inline]
pub const fn footer_offset(p: u32, size: u32) -> u32 {
    p + size - 2 * WORD_SIZE
}

#[inline]
pub const fn next_link_offset(p: u32) -> u32 {
    p
}

#[inline]
pub const fn prev_link_offset(p: u32, size: u32) -> u32 {
    p + size - 3 * WORD_SIZE
}

/// Header tag of the block at `p`
pub fn tag<M: WordMemory + ?Sized>(mem: &M, p: u32) -> BoundaryTag {
    BoundaryTag::from_raw(mem.read_word(header_offset(p)))
}

pub fn size<M: WordMemory + ?Sized>(mem: &M, p: u32) -> u32 {
    tag(mem, p).size()
}

pub fn status<M: WordMemory + ?Sized>(mem: &M, p: u32) -> Option<BlockStatus> {
    tag(mem, p).status()
}

pub fn is_free<M: WordMemory + ?Sized>(mem: &M, p: u32) -> bool {
    tag(mem, p).is(BlockStatus::Free)
}

/// Footer tag of the block at `p`
pub fn footer_tag<M: WordMemory + ?Sized>(mem: &M, p: u32) -> BoundaryTag {
    BoundaryTag::from_raw(mem.read_word(footer_offset(p, size(mem, p))))
}

/// Write matching header and footer
pub fn write_tags<M: WordMemory + ?Sized>(mem: &mut M, p: u32, size: u32, status: BlockStatus) {
    let tag = BoundaryTag::new(size, status).raw();
    mem.write_word(header_offset(p), tag);
    mem.write_word(footer_offset(p, size), tag);
}

/// Block physically following `p`
pub fn heap_next<M: WordMemory + ?Sized>(mem: &M, p: u32) -> u32 {
    p + size(mem, p)
}

/// Block physically preceding `p`, found through its footer.
///
/// For the first block this lands on the prologue, whose lone header sits
/// where a footer would be.
pub fn heap_prev<M: WordMemory + ?Sized>(mem: &M, p: u32) -> u32 {
    let prev_footer = BoundaryTag::from_raw(mem.read_word(p - 2 * WORD_SIZE));
    p - prev_footer.size()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_offsets() {
        assert_eq!(BORDER_OFFSET, 20);
        assert_eq!(FIRST_BLOCK_OFFSET, 24);
        assert_eq!(EMPTY_HEAP_SIZE, 24);
        assert_eq!(FIRST_BLOCK_OFFSET % ALIGNMENT, 0);
    }

    #[test]
    fn test_adjusted_size() {
        assert_eq!(adjusted_size(1), Some(16));
        assert_eq!(adjusted_size(8), Some(16));
        assert_eq!(adjusted_size(9), Some(24));
        assert_eq!(adjusted_size(16), Some(24));
        assert_eq!(adjusted_size(32), Some(40));
        assert_eq!(adjusted_size(usize::MAX), None);
        assert_eq!(adjusted_size(u32::MAX as usize), None);
    }

    #[test]
    fn test_link_offsets_inside_minimum_block() {
        let p = FIRST_BLOCK_OFFSET;
        assert_eq!(header_offset(p), p - 4);
        assert_eq!(next_link_offset(p), p);
        assert_eq!(prev_link_offset(p, MIN_BLOCK_SIZE), p + 4);
        assert_eq!(footer_offset(p, MIN_BLOCK_SIZE), p + 8);
        // the next block's header follows the footer directly
        assert_eq!(header_offset(p + MIN_BLOCK_SIZE), p + 12);
    }
}
