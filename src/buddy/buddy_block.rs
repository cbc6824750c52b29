//! Buddy block metadata
//!
//! Each tracked block is a node of a complete binary tree laid over the
//! arena. The root (index 0) covers every page; node `i` has children
//! `2i + 1` and `2i + 2`.

/// Largest supported rank number (an arena of `2^(MAX_RANK_NUM - 1)` pages)
pub const MAX_RANK_NUM: usize = 21;

/// Largest supported arena, in pages
pub const MAX_PAGE_NUM: usize = 1 << (MAX_RANK_NUM - 1);

/// Tree index of the root block
pub const ROOT: u32 = 0;

/// Lifecycle state of a metadata record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockStatus {
    /// Subsumed by a larger block, the record is stale.
    Undefined,
    /// Linked into the free list of its rank.
    Free,
    /// Handed out to a client.
    Allocated,
}

/// Buddy block metadata
///
/// `prev`/`next` are page slots of the neighbouring records in the free list
/// of `rank`; they only mean something while `status` is [`BlockStatus::Free`].
#[derive(Debug, Clone, Copy)]
pub struct BuddyBlock {
    pub status: BlockStatus,
    pub rank: u8,
    pub index: u32,
    pub prev: Option<usize>,
    pub next: Option<usize>,
}

impl BuddyBlock {
    pub const UNDEFINED: Self = Self {
        status: BlockStatus::Undefined,
        rank: 0,
        index: 0,
        prev: None,
        next: None,
    };

    /// A fresh, unlinked free block
    pub const fn free(rank: usize, index: u32) -> Self {
        Self {
            status: BlockStatus::Free,
            rank: rank as u8,
            index,
            prev: None,
            next: None,
        }
    }

    pub const fn rank(&self) -> usize {
        self.rank as usize
    }
}

impl Default for BuddyBlock {
    fn default() -> Self {
        Self::UNDEFINED
    }
}

#[inline]
pub const fn parent(index: u32) -> u32 {
    (index - 1) / 2
}

/// Left (`right == false`) or right child of `index`
#[inline]
pub const fn child(index: u32, right: bool) -> u32 {
    index * 2 + 1 + right as u32
}

/// Sibling of a non-root node.
///
/// Children of `p` are `2p + 1` and `2p + 2`; shifted down by one they become
/// `2p` and `2p + 1`, which differ only in bit 0.
#[inline]
pub const fn buddy(index: u32) -> u32 {
    ((index - 1) ^ 1) + 1
}

/// Index of the leftmost node at `rank`
#[inline]
pub const fn first_index(rank: usize, rank_num: usize) -> u32 {
    (1u32 << (rank_num - rank)) - 1
}

/// First page covered by node `index` at `rank`
#[inline]
pub const fn index_to_page(index: u32, rank: usize, rank_num: usize) -> usize {
    ((index - first_index(rank, rank_num)) as usize) << (rank - 1)
}
