//! Boundary tags
//!
//! Every heap block starts with a header word and ends with a footer word,
//! both holding the same [`BoundaryTag`]: the block size with the status
//! packed into the two low bits.

use super::layout::WORD_SIZE;

const STATUS_MASK: u32 = 0x3;

/// State of a heap block as recorded in its tags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum BlockStatus {
    Used = 1,
    Free = 2,
    /// Prologue or epilogue sentinel, never allocatable
    Border = 3,
}

impl BlockStatus {
    const fn from_bits(bits: u32) -> Option<Self> {
        match bits {
            1 => Some(Self::Used),
            2 => Some(Self::Free),
            3 => Some(Self::Border),
            _ => None,
        }
    }
}

/// A packed `(size, status)` word
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct BoundaryTag(u32);

impl BoundaryTag {
    /// Pack `size` and `status`.
    ///
    /// # Panics
    /// If `size` is not a multiple of the word size, which would clobber the
    /// status bits.
    pub const fn new(size: u32, status: BlockStatus) -> Self {
        assert!(
            size.is_multiple_of(WORD_SIZE),
            "block size must be a multiple of the word size"
        );
        Self(size | status as u32)
    }

    /// Reinterpret a word read from the heap
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    pub const fn size(self) -> u32 {
        self.0 & !STATUS_MASK
    }

    /// `None` for a word that was never written as a tag
    pub const fn status(self) -> Option<BlockStatus> {
        BlockStatus::from_bits(self.0 & STATUS_MASK)
    }

    pub fn is(self, status: BlockStatus) -> bool {
        self.status() == Some(status)
    }
}

impl core::fmt::Debug for BoundaryTag {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("BoundaryTag")
            .field("size", &self.size())
            .field("status", &self.status())
            .finish()
    }
}
