//! Heap consistency checking
//!
//! A full walk over the heap and every free list. Meant for tests and
//! debugging: it is linear in the heap size and allocates its report.

use alloc::vec;
use alloc::vec::Vec;
use core::fmt;

#[cfg(feature = "log")]
use log::{debug, error};

use super::{
    backing::BackingStore,
    boundary_tag::{BlockStatus, BoundaryTag},
    free_list,
    layout::{
        footer_tag, header_offset, prev_link_offset, tag, ALIGNMENT, BORDER_OFFSET,
        EMPTY_HEAP_SIZE, FIRST_BLOCK_OFFSET, MIN_BLOCK_SIZE, WORD_SIZE,
    },
    seg_heap::SegregatedHeap,
    size_class::SizeClass,
};

/// One block found while walking the heap
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    /// Payload offset
    pub offset: u32,
    /// Block size, tags included
    pub size: u32,
    pub status: BlockStatus,
}

/// Snapshot of a consistent heap
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeapReport {
    pub heap_size: usize,
    /// All blocks in address order, borders excluded
    pub blocks: Vec<BlockInfo>,
    /// Payload offsets of each free list, head first, indexed by size class
    pub free_lists: [Vec<u32>; SizeClass::COUNT],
}

impl HeapReport {
    pub fn used_bytes(&self) -> usize {
        self.bytes_with(BlockStatus::Used)
    }

    pub fn free_bytes(&self) -> usize {
        self.bytes_with(BlockStatus::Free)
    }

    fn bytes_with(&self, status: BlockStatus) -> usize {
        self.blocks
            .iter()
            .filter(|b| b.status == status)
            .map(|b| b.size as usize)
            .sum()
    }

    pub fn free_list(&self, class: SizeClass) -> &[u32] {
        &self.free_lists[class.to_index()]
    }
}

/// First inconsistency found by [`SegregatedHeap::check`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeapCheckError {
    Uninitialized,
    /// Prologue tag missing or wrong
    BadPrologue,
    /// Epilogue tag missing or wrong at the end of the heap
    BadEpilogue { offset: u32 },
    /// Tag with no valid status, or a border inside the heap
    BadStatus { offset: u32 },
    /// Size too small, not aligned, or running past the heap end
    BadSize { offset: u32, size: u32 },
    /// Header and footer disagree
    TagMismatch { offset: u32 },
    /// Two free blocks next to each other
    AdjacentFree { offset: u32 },
    /// Tracked used bytes disagree with the blocks found
    UsedBytesMismatch { tracked: usize, found: usize },
    /// A list entry that is not a free block of the heap
    NotFree { class: SizeClass, offset: u32 },
    /// A free block linked into the list of another class
    WrongClass { class: SizeClass, offset: u32 },
    /// Back link does not point at the predecessor in the list
    BrokenLink { class: SizeClass, offset: u32 },
    /// A block reached twice while walking the lists
    Cycle { class: SizeClass, offset: u32 },
    /// A free block that is on no list
    Unlisted { offset: u32 },
}

impl fmt::Display for HeapCheckError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::Uninitialized => write!(f, "heap is not initialized"),
            Self::BadPrologue => write!(f, "bad prologue"),
            Self::BadEpilogue { offset } => write!(f, "bad epilogue at {:#x}", offset),
            Self::BadStatus { offset } => write!(f, "bad status in block at {:#x}", offset),
            Self::BadSize { offset, size } => {
                write!(f, "bad size {:#x} of block at {:#x}", size, offset)
            }
            Self::TagMismatch { offset } => {
                write!(f, "header and footer differ in block at {:#x}", offset)
            }
            Self::AdjacentFree { offset } => {
                write!(f, "free block at {:#x} follows another free block", offset)
            }
            Self::UsedBytesMismatch { tracked, found } => write!(
                f,
                "{:#x} used bytes tracked, {:#x} found",
                tracked, found
            ),
            Self::NotFree { class, offset } => {
                write!(f, "{:?} list holds non-free offset {:#x}", class, offset)
            }
            Self::WrongClass { class, offset } => {
                write!(f, "block at {:#x} is on the {:?} list", offset, class)
            }
            Self::BrokenLink { class, offset } => {
                write!(f, "{:?} list: bad back link at {:#x}", class, offset)
            }
            Self::Cycle { class, offset } => {
                write!(f, "{:?} list: cycle through {:#x}", class, offset)
            }
            Self::Unlisted { offset } => {
                write!(f, "free block at {:#x} is on no list", offset)
            }
        }
    }
}

impl<S: BackingStore> SegregatedHeap<S> {
    /// Walk the whole heap and every free list, verifying all structural
    /// invariants.
    pub fn check(&self) -> Result<HeapReport, HeapCheckError> {
        if !self.initialized {
            return Err(HeapCheckError::Uninitialized);
        }
        let heap_size = self.heap_size();
        let prologue = self.store.read_word(header_offset(BORDER_OFFSET));
        if prologue != BoundaryTag::new(WORD_SIZE, BlockStatus::Border).raw() {
            return Err(HeapCheckError::BadPrologue);
        }

        let blocks = self.check_blocks(heap_size)?;
        let found = blocks
            .iter()
            .filter(|b| b.status == BlockStatus::Used)
            .map(|b| b.size as usize)
            .sum();
        if found != self.used_bytes {
            return Err(HeapCheckError::UsedBytesMismatch {
                tracked: self.used_bytes,
                found,
            });
        }

        let free_lists = self.check_free_lists(&blocks)?;
        Ok(HeapReport {
            heap_size: heap_size as usize,
            blocks,
            free_lists,
        })
    }

    /// Walk blocks from the first to the epilogue
    fn check_blocks(&self, heap_size: u32) -> Result<Vec<BlockInfo>, HeapCheckError> {
        let mut blocks = Vec::new();
        let mut prev_free = false;
        let mut p = FIRST_BLOCK_OFFSET;
        while p < heap_size {
            let header = tag(&self.store, p);
            let status = match header.status() {
                Some(status @ (BlockStatus::Used | BlockStatus::Free)) => status,
                _ => return Err(HeapCheckError::BadStatus { offset: p }),
            };
            let size = header.size();
            let fits = p.checked_add(size).is_some_and(|end| end <= heap_size);
            if size < MIN_BLOCK_SIZE || !size.is_multiple_of(ALIGNMENT) || !fits {
                return Err(HeapCheckError::BadSize { offset: p, size });
            }
            if footer_tag(&self.store, p) != header {
                return Err(HeapCheckError::TagMismatch { offset: p });
            }
            let is_free = status == BlockStatus::Free;
            if is_free && prev_free {
                return Err(HeapCheckError::AdjacentFree { offset: p });
            }
            prev_free = is_free;
            blocks.push(BlockInfo {
                offset: p,
                size,
                status,
            });
            p += size;
        }

        // every block size is a multiple of 8 and the walk starts at 24, so
        // reaching the end means `24 + sum of sizes == heap_size`
        let epilogue = self.store.read_word(header_offset(heap_size));
        if p != heap_size || epilogue != BoundaryTag::new(0, BlockStatus::Border).raw() {
            return Err(HeapCheckError::BadEpilogue { offset: p });
        }
        debug_assert_eq!(
            EMPTY_HEAP_SIZE as usize + blocks.iter().map(|b| b.size as usize).sum::<usize>(),
            heap_size as usize
        );
        Ok(blocks)
    }

    /// Walk every list, matching entries against the free blocks found
    fn check_free_lists(
        &self,
        blocks: &[BlockInfo],
    ) -> Result<[Vec<u32>; SizeClass::COUNT], HeapCheckError> {
        let mut lists: [Vec<u32>; SizeClass::COUNT] = Default::default();
        let mut listed = vec![false; blocks.len()];

        for class in SizeClass::ALL {
            let list = &mut lists[class.to_index()];
            let mut prev = BORDER_OFFSET;
            let mut p = free_list::head(&self.store, class);
            while p != BORDER_OFFSET {
                let index = blocks
                    .binary_search_by_key(&p, |b| b.offset)
                    .ok()
                    .filter(|&i| blocks[i].status == BlockStatus::Free)
                    .ok_or(HeapCheckError::NotFree { class, offset: p })?;
                if listed[index] {
                    return Err(HeapCheckError::Cycle { class, offset: p });
                }
                listed[index] = true;

                let size = blocks[index].size;
                if SizeClass::from_size(size) != class {
                    return Err(HeapCheckError::WrongClass { class, offset: p });
                }
                if self.store.read_word(prev_link_offset(p, size)) != prev {
                    return Err(HeapCheckError::BrokenLink { class, offset: p });
                }
                list.push(p);
                prev = p;
                p = free_list::next(&self.store, p);
            }
        }

        for (block, &on_list) in blocks.iter().zip(&listed) {
            if block.status == BlockStatus::Free && !on_list {
                return Err(HeapCheckError::Unlisted {
                    offset: block.offset,
                });
            }
        }
        Ok(lists)
    }

    /// Log the block layout and free lists at debug level
    #[cfg_attr(not(feature = "log"), allow(unused_variables))]
    pub fn dump(&self) {
        debug!(
            "heap @ {:p}: {:#x} bytes, {:#x} used",
            self.store.base(),
            self.store.size(),
            self.used_bytes
        );
        match self.check() {
            Ok(report) => {
                for block in &report.blocks {
                    debug!(
                        "  [{:#08x}, {:#08x}) {:?}",
                        block.offset,
                        block.offset + block.size,
                        block.status
                    );
                }
                for class in SizeClass::ALL {
                    debug!("  {:?} list: {:x?}", class, report.free_list(class));
                }
            }
            Err(_e) => {
                error!("heap is inconsistent: {}", _e);
            }
        }
    }
}
