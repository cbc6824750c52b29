//! Buddy + segregated-fit memory allocators
//!
//! This crate implements two independent allocators over raw, linear address
//! ranges:
//! - Buddy page allocator serving power-of-two runs of pages
//! - Segregated-fit heap serving byte-granularity requests with boundary tags
//!
//! Neither allocator is thread-safe; callers sharing one across threads must
//! provide their own locking.

#![no_std]

extern crate alloc;

use core::ptr::NonNull;

// Logging support - conditionally import log crate
#[cfg(feature = "log")]
extern crate log;

// Stub macros when log is disabled - these become no-ops
#[cfg(not(feature = "log"))]
macro_rules! error {
    ($($arg:tt)*) => {};
}
#[cfg(not(feature = "log"))]
macro_rules! warn {
    ($($arg:tt)*) => {};
}
#[cfg(not(feature = "log"))]
macro_rules! info {
    ($($arg:tt)*) => {};
}
#[cfg(not(feature = "log"))]
macro_rules! debug {
    ($($arg:tt)*) => {};
}
#[cfg(not(feature = "log"))]
#[allow(unused_macros)]
macro_rules! trace {
    ($($arg:tt)*) => {};
}

/// Default page size
pub const DEFAULT_PAGE_SIZE: usize = 0x1000;

/// The error type used for allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    /// Out-of-range rank, misaligned or out-of-bounds address, or an address
    /// whose block is not in the expected state (e.g. double free).
    InvalidArgument,
    /// No free block of sufficient rank or size is available.
    OutOfSpace,
    /// The backing store could not be grown.
    AllocationFailure,
}

/// A [`Result`] type with [`AllocError`] as the error type.
pub type AllocResult<T = ()> = Result<T, AllocError>;

/// Page-granularity allocator handing out blocks of `2^(rank-1)` pages.
pub trait PageAllocator {
    /// The size of a memory page.
    const PAGE_SIZE: usize;

    /// Take over the arena `[base, base + page_count * PAGE_SIZE)`.
    fn init(&mut self, base: usize, page_count: usize) -> AllocResult;

    /// Allocate a block of the given rank and return its address.
    fn alloc_pages(&mut self, rank: usize) -> AllocResult<usize>;

    /// Return a block previously handed out by [`PageAllocator::alloc_pages`].
    fn dealloc_pages(&mut self, addr: usize) -> AllocResult;

    /// Rank of the tracked block starting at `addr`.
    fn query_rank(&self, addr: usize) -> AllocResult<usize>;

    /// Number of free blocks of the given rank.
    fn query_free_count(&self, rank: usize) -> AllocResult<usize>;

    /// Returns the total number of memory pages.
    fn total_pages(&self) -> usize;

    /// Returns the number of allocated memory pages.
    fn used_pages(&self) -> usize;

    /// Returns the number of available memory pages.
    fn available_pages(&self) -> usize;
}

/// Byte-granularity allocator following the `malloc` family contract.
///
/// Failures surface as `None`; freeing or resizing an invalid pointer is a
/// no-op rather than an error.
pub trait ByteAllocator {
    /// Allocate at least `size` bytes. `size == 0` yields `None`.
    fn alloc(&mut self, size: usize) -> Option<NonNull<u8>>;

    /// Release a block. `None` and unknown pointers are ignored.
    fn dealloc(&mut self, ptr: Option<NonNull<u8>>);

    /// Grow or shrink a block, possibly moving it.
    fn resize(&mut self, ptr: Option<NonNull<u8>>, new_size: usize) -> Option<NonNull<u8>>;

    /// Allocate `count * size` zeroed bytes.
    fn zero_alloc(&mut self, count: usize, size: usize) -> Option<NonNull<u8>>;

    /// Returns total memory size in bytes.
    fn total_bytes(&self) -> usize;

    /// Returns allocated memory size in bytes.
    fn used_bytes(&self) -> usize;

    /// Returns available memory size in bytes.
    fn available_bytes(&self) -> usize;
}

#[inline]
const fn align_up(pos: usize, align: usize) -> usize {
    (pos + align - 1) & !(align - 1)
}

/// Checks whether the address has the demanded alignment.
///
/// Equivalent to `addr % align == 0`, but the alignment must be a power of two.
#[inline]
const fn is_aligned(base_addr: usize, align: usize) -> bool {
    base_addr & (align - 1) == 0
}

pub mod buddy;
pub use buddy::{BuddyPageAllocator, BuddyStats, MAX_PAGE_NUM, MAX_RANK_NUM};

pub mod heap;
// both modules define a `BlockStatus`; reach them through `buddy::` and `heap::`
pub use heap::{
    BackingStore, BoundaryTag, HeapCheckError, HeapReport, OwnedRegion, RawRegion,
    SegregatedHeap, SizeClass,
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_helpers() {
        assert_eq!(align_up(0, 8), 0);
        assert_eq!(align_up(1, 8), 8);
        assert_eq!(align_up(16, 8), 16);
        assert_eq!(align_up(17, 0x1000), 0x1000);
        assert!(is_aligned(0x2000, 0x1000));
        assert!(!is_aligned(0x2004, 8));
    }
}
