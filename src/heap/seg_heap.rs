//! Segregated-fit heap allocator
//!
//! Blocks carry boundary tags on both ends, free blocks are kept in four
//! size-segregated lists and searched first-fit, and freed blocks are merged
//! with free neighbours immediately. The heap only grows, by extending the
//! backing store at its end.

use core::ptr::NonNull;

use crate::{AllocError, AllocResult, ByteAllocator};

#[cfg(feature = "log")]
use log::{debug, info, warn};

use super::{
    backing::BackingStore,
    boundary_tag::{BlockStatus, BoundaryTag},
    free_list,
    layout::{
        adjusted_size, footer_tag, header_offset, heap_next, heap_prev, is_free, size, tag,
        write_tags, ALIGNMENT, BORDER_OFFSET, EMPTY_HEAP_SIZE, FIRST_BLOCK_OFFSET, META_SIZE,
        MIN_BLOCK_SIZE, WORD_SIZE,
    },
    size_class::SizeClass,
};

/// Byte-granularity heap on top of a [`BackingStore`]
pub struct SegregatedHeap<S: BackingStore> {
    pub(super) store: S,
    pub(super) initialized: bool,
    /// Sum of the sizes of all `Used` blocks, tags included
    pub(super) used_bytes: usize,
}

impl<S: BackingStore> SegregatedHeap<S> {
    /// Wrap an empty store (uninitialized, must call init())
    pub const fn new(store: S) -> Self {
        Self {
            store,
            initialized: false,
            used_bytes: 0,
        }
    }

    /// Lay out an empty heap: bucket table, prologue and epilogue.
    pub fn init(&mut self) -> AllocResult {
        if self.initialized || self.store.size() != 0 {
            warn!(
                "heap: store already holds {:#x} bytes, refusing to initialize",
                self.store.size()
            );
            return Err(AllocError::InvalidArgument);
        }
        self.store.extend(EMPTY_HEAP_SIZE as usize)?;

        free_list::init(&mut self.store);
        self.store.write_word(
            header_offset(BORDER_OFFSET),
            BoundaryTag::new(WORD_SIZE, BlockStatus::Border).raw(),
        );
        self.store.write_word(
            header_offset(FIRST_BLOCK_OFFSET),
            BoundaryTag::new(0, BlockStatus::Border).raw(),
        );

        self.initialized = true;
        self.used_bytes = 0;
        info!("heap initialized at {:p}", self.store.base());
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// The backing store
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Current heap size in bytes
    pub(super) fn heap_size(&self) -> u32 {
        self.store.size() as u32
    }

    /// Allocate at least `size` bytes, 8-byte aligned.
    pub fn alloc(&mut self, size: usize) -> Option<NonNull<u8>> {
        if size == 0 {
            return None;
        }
        if !self.initialized {
            warn!("heap: alloc on uninitialized heap");
            return None;
        }
        let Some(asize) = adjusted_size(size) else {
            warn!("heap: request of {:#x} bytes is too large", size);
            return None;
        };

        let p = match self.find_fit(asize) {
            Some((p, class)) => {
                free_list::remove(&mut self.store, p, class);
                self.place(p, asize);
                p
            }
            None => self.extend_heap(asize)?,
        };
        debug!("heap: alloc {:#x} bytes at offset {:#x}", size, p);
        Some(self.store.ptr_at(p))
    }

    /// Release a block. Pointers not handed out by this heap, or already
    /// freed, are ignored.
    pub fn dealloc(&mut self, ptr: Option<NonNull<u8>>) {
        let Some(ptr) = ptr else {
            return;
        };
        let Some(p) = self.checked_block(ptr) else {
            warn!("heap: ignoring free of invalid pointer {:p}", ptr);
            return;
        };

        let block_size = size(&self.store, p);
        self.used_bytes -= block_size as usize;
        write_tags(&mut self.store, p, block_size, BlockStatus::Free);
        debug!("heap: free {:#x} bytes at offset {:#x}", block_size, p);

        let (p, merged_size) = self.coalesce(p, block_size);
        write_tags(&mut self.store, p, merged_size, BlockStatus::Free);
        free_list::push(&mut self.store, p, SizeClass::from_size(merged_size));
    }

    /// Resize a block to hold `new_size` bytes, in place when possible.
    ///
    /// Returns `None` if the block cannot be resized, in which case the old
    /// block is left untouched.
    pub fn resize(&mut self, ptr: Option<NonNull<u8>>, new_size: usize) -> Option<NonNull<u8>> {
        let Some(ptr) = ptr else {
            return self.alloc(new_size);
        };
        if new_size == 0 {
            self.dealloc(Some(ptr));
            return None;
        }
        let Some(p) = self.checked_block(ptr) else {
            warn!("heap: ignoring resize of invalid pointer {:p}", ptr);
            return None;
        };
        let Some(asize) = adjusted_size(new_size) else {
            warn!("heap: resize to {:#x} bytes is too large", new_size);
            return None;
        };

        let block_size = size(&self.store, p);
        if asize <= block_size {
            return Some(ptr);
        }

        let next = heap_next(&self.store, p);
        if is_free(&self.store, next) {
            let next_size = size(&self.store, next);
            if block_size + next_size >= asize {
                debug!(
                    "heap: grow block at {:#x} into next free block at {:#x}",
                    p, next
                );
                free_list::remove(&mut self.store, next, SizeClass::from_size(next_size));
                self.used_bytes -= block_size as usize;
                write_tags(&mut self.store, p, block_size + next_size, BlockStatus::Used);
                self.place(p, asize);
                return Some(ptr);
            }
        }

        let new_ptr = self.alloc(new_size)?;
        let new_p = self.store.offset_of(new_ptr)?;
        let payload = (block_size - META_SIZE) as usize;
        self.store.copy_bytes(p, new_p, payload.min(new_size));
        self.dealloc(Some(ptr));
        Some(new_ptr)
    }

    /// Allocate a zeroed array of `count` elements of `size` bytes each.
    pub fn zero_alloc(&mut self, count: usize, size: usize) -> Option<NonNull<u8>> {
        let Some(bytes) = count.checked_mul(size) else {
            warn!("heap: zero_alloc of {} * {} bytes overflows", count, size);
            return None;
        };
        let ptr = self.alloc(bytes)?;
        let p = self.store.offset_of(ptr)?;
        self.store.fill_zero(p, bytes);
        Some(ptr)
    }

    /// Search the classes from the one `asize` belongs to upwards, first fit
    /// within each list.
    fn find_fit(&self, asize: u32) -> Option<(u32, SizeClass)> {
        let limit = free_list::walk_limit(self.store.size());
        SizeClass::from_size(asize).and_larger().find_map(|class| {
            free_list::find_fit(&self.store, class, asize, limit).map(|p| (p, class))
        })
    }

    /// Mark the unlinked block `p` used for an `asize` request, splitting off
    /// the tail as a new free block when it is big enough.
    fn place(&mut self, p: u32, asize: u32) {
        let block_size = size(&self.store, p);
        let remainder = block_size - asize;
        if remainder > MIN_BLOCK_SIZE {
            write_tags(&mut self.store, p, asize, BlockStatus::Used);
            let rest = p + asize;
            write_tags(&mut self.store, rest, remainder, BlockStatus::Free);
            free_list::push(&mut self.store, rest, SizeClass::from_size(remainder));
            self.used_bytes += asize as usize;
            debug!(
                "heap: split {:#x} at {:#x}, free remainder {:#x} at {:#x}",
                block_size, p, remainder, rest
            );
        } else {
            write_tags(&mut self.store, p, block_size, BlockStatus::Used);
            self.used_bytes += block_size as usize;
        }
    }

    /// Grow the heap by one `asize` block, placed where the epilogue was.
    fn extend_heap(&mut self, asize: u32) -> Option<u32> {
        let p = self.heap_size();
        if let Err(_e) = self.store.extend(asize as usize) {
            warn!("heap: cannot grow by {:#x} bytes: {:?}", asize, _e);
            return None;
        }
        write_tags(&mut self.store, p, asize, BlockStatus::Used);
        self.store.write_word(
            header_offset(p + asize),
            BoundaryTag::new(0, BlockStatus::Border).raw(),
        );
        self.used_bytes += asize as usize;
        debug!("heap: extended by {:#x} bytes for block at {:#x}", asize, p);
        Some(p)
    }

    /// Merge the unlinked free block `p` with its free neighbours, next first.
    /// Returns the merged block; its tags are left for the caller to write.
    fn coalesce(&mut self, p: u32, block_size: u32) -> (u32, u32) {
        let mut start = p;
        let mut merged = block_size;

        let next = heap_next(&self.store, p);
        if is_free(&self.store, next) {
            let next_size = size(&self.store, next);
            free_list::remove(&mut self.store, next, SizeClass::from_size(next_size));
            merged += next_size;
            debug!("heap: merge {:#x} with next {:#x}", p, next);
        }

        let prev = heap_prev(&self.store, p);
        if is_free(&self.store, prev) {
            let prev_size = size(&self.store, prev);
            free_list::remove(&mut self.store, prev, SizeClass::from_size(prev_size));
            start = prev;
            merged += prev_size;
            debug!("heap: merge {:#x} with previous {:#x}", p, prev);
        }

        (start, merged)
    }

    /// Payload offset of a live `Used` block at `ptr`, or `None` if `ptr` is
    /// not one.
    fn checked_block(&self, ptr: NonNull<u8>) -> Option<u32> {
        if !self.initialized {
            return None;
        }
        let p = self.store.offset_of(ptr)?;
        if p < FIRST_BLOCK_OFFSET || !p.is_multiple_of(ALIGNMENT) {
            return None;
        }
        let header = tag(&self.store, p);
        if !header.is(BlockStatus::Used) {
            return None;
        }
        let block_size = header.size();
        let in_heap = p
            .checked_add(block_size)
            .is_some_and(|end| end <= self.heap_size());
        if block_size < MIN_BLOCK_SIZE || !block_size.is_multiple_of(ALIGNMENT) || !in_heap {
            return None;
        }
        (footer_tag(&self.store, p) == header).then_some(p)
    }
}

impl<S: BackingStore> ByteAllocator for SegregatedHeap<S> {
    fn alloc(&mut self, size: usize) -> Option<NonNull<u8>> {
        SegregatedHeap::alloc(self, size)
    }

    fn dealloc(&mut self, ptr: Option<NonNull<u8>>) {
        SegregatedHeap::dealloc(self, ptr)
    }

    fn resize(&mut self, ptr: Option<NonNull<u8>>, new_size: usize) -> Option<NonNull<u8>> {
        SegregatedHeap::resize(self, ptr, new_size)
    }

    fn zero_alloc(&mut self, count: usize, size: usize) -> Option<NonNull<u8>> {
        SegregatedHeap::zero_alloc(self, count, size)
    }

    fn total_bytes(&self) -> usize {
        self.store.size()
    }

    fn used_bytes(&self) -> usize {
        self.used_bytes
    }

    fn available_bytes(&self) -> usize {
        self.store
            .size()
            .saturating_sub(self.used_bytes + EMPTY_HEAP_SIZE as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::backing::OwnedRegion;

    fn new_heap(capacity: usize) -> SegregatedHeap<OwnedRegion> {
        let mut heap = SegregatedHeap::new(OwnedRegion::new(capacity).unwrap());
        heap.init().unwrap();
        heap
    }

    fn offset(heap: &SegregatedHeap<OwnedRegion>, ptr: NonNull<u8>) -> u32 {
        heap.store.offset_of(ptr).unwrap()
    }

    #[test]
    fn test_init_layout() {
        let heap = new_heap(4096);
        assert!(heap.is_initialized());
        assert_eq!(heap.total_bytes(), 24);
        assert_eq!(heap.used_bytes(), 0);
        assert_eq!(heap.available_bytes(), 0);
        for class in SizeClass::ALL {
            assert_eq!(free_list::head(&heap.store, class), BORDER_OFFSET);
        }
        assert!(tag(&heap.store, BORDER_OFFSET).is(BlockStatus::Border));
        assert_eq!(size(&heap.store, BORDER_OFFSET), 4);
        assert!(tag(&heap.store, FIRST_BLOCK_OFFSET).is(BlockStatus::Border));
        assert_eq!(size(&heap.store, FIRST_BLOCK_OFFSET), 0);
        heap.check().unwrap();
    }

    #[test]
    fn test_init_twice_fails() {
        let mut heap = new_heap(4096);
        assert_eq!(heap.init(), Err(AllocError::InvalidArgument));
    }

    #[test]
    fn test_init_without_room_fails() {
        let mut heap = SegregatedHeap::new(OwnedRegion::new(16).unwrap());
        assert_eq!(heap.init(), Err(AllocError::AllocationFailure));
        assert!(!heap.is_initialized());
        assert_eq!(heap.alloc(8), None);
    }

    #[test]
    fn test_alloc_zero_and_uninitialized() {
        let mut heap = new_heap(4096);
        assert_eq!(heap.alloc(0), None);

        let mut fresh = SegregatedHeap::new(OwnedRegion::new(4096).unwrap());
        assert_eq!(fresh.alloc(8), None);
    }

    #[test]
    fn test_extend_places_block_over_old_epilogue() {
        let mut heap = new_heap(4096);
        let a = heap.alloc(16).unwrap();
        assert_eq!(offset(&heap, a), FIRST_BLOCK_OFFSET);
        assert_eq!(heap.total_bytes(), 24 + 24);
        assert_eq!(a.as_ptr() as usize % 8, 0);

        let b = heap.alloc(1).unwrap();
        assert_eq!(offset(&heap, b), FIRST_BLOCK_OFFSET + 24);
        assert_eq!(heap.total_bytes(), 24 + 24 + 16);
        assert_eq!(heap.used_bytes(), 40);
        heap.check().unwrap();
    }

    #[test]
    fn test_freed_block_is_reused() {
        let mut heap = new_heap(4096);
        let a = heap.alloc(16).unwrap();
        let _b = heap.alloc(32).unwrap();
        heap.dealloc(Some(a));
        let size_before = heap.total_bytes();

        let c = heap.alloc(8).unwrap();
        assert_eq!(c, a);
        assert_eq!(heap.total_bytes(), size_before);
        heap.check().unwrap();
    }

    #[test]
    fn test_split_leaves_free_remainder() {
        let mut heap = new_heap(4096);
        let a = heap.alloc(200).unwrap();
        let _guard = heap.alloc(8).unwrap();
        heap.dealloc(Some(a));

        let b = heap.alloc(16).unwrap();
        assert_eq!(b, a);
        let p = offset(&heap, b);
        assert_eq!(size(&heap.store, p), 24);
        let rest = heap_next(&heap.store, p);
        assert!(is_free(&heap.store, rest));
        assert_eq!(size(&heap.store, rest), 208 - 24);
        heap.check().unwrap();
    }

    #[test]
    fn test_small_remainder_is_not_split() {
        let mut heap = new_heap(4096);
        let a = heap.alloc(24).unwrap();
        let _guard = heap.alloc(8).unwrap();
        heap.dealloc(Some(a));

        // 32-byte block, 16-byte request: remainder of 16 stays attached
        let b = heap.alloc(8).unwrap();
        assert_eq!(b, a);
        assert_eq!(size(&heap.store, offset(&heap, b)), 32);
        heap.check().unwrap();
    }

    #[test]
    fn test_coalesce_both_sides() {
        let mut heap = new_heap(4096);
        let a = heap.alloc(16).unwrap();
        let b = heap.alloc(16).unwrap();
        let c = heap.alloc(16).unwrap();
        let _guard = heap.alloc(16).unwrap();

        heap.dealloc(Some(a));
        heap.dealloc(Some(c));
        heap.check().unwrap();
        heap.dealloc(Some(b));

        let report = heap.check().unwrap();
        let free: alloc::vec::Vec<_> = report
            .blocks
            .iter()
            .filter(|b| b.status == BlockStatus::Free)
            .collect();
        assert_eq!(free.len(), 1);
        assert_eq!(free[0].offset, FIRST_BLOCK_OFFSET);
        assert_eq!(free[0].size, 72);
    }

    #[test]
    fn test_a_b_coalesce_into_one_block() {
        let mut heap = new_heap(4096);
        let a = heap.alloc(100).unwrap();
        let b = heap.alloc(100).unwrap();
        heap.dealloc(Some(a));
        heap.dealloc(Some(b));

        let report = heap.check().unwrap();
        assert_eq!(report.blocks.len(), 1);
        assert_eq!(report.blocks[0].status, BlockStatus::Free);
        assert_eq!(report.blocks[0].size, 112 * 2);
        assert_eq!(heap.available_bytes(), 224);
    }

    #[test]
    fn test_double_free_is_ignored() {
        let mut heap = new_heap(4096);
        let a = heap.alloc(40).unwrap();
        let _b = heap.alloc(40).unwrap();
        heap.dealloc(Some(a));
        let before = heap.check().unwrap();
        heap.dealloc(Some(a));
        assert_eq!(heap.check().unwrap(), before);
    }

    #[test]
    fn test_invalid_pointers_are_ignored() {
        let mut heap = new_heap(4096);
        let a = heap.alloc(64).unwrap();
        let before = heap.check().unwrap();

        // middle of a block
        let inner = NonNull::new(unsafe { a.as_ptr().add(8) }).unwrap();
        heap.dealloc(Some(inner));
        // misaligned
        let odd = NonNull::new(unsafe { a.as_ptr().add(1) }).unwrap();
        heap.dealloc(Some(odd));
        // outside the heap
        let mut outside = 0u64;
        heap.dealloc(NonNull::new(&mut outside as *mut u64 as *mut u8));
        heap.dealloc(None);

        assert_eq!(heap.check().unwrap(), before);
        assert_eq!(heap.resize(Some(inner), 128), None);
        assert_eq!(heap.check().unwrap(), before);
    }

    #[test]
    fn test_resize_in_place_when_covered() {
        let mut heap = new_heap(4096);
        let a = heap.alloc(100).unwrap();
        assert_eq!(heap.resize(Some(a), 50), Some(a));
        assert_eq!(heap.resize(Some(a), 104), Some(a));
        heap.check().unwrap();
    }

    #[test]
    fn test_resize_grows_into_next_free_block() {
        let mut heap = new_heap(4096);
        let a = heap.alloc(16).unwrap();
        let b = heap.alloc(200).unwrap();
        let _guard = heap.alloc(8).unwrap();
        heap.dealloc(Some(b));

        let grown = heap.resize(Some(a), 64).unwrap();
        assert_eq!(grown, a);
        assert_eq!(size(&heap.store, offset(&heap, a)), 72);
        heap.check().unwrap();
    }

    #[test]
    fn test_resize_moves_and_copies() {
        let mut heap = new_heap(4096);
        let a = heap.alloc(16).unwrap();
        let _guard = heap.alloc(16).unwrap();
        unsafe {
            for i in 0..16 {
                a.as_ptr().add(i).write(i as u8 + 1);
            }
        }

        let moved = heap.resize(Some(a), 256).unwrap();
        assert_ne!(moved, a);
        for i in 0..16 {
            assert_eq!(unsafe { moved.as_ptr().add(i).read() }, i as u8 + 1);
        }
        assert!(is_free(&heap.store, offset(&heap, a)));
        heap.check().unwrap();
    }

    #[test]
    fn test_resize_null_and_zero() {
        let mut heap = new_heap(4096);
        let a = heap.resize(None, 32).unwrap();
        assert_eq!(heap.used_bytes(), 40);
        assert_eq!(heap.resize(Some(a), 0), None);
        assert_eq!(heap.used_bytes(), 0);
        heap.check().unwrap();
    }

    #[test]
    fn test_resize_failure_keeps_old_block() {
        let mut heap = new_heap(128);
        let a = heap.alloc(32).unwrap();
        let _guard = heap.alloc(8).unwrap();
        unsafe { a.as_ptr().write(0x5a) };

        assert_eq!(heap.resize(Some(a), 1024), None);
        assert_eq!(unsafe { a.as_ptr().read() }, 0x5a);
        assert!(tag(&heap.store, offset(&heap, a)).is(BlockStatus::Used));
        heap.check().unwrap();
    }

    #[test]
    fn test_zero_alloc() {
        let mut heap = new_heap(4096);
        let a = heap.alloc(64).unwrap();
        unsafe { a.as_ptr().write_bytes(0xff, 64) };
        heap.dealloc(Some(a));

        let z = heap.zero_alloc(8, 8).unwrap();
        assert_eq!(z, a);
        for i in 0..64 {
            assert_eq!(unsafe { z.as_ptr().add(i).read() }, 0);
        }
        assert_eq!(heap.zero_alloc(usize::MAX, 2), None);
        assert_eq!(heap.zero_alloc(0, 8), None);
    }

    #[test]
    fn test_out_of_memory() {
        let mut heap = new_heap(64);
        assert!(heap.alloc(16).is_some());
        assert_eq!(heap.alloc(64), None);
        assert_eq!(heap.alloc(usize::MAX), None);
        heap.check().unwrap();
    }

    #[test]
    fn test_large_blocks_use_large_class() {
        let mut heap = new_heap(8192);
        let a = heap.alloc(2000).unwrap();
        let _guard = heap.alloc(8).unwrap();
        heap.dealloc(Some(a));

        let p = offset(&heap, a);
        assert_eq!(free_list::head(&heap.store, SizeClass::Larger), p);
        // small requests fall through to the large list
        assert_eq!(heap.alloc(8), Some(a));
        heap.check().unwrap();
    }
}
