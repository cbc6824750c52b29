//! Backing stores for the segregated heap
//!
//! A backing store is a contiguous region that only grows at its end, like a
//! program break. This is the only place in the heap that dereferences raw
//! pointers; everything above it works on heap-relative offsets.

use core::alloc::Layout;
use core::ptr::NonNull;

use crate::{AllocError, AllocResult};

#[cfg(feature = "log")]
use log::{debug, warn};

use super::layout::{WordMemory, ALIGNMENT, WORD_SIZE};

/// Growable memory behind a [`SegregatedHeap`](super::SegregatedHeap).
pub trait BackingStore: WordMemory {
    /// Start of the region. Stays fixed while the heap lives.
    fn base(&self) -> NonNull<u8>;

    /// Bytes handed out so far
    fn size(&self) -> usize;

    /// Grow by `bytes`, returning the start of the new part, which directly
    /// follows the previous end.
    fn extend(&mut self, bytes: usize) -> AllocResult<NonNull<u8>>;

    /// Copy `len` bytes from offset `src` to offset `dst` (ranges may overlap)
    fn copy_bytes(&mut self, src: u32, dst: u32, len: usize);

    /// Zero `len` bytes at `offset`
    fn fill_zero(&mut self, offset: u32, len: usize);

    /// Address of the byte at `offset`, which must lie within the heap
    fn ptr_at(&self, offset: u32) -> NonNull<u8> {
        debug_assert!(offset as usize <= self.size());
        // SAFETY: the offset is inside the region, so the result is non-null
        unsafe { NonNull::new_unchecked(self.base().as_ptr().add(offset as usize)) }
    }

    /// Heap offset of `ptr`, or `None` if it points outside the heap
    fn offset_of(&self, ptr: NonNull<u8>) -> Option<u32> {
        let offset = (ptr.as_ptr() as usize).checked_sub(self.base().as_ptr() as usize)?;
        if offset < self.size() {
            u32::try_from(offset).ok()
        } else {
            None
        }
    }
}

/// Break-style bookkeeping shared by the concrete stores
struct Region {
    base: NonNull<u8>,
    capacity: usize,
    brk: usize,
}

impl Region {
    fn new(base: NonNull<u8>, capacity: usize) -> AllocResult<Self> {
        if !crate::is_aligned(base.as_ptr() as usize, ALIGNMENT as usize) {
            warn!(
                "backing store: base {:p} is not {}-byte aligned",
                base, ALIGNMENT
            );
            return Err(AllocError::InvalidArgument);
        }
        // offsets are stored in 32-bit words
        if capacity > u32::MAX as usize {
            warn!(
                "backing store: capacity {:#x} exceeds 32-bit offsets",
                capacity
            );
            return Err(AllocError::InvalidArgument);
        }
        Ok(Self {
            base,
            capacity,
            brk: 0,
        })
    }

    fn check_range(&self, offset: usize, len: usize) {
        assert!(
            offset.checked_add(len).is_some_and(|end| end <= self.brk),
            "heap access [{:#x}, +{:#x}) outside heap of {:#x} bytes",
            offset,
            len,
            self.brk
        );
    }

    fn ptr_at(&self, offset: usize) -> *mut u8 {
        // SAFETY: callers checked `offset <= brk <= capacity`
        unsafe { self.base.as_ptr().add(offset) }
    }

    fn read_word(&self, offset: u32) -> u32 {
        let offset = offset as usize;
        self.check_range(offset, WORD_SIZE as usize);
        assert!(
            crate::is_aligned(offset, WORD_SIZE as usize),
            "unaligned word offset {:#x}",
            offset
        );
        // SAFETY: in bounds and aligned, since the base is 8-byte aligned
        unsafe { self.ptr_at(offset).cast::<u32>().read() }
    }

    fn write_word(&mut self, offset: u32, value: u32) {
        let offset = offset as usize;
        self.check_range(offset, WORD_SIZE as usize);
        assert!(
            crate::is_aligned(offset, WORD_SIZE as usize),
            "unaligned word offset {:#x}",
            offset
        );
        // SAFETY: in bounds and aligned, since the base is 8-byte aligned
        unsafe { self.ptr_at(offset).cast::<u32>().write(value) }
    }

    fn extend(&mut self, bytes: usize) -> AllocResult<NonNull<u8>> {
        let Some(new_brk) = self.brk.checked_add(bytes).filter(|&end| end <= self.capacity) else {
            debug!(
                "backing store: cannot grow {:#x} by {:#x} (capacity {:#x})",
                self.brk, bytes, self.capacity
            );
            return Err(AllocError::AllocationFailure);
        };
        let old_brk = self.brk;
        self.brk = new_brk;
        // SAFETY: `old_brk` is within the region, and the region is non-null
        Ok(unsafe { NonNull::new_unchecked(self.ptr_at(old_brk)) })
    }

    fn copy_bytes(&mut self, src: u32, dst: u32, len: usize) {
        self.check_range(src as usize, len);
        self.check_range(dst as usize, len);
        // SAFETY: both ranges are inside the heap; `copy` tolerates overlap
        unsafe { core::ptr::copy(self.ptr_at(src as usize), self.ptr_at(dst as usize), len) }
    }

    fn fill_zero(&mut self, offset: u32, len: usize) {
        self.check_range(offset as usize, len);
        // SAFETY: the range is inside the heap
        unsafe { core::ptr::write_bytes(self.ptr_at(offset as usize), 0, len) }
    }
}

macro_rules! forward_to_region {
    ($ty:ty) => {
        impl WordMemory for $ty {
            fn read_word(&self, offset: u32) -> u32 {
                self.region.read_word(offset)
            }

            fn write_word(&mut self, offset: u32, value: u32) {
                self.region.write_word(offset, value)
            }
        }

        impl BackingStore for $ty {
            fn base(&self) -> NonNull<u8> {
                self.region.base
            }

            fn size(&self) -> usize {
                self.region.brk
            }

            fn extend(&mut self, bytes: usize) -> AllocResult<NonNull<u8>> {
                self.region.extend(bytes)
            }

            fn copy_bytes(&mut self, src: u32, dst: u32, len: usize) {
                self.region.copy_bytes(src, dst, len)
            }

            fn fill_zero(&mut self, offset: u32, len: usize) {
                self.region.fill_zero(offset, len)
            }
        }
    };
}

/// A fixed-capacity region allocated from the global allocator and freed on
/// drop.
pub struct OwnedRegion {
    region: Region,
    layout: Layout,
}

impl OwnedRegion {
    /// Reserve `capacity` bytes (rounded up to the alignment).
    pub fn new(capacity: usize) -> AllocResult<Self> {
        let capacity = crate::align_up(capacity.max(ALIGNMENT as usize), ALIGNMENT as usize);
        let layout = Layout::from_size_align(capacity, ALIGNMENT as usize)
            .map_err(|_| AllocError::InvalidArgument)?;
        // SAFETY: the layout has a non-zero size
        let ptr = unsafe { alloc::alloc::alloc_zeroed(layout) };
        let base = NonNull::new(ptr).ok_or(AllocError::AllocationFailure)?;
        match Region::new(base, capacity) {
            Ok(region) => Ok(Self { region, layout }),
            Err(e) => {
                // SAFETY: allocated above with the same layout
                unsafe { alloc::alloc::dealloc(ptr, layout) };
                Err(e)
            }
        }
    }

    /// Maximum size the region can grow to
    pub fn capacity(&self) -> usize {
        self.region.capacity
    }
}

impl Drop for OwnedRegion {
    fn drop(&mut self) {
        // SAFETY: allocated in `new` with this layout
        unsafe { alloc::alloc::dealloc(self.region.base.as_ptr(), self.layout) };
    }
}

forward_to_region!(OwnedRegion);

/// A caller-provided region, e.g. a static array or memory mapped at boot.
pub struct RawRegion {
    region: Region,
}

impl RawRegion {
    /// Manage `capacity` bytes at `start`.
    ///
    /// # Safety
    /// `[start, start + capacity)` must be valid for reads and writes, and
    /// must not be accessed other than through this store and the pointers
    /// the heap hands out, for as long as the store lives.
    pub unsafe fn new(start: NonNull<u8>, capacity: usize) -> AllocResult<Self> {
        Ok(Self {
            region: Region::new(start, capacity)?,
        })
    }

    /// Maximum size the region can grow to
    pub fn capacity(&self) -> usize {
        self.region.capacity
    }
}

forward_to_region!(RawRegion);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_owned_region_grows_contiguously() {
        let mut store = OwnedRegion::new(64).unwrap();
        assert_eq!(store.size(), 0);
        assert_eq!(store.capacity(), 64);

        let first = store.extend(24).unwrap();
        assert_eq!(first, store.base());
        let second = store.extend(16).unwrap();
        assert_eq!(second.as_ptr() as usize, store.base().as_ptr() as usize + 24);
        assert_eq!(store.size(), 40);

        assert_eq!(store.extend(32), Err(AllocError::AllocationFailure));
        assert_eq!(store.size(), 40);
        assert!(store.extend(24).is_ok());
        assert_eq!(store.extend(1), Err(AllocError::AllocationFailure));
    }

    #[test]
    fn test_word_and_byte_access() {
        let mut store = OwnedRegion::new(32).unwrap();
        store.extend(32).unwrap();
        store.write_word(8, 0xdead_beef);
        assert_eq!(store.read_word(8), 0xdead_beef);

        store.copy_bytes(8, 20, 4);
        assert_eq!(store.read_word(20), 0xdead_beef);

        store.fill_zero(8, 4);
        assert_eq!(store.read_word(8), 0);
        assert_eq!(store.read_word(20), 0xdead_beef);
    }

    #[test]
    fn test_pointer_offset_conversion() {
        let mut store = OwnedRegion::new(64).unwrap();
        store.extend(32).unwrap();
        let p = store.ptr_at(24);
        assert_eq!(store.offset_of(p), Some(24));
        assert_eq!(store.offset_of(store.base()), Some(0));
        assert_eq!(store.offset_of(store.ptr_at(32)), None);
        let before = NonNull::new((store.base().as_ptr() as usize - 8) as *mut u8).unwrap();
        assert_eq!(store.offset_of(before), None);
    }

    #[test]
    #[should_panic]
    fn test_access_past_break_panics() {
        let mut store = OwnedRegion::new(64).unwrap();
        store.extend(16).unwrap();
        store.read_word(16);
    }

    #[test]
    fn test_raw_region_checks_alignment() {
        let mut backing = [0u64; 8];
        let base = NonNull::new(backing.as_mut_ptr().cast::<u8>()).unwrap();
        let misaligned = NonNull::new(unsafe { base.as_ptr().add(4) }).unwrap();

        assert!(unsafe { RawRegion::new(misaligned, 32) }.is_err());

        let mut store = unsafe { RawRegion::new(base, 64) }.unwrap();
        store.extend(8).unwrap();
        store.write_word(4, 7);
        assert_eq!(store.read_word(4), 7);
        assert_eq!(store.capacity(), 64);
    }
}
