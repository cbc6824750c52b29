//! Rank-based buddy page allocator
//!
//! Manages an arena of `2^(rank_num - 1)` pages as a complete binary tree of
//! blocks. A block of rank `r` covers `2^(r-1)` pages. Larger free blocks are
//! split on demand when allocating, and freed blocks are merged with their
//! buddy eagerly on deallocation.

use crate::{AllocError, AllocResult, PageAllocator};

#[cfg(feature = "log")]
use log::{debug, info, warn};

use super::{
    buddy_block::{
        buddy, child, index_to_page, parent, BlockStatus, BuddyBlock, MAX_PAGE_NUM, MAX_RANK_NUM,
        ROOT,
    },
    meta_table::MetaTable,
    rank_list::RankList,
    stats::BuddyStats,
};

#[cfg(feature = "tracking")]
use super::stats::MemoryStatsReporter;

/// Buddy page allocator over a single fixed arena
///
/// The allocator never touches the pages it manages; all bookkeeping is kept
/// in its own [`MetaTable`].
pub struct BuddyPageAllocator<const PAGE_SIZE: usize = { crate::DEFAULT_PAGE_SIZE }> {
    base_addr: usize,
    page_count: usize,
    rank_num: usize,
    table: MetaTable,
    /// Free lists for each rank, index 0 unused
    free_lists: [RankList; MAX_RANK_NUM + 1],
}

impl<const PAGE_SIZE: usize> BuddyPageAllocator<PAGE_SIZE> {
    /// Create an allocator with no arena (uninitialized, must call init())
    pub const fn new() -> Self {
        Self {
            base_addr: 0,
            page_count: 0,
            rank_num: 0,
            table: MetaTable::new(),
            free_lists: [const { RankList::new() }; MAX_RANK_NUM + 1],
        }
    }

    /// Take over `page_count` pages starting at `base_addr`.
    ///
    /// `page_count` must be a power of two no larger than [`MAX_PAGE_NUM`] and
    /// `base_addr` must be page aligned. Any previous state is discarded.
    pub fn init(&mut self, base_addr: usize, page_count: usize) -> AllocResult {
        if !page_count.is_power_of_two() || page_count > MAX_PAGE_NUM {
            warn!(
                "buddy allocator: page count {} is not a power of two in [1, {}]",
                page_count, MAX_PAGE_NUM
            );
            return Err(AllocError::InvalidArgument);
        }
        if !crate::is_aligned(base_addr, PAGE_SIZE) {
            warn!(
                "buddy allocator: arena base {:#x} is not aligned to {:#x}",
                base_addr, PAGE_SIZE
            );
            return Err(AllocError::InvalidArgument);
        }
        if base_addr.checked_add(page_count * PAGE_SIZE).is_none() {
            warn!("buddy allocator: arena at {:#x} wraps the address space", base_addr);
            return Err(AllocError::InvalidArgument);
        }

        self.base_addr = base_addr;
        self.page_count = page_count;
        self.rank_num = page_count.trailing_zeros() as usize + 1;

        self.table.reset(page_count);
        for list in &mut self.free_lists {
            list.clear();
        }

        *self.table.get_mut(0) = BuddyBlock::free(self.rank_num, ROOT);
        self.free_lists[self.rank_num].push_front(&mut self.table, 0);

        info!(
            "buddy allocator: arena [{:#x}, {:#x}), {} pages, rank_num {}",
            base_addr,
            self.end_addr(),
            page_count,
            self.rank_num
        );
        Ok(())
    }

    /// Number of ranks; the root block has rank `rank_num`
    pub const fn rank_num(&self) -> usize {
        self.rank_num
    }

    pub const fn base_addr(&self) -> usize {
        self.base_addr
    }

    pub const fn page_count(&self) -> usize {
        self.page_count
    }

    pub const fn end_addr(&self) -> usize {
        self.base_addr + self.page_count * PAGE_SIZE
    }

    /// Check if an address belongs to this arena
    pub fn addr_in_arena(&self, addr: usize) -> bool {
        addr >= self.base_addr && addr < self.end_addr()
    }

    fn check_rank(&self, rank: usize) -> AllocResult {
        if rank < 1 || rank > self.rank_num {
            warn!(
                "buddy allocator: rank {} out of range [1, {}]",
                rank, self.rank_num
            );
            return Err(AllocError::InvalidArgument);
        }
        Ok(())
    }

    /// Translate a caller-provided address into a page slot
    fn addr_to_page(&self, addr: usize) -> AllocResult<usize> {
        if !self.addr_in_arena(addr) {
            warn!(
                "buddy allocator: address {:#x} not in arena [{:#x}, {:#x})",
                addr,
                self.base_addr,
                self.end_addr()
            );
            return Err(AllocError::InvalidArgument);
        }
        let offset = addr - self.base_addr;
        if !crate::is_aligned(offset, PAGE_SIZE) {
            warn!(
                "buddy allocator: address {:#x} is not on a page boundary",
                addr
            );
            return Err(AllocError::InvalidArgument);
        }
        Ok(offset / PAGE_SIZE)
    }

    const fn page_to_addr(&self, page: usize) -> usize {
        self.base_addr + page * PAGE_SIZE
    }

    /// Allocate a block of `2^(rank-1)` pages.
    ///
    /// Takes the smallest free block of at least `rank` and splits it down,
    /// leaving one free buddy behind at every intermediate rank.
    pub fn alloc_pages(&mut self, rank: usize) -> AllocResult<usize> {
        self.check_rank(rank)?;

        let Some(found) = (rank..=self.rank_num).find(|&r| !self.free_lists[r].is_empty()) else {
            debug!(
                "buddy allocator: no free block for rank {} ({} pages)",
                rank,
                1usize << (rank - 1)
            );
            #[cfg(feature = "tracking")]
            MemoryStatsReporter::print_alloc_failure_stats(
                PAGE_SIZE,
                self.base_addr,
                self.rank_num,
                &self.stats(),
                rank,
            );
            return Err(AllocError::OutOfSpace);
        };

        let mut split_rank = found;
        while split_rank > rank {
            let slot = self.free_lists[split_rank]
                .pop_front(&mut self.table)
                .ok_or(AllocError::OutOfSpace)?;
            let index = self.table.get(slot).index;
            self.table.set_status(slot, BlockStatus::Undefined);

            split_rank -= 1;
            // right first, so the left half ends up at the head
            for right in [true, false] {
                let half = child(index, right);
                let half_slot = index_to_page(half, split_rank, self.rank_num);
                *self.table.get_mut(half_slot) = BuddyBlock::free(split_rank, half);
                self.free_lists[split_rank].push_front(&mut self.table, half_slot);
            }
            debug!(
                "buddy allocator: split block at page {} down to rank {}",
                slot, split_rank
            );
        }

        let slot = self.free_lists[rank]
            .pop_front(&mut self.table)
            .ok_or(AllocError::OutOfSpace)?;
        self.table.set_status(slot, BlockStatus::Allocated);

        Ok(self.page_to_addr(slot))
    }

    /// Return a block and merge it with its free buddies.
    ///
    /// Fails with [`AllocError::InvalidArgument`] if `addr` does not start a
    /// currently allocated block, which covers double frees and pointers into
    /// the middle of a block.
    pub fn dealloc_pages(&mut self, addr: usize) -> AllocResult {
        let page = self.addr_to_page(addr)?;
        let block = *self.table.get(page);
        if block.status != BlockStatus::Allocated {
            warn!(
                "buddy allocator: dealloc of {:#x} which is not an allocated block ({:?})",
                addr, block.status
            );
            return Err(AllocError::InvalidArgument);
        }

        let mut rank = block.rank();
        let mut index = block.index;
        while rank < self.rank_num {
            let slot = index_to_page(index, rank, self.rank_num);
            let buddy_index = buddy(index);
            let buddy_slot = index_to_page(buddy_index, rank, self.rank_num);

            let buddy_block = *self.table.get(buddy_slot);
            if buddy_block.status != BlockStatus::Free
                || buddy_block.rank() != rank
                || buddy_block.index != buddy_index
            {
                break;
            }

            self.free_lists[rank].remove(&mut self.table, buddy_slot);
            self.table.set_status(slot, BlockStatus::Undefined);
            self.table.set_status(buddy_slot, BlockStatus::Undefined);
            debug!(
                "buddy allocator: merged pages {} and {} at rank {}",
                slot, buddy_slot, rank
            );

            rank += 1;
            index = parent(index);
        }

        let slot = index_to_page(index, rank, self.rank_num);
        *self.table.get_mut(slot) = BuddyBlock::free(rank, index);
        self.free_lists[rank].push_front(&mut self.table, slot);
        Ok(())
    }

    /// Rank of the free or allocated block starting at `addr`
    pub fn query_rank(&self, addr: usize) -> AllocResult<usize> {
        let page = self.addr_to_page(addr)?;
        let block = self.table.get(page);
        match block.status {
            BlockStatus::Undefined => Err(AllocError::InvalidArgument),
            BlockStatus::Free | BlockStatus::Allocated => Ok(block.rank()),
        }
    }

    /// Number of free blocks of `rank`
    pub fn query_free_count(&self, rank: usize) -> AllocResult<usize> {
        self.check_rank(rank)?;
        Ok(self.free_lists[rank].len())
    }

    /// Addresses of the free blocks of `rank`, most recently freed first
    pub fn free_blocks(&self, rank: usize) -> impl Iterator<Item = usize> + '_ {
        let list = self.free_lists.get(rank).filter(|_| rank >= 1 && rank <= self.rank_num);
        list.into_iter()
            .flat_map(move |list| list.iter(&self.table))
            .map(move |slot| self.page_to_addr(slot))
    }

    /// Page accounting derived from the free lists
    pub fn stats(&self) -> BuddyStats {
        let mut stats = BuddyStats::new();
        stats.total_pages = self.page_count;
        for rank in 1..=self.rank_num {
            stats.add_free_blocks(rank, self.free_lists[rank].len());
        }
        stats
    }

    /// Verify that every free list is well linked and that the free and
    /// allocated blocks tile the arena exactly without overlap.
    pub fn is_consistent(&self) -> bool {
        let mut covered = 0;
        for rank in 1..=self.rank_num {
            if !self.free_lists[rank].is_consistent(&self.table, rank) {
                return false;
            }
        }
        let mut page = 0;
        while page < self.page_count {
            let block = self.table.get(page);
            if block.status == BlockStatus::Undefined
                || index_to_page(block.index, block.rank(), self.rank_num) != page
            {
                return false;
            }
            let pages = 1usize << (block.rank() - 1);
            covered += pages;
            page += pages;
        }
        covered == self.page_count
    }

    /// Print the free block distribution
    pub fn print_state(&self) {
        info!("========== Buddy Allocator State ==========");
        info!(
            "Arena: [{:#x}, {:#x})",
            self.base_addr,
            self.end_addr()
        );
        info!("Page size: {:#x}, rank_num: {}", PAGE_SIZE, self.rank_num);
        let _stats = self.stats();
        info!(
            "Pages: {} total, {} free, {} used",
            _stats.total_pages, _stats.free_pages, _stats.used_pages
        );
        for rank in 1..=self.rank_num {
            let _count = self.free_lists[rank].len();
            if _count > 0 {
                info!(
                    "    Rank {}: {} free blocks of {} pages",
                    rank,
                    _count,
                    1usize << (rank - 1)
                );
            }
        }
        info!("===========================================");
    }
}

impl<const PAGE_SIZE: usize> Default for BuddyPageAllocator<PAGE_SIZE> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const PAGE_SIZE: usize> PageAllocator for BuddyPageAllocator<PAGE_SIZE> {
    const PAGE_SIZE: usize = PAGE_SIZE;

    fn init(&mut self, base: usize, page_count: usize) -> AllocResult {
        BuddyPageAllocator::init(self, base, page_count)
    }

    fn alloc_pages(&mut self, rank: usize) -> AllocResult<usize> {
        BuddyPageAllocator::alloc_pages(self, rank)
    }

    fn dealloc_pages(&mut self, addr: usize) -> AllocResult {
        BuddyPageAllocator::dealloc_pages(self, addr)
    }

    fn query_rank(&self, addr: usize) -> AllocResult<usize> {
        BuddyPageAllocator::query_rank(self, addr)
    }

    fn query_free_count(&self, rank: usize) -> AllocResult<usize> {
        BuddyPageAllocator::query_free_count(self, rank)
    }

    fn total_pages(&self) -> usize {
        self.page_count
    }

    fn used_pages(&self) -> usize {
        self.stats().used_pages
    }

    fn available_pages(&self) -> usize {
        self.stats().free_pages
    }
}
