//! Statistics and debugging for buddy allocator
//!
//! Provides page accounting per rank and failure reporting.

use super::buddy_block::MAX_RANK_NUM;

/// Buddy system statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuddyStats {
    pub total_pages: usize,
    pub free_pages: usize,
    pub used_pages: usize,
    /// Number of free blocks, indexed by rank
    pub free_blocks_by_rank: [usize; MAX_RANK_NUM + 1],
}

impl Default for BuddyStats {
    fn default() -> Self {
        Self::new()
    }
}

impl BuddyStats {
    pub const fn new() -> Self {
        Self {
            total_pages: 0,
            free_pages: 0,
            used_pages: 0,
            free_blocks_by_rank: [0; MAX_RANK_NUM + 1],
        }
    }

    /// Record `count` free blocks of `rank`
    pub fn add_free_blocks(&mut self, rank: usize, count: usize) {
        self.free_blocks_by_rank[rank] += count;
        self.free_pages += count << (rank - 1);
        self.used_pages = self.total_pages.saturating_sub(self.free_pages);
    }
}

/// Detailed memory statistics reporter
#[cfg(feature = "tracking")]
pub struct MemoryStatsReporter;

#[cfg(feature = "tracking")]
impl MemoryStatsReporter {
    /// Print detailed allocation failure statistics
    #[allow(unused_variables)]
    pub fn print_alloc_failure_stats(
        page_size: usize,
        base_addr: usize,
        rank_num: usize,
        stats: &BuddyStats,
        request_rank: usize,
    ) {
        #[cfg(feature = "log")]
        use log::error;
        error!("========================================");
        error!(
            "Request: rank {} ({} pages, {} KB)",
            request_rank,
            1usize << (request_rank - 1),
            ((1usize << (request_rank - 1)) * page_size) / 1024
        );
        error!(
            "Arena: [{:#x}, {:#x}), rank_num {}",
            base_addr,
            base_addr + stats.total_pages * page_size,
            rank_num
        );
        error!(
            "  Total pages: {} ({} KB)",
            stats.total_pages,
            (stats.total_pages * page_size) / 1024
        );
        error!(
            "  Free pages: {} ({} KB)",
            stats.free_pages,
            (stats.free_pages * page_size) / 1024
        );
        error!(
            "  Used pages: {} ({} KB)",
            stats.used_pages,
            (stats.used_pages * page_size) / 1024
        );
        error!("  Free blocks by rank:");
        for rank in (1..=rank_num).rev() {
            let count = stats.free_blocks_by_rank[rank];
            if count > 0 {
                let block_size = (1usize << (rank - 1)) * page_size;
                error!(
                    "    Rank {}: {} blocks ({} KB each, {} KB total)",
                    rank,
                    count,
                    block_size / 1024,
                    (count * block_size) / 1024
                );
            }
        }
        error!("========================================");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_free_blocks() {
        let mut stats = BuddyStats::new();
        stats.total_pages = 8;
        stats.add_free_blocks(1, 1);
        stats.add_free_blocks(3, 1);
        assert_eq!(stats.free_pages, 5);
        assert_eq!(stats.used_pages, 3);
        assert_eq!(stats.free_blocks_by_rank[1], 1);
        assert_eq!(stats.free_blocks_by_rank[3], 1);
        assert_eq!(stats.free_blocks_by_rank[2], 0);
    }
}
