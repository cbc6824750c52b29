//! Buddy page allocator module
//!
//! This module provides a rank-based buddy system with:
//! - Complete binary tree indexing of blocks
//! - An out-of-band metadata table (one record per page)
//! - Index-linked free lists per rank
//! - Statistics and debugging

pub mod buddy_allocator;
pub mod buddy_block;
pub mod meta_table;
pub mod rank_list;
pub mod stats;

pub use buddy_allocator::BuddyPageAllocator;
pub use buddy_block::{BlockStatus, BuddyBlock, MAX_PAGE_NUM, MAX_RANK_NUM};
pub use meta_table::MetaTable;
pub use rank_list::{RankList, RankListIter};
pub use stats::BuddyStats;
