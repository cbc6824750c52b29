//! Metadata registry for the buddy allocator
//!
//! Pages handed out by the buddy allocator carry no header space, so all
//! block state lives here: one record per page slot, where a block's record
//! sits at the slot of its first page.

use alloc::vec::Vec;

use super::buddy_block::{BlockStatus, BuddyBlock};

/// Fixed-capacity table of block records, indexed by page slot
pub struct MetaTable {
    blocks: Vec<BuddyBlock>,
}

impl MetaTable {
    /// Create an empty table (no slots until [`MetaTable::reset`])
    pub const fn new() -> Self {
        Self { blocks: Vec::new() }
    }

    /// Resize the table to `slots` records, all [`BlockStatus::Undefined`]
    pub fn reset(&mut self, slots: usize) {
        self.blocks.clear();
        self.blocks.resize(slots, BuddyBlock::UNDEFINED);
    }

    /// Number of page slots
    pub fn capacity(&self) -> usize {
        self.blocks.len()
    }

    pub fn get(&self, slot: usize) -> &BuddyBlock {
        &self.blocks[slot]
    }

    pub fn get_mut(&mut self, slot: usize) -> &mut BuddyBlock {
        &mut self.blocks[slot]
    }

    pub fn set_status(&mut self, slot: usize, status: BlockStatus) {
        self.blocks[slot].status = status;
    }

    /// Count records in the given state
    pub fn count_status(&self, status: BlockStatus) -> usize {
        self.blocks.iter().filter(|b| b.status == status).count()
    }
}

impl Default for MetaTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reset_clears_records() {
        let mut table = MetaTable::new();
        assert_eq!(table.capacity(), 0);

        table.reset(8);
        assert_eq!(table.capacity(), 8);
        assert_eq!(table.count_status(BlockStatus::Undefined), 8);

        *table.get_mut(3) = BuddyBlock::free(2, 5);
        table.set_status(4, BlockStatus::Allocated);
        assert_eq!(table.get(3).rank(), 2);
        assert_eq!(table.get(3).index, 5);
        assert_eq!(table.count_status(BlockStatus::Free), 1);
        assert_eq!(table.count_status(BlockStatus::Allocated), 1);

        table.reset(4);
        assert_eq!(table.capacity(), 4);
        assert_eq!(table.count_status(BlockStatus::Undefined), 4);
    }
}
