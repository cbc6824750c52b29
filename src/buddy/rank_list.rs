//! Per-rank free lists threaded through the metadata table
//!
//! Each list holds only its head and length; the `prev`/`next` links live in
//! the [`BuddyBlock`] records of the member slots, so the lists cost no memory
//! beyond the table itself.

#[cfg(feature = "log")]
use log::error;

use super::{
    buddy_block::{BlockStatus, BuddyBlock},
    meta_table::MetaTable,
};

/// Unordered doubly-linked list of free page slots
pub struct RankList {
    head: Option<usize>,
    len: usize,
}

impl RankList {
    /// Create a new empty list
    pub const fn new() -> Self {
        Self { head: None, len: 0 }
    }

    /// Forget all members without touching their records
    pub fn clear(&mut self) {
        self.head = None;
        self.len = 0;
    }

    /// Check if the list is empty
    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Get the length of the list
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn head(&self) -> Option<usize> {
        self.head
    }

    /// Link `slot` in as the new head
    pub fn push_front(&mut self, table: &mut MetaTable, slot: usize) {
        let old_head = self.head;
        {
            let block = table.get_mut(slot);
            block.prev = None;
            block.next = old_head;
        }
        if let Some(head) = old_head {
            table.get_mut(head).prev = Some(slot);
        }
        self.head = Some(slot);
        self.len += 1;
    }

    /// Unlink and return the head slot
    pub fn pop_front(&mut self, table: &mut MetaTable) -> Option<usize> {
        let head = self.head?;
        let next = table.get(head).next;
        if let Some(next) = next {
            table.get_mut(next).prev = None;
        }
        self.head = next;
        self.len -= 1;

        let block = table.get_mut(head);
        block.prev = None;
        block.next = None;
        Some(head)
    }

    /// Unlink `slot`, which must currently be a member of this list
    pub fn remove(&mut self, table: &mut MetaTable, slot: usize) {
        let BuddyBlock { prev, next, .. } = *table.get(slot);

        if let Some(next) = next {
            table.get_mut(next).prev = prev;
        }
        match prev {
            Some(prev) => table.get_mut(prev).next = next,
            None => {
                if self.head != Some(slot) {
                    error!("slot {} has no predecessor but is not the list head", slot);
                    return;
                }
                self.head = next;
            }
        }
        self.len -= 1;

        let block = table.get_mut(slot);
        block.prev = None;
        block.next = None;
    }

    /// Get iterator over member slots
    pub fn iter<'a>(&self, table: &'a MetaTable) -> RankListIter<'a> {
        RankListIter {
            table,
            current: self.head,
            remaining: self.len,
        }
    }

    /// Check that every member is free, and that the links agree in both
    /// directions and with the length counter.
    pub fn is_consistent(&self, table: &MetaTable, rank: usize) -> bool {
        let mut prev = None;
        let mut current = self.head;
        let mut visited = 0;

        while let Some(slot) = current {
            if visited >= self.len {
                error!("Potential cycle detected in rank {} free list", rank);
                return false;
            }
            let block = table.get(slot);
            if block.status != BlockStatus::Free || block.rank() != rank || block.prev != prev {
                return false;
            }
            prev = current;
            current = block.next;
            visited += 1;
        }
        visited == self.len
    }
}

impl Default for RankList {
    fn default() -> Self {
        Self::new()
    }
}

/// Iterator for RankList
pub struct RankListIter<'a> {
    table: &'a MetaTable,
    current: Option<usize>,
    remaining: usize,
}

impl Iterator for RankListIter<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<Self::Item> {
        // bounded by `remaining` so a corrupted link cannot loop forever
        if self.remaining == 0 {
            return None;
        }
        let slot = self.current?;
        self.current = self.table.get(slot).next;
        self.remaining -= 1;
        Some(slot)
    }
}
