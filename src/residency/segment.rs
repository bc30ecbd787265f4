//! Per-segment budget bookkeeping and LRU of evictable pageables

use lru::LruCache;

use super::config::ResidencyConfig;
use super::types::{MemorySegment, PageableId, SegmentStats};

/// Accounting for one physical memory pool
///
/// `usage` is the sum of the sizes of every resident pageable in the segment,
/// locked or not. The LRU only holds resident, unlocked pageables: the head
/// is the least recently touched, the tail the most recent.
#[derive(Debug)]
pub(crate) struct MemorySegmentInfo {
    pub(crate) segment: MemorySegment,
    pub(crate) budget: u64,
    pub(crate) usage: u64,
    /// Reservation the caller asked for
    pub(crate) external_request: u64,
    /// Reservation actually granted after the last budget refresh
    pub(crate) external_reservation: u64,
    lru: LruCache<PageableId, ()>,
}

impl MemorySegmentInfo {
    pub(crate) fn new(segment: MemorySegment) -> Self {
        MemorySegmentInfo {
            segment,
            budget: 0,
            usage: 0,
            external_request: 0,
            external_reservation: 0,
            lru: LruCache::unbounded(),
        }
    }

    /// Fold a fresh OS budget into the segment
    ///
    /// The external reservation is clamped to `[0, os_budget]`, scaled by
    /// the configured reservation ratio. While the budget is restricted for testing only the reservation is
    /// refreshed.
    pub(crate) fn apply_os_budget(
        &mut self,
        os_budget: u64,
        config: &ResidencyConfig,
        restricted: bool,
    ) {
        let max_reservation = scale(os_budget, config.max_external_reservation_ratio);
        self.external_reservation = self.external_request.min(max_reservation);

        if restricted {
            return;
        }

        let usable = os_budget.saturating_sub(self.external_reservation);
        self.budget = scale(usable, config.budget_cap_ratio);
    }

    /// Whether `size` more bytes fit without exceeding the budget
    pub(crate) fn fits(&self, size: u64) -> bool {
        self.usage.saturating_add(size) <= self.budget
    }

    pub(crate) fn add_usage(&mut self, size: u64) {
        self.usage = self.usage.saturating_add(size);
    }

    pub(crate) fn sub_usage(&mut self, size: u64) {
        debug_assert!(
            self.usage >= size,
            "{} segment usage {} would drop below zero (-{})",
            self.segment,
            self.usage,
            size
        );
        self.usage = self.usage.saturating_sub(size);
    }

    /// Append at the tail (most recently used)
    pub(crate) fn push_tail(&mut self, id: PageableId) {
        self.lru.push(id, ());
    }

    /// Move an entry already in the LRU to the tail
    pub(crate) fn touch(&mut self, id: PageableId) -> bool {
        if self.lru.pop(&id).is_some() {
            self.lru.push(id, ());
            true
        } else {
            false
        }
    }

    pub(crate) fn remove(&mut self, id: PageableId) -> bool {
        self.lru.pop(&id).is_some()
    }

    pub(crate) fn peek_head(&self) -> Option<PageableId> {
        self.lru.peek_lru().map(|(id, _)| *id)
    }

    pub(crate) fn pop_head(&mut self) -> Option<PageableId> {
        self.lru.pop_lru().map(|(id, _)| id)
    }

    pub(crate) fn contains(&self, id: PageableId) -> bool {
        self.lru.contains(&id)
    }

    pub(crate) fn lru_len(&self) -> usize {
        self.lru.len()
    }

    /// LRU contents from head (next to evict) to tail
    pub(crate) fn lru_order(&self) -> Vec<PageableId> {
        self.lru.iter().rev().map(|(id, _)| *id).collect()
    }

    pub(crate) fn stats(&self, locked_count: usize) -> SegmentStats {
        SegmentStats {
            segment: self.segment,
            budget: self.budget,
            usage: self.usage,
            external_reservation: self.external_reservation,
            evictable_count: self.lru_len(),
            locked_count,
        }
    }
}

fn scale(bytes: u64, ratio: f64) -> u64 {
    (bytes as f64 * ratio) as u64
}
