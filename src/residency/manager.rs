//! Residency manager: budget-driven LRU eviction and pinning
//!
//! All residency metadata (per-segment usage, the LRUs, pin counts) lives in
//! one ledger behind a single mutex, so lock, unlock, ensure-resident and the
//! eviction decisions they trigger are atomic with respect to each other.
//! Driver calls are issued while the ledger lock is held. Nothing here blocks
//! on the GPU.
//!
//! # Overcommit
//!
//! `usage <= budget` is a soft invariant. The eviction loop stops when the
//! segment's LRU runs dry, or when the next candidate was referenced by the
//! batch currently being recorded, and execution proceeds above budget. The
//! driver's make-resident call is the only hard enforcement point; its
//! failure is the only error the eviction path reports. Overcommitted memory
//! is reclaimed lazily by the next eviction pass.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use super::config::ResidencyConfig;
use super::pageable::{Pageable, PageableEntry};
use super::segment::MemorySegmentInfo;
use super::types::{
    ExecutionSerial, MemorySegment, NativeHandle, PageableId, PageableInfo, ResidencyStats,
    SegmentStats,
};
use crate::driver::{DriverPageable, DriverResult, ResidencyDriver};
use crate::error::{ResidencyError, ResidencyResult};
use crate::internal_error;
use crate::metrics::ResidencyMetrics;

/// Everything the residency lock protects
#[derive(Debug)]
struct ResidencyLedger {
    entries: HashMap<PageableId, PageableEntry>,
    segments: [MemorySegmentInfo; 2],
    pending_serial: ExecutionSerial,
    budget_restricted: bool,
    next_id: u64,
}

impl ResidencyLedger {
    fn new() -> Self {
        ResidencyLedger {
            entries: HashMap::new(),
            segments: [
                MemorySegmentInfo::new(MemorySegment::Local),
                MemorySegmentInfo::new(MemorySegment::NonLocal),
            ],
            pending_serial: ExecutionSerial::FIRST,
            budget_restricted: false,
            next_id: 1,
        }
    }

    fn entry(&self, id: PageableId) -> ResidencyResult<&PageableEntry> {
        self.entries
            .get(&id)
            .ok_or(ResidencyError::UnknownPageable(id))
    }

    fn entry_mut(&mut self, id: PageableId) -> ResidencyResult<&mut PageableEntry> {
        self.entries
            .get_mut(&id)
            .ok_or(ResidencyError::UnknownPageable(id))
    }

    fn segment_stats(&self, segment: MemorySegment) -> SegmentStats {
        let locked = self
            .entries
            .values()
            .filter(|e| e.segment == segment && e.is_locked())
            .count();
        self.segments[segment.index()].stats(locked)
    }

    /// Check the pin/LRU/usage invariants, describing the first violation
    fn verify(&self) -> Result<(), String> {
        let mut resident_bytes = [0u64; 2];

        for (id, entry) in &self.entries {
            let idx = entry.segment.index();
            let in_own_lru = self.segments[idx].contains(*id);
            let in_other_lru = self.segments[1 - idx].contains(*id);

            if in_other_lru {
                return Err(format!("{} is in the LRU of the wrong segment", id));
            }
            if entry.is_locked() && !entry.is_resident {
                return Err(format!("{} is locked but not resident", id));
            }
            if entry.is_locked() && in_own_lru {
                return Err(format!("{} is locked but still evictable", id));
            }
            if entry.is_resident && !entry.is_locked() && !in_own_lru {
                return Err(format!("{} is resident and unlocked but not in the LRU", id));
            }
            if !entry.is_resident && in_own_lru {
                return Err(format!("{} is in the LRU but not resident", id));
            }
            if entry.is_resident {
                resident_bytes[idx] += entry.size_in_bytes;
            }
        }

        for info in &self.segments {
            if info.usage != resident_bytes[info.segment.index()] {
                return Err(format!(
                    "{} segment usage {} does not match resident bytes {}",
                    info.segment,
                    info.usage,
                    resident_bytes[info.segment.index()]
                ));
            }
            if let Some(orphan) = info
                .lru_order()
                .into_iter()
                .find(|id| !self.entries.contains_key(id))
            {
                return Err(format!("{} segment LRU holds unknown {}", info.segment, orphan));
            }
        }

        Ok(())
    }
}

/// State shared between the manager and the pageable handles it issued
pub(crate) struct Shared {
    config: ResidencyConfig,
    driver: Arc<dyn ResidencyDriver>,
    metrics: ResidencyMetrics,
    ledger: Mutex<ResidencyLedger>,
}

impl Shared {
    fn lock(&self) -> ResidencyResult<MutexGuard<'_, ResidencyLedger>> {
        Ok(self.ledger.lock()?)
    }

    fn tracked_segments(&self) -> &'static [MemorySegment] {
        if self.config.is_uma {
            &[MemorySegment::Local]
        } else {
            &MemorySegment::ALL
        }
    }

    /// Unified-memory adapters account everything against the local segment
    fn effective_segment(&self, segment: MemorySegment) -> MemorySegment {
        if self.config.is_uma {
            MemorySegment::Local
        } else {
            segment
        }
    }

    fn publish(&self, ledger: &ResidencyLedger, segment: MemorySegment) {
        let info = &ledger.segments[segment.index()];
        self.metrics.record_segment(segment, info.budget, info.usage);
    }

    fn load_segment_budget(
        &self,
        ledger: &mut ResidencyLedger,
        segment: MemorySegment,
    ) -> DriverResult<()> {
        let os_budget = self.driver.query_segment_budget(segment)?;
        let restricted = ledger.budget_restricted;
        let info = &mut ledger.segments[segment.index()];
        info.apply_os_budget(os_budget, &self.config, restricted);
        tracing::trace!(
            %segment,
            os_budget,
            budget = info.budget,
            external_reservation = info.external_reservation,
            "Segment budget refreshed"
        );
        self.publish(ledger, segment);
        Ok(())
    }

    /// Re-query the OS budget for one segment
    ///
    /// A failed query keeps the previous budget; budget bookkeeping never
    /// surfaces errors after construction.
    fn refresh_segment(&self, ledger: &mut ResidencyLedger, segment: MemorySegment) {
        if let Err(e) = self.load_segment_budget(ledger, segment) {
            tracing::warn!(%segment, error = %e, "Budget query failed, keeping previous budget");
            self.publish(ledger, segment);
        }
    }

    /// The eviction loop
    ///
    /// Pops the LRU head of `segment` until `usage + size <= budget`. Stops
    /// early (overcommit) when the LRU is empty or its head was referenced in
    /// the pending serial. Returns the number of bytes evicted.
    fn evict_until_fits(
        &self,
        ledger: &mut ResidencyLedger,
        size: u64,
        segment: MemorySegment,
    ) -> u64 {
        self.refresh_segment(ledger, segment);

        let idx = segment.index();
        let pending = ledger.pending_serial;
        let mut batch = Vec::new();
        let mut bytes_evicted = 0u64;
        let mut overcommitted = false;

        while !ledger.segments[idx].fits(size) {
            let Some(head) = ledger.segments[idx].peek_head() else {
                overcommitted = true;
                break;
            };

            let Some(entry) = ledger.entries.get_mut(&head) else {
                tracing::error!(%head, %segment, "LRU node without metadata dropped");
                ledger.segments[idx].remove(head);
                continue;
            };

            // More memory is referenced by the batch being recorded than the
            // budget allows; evicting its own heaps would only thrash
            if entry.last_submission == pending {
                overcommitted = true;
                break;
            }

            ledger.segments[idx].pop_head();
            entry.is_resident = false;
            ledger.segments[idx].sub_usage(entry.size_in_bytes);
            bytes_evicted += entry.size_in_bytes;
            batch.push(DriverPageable {
                handle: entry.native,
                segment,
                size_in_bytes: entry.size_in_bytes,
            });
        }

        if overcommitted {
            let info = &ledger.segments[idx];
            self.metrics.overcommit_events.inc();
            tracing::warn!(
                %segment,
                usage = info.usage,
                budget = info.budget,
                requested = size,
                "Residency budget overcommitted, no more pageables can be evicted"
            );
        }

        if !batch.is_empty() {
            self.metrics.evictions.inc_by(batch.len() as u64);
            self.metrics.evicted_bytes.inc_by(bytes_evicted);
            tracing::debug!(
                %segment,
                count = batch.len(),
                bytes_evicted,
                "Evicting pageables to stay under budget"
            );
            if let Err(e) = self.driver.evict(&batch) {
                self.metrics.evict_failures.inc();
                tracing::warn!(%segment, count = batch.len(), error = %e, "Evict call failed");
            }
            self.publish(ledger, segment);
        }

        bytes_evicted
    }

    /// Evict for `size` bytes, then make every id in `ids` resident in one
    /// driver call. The caller decides where the pageables go afterwards
    /// (LRU tail or pinned).
    fn make_resident(
        &self,
        ledger: &mut ResidencyLedger,
        segment: MemorySegment,
        ids: &[PageableId],
        size: u64,
    ) -> ResidencyResult<()> {
        self.evict_until_fits(ledger, size, segment);

        let batch: Vec<DriverPageable> = ids
            .iter()
            .filter_map(|id| ledger.entries.get(id))
            .map(|entry| DriverPageable {
                handle: entry.native,
                segment,
                size_in_bytes: entry.size_in_bytes,
            })
            .collect();

        self.metrics.make_resident_calls.inc();
        if let Err(source) = self.driver.make_resident(&batch) {
            self.metrics.out_of_memory.inc();
            tracing::error!(
                %segment,
                requested_bytes = size,
                count = batch.len(),
                error = %source,
                "Make resident failed"
            );
            return Err(ResidencyError::OutOfMemory {
                segment,
                requested_bytes: size,
                source,
            });
        }

        for id in ids {
            if let Some(entry) = ledger.entries.get_mut(id) {
                entry.is_resident = true;
            }
        }
        ledger.segments[segment.index()].add_usage(size);
        self.metrics.made_resident.inc_by(batch.len() as u64);
        tracing::debug!(%segment, count = batch.len(), bytes = size, "Pageables made resident");
        self.publish(ledger, segment);
        Ok(())
    }

    fn unlock(&self, id: PageableId) -> ResidencyResult<()> {
        let mut guard = self.lock()?;
        let ledger = &mut *guard;

        let entry = ledger.entry_mut(id)?;
        if !entry.is_locked() {
            return Err(ResidencyError::NotLocked(id));
        }

        entry.lock_count -= 1;
        if entry.lock_count == 0 {
            // Still resident; evictable again from the most-recent end
            let idx = entry.segment.index();
            ledger.segments[idx].push_tail(id);
            tracing::trace!(%id, "Pageable unlocked and returned to LRU");
        }
        Ok(())
    }

    /// Destruction notification from a dropped [`Pageable`]
    pub(crate) fn forget(&self, id: PageableId) {
        let mut guard = match self.ledger.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::warn!(%id, "Residency lock poisoned while releasing pageable");
                poisoned.into_inner()
            }
        };
        let ledger = &mut *guard;

        let Some(entry) = ledger.entries.remove(&id) else {
            return;
        };

        if entry.is_resident {
            let info = &mut ledger.segments[entry.segment.index()];
            info.sub_usage(entry.size_in_bytes);
            if !entry.is_locked() {
                info.remove(id);
            }
            self.publish(ledger, entry.segment);
        }

        if entry.is_locked() {
            tracing::debug!(%id, lock_count = entry.lock_count, "Locked pageable released");
        } else {
            tracing::trace!(%id, "Pageable released");
        }
    }
}

/// Report collaborator bugs loudly: fatal in debug builds, an `Internal`
/// error otherwise
fn check_programming_error<T>(operation: &str, result: ResidencyResult<T>) -> ResidencyResult<T> {
    if let Err(
        err @ (ResidencyError::NotLocked(_)
        | ResidencyError::UnknownPageable(_)
        | ResidencyError::AlreadyResident(_)),
    ) = &result
    {
        tracing::error!(operation, error = %err, "Residency programming error");
        if cfg!(debug_assertions) {
            panic!("{}: {}", operation, err);
        }
    }
    result
}

/// GPU memory residency manager
///
/// Owns the local and non-local segment bookkeeping and decides which
/// pageables are resident. Cloning is cheap and yields a handle to the same
/// manager.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use residencyforge::driver::FakeDriver;
/// use residencyforge::residency::{MemorySegment, NativeHandle, ResidencyConfig, ResidencyManager};
///
/// let driver = Arc::new(FakeDriver::new(1 << 30, 1 << 30));
/// let manager = ResidencyManager::new(driver, ResidencyConfig::default())?;
///
/// manager.ensure_can_allocate(4096, MemorySegment::Local)?;
/// let heap = manager.register_pageable(MemorySegment::Local, 4096, NativeHandle::new(1))?;
/// manager.track_resident_allocation(&heap)?;
///
/// manager.ensure_heaps_are_resident([&heap])?;
/// assert!(manager.pageable_info(&heap)?.is_resident());
/// # Ok::<(), residencyforge::ResidencyError>(())
/// ```
#[derive(Clone)]
pub struct ResidencyManager {
    shared: Arc<Shared>,
}

impl ResidencyManager {
    /// Create a manager on top of `driver` and take the first budget reading
    ///
    /// Fails with [`ResidencyError::Driver`] when that reading fails.
    pub fn new(
        driver: Arc<dyn ResidencyDriver>,
        config: ResidencyConfig,
    ) -> ResidencyResult<Self> {
        config.validate()?;

        let restrict_budget = config.restrict_budget;
        let manager = ResidencyManager {
            shared: Arc::new(Shared {
                config,
                driver,
                metrics: ResidencyMetrics::new(),
                ledger: Mutex::new(ResidencyLedger::new()),
            }),
        };

        {
            // The first budget reading must succeed
            let mut ledger = manager.shared.lock()?;
            for &segment in manager.shared.tracked_segments() {
                manager.shared.load_segment_budget(&mut ledger, segment)?;
            }
        }
        if let Some(budget) = restrict_budget {
            manager.restrict_budget_for_testing(budget)?;
        }

        tracing::info!(
            enabled = manager.shared.config.enabled,
            is_uma = manager.shared.config.is_uma,
            "Residency manager created"
        );
        Ok(manager)
    }

    pub fn config(&self) -> &ResidencyConfig {
        &self.shared.config
    }

    pub fn metrics(&self) -> &ResidencyMetrics {
        &self.shared.metrics
    }

    /// Whether residency management is active
    pub fn is_enabled(&self) -> bool {
        self.shared.config.enabled
    }

    fn check_owner(&self, pageable: &Pageable) -> ResidencyResult<()> {
        if pageable.is_owned_by(&self.shared) {
            Ok(())
        } else {
            Err(ResidencyError::UnknownPageable(pageable.id()))
        }
    }

    /// Register a new heap or directly allocated resource
    ///
    /// The pageable starts out not resident and outside every LRU. On
    /// unified-memory adapters every pageable is accounted to the local
    /// segment.
    pub fn register_pageable(
        &self,
        segment: MemorySegment,
        size_in_bytes: u64,
        native: NativeHandle,
    ) -> ResidencyResult<Pageable> {
        if size_in_bytes == 0 {
            return Err(ResidencyError::InvalidRequest(
                "pageable size cannot be zero".to_string(),
            ));
        }

        let segment = self.shared.effective_segment(segment);
        let mut ledger = self.shared.lock()?;
        let id = PageableId(ledger.next_id);
        ledger.next_id += 1;
        ledger
            .entries
            .insert(id, PageableEntry::new(segment, size_in_bytes, native));
        drop(ledger);

        tracing::trace!(%id, %segment, size_in_bytes, "Pageable registered");
        Ok(Pageable::new(
            id,
            segment,
            size_in_bytes,
            native,
            Arc::downgrade(&self.shared),
        ))
    }

    /// Evict until an allocation of `size` fits in `segment`
    ///
    /// Running out of eviction candidates is not an error: the allocation is
    /// allowed to overcommit.
    pub fn ensure_can_allocate(&self, size: u64, segment: MemorySegment) -> ResidencyResult<()> {
        self.ensure_can_make_resident(size, segment).map(|_| ())
    }

    /// Evict least-recently-used pageables until `size` more bytes fit
    ///
    /// Returns the number of bytes evicted. Locked pageables are never
    /// candidates.
    pub fn ensure_can_make_resident(
        &self,
        size: u64,
        segment: MemorySegment,
    ) -> ResidencyResult<u64> {
        if !self.is_enabled() {
            return Ok(0);
        }

        let segment = self.shared.effective_segment(segment);
        let mut ledger = self.shared.lock()?;
        Ok(self.shared.evict_until_fits(&mut ledger, size, segment))
    }

    /// Make every heap referenced by the next command batch resident
    ///
    /// Resident heaps move to the tail of their LRU. Non-resident heaps are
    /// made resident with one batched driver call per segment, after evicting
    /// for their combined size. Every referenced heap is stamped with the
    /// pending serial. Duplicates in `heaps` are ignored.
    pub fn ensure_heaps_are_resident<'a, I>(&self, heaps: I) -> ResidencyResult<()>
    where
        I: IntoIterator<Item = &'a Pageable>,
    {
        if !self.is_enabled() {
            return Ok(());
        }

        let heaps: Vec<&Pageable> = heaps.into_iter().collect();
        let result = heaps
            .iter()
            .try_for_each(|heap| self.check_owner(heap))
            .and_then(|()| self.ensure_resident_locked(&heaps));
        check_programming_error("ensure_heaps_are_resident", result)
    }

    fn ensure_resident_locked(&self, heaps: &[&Pageable]) -> ResidencyResult<()> {
        let mut guard = self.shared.lock()?;
        let ledger = &mut *guard;

        for heap in heaps {
            ledger.entry(heap.id())?;
        }

        let pending = ledger.pending_serial;
        let mut seen = HashSet::with_capacity(heaps.len());
        let mut to_make_resident: [Vec<PageableId>; 2] = Default::default();
        let mut sizes = [0u64; 2];

        for heap in heaps {
            let id = heap.id();
            if !seen.insert(id) {
                continue;
            }
            let Some(entry) = ledger.entries.get_mut(&id) else {
                continue;
            };

            entry.last_submission = pending;
            if entry.is_locked() {
                continue;
            }

            let idx = entry.segment.index();
            if entry.is_resident {
                ledger.segments[idx].touch(id);
            } else {
                to_make_resident[idx].push(id);
                sizes[idx] += entry.size_in_bytes;
            }
        }

        for segment in MemorySegment::ALL {
            let idx = segment.index();
            let ids = std::mem::take(&mut to_make_resident[idx]);
            if ids.is_empty() {
                continue;
            }

            self.shared.make_resident(ledger, segment, &ids, sizes[idx])?;
            for id in ids {
                ledger.segments[idx].push_tail(id);
            }
        }

        Ok(())
    }

    /// Start tracking memory that is resident by construction
    ///
    /// No driver call and no budget check; the pageable goes straight to the
    /// tail of its segment's LRU.
    pub fn track_resident_allocation(&self, pageable: &Pageable) -> ResidencyResult<()> {
        if !self.is_enabled() {
            return Ok(());
        }

        let result = self.check_owner(pageable).and_then(|()| {
            let mut guard = self.shared.lock()?;
            let ledger = &mut *guard;
            let id = pageable.id();

            let entry = ledger.entry_mut(id)?;
            if entry.is_resident {
                return Err(ResidencyError::AlreadyResident(id));
            }
            entry.is_resident = true;
            let (segment, size) = (entry.segment, entry.size_in_bytes);

            let info = &mut ledger.segments[segment.index()];
            info.add_usage(size);
            info.push_tail(id);
            self.shared.publish(ledger, segment);
            tracing::trace!(%id, %segment, size, "Tracking resident allocation");
            Ok(())
        });
        check_programming_error("track_resident_allocation", result)
    }

    /// Pin a pageable resident
    ///
    /// Makes it resident first if needed, then removes it from the LRU so no
    /// eviction pass can pick it. Locks nest: every lock needs its own unlock.
    pub fn lock_allocation(&self, pageable: &Pageable) -> ResidencyResult<()> {
        if !self.is_enabled() {
            return Ok(());
        }

        let result = self.check_owner(pageable).and_then(|()| {
            let mut guard = self.shared.lock()?;
            let ledger = &mut *guard;
            let id = pageable.id();

            let entry = ledger.entry(id)?;
            let (segment, size) = (entry.segment, entry.size_in_bytes);
            let (is_resident, is_locked) = (entry.is_resident, entry.is_locked());

            if !is_resident {
                self.shared.make_resident(ledger, segment, &[id], size)?;
            } else if !is_locked {
                ledger.segments[segment.index()].remove(id);
            }

            let entry = ledger.entry_mut(id)?;
            entry.lock_count = entry
                .lock_count
                .checked_add(1)
                .ok_or_else(|| internal_error!("lock count overflow on {}", id))?;
            tracing::trace!(%id, lock_count = entry.lock_count, "Pageable locked");
            Ok(())
        });
        check_programming_error("lock_allocation", result)
    }

    /// Release one lock; the last unlock makes the pageable evictable again
    pub fn unlock_allocation(&self, pageable: &Pageable) -> ResidencyResult<()> {
        if !self.is_enabled() {
            return Ok(());
        }

        let result = self
            .check_owner(pageable)
            .and_then(|()| self.shared.unlock(pageable.id()));
        check_programming_error("unlock_allocation", result)
    }

    /// Lock `pageable` for the lifetime of the returned guard
    pub fn lock_guard<'a>(&'a self, pageable: &'a Pageable) -> ResidencyResult<ResidencyLockGuard<'a>> {
        self.lock_allocation(pageable)?;
        Ok(ResidencyLockGuard {
            manager: self,
            pageable,
        })
    }

    /// Re-query the OS budget of every tracked segment
    ///
    /// Call once per device tick. A restricted budget is left untouched.
    pub fn update_memory_segment_info(&self) -> ResidencyResult<()> {
        let mut ledger = self.shared.lock()?;
        for &segment in self.shared.tracked_segments() {
            self.shared.refresh_segment(&mut ledger, segment);
        }
        Ok(())
    }

    /// Carve out budget for memory the manager does not own
    ///
    /// Returns the reservation actually granted: the request clamped to the
    /// OS budget (scaled by `max_external_reservation_ratio`, 1.0 by default).
    /// The grant follows the OS budget on every refresh.
    pub fn set_external_memory_reservation(
        &self,
        segment: MemorySegment,
        requested: u64,
    ) -> ResidencyResult<u64> {
        let segment = self.shared.effective_segment(segment);
        let mut ledger = self.shared.lock()?;
        ledger.segments[segment.index()].external_request = requested;
        self.shared.refresh_segment(&mut ledger, segment);

        let granted = ledger.segments[segment.index()].external_reservation;
        tracing::debug!(%segment, requested, granted, "External memory reservation updated");
        Ok(granted)
    }

    /// Pin every tracked segment's budget to `budget` bytes
    ///
    /// Later budget refreshes keep the restricted value.
    pub fn restrict_budget_for_testing(&self, budget: u64) -> ResidencyResult<()> {
        let mut guard = self.shared.lock()?;
        let ledger = &mut *guard;
        ledger.budget_restricted = true;

        for &segment in self.shared.tracked_segments() {
            self.shared.refresh_segment(ledger, segment);
            ledger.segments[segment.index()].budget = budget;
            self.shared.publish(ledger, segment);
        }

        tracing::info!(budget, "Residency budget restricted");
        Ok(())
    }

    /// Current pending serial (the batch being recorded)
    pub fn pending_serial(&self) -> ResidencyResult<ExecutionSerial> {
        Ok(self.shared.lock()?.pending_serial)
    }

    /// Called once the pending batch has been handed to the queue
    ///
    /// Heaps referenced by earlier batches become eviction candidates again.
    pub fn advance_pending_serial(&self) -> ResidencyResult<ExecutionSerial> {
        let mut ledger = self.shared.lock()?;
        ledger.pending_serial = ledger.pending_serial.next();
        Ok(ledger.pending_serial)
    }

    pub fn pageable_info(&self, pageable: &Pageable) -> ResidencyResult<PageableInfo> {
        self.check_owner(pageable)?;
        let ledger = self.shared.lock()?;
        let id = pageable.id();
        let entry = ledger.entry(id)?;

        Ok(PageableInfo {
            id,
            segment: entry.segment,
            size_in_bytes: entry.size_in_bytes,
            state: entry.state(),
            lock_count: entry.lock_count,
            last_submission: entry.last_submission,
            in_lru: ledger.segments[entry.segment.index()].contains(id),
        })
    }

    pub fn segment_stats(&self, segment: MemorySegment) -> ResidencyResult<SegmentStats> {
        let segment = self.shared.effective_segment(segment);
        Ok(self.shared.lock()?.segment_stats(segment))
    }

    pub fn stats(&self) -> ResidencyResult<ResidencyStats> {
        let ledger = self.shared.lock()?;
        Ok(ResidencyStats {
            enabled: self.is_enabled(),
            pending_serial: ledger.pending_serial,
            budget_restricted: ledger.budget_restricted,
            pageable_count: ledger.entries.len(),
            segments: self
                .shared
                .tracked_segments()
                .iter()
                .map(|&segment| ledger.segment_stats(segment))
                .collect(),
        })
    }

    /// Evictable pageables of `segment`, next eviction candidate first
    pub fn lru_order(&self, segment: MemorySegment) -> ResidencyResult<Vec<PageableId>> {
        let segment = self.shared.effective_segment(segment);
        Ok(self.shared.lock()?.segments[segment.index()].lru_order())
    }

    /// Check the residency invariants
    ///
    /// Locked pageables are resident and in no LRU; resident unlocked ones
    /// are in exactly their own segment's LRU; usage equals the resident
    /// bytes of each segment.
    pub fn verify_invariants(&self) -> ResidencyResult<()> {
        self.shared
            .lock()?
            .verify()
            .map_err(ResidencyError::InternalError)
    }
}

impl fmt::Debug for ResidencyManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResidencyManager")
            .field("config", &self.shared.config)
            .finish_non_exhaustive()
    }
}

/// Keeps a pageable locked until dropped
#[must_use = "the pageable is unlocked as soon as the guard is dropped"]
pub struct ResidencyLockGuard<'a> {
    manager: &'a ResidencyManager,
    pageable: &'a Pageable,
}

impl fmt::Debug for ResidencyLockGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResidencyLockGuard")
            .field("pageable", &self.pageable.id())
            .finish()
    }
}

impl Drop for ResidencyLockGuard<'_> {
    fn drop(&mut self) {
        if !self.manager.is_enabled() {
            return;
        }
        if let Err(e) = self.manager.shared.unlock(self.pageable.id()) {
            tracing::error!(id = %self.pageable.id(), error = %e, "Failed to release residency lock");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{DriverCall, FakeDriver};

    const MB: u64 = 1_000_000;

    fn manager(budget: u64) -> (ResidencyManager, Arc<FakeDriver>) {
        let driver = Arc::new(FakeDriver::new(10 * budget, 10 * budget));
        let config = ResidencyConfig::default().with_restricted_budget(budget);
        let manager = ResidencyManager::new(driver.clone(), config).unwrap();
        (manager, driver)
    }

    fn resident(manager: &ResidencyManager, raw: u64, size: u64) -> Pageable {
        manager.ensure_can_allocate(size, MemorySegment::Local).unwrap();
        let pageable = manager
            .register_pageable(MemorySegment::Local, size, NativeHandle::new(raw))
            .unwrap();
        manager.track_resident_allocation(&pageable).unwrap();
        pageable
    }

    #[test]
    fn test_new_pageable_is_not_resident() {
        let (manager, _) = manager(10 * MB);
        let pageable = manager
            .register_pageable(MemorySegment::Local, MB, NativeHandle::new(1))
            .unwrap();

        let info = manager.pageable_info(&pageable).unwrap();
        assert!(!info.is_resident());
        assert!(!info.in_lru);
        assert_eq!(info.lock_count, 0);
        assert_eq!(manager.segment_stats(MemorySegment::Local).unwrap().usage, 0);
    }

    #[test]
    fn test_zero_sized_pageable_rejected() {
        let (manager, _) = manager(10 * MB);
        let err = manager
            .register_pageable(MemorySegment::Local, 0, NativeHandle::new(1))
            .unwrap_err();
        assert!(err.is_user_error());
    }

    #[test]
    fn test_eviction_pops_lru_head_in_one_batch() {
        let (manager, driver) = manager(3 * MB);
        let a = resident(&manager, 1, MB);
        let b = resident(&manager, 2, MB);
        let c = resident(&manager, 3, MB);
        driver.clear_calls();

        let evicted = manager
            .ensure_can_make_resident(2 * MB, MemorySegment::Local)
            .unwrap();

        assert_eq!(evicted, 2 * MB);
        assert_eq!(
            driver.calls(),
            vec![DriverCall::Evict(vec![NativeHandle::new(1), NativeHandle::new(2)])]
        );
        assert!(!manager.pageable_info(&a).unwrap().is_resident());
        assert!(!manager.pageable_info(&b).unwrap().is_resident());
        assert!(manager.pageable_info(&c).unwrap().is_resident());
        assert_eq!(manager.metrics().evictions.get(), 2);
        manager.verify_invariants().unwrap();
    }

    #[test]
    fn test_no_eviction_when_request_fits() {
        let (manager, driver) = manager(3 * MB);
        let _a = resident(&manager, 1, MB);
        driver.clear_calls();

        assert_eq!(
            manager.ensure_can_make_resident(2 * MB, MemorySegment::Local).unwrap(),
            0
        );
        assert!(driver.calls().is_empty());
    }

    #[test]
    fn test_overcommit_when_lru_runs_dry() {
        let (manager, _) = manager(2 * MB);
        let a = resident(&manager, 1, MB);
        manager.lock_allocation(&a).unwrap();

        let evicted = manager
            .ensure_can_make_resident(5 * MB, MemorySegment::Local)
            .unwrap();

        assert_eq!(evicted, 0);
        assert!(manager.pageable_info(&a).unwrap().is_resident());
        assert_eq!(manager.metrics().overcommit_events.get(), 1);
    }

    #[test]
    fn test_lock_removes_from_lru_and_unlock_appends_to_tail() {
        let (manager, _) = manager(10 * MB);
        let a = resident(&manager, 1, MB);
        let b = resident(&manager, 2, MB);

        manager.lock_allocation(&a).unwrap();
        manager.lock_allocation(&a).unwrap();
        assert_eq!(manager.lru_order(MemorySegment::Local).unwrap(), vec![b.id()]);
        assert_eq!(manager.pageable_info(&a).unwrap().lock_count, 2);

        manager.unlock_allocation(&a).unwrap();
        assert_eq!(manager.lru_order(MemorySegment::Local).unwrap(), vec![b.id()]);

        manager.unlock_allocation(&a).unwrap();
        assert_eq!(
            manager.lru_order(MemorySegment::Local).unwrap(),
            vec![b.id(), a.id()]
        );
        manager.verify_invariants().unwrap();
    }

    #[test]
    fn test_lock_makes_non_resident_pageable_resident() {
        let (manager, driver) = manager(10 * MB);
        let a = manager
            .register_pageable(MemorySegment::Local, MB, NativeHandle::new(7))
            .unwrap();

        manager.lock_allocation(&a).unwrap();

        let info = manager.pageable_info(&a).unwrap();
        assert!(info.is_resident());
        assert!(!info.in_lru);
        assert!(driver.is_resident(NativeHandle::new(7)));
        assert_eq!(manager.segment_stats(MemorySegment::Local).unwrap().usage, MB);
        assert_eq!(manager.segment_stats(MemorySegment::Local).unwrap().locked_count, 1);
    }

    #[test]
    #[cfg_attr(debug_assertions, should_panic(expected = "is not locked"))]
    fn test_unlock_without_lock_is_programming_error() {
        let (manager, _) = manager(10 * MB);
        let a = resident(&manager, 1, MB);

        let err = manager.unlock_allocation(&a).unwrap_err();
        assert!(matches!(err, ResidencyError::NotLocked(_)));
    }

    #[test]
    #[cfg_attr(debug_assertions, should_panic(expected = "already resident"))]
    fn test_double_track_is_programming_error() {
        let (manager, _) = manager(10 * MB);
        let a = resident(&manager, 1, MB);

        let err = manager.track_resident_allocation(&a).unwrap_err();
        assert!(matches!(err, ResidencyError::AlreadyResident(_)));
    }

    #[test]
    fn test_drop_releases_usage_and_lru_node() {
        let (manager, _) = manager(10 * MB);
        let a = resident(&manager, 1, MB);
        let b = resident(&manager, 2, 2 * MB);
        manager.lock_allocation(&b).unwrap();

        drop(a);
        drop(b);

        let stats = manager.segment_stats(MemorySegment::Local).unwrap();
        assert_eq!(stats.usage, 0);
        assert_eq!(stats.evictable_count, 0);
        assert_eq!(stats.locked_count, 0);
        assert_eq!(manager.stats().unwrap().pageable_count, 0);
        manager.verify_invariants().unwrap();
    }

    #[test]
    fn test_guard_unlocks_on_drop() {
        let (manager, _) = manager(10 * MB);
        let a = resident(&manager, 1, MB);

        {
            let _guard = manager.lock_guard(&a).unwrap();
            assert_eq!(manager.pageable_info(&a).unwrap().lock_count, 1);
            assert!(manager.lru_order(MemorySegment::Local).unwrap().is_empty());
        }

        assert_eq!(manager.pageable_info(&a).unwrap().lock_count, 0);
        assert_eq!(manager.lru_order(MemorySegment::Local).unwrap(), vec![a.id()]);
    }

    #[test]
    fn test_pending_serial_advances() {
        let (manager, _) = manager(10 * MB);
        assert_eq!(manager.pending_serial().unwrap(), ExecutionSerial::FIRST);
        assert_eq!(manager.advance_pending_serial().unwrap(), ExecutionSerial::new(2));
        assert_eq!(manager.pending_serial().unwrap(), ExecutionSerial::new(2));
    }

    #[test]
    fn test_verify_detects_broken_usage() {
        let (manager, _) = manager(10 * MB);
        let _a = resident(&manager, 1, MB);
        manager.shared.lock().unwrap().segments[0].usage += 1;

        let err = manager.verify_invariants().unwrap_err();
        assert!(err.to_string().contains("usage"));
    }

    #[test]
    fn test_disabled_manager_is_a_no_op() {
        let driver = Arc::new(FakeDriver::new(MB, MB));
        let manager =
            ResidencyManager::new(driver.clone(), ResidencyConfig::default().with_enabled(false))
                .unwrap();
        let a = manager
            .register_pageable(MemorySegment::Local, 10 * MB, NativeHandle::new(1))
            .unwrap();

        manager.ensure_heaps_are_resident([&a]).unwrap();
        manager.lock_allocation(&a).unwrap();
        manager.unlock_allocation(&a).unwrap();
        manager.unlock_allocation(&a).unwrap();

        assert!(driver.calls().is_empty());
        assert!(!manager.pageable_info(&a).unwrap().is_resident());
        assert!(!manager.stats().unwrap().enabled);
    }
}
