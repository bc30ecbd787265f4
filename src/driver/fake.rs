//! Deterministic in-memory driver for tests and simulation

use std::collections::HashSet;
use std::sync::Mutex;

use super::{DriverError, DriverPageable, DriverResult, ResidencyDriver};
use crate::residency::{MemorySegment, NativeHandle};

/// A driver call recorded by [`FakeDriver`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverCall {
    MakeResident(Vec<NativeHandle>),
    Evict(Vec<NativeHandle>),
}

#[derive(Debug, Default)]
struct FakeDriverState {
    budgets: [u64; 2],
    resident: HashSet<NativeHandle>,
    calls: Vec<DriverCall>,
    recording_disabled: bool,
    failing_make_resident_calls: u32,
    fail_evict: bool,
    fail_budget_query: bool,
    budget_queries: u64,
}

impl FakeDriverState {
    fn record(&mut self, call: DriverCall) {
        if !self.recording_disabled {
            self.calls.push(call);
        }
    }
}

/// Driver with fixed, adjustable budgets and scripted failures
///
/// Records every make-resident and evict batch so tests can assert on what
/// the manager asked for, and tracks which handles it currently considers
/// resident. Long-running callers turn recording off with
/// [`set_call_recording`](FakeDriver::set_call_recording).
#[derive(Debug, Default)]
pub struct FakeDriver {
    state: Mutex<FakeDriverState>,
}

impl FakeDriver {
    pub fn new(local_budget: u64, non_local_budget: u64) -> Self {
        FakeDriver {
            state: Mutex::new(FakeDriverState {
                budgets: [local_budget, non_local_budget],
                ..FakeDriverState::default()
            }),
        }
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut FakeDriverState) -> R) -> R {
        // A panicking test thread must not cascade into every later call
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut state)
    }

    /// Change the OS budget reported for `segment`
    pub fn set_budget(&self, segment: MemorySegment, budget: u64) {
        self.with_state(|s| s.budgets[segment.index()] = budget);
    }

    /// Fail the next `count` make-resident calls
    pub fn fail_next_make_resident(&self, count: u32) {
        self.with_state(|s| s.failing_make_resident_calls = count);
    }

    pub fn set_evict_failure(&self, fail: bool) {
        self.with_state(|s| s.fail_evict = fail);
    }

    pub fn set_budget_query_failure(&self, fail: bool) {
        self.with_state(|s| s.fail_budget_query = fail);
    }

    /// Stop (or resume) appending to the call log
    pub fn set_call_recording(&self, enabled: bool) {
        self.with_state(|s| s.recording_disabled = !enabled);
    }

    /// All recorded calls, oldest first
    pub fn calls(&self) -> Vec<DriverCall> {
        self.with_state(|s| s.calls.clone())
    }

    pub fn clear_calls(&self) {
        self.with_state(|s| s.calls.clear());
    }

    pub fn make_resident_call_count(&self) -> usize {
        self.with_state(|s| {
            s.calls
                .iter()
                .filter(|c| matches!(c, DriverCall::MakeResident(_)))
                .count()
        })
    }

    /// Handles evicted so far, in eviction order
    pub fn evicted_handles(&self) -> Vec<NativeHandle> {
        self.with_state(|s| {
            s.calls
                .iter()
                .filter_map(|c| match c {
                    DriverCall::Evict(handles) => Some(handles.clone()),
                    DriverCall::MakeResident(_) => None,
                })
                .flatten()
                .collect()
        })
    }

    /// Whether the last driver call touching `handle` made it resident
    pub fn is_resident(&self, handle: NativeHandle) -> bool {
        self.with_state(|s| s.resident.contains(&handle))
    }

    pub fn budget_query_count(&self) -> u64 {
        self.with_state(|s| s.budget_queries)
    }
}

impl ResidencyDriver for FakeDriver {
    fn query_segment_budget(&self, segment: MemorySegment) -> DriverResult<u64> {
        self.with_state(|s| {
            s.budget_queries += 1;
            if s.fail_budget_query {
                return Err(DriverError::BudgetQueryFailed(format!(
                    "scripted failure for {} segment",
                    segment
                )));
            }
            Ok(s.budgets[segment.index()])
        })
    }

    fn make_resident(&self, pageables: &[DriverPageable]) -> DriverResult<()> {
        self.with_state(|s| {
            let handles: Vec<NativeHandle> = pageables.iter().map(|p| p.handle).collect();
            s.record(DriverCall::MakeResident(handles.clone()));

            if s.failing_make_resident_calls > 0 {
                s.failing_make_resident_calls -= 1;
                return Err(DriverError::MakeResidentFailed(format!(
                    "scripted out-of-memory for {} pageables",
                    pageables.len()
                )));
            }

            s.resident.extend(handles);
            Ok(())
        })
    }

    fn evict(&self, pageables: &[DriverPageable]) -> DriverResult<()> {
        self.with_state(|s| {
            let handles: Vec<NativeHandle> = pageables.iter().map(|p| p.handle).collect();
            s.record(DriverCall::Evict(handles.clone()));

            if s.fail_evict {
                return Err(DriverError::EvictFailed("scripted evict failure".to_string()));
            }

            for handle in &handles {
                s.resident.remove(handle);
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pageable(raw: u64) -> DriverPageable {
        DriverPageable {
            handle: NativeHandle::new(raw),
            segment: MemorySegment::Local,
            size_in_bytes: 64,
        }
    }

    #[test]
    fn test_budget_query() {
        let driver = FakeDriver::new(1000, 500);
        assert_eq!(driver.query_segment_budget(MemorySegment::Local), Ok(1000));
        assert_eq!(driver.query_segment_budget(MemorySegment::NonLocal), Ok(500));

        driver.set_budget(MemorySegment::Local, 10);
        assert_eq!(driver.query_segment_budget(MemorySegment::Local), Ok(10));
        assert_eq!(driver.budget_query_count(), 3);

        driver.set_budget_query_failure(true);
        assert!(driver.query_segment_budget(MemorySegment::Local).is_err());
    }

    #[test]
    fn test_make_resident_and_evict_are_recorded() {
        let driver = FakeDriver::new(1000, 1000);
        driver.make_resident(&[pageable(1), pageable(2)]).unwrap();
        driver.evict(&[pageable(1)]).unwrap();

        assert_eq!(
            driver.calls(),
            vec![
                DriverCall::MakeResident(vec![NativeHandle::new(1), NativeHandle::new(2)]),
                DriverCall::Evict(vec![NativeHandle::new(1)]),
            ]
        );
        assert!(!driver.is_resident(NativeHandle::new(1)));
        assert!(driver.is_resident(NativeHandle::new(2)));
        assert_eq!(driver.evicted_handles(), vec![NativeHandle::new(1)]);
        assert_eq!(driver.make_resident_call_count(), 1);
    }

    #[test]
    fn test_scripted_make_resident_failures() {
        let driver = FakeDriver::new(1000, 1000);
        driver.fail_next_make_resident(1);

        assert!(driver.make_resident(&[pageable(1)]).is_err());
        assert!(!driver.is_resident(NativeHandle::new(1)));
        assert!(driver.make_resident(&[pageable(1)]).is_ok());
        assert!(driver.is_resident(NativeHandle::new(1)));
    }

    #[test]
    fn test_scripted_evict_failure_keeps_residency() {
        let driver = FakeDriver::new(1000, 1000);
        driver.make_resident(&[pageable(4)]).unwrap();
        driver.set_evict_failure(true);

        assert!(driver.evict(&[pageable(4)]).is_err());
        assert!(driver.is_resident(NativeHandle::new(4)));

        driver.clear_calls();
        assert!(driver.calls().is_empty());
    }

    #[test]
    fn test_call_recording_can_be_disabled() {
        let driver = FakeDriver::new(1000, 1000);
        driver.set_call_recording(false);
        driver.make_resident(&[pageable(5)]).unwrap();
        driver.evict(&[pageable(5)]).unwrap();
        driver.make_resident(&[pageable(6)]).unwrap();

        assert!(driver.calls().is_empty());
        assert!(!driver.is_resident(NativeHandle::new(5)));
        assert!(driver.is_resident(NativeHandle::new(6)));

        driver.set_call_recording(true);
        driver.evict(&[pageable(6)]).unwrap();
        assert_eq!(driver.calls(), vec![DriverCall::Evict(vec![NativeHandle::new(6)])]);
    }
}
