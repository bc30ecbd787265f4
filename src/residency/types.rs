//! Core identifiers and snapshot types for residency tracking

use serde::{Deserialize, Serialize};
use std::fmt;

/// Physical memory pool a pageable is committed to
///
/// Each segment has its own OS-reported budget and its own LRU of
/// evictable pageables. Discrete adapters expose both; unified-memory
/// adapters only use `Local`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MemorySegment {
    /// Device-local video memory
    Local,
    /// Shared system memory visible to the GPU
    NonLocal,
}

impl MemorySegment {
    /// Both segments, in bookkeeping order
    pub const ALL: [MemorySegment; 2] = [MemorySegment::Local, MemorySegment::NonLocal];

    pub(crate) fn index(self) -> usize {
        match self {
            MemorySegment::Local => 0,
            MemorySegment::NonLocal => 1,
        }
    }
}

impl fmt::Display for MemorySegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemorySegment::Local => write!(f, "local"),
            MemorySegment::NonLocal => write!(f, "non-local"),
        }
    }
}

/// Identifier the manager uses to key pageable metadata
///
/// Ids are handed out monotonically and never reused within one manager,
/// so a stale id can never alias a newer pageable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PageableId(pub(crate) u64);

impl PageableId {
    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for PageableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pageable#{}", self.0)
    }
}

/// Opaque driver-side handle of the native heap or resource
///
/// For the HIP driver this is the device pointer of a managed allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NativeHandle(u64);

impl NativeHandle {
    pub fn new(raw: u64) -> Self {
        NativeHandle(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

/// Serial of a command batch
///
/// Serial 0 means "never referenced by a submission". The manager's pending
/// serial starts at 1.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct ExecutionSerial(u64);

impl ExecutionSerial {
    pub const NEVER: ExecutionSerial = ExecutionSerial(0);
    pub const FIRST: ExecutionSerial = ExecutionSerial(1);

    pub fn new(raw: u64) -> Self {
        ExecutionSerial(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }

    pub fn next(self) -> Self {
        ExecutionSerial(self.0.saturating_add(1))
    }
}

impl fmt::Display for ExecutionSerial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Residency state of a single pageable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ResidencyState {
    NotResident,
    /// Resident and tracked in its segment's LRU
    ResidentEvictable,
    /// Resident and pinned; not in any LRU
    ResidentLocked,
}

/// Point-in-time view of one pageable's residency metadata
#[derive(Debug, Clone, Serialize)]
pub struct PageableInfo {
    pub id: PageableId,
    pub segment: MemorySegment,
    pub size_in_bytes: u64,
    pub state: ResidencyState,
    pub lock_count: u32,
    pub last_submission: ExecutionSerial,
    pub in_lru: bool,
}

impl PageableInfo {
    pub fn is_resident(&self) -> bool {
        self.state != ResidencyState::NotResident
    }
}

/// Point-in-time view of one segment's accounting
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SegmentStats {
    pub segment: MemorySegment,
    pub budget: u64,
    pub usage: u64,
    pub external_reservation: u64,
    /// Number of resident, unlocked pageables
    pub evictable_count: usize,
    /// Number of resident, locked pageables
    pub locked_count: usize,
}

impl SegmentStats {
    /// Bytes that can still be made resident without evicting
    pub fn headroom(&self) -> u64 {
        self.budget.saturating_sub(self.usage)
    }

    pub fn is_overcommitted(&self) -> bool {
        self.usage > self.budget
    }
}

/// Snapshot of the whole manager
#[derive(Debug, Clone, Serialize)]
pub struct ResidencyStats {
    pub enabled: bool,
    pub pending_serial: ExecutionSerial,
    pub budget_restricted: bool,
    pub pageable_count: usize,
    pub segments: Vec<SegmentStats>,
}

impl ResidencyStats {
    pub fn segment(&self, segment: MemorySegment) -> Option<&SegmentStats> {
        self.segments.iter().find(|s| s.segment == segment)
    }
}
