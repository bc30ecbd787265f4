//! Driver/OS interop seam
//!
//! The residency manager never talks to the graphics driver directly. It
//! queries budgets and issues batched evict/make-resident calls through
//! [`ResidencyDriver`], which keeps the eviction engine testable against the
//! deterministic [`FakeDriver`].
//!
//! Resident memory may silently decay between command batches on real
//! drivers, so callers re-ensure residency for every submission instead of
//! once per heap.

mod error;
mod fake;
#[cfg(feature = "rocm")]
mod ffi;
#[cfg(feature = "rocm")]
mod hip;

pub use error::{DriverError, DriverResult};
pub use fake::{DriverCall, FakeDriver};
#[cfg(feature = "rocm")]
pub use hip::HipDriver;

use crate::residency::{MemorySegment, NativeHandle};

/// What the driver needs to know about one pageable in a batched call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriverPageable {
    pub handle: NativeHandle,
    pub segment: MemorySegment,
    pub size_in_bytes: u64,
}

/// Budget queries and residency syscalls for one adapter
///
/// Every call is made while the manager's residency lock is held, so
/// implementations observe calls in the same order the manager decided them.
pub trait ResidencyDriver: Send + Sync {
    /// Current OS budget for the process in `segment`, in bytes
    ///
    /// The budget can shrink at any time under system memory pressure.
    fn query_segment_budget(&self, segment: MemorySegment) -> DriverResult<u64>;

    /// Make every pageable in the batch resident
    ///
    /// A failure means the memory could not be committed even after the
    /// manager evicted what it could.
    fn make_resident(&self, pageables: &[DriverPageable]) -> DriverResult<()>;

    /// Evict every pageable in the batch
    fn evict(&self, pageables: &[DriverPageable]) -> DriverResult<()>;
}
