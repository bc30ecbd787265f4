//! GPU memory residency management
//!
//! Keeps the memory a device workload touches resident while staying inside
//! the OS-granted budget of each memory segment:
//! - [`ResidencyManager`] owns per-segment budgets and LRUs and decides what
//!   to evict
//! - [`Pageable`] is the handle for one heap or directly allocated resource
//! - [`ResidencyConfig`] selects budget derivation and test restrictions
//!
//! A typical frame calls `ensure_heaps_are_resident` with every heap the
//! next command batch references, submits, then `advance_pending_serial`.

mod config;
mod manager;
mod pageable;
mod segment;
mod types;

pub use config::{
    ResidencyConfig, BUDGET_CAP_RATIO_ENV, RESIDENCY_ENABLED_ENV, RESTRICT_BUDGET_ENV, UMA_ENV,
};
pub use manager::{ResidencyLockGuard, ResidencyManager};
pub use pageable::Pageable;
pub use types::{
    ExecutionSerial, MemorySegment, NativeHandle, PageableId, PageableInfo, ResidencyState,
    ResidencyStats, SegmentStats,
};
