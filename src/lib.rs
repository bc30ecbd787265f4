//! ResidencyForge - GPU memory residency manager
//!
//! Tracks which GPU heaps are resident in device-local or system memory,
//! evicts least-recently-used heaps to stay within the OS-granted budget,
//! and pins heaps that must never be evicted.

pub mod driver;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod residency;

pub use driver::{DriverError, DriverPageable, FakeDriver, ResidencyDriver};
pub use error::{ErrorCategory, ResidencyError, ResidencyResult};
pub use metrics::ResidencyMetrics;
pub use residency::{
    MemorySegment, NativeHandle, Pageable, PageableId, ResidencyConfig, ResidencyManager,
};
