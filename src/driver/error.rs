//! Driver error types

use thiserror::Error;

/// Errors reported by a residency driver
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DriverError {
    #[error("Driver initialization failed: {0}")]
    InitializationFailed(String),
    #[error("Device not found")]
    DeviceNotFound,
    #[error("Budget query failed: {0}")]
    BudgetQueryFailed(String),
    #[error("Make resident failed: {0}")]
    MakeResidentFailed(String),
    #[error("Evict failed: {0}")]
    EvictFailed(String),
}

/// Driver result type
pub type DriverResult<T> = Result<T, DriverError>;
