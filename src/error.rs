//! Unified error handling for ResidencyForge
//!
//! This module provides the crate-wide error type. Errors are categorised so
//! collaborators can tell runtime conditions apart from collaborator bugs:
//! - User errors (invalid configuration or arguments)
//! - Backend errors (the driver refused to make memory resident)
//! - Internal errors (programming errors, broken invariants, poisoned locks)
//!
//! Soft budget overruns are not errors and never surface here.

use std::fmt;

use crate::driver::DriverError;
use crate::residency::{MemorySegment, PageableId};

/// Unified error type for ResidencyForge
#[derive(Debug, thiserror::Error)]
pub enum ResidencyError {
    // ========== Backend Errors ==========
    /// The make-resident driver call failed after eviction
    #[error("out of memory making {requested_bytes} bytes resident in {segment} segment: {source}")]
    OutOfMemory {
        segment: MemorySegment,
        requested_bytes: u64,
        #[source]
        source: DriverError,
    },

    /// Driver could not be created or initialised
    #[error("driver error: {0}")]
    Driver(#[from] DriverError),

    // ========== Programming Errors ==========
    /// Unlock on a pageable whose lock count is already zero
    #[error("{0} is not locked")]
    NotLocked(PageableId),

    /// Pageable is not tracked by this manager
    #[error("{0} is not registered with this residency manager")]
    UnknownPageable(PageableId),

    /// Resident tracking requested for a pageable that is already resident
    #[error("{0} is already resident")]
    AlreadyResident(PageableId),

    // ========== User Errors ==========
    /// Invalid argument passed by a collaborator
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Invalid manager configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    // ========== Internal Errors ==========
    /// Internal error (indicates a bug)
    #[error("Internal error: {0}")]
    InternalError(String),

    /// Lock poisoned (a thread panicked while holding the residency lock)
    #[error("Internal lock poisoned: {0}")]
    LockPoisoned(String),
}

impl ResidencyError {
    /// Categorize the error for handling decisions
    pub fn category(&self) -> ErrorCategory {
        match self {
            ResidencyError::InvalidRequest(_) | ResidencyError::InvalidConfiguration(_) => {
                ErrorCategory::User
            }

            ResidencyError::OutOfMemory { .. } | ResidencyError::Driver(_) => {
                ErrorCategory::Backend
            }

            ResidencyError::NotLocked(_)
            | ResidencyError::UnknownPageable(_)
            | ResidencyError::AlreadyResident(_)
            | ResidencyError::InternalError(_)
            | ResidencyError::LockPoisoned(_) => ErrorCategory::Internal,
        }
    }

    /// Check if this error is recoverable
    ///
    /// An out-of-memory failure is final for the attempt that hit it, but the
    /// caller may release memory and try again.
    pub fn is_recoverable(&self) -> bool {
        matches!(self.category(), ErrorCategory::Backend)
    }

    /// Check if this is a user-facing error (invalid input or configuration)
    pub fn is_user_error(&self) -> bool {
        matches!(self.category(), ErrorCategory::User)
    }

    /// Check if this is an internal error (indicates a bug in a collaborator
    /// or in the manager itself)
    pub fn is_internal_error(&self) -> bool {
        matches!(self.category(), ErrorCategory::Internal)
    }

    /// Check if this is the out-of-memory condition from a make-resident call
    pub fn is_out_of_memory(&self) -> bool {
        matches!(self, ResidencyError::OutOfMemory { .. })
    }
}

/// Error category for handling decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Invalid input or configuration
    User,
    /// Internal error - indicates a bug
    Internal,
    /// Driver/OS failure
    Backend,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::User => write!(f, "User"),
            ErrorCategory::Internal => write!(f, "Internal"),
            ErrorCategory::Backend => write!(f, "Backend"),
        }
    }
}

impl<T> From<std::sync::PoisonError<T>> for ResidencyError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        ResidencyError::LockPoisoned(err.to_string())
    }
}

/// Result type using ResidencyError
pub type ResidencyResult<T> = std::result::Result<T, ResidencyError>;

/// Create an internal error with context
///
/// # Examples
/// ```ignore
/// return Err(internal_error!("LRU entry {} has no metadata", id));
/// ```
#[macro_export]
macro_rules! internal_error {
    ($msg:expr) => {
        $crate::error::ResidencyError::InternalError($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::ResidencyError::InternalError(format!($fmt, $($arg)*))
    };
}

/// Create a configuration error with context
#[macro_export]
macro_rules! config_error {
    ($msg:expr) => {
        $crate::error::ResidencyError::InvalidConfiguration($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::ResidencyError::InvalidConfiguration(format!($fmt, $($arg)*))
    };
}
