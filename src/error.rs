//! Error types for the stepgc runtime.

use std::fmt;

/// Errors surfaced by allocation and handle operations.
///
/// Collector-internal invariant violations (registry index desync,
/// overlapping payload ranges, offset-table corruption) are debug
/// assertions rather than error values; they indicate memory corruption
/// and are not recoverable.
///
/// # Examples
///
/// ```
/// use stepgc::{GcError, GcResult};
///
/// let failure: GcResult<u32> = Err(GcError::OutOfMemory);
/// assert!(failure.is_err());
/// assert_eq!(GcError::OutOfMemory.to_string(), "Out of memory");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GcError {
    /// Allocation of a meta + payload block failed.
    OutOfMemory,
    /// An address did not resolve to a managed allocation.
    InvalidReference,
}

impl fmt::Display for GcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GcError::OutOfMemory => write!(f, "Out of memory"),
            GcError::InvalidReference => write!(f, "Invalid object reference"),
        }
    }
}

impl std::error::Error for GcError {}

/// Result type for GC operations.
pub type GcResult<T> = Result<T, GcError>;
