//! Error taxonomy shared by every operator in the crate.

use thiserror::Error;

/// Boxed error returned by user-supplied pairwise and reduce functions.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Failures surfaced by the memory-bounded operators.
///
/// Classification:
/// - [`OperatorError::InsufficientMemory`] / [`OperatorError::InvalidConfig`]:
///   raised before any record is processed
/// - [`OperatorError::Allocation`]: the process-wide segment budget ran dry mid-run
/// - [`OperatorError::Io`]: spill file read/write failures, never retried
/// - [`OperatorError::Serialization`]: spill bytes that do not decode, or a record
///   that cannot fit in the buffer meant to hold it
/// - [`OperatorError::UserFunction`]: the user function failed; the source is kept verbatim
///
/// Cancellation is not part of this enum. Operators report it through
/// [`crate::Outcome::Cancelled`].
#[derive(Debug, Error)]
pub enum OperatorError {
    /// The memory grant is too small to hold the minimum sort heap plus I/O buffer.
    #[error("insufficient memory: granted {granted_mb} MB, need more than {required_mb} MB")]
    InsufficientMemory {
        /// Grant handed to the task.
        granted_mb: u64,
        /// Minimum sort heap + minimum I/O buffer.
        required_mb: u64,
    },

    /// Inconsistent task configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The memory allocator could not hand out the requested segments.
    #[error("memory allocation failed: requested {requested} bytes, {available} bytes available")]
    Allocation {
        /// Bytes requested (rounded up to whole segments).
        requested: usize,
        /// Bytes left in the allocator at the time of the request.
        available: usize,
    },

    /// Spill store I/O failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Record encoding/decoding failure.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The user-supplied function failed.
    #[error("user function failed: {0}")]
    UserFunction(#[source] BoxError),
}

impl OperatorError {
    /// Wrap a user function failure.
    pub fn user(err: impl Into<BoxError>) -> Self {
        Self::UserFunction(err.into())
    }
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, OperatorError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_insufficient_memory_message() {
        let err = OperatorError::InsufficientMemory {
            granted_mb: 5,
            required_mb: 5,
        };
        let msg = err.to_string();
        assert!(msg.contains("granted 5 MB"));
    }

    #[test]
    fn test_user_function_keeps_source() {
        let err = OperatorError::user("boom");
        assert_eq!(err.source().map(|s| s.to_string()), Some("boom".to_string()));
    }

    #[test]
    fn test_io_error_converts() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk gone");
        let err: OperatorError = io.into();
        assert!(matches!(err, OperatorError::Io(_)));
    }
}
