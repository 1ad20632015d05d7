//! Error types and result codes for Crystal
//!
//! Every fallible operation in the engine reports a [`CrystalError`]. Each error
//! maps onto exactly one [`ResultCode`], which is what RPC and CLI callers see.
//! We use `thiserror` for automatic `Display` and `Error` trait implementations.

use serde::{Deserialize, Serialize};
use std::io;
use thiserror::Error;

/// Result type alias for Crystal operations
pub type CrystalResult<T> = std::result::Result<T, CrystalError>;

/// Enumerated outcome of an engine operation
///
/// `Success` is never carried by a [`CrystalError`]; it is what an `Ok` maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResultCode {
    /// Operation completed
    Success,
    /// Component has not been prepared/started yet
    NotStarted,
    /// Underlying I/O failed
    FileError,
    /// Stored bytes failed to decode
    DeserializeError,
    /// Payload exceeds a hard size limit
    OverSizeLimit,
    /// Caller's wait elapsed before the operation completed
    Timeout,
    /// Target node or data unit has been deleted
    Removed,
    /// Nothing stored under the requested handle
    NoData,
    /// Stored object has a different type than requested
    InvalidCast,
    /// Caller violated an API contract
    InvalidArgument,
}

impl ResultCode {
    /// Whether the operation may succeed if retried later
    pub fn is_retryable(&self) -> bool {
        matches!(self, ResultCode::FileError | ResultCode::Timeout)
    }
}

/// Error type shared by every Crystal layer
///
/// Errors are `Clone` so that one filer outcome can be handed to every caller
/// waiting on a coalesced job.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CrystalError {
    /// Component used before `prepare`/`start`
    #[error("Component not started")]
    NotStarted,

    /// I/O failure (message preserved from the source error)
    #[error("I/O error: {0}")]
    FileError(String),

    /// Decoding of stored bytes failed
    #[error("Deserialize error: {0}")]
    DeserializeError(String),

    /// Payload larger than the enforced limit
    #[error("Payload of {size} bytes exceeds limit of {limit} bytes")]
    OverSizeLimit {
        /// Offending size
        size: usize,
        /// Enforced limit
        limit: usize,
    },

    /// The caller stopped waiting; the operation itself may still complete
    #[error("Timed out waiting for operation")]
    Timeout,

    /// Node or data unit was deleted
    #[error("Target has been removed")]
    Removed,

    /// No content under the requested handle
    #[error("No data")]
    NoData,

    /// Type mismatch between stored and requested object
    #[error("Invalid cast: expected {expected}, found {found}")]
    InvalidCast {
        /// Requested type name
        expected: String,
        /// Registered or resident type name
        found: String,
    },

    /// API contract violation
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl CrystalError {
    /// The result code reported to external callers
    pub fn code(&self) -> ResultCode {
        match self {
            CrystalError::NotStarted => ResultCode::NotStarted,
            CrystalError::FileError(_) => ResultCode::FileError,
            CrystalError::DeserializeError(_) => ResultCode::DeserializeError,
            CrystalError::OverSizeLimit { .. } => ResultCode::OverSizeLimit,
            CrystalError::Timeout => ResultCode::Timeout,
            CrystalError::Removed => ResultCode::Removed,
            CrystalError::NoData => ResultCode::NoData,
            CrystalError::InvalidCast { .. } => ResultCode::InvalidCast,
            CrystalError::InvalidArgument(_) => ResultCode::InvalidArgument,
        }
    }

    /// Convenience constructor for decode failures
    pub fn deserialize(msg: impl Into<String>) -> Self {
        CrystalError::DeserializeError(msg.into())
    }

    /// Convenience constructor for contract violations
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        CrystalError::InvalidArgument(msg.into())
    }
}

impl From<io::Error> for CrystalError {
    fn from(e: io::Error) -> Self {
        CrystalError::FileError(e.to_string())
    }
}

/// Map a result onto its external result code
pub fn result_code<T>(result: &CrystalResult<T>) -> ResultCode {
    match result {
        Ok(_) => ResultCode::Success,
        Err(e) => e.code(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_io() {
        let err: CrystalError = io::Error::new(io::ErrorKind::NotFound, "file not found").into();
        assert!(err.to_string().contains("I/O error"));
        assert_eq!(err.code(), ResultCode::FileError);
    }

    #[test]
    fn test_error_display_oversize() {
        let err = CrystalError::OverSizeLimit {
            size: 16385,
            limit: 16384,
        };
        let msg = err.to_string();
        assert!(msg.contains("16385"));
        assert!(msg.contains("16384"));
    }

    #[test]
    fn test_every_variant_has_distinct_code() {
        let errors = vec![
            CrystalError::NotStarted,
            CrystalError::FileError("x".into()),
            CrystalError::deserialize("x"),
            CrystalError::OverSizeLimit { size: 2, limit: 1 },
            CrystalError::Timeout,
            CrystalError::Removed,
            CrystalError::NoData,
            CrystalError::InvalidCast {
                expected: "a".into(),
                found: "b".into(),
            },
            CrystalError::invalid_argument("x"),
        ];
        let mut codes: Vec<ResultCode> = errors.iter().map(|e| e.code()).collect();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
        assert!(!codes.contains(&ResultCode::Success));
    }

    #[test]
    fn test_result_code_of_ok() {
        let ok: CrystalResult<u8> = Ok(1);
        assert_eq!(result_code(&ok), ResultCode::Success);
        let err: CrystalResult<u8> = Err(CrystalError::Timeout);
        assert_eq!(result_code(&err), ResultCode::Timeout);
    }

    #[test]
    fn test_retryable_codes() {
        assert!(ResultCode::FileError.is_retryable());
        assert!(ResultCode::Timeout.is_retryable());
        assert!(!ResultCode::Removed.is_retryable());
        assert!(!ResultCode::InvalidCast.is_retryable());
    }
}
