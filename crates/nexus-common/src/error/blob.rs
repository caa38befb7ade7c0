//! BLOB engine error types.
//!
//! Every fallible engine operation returns [`BlobError`]. Each variant maps
//! to a stable [`ErrorCode`] for programmatic handling.

use std::fmt;
use std::io;
use thiserror::Error;

/// Error codes for categorizing errors.
///
/// These codes are stable across versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ErrorCode {
    // General errors (0x0000 - 0x00FF)
    /// Unknown or unspecified error.
    Unknown = 0x0000,
    /// Invalid argument provided.
    InvalidArgument = 0x0003,
    /// Component has been shut down.
    Closed = 0x0006,
    /// Configuration rejected.
    Config = 0x0007,

    // I/O errors (0x0100 - 0x01FF)
    /// General I/O error.
    Io = 0x0100,
    /// Data corruption detected.
    Corruption = 0x0104,
    /// Encoding or decoding of metadata failed.
    Serialization = 0x0105,

    // Repository errors (0x0200 - 0x02FF)
    /// Unknown table, BLOB, repository or slot.
    NotFound = 0x0200,
    /// Id or name already registered.
    Duplicate = 0x0201,
    /// Lock-state conflict.
    Busy = 0x0202,

    // Backup errors (0x0300 - 0x03FF)
    /// Backup or restore format mismatch.
    ProtocolMismatch = 0x0300,

    // Cloud errors (0x0400 - 0x04FF)
    /// Object store request failed.
    Cloud = 0x0400,
}

impl ErrorCode {
    /// Returns the numeric code.
    #[inline]
    #[must_use]
    pub const fn as_u16(self) -> u16 {
        self as u16
    }

    /// Returns the error category name.
    #[must_use]
    pub const fn category(&self) -> &'static str {
        match (*self as u16) >> 8 {
            0x00 => "General",
            0x01 => "I/O",
            0x02 => "Repository",
            0x03 => "Backup",
            0x04 => "Cloud",
            _ => "Unknown",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// The error type of the BLOB engine.
///
/// # Example
///
/// ```rust
/// use nexus_common::error::{BlobError, BlobResult, ErrorCode};
///
/// fn lookup() -> BlobResult<()> {
///     Err(BlobError::not_found("blob 7 in table 3"))
/// }
///
/// assert_eq!(lookup().unwrap_err().code(), ErrorCode::NotFound);
/// ```
#[derive(Debug, Error)]
pub enum BlobError {
    /// Unknown table, BLOB, repository or slot.
    #[error("not found: {what}")]
    NotFound {
        /// What was looked up.
        what: String,
    },

    /// A header failed structural validation.
    #[error("data corruption detected: {reason}")]
    Corruption {
        /// Description of the corruption.
        reason: String,
    },

    /// An id or name is already registered.
    #[error("already exists: {what}")]
    Duplicate {
        /// What was registered twice.
        what: String,
    },

    /// A lock-state conflict, e.g. compacting while writing.
    #[error("resource busy: {reason}")]
    Busy {
        /// Why the resource is unavailable.
        reason: String,
    },

    /// I/O error from the underlying system.
    #[error("I/O error: {source}")]
    Io {
        /// The underlying I/O error.
        #[from]
        source: io::Error,
    },

    /// Backup or restore version or format id mismatch.
    #[error("protocol mismatch: {reason}")]
    ProtocolMismatch {
        /// Description of the mismatch.
        reason: String,
    },

    /// Invalid argument provided.
    #[error("invalid argument: {reason}")]
    InvalidArgument {
        /// Error message.
        reason: String,
    },

    /// Configuration rejected.
    #[error("configuration error: {reason}")]
    Config {
        /// Error message.
        reason: String,
    },

    /// Object store request failed.
    #[error("cloud storage error: {reason}")]
    Cloud {
        /// Error message.
        reason: String,
    },

    /// Metadata encoding or decoding failed.
    #[error("serialization error: {reason}")]
    Serialization {
        /// Error message.
        reason: String,
    },

    /// The database or engine has been shut down.
    #[error("engine is closed")]
    Closed,
}

impl BlobError {
    /// Creates a not-found error.
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    /// Creates a corruption error.
    pub fn corruption(reason: impl Into<String>) -> Self {
        Self::Corruption {
            reason: reason.into(),
        }
    }

    /// Creates a duplicate error.
    pub fn duplicate(what: impl Into<String>) -> Self {
        Self::Duplicate { what: what.into() }
    }

    /// Creates a busy error.
    pub fn busy(reason: impl Into<String>) -> Self {
        Self::Busy {
            reason: reason.into(),
        }
    }

    /// Creates a protocol mismatch error.
    pub fn protocol_mismatch(reason: impl Into<String>) -> Self {
        Self::ProtocolMismatch {
            reason: reason.into(),
        }
    }

    /// Creates an invalid argument error.
    pub fn invalid_argument(reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            reason: reason.into(),
        }
    }

    /// Creates a configuration error.
    pub fn config(reason: impl Into<String>) -> Self {
        Self::Config {
            reason: reason.into(),
        }
    }

    /// Creates a cloud error.
    pub fn cloud(reason: impl Into<String>) -> Self {
        Self::Cloud {
            reason: reason.into(),
        }
    }

    /// Creates a serialization error.
    pub fn serialization(reason: impl Into<String>) -> Self {
        Self::Serialization {
            reason: reason.into(),
        }
    }

    /// Returns the stable error code.
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::NotFound { .. } => ErrorCode::NotFound,
            Self::Corruption { .. } => ErrorCode::Corruption,
            Self::Duplicate { .. } => ErrorCode::Duplicate,
            Self::Busy { .. } => ErrorCode::Busy,
            Self::Io { .. } => ErrorCode::Io,
            Self::ProtocolMismatch { .. } => ErrorCode::ProtocolMismatch,
            Self::InvalidArgument { .. } => ErrorCode::InvalidArgument,
            Self::Config { .. } => ErrorCode::Config,
            Self::Cloud { .. } => ErrorCode::Cloud,
            Self::Serialization { .. } => ErrorCode::Serialization,
            Self::Closed => ErrorCode::Closed,
        }
    }

    /// Returns true for expected conditions the caller can act on.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::NotFound { .. } | Self::Duplicate { .. } | Self::Busy { .. }
        )
    }

    /// Returns true if this is a corruption error.
    #[must_use]
    pub fn is_corruption(&self) -> bool {
        matches!(self, Self::Corruption { .. })
    }

    /// Returns true if this is a not-found error.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(BlobError::not_found("blob").is_recoverable());
        assert!(BlobError::duplicate("alias").is_recoverable());
        assert!(BlobError::busy("compacting").is_recoverable());
        assert!(!BlobError::corruption("bad magic").is_recoverable());
        assert!(BlobError::corruption("bad magic").is_corruption());
        assert!(!BlobError::protocol_mismatch("v2").is_recoverable());
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(BlobError::busy("x").code(), ErrorCode::Busy);
        assert_eq!(ErrorCode::Busy.category(), "Repository");
        assert_eq!(ErrorCode::ProtocolMismatch.category(), "Backup");
        assert_eq!(ErrorCode::Io.as_u16(), 0x0100);
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let err: BlobError = io_err.into();
        assert!(matches!(err, BlobError::Io { .. }));
        assert_eq!(err.code(), ErrorCode::Io);
    }

    #[test]
    fn test_error_display() {
        let err = BlobError::not_found("blob 7 in table 3");
        assert_eq!(err.to_string(), "not found: blob 7 in table 3");
    }
}
