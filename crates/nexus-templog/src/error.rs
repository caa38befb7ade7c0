//! Temp log error types.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

use nexus_common::BlobError;

use crate::record::LogPosition;

/// Result type for temp log operations.
pub type TempLogResult<T> = Result<T, TempLogError>;

/// Errors that can occur during temp log operations.
#[derive(Debug, Error)]
pub enum TempLogError {
    /// I/O error during temp log operations.
    #[error("temp log I/O error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },

    /// Temp log directory does not exist.
    #[error("temp log directory does not exist: {path}")]
    DirectoryNotFound { path: PathBuf },

    /// Segment file is corrupted.
    #[error("temp log segment {log_id} corrupted: {reason}")]
    SegmentCorrupted { log_id: u32, reason: String },

    /// Invalid segment magic number.
    #[error("invalid temp log magic: expected {expected:#010x}, found {found:#010x}")]
    InvalidMagic { expected: u32, found: u32 },

    /// Unsupported segment version.
    #[error("unsupported temp log version: expected {expected}, found {found}")]
    UnsupportedVersion { expected: u16, found: u16 },

    /// Record checksum mismatch.
    #[error("temp log record checksum mismatch at {position}: expected {expected:#010x}, computed {computed:#010x}")]
    ChecksumMismatch {
        position: LogPosition,
        expected: u32,
        computed: u32,
    },

    /// Segment not found.
    #[error("temp log segment not found: {log_id}")]
    SegmentNotFound { log_id: u32 },

    /// The active segment cannot be removed.
    #[error("temp log segment {log_id} is still active")]
    SegmentActive { log_id: u32 },

    /// Temp log is closed.
    #[error("temp log is closed")]
    Closed,

    /// Record deserialization error.
    #[error("failed to deserialize temp log record: {reason}")]
    DeserializationError { reason: String },

    /// Configuration error.
    #[error("temp log configuration error: {reason}")]
    ConfigError { reason: String },
}

impl TempLogError {
    /// Creates a segment corrupted error.
    pub fn segment_corrupted(log_id: u32, reason: impl Into<String>) -> Self {
        Self::SegmentCorrupted {
            log_id,
            reason: reason.into(),
        }
    }

    /// Creates a deserialization error.
    pub fn deserialization_error(reason: impl Into<String>) -> Self {
        Self::DeserializationError {
            reason: reason.into(),
        }
    }

    /// Creates a config error.
    pub fn config_error(reason: impl Into<String>) -> Self {
        Self::ConfigError {
            reason: reason.into(),
        }
    }

    /// Returns true if this is a corruption error.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            Self::SegmentCorrupted { .. }
                | Self::ChecksumMismatch { .. }
                | Self::InvalidMagic { .. }
                | Self::DeserializationError { .. }
        )
    }
}

impl From<TempLogError> for BlobError {
    fn from(err: TempLogError) -> Self {
        match err {
            TempLogError::Io { source } => BlobError::Io { source },
            TempLogError::Closed => BlobError::Closed,
            TempLogError::SegmentNotFound { log_id } => {
                BlobError::not_found(format!("temp log segment {log_id}"))
            }
            TempLogError::SegmentActive { log_id } => {
                BlobError::busy(format!("temp log segment {log_id} is active"))
            }
            TempLogError::ConfigError { reason } => BlobError::config(reason),
            TempLogError::UnsupportedVersion { .. } => BlobError::protocol_mismatch(err.to_string()),
            other => BlobError::corruption(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let err = TempLogError::segment_corrupted(3, "short header");
        assert!(err.is_corruption());
        assert!(!TempLogError::Closed.is_corruption());
    }

    #[test]
    fn test_into_blob_error() {
        let err: BlobError = TempLogError::SegmentNotFound { log_id: 4 }.into();
        assert!(err.is_not_found());

        let err: BlobError = TempLogError::InvalidMagic {
            expected: 1,
            found: 2,
        }
        .into();
        assert!(err.is_corruption());

        let io_err = io::Error::new(io::ErrorKind::Other, "disk");
        let err: BlobError = TempLogError::from(io_err).into();
        assert!(matches!(err, BlobError::Io { .. }));
    }
}
