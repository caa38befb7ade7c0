//! Error handling for the BLOB engine.
//!
//! This module provides the error type and result alias used across the
//! engine crates.

mod blob;

pub use blob::{BlobError, ErrorCode};

/// Result type alias for BLOB engine operations.
pub type BlobResult<T> = std::result::Result<T, BlobError>;
