//! # nexus-common
//!
//! Common types, errors, and configuration for the Nexus BLOB engine.
//!
//! This crate provides the foundational types shared by the temp log, the
//! engine and the admin CLI. It includes:
//!
//! - **Types**: identifiers (`TableId`, `BlobId`, `RefId`, ...), `BlobHandle`, `Timestamp`
//! - **Errors**: unified error handling with `BlobError`
//! - **Config**: `EngineConfig` and its cloud section
//! - **Constants**: on-disk magics, versions and defaults
//!
//! ## Example
//!
//! ```rust
//! use nexus_common::types::{BlobHandle, TableId};
//! use nexus_common::error::BlobResult;
//!
//! fn example() -> BlobResult<()> {
//!     let handle: BlobHandle = "~*1~3-7-beef-11".parse()?;
//!     assert_eq!(handle.table_id, TableId::new(3));
//!     Ok(())
//! }
//! # example().unwrap();
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod constants;
pub mod error;
pub mod types;

// Re-export commonly used items at the crate root
pub use config::{CloudConfig, EngineConfig, StorageType};
pub use error::{BlobError, BlobResult, ErrorCode};
pub use types::{
    AuthCode, BackupId, BlobHandle, BlobId, DatabaseId, RefId, RepoId, TableId, Timestamp,
};
