//! Type definitions for the BLOB engine.
//!
//! This module contains the identifiers, handles and timestamps shared by
//! every crate in the workspace.

mod handle;
mod ids;
mod timestamps;

pub use handle::BlobHandle;
pub use ids::{AuthCode, BackupId, BlobId, DatabaseId, RefId, RepoId, TableId};
pub use timestamps::Timestamp;
