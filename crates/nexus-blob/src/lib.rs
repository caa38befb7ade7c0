//! # nexus-blob
//!
//! Embedded BLOB repository engine.
//!
//! BLOBs are stored as records in append-only repository files. A host
//! database refers to them through [`BlobHandle`]s resolved by per-table
//! indirection files, and records which rows reference each BLOB through
//! reference slots in the record header. Destructive changes are logged to
//! the temp log first and applied after a grace period.
//!
//! # Architecture
//!
//! ```text
//! BlobEngine
//!   └─ Database ─────────────┬──────────────┬───────────────┐
//!        │ lifecycle / txn   │ deferred     │ compactor     │ backup
//!        ▼                   ▼              ▼               ▼
//!   TableDirectory ──► TableIndirection ──► Repository ◄── CloudStore
//!                                             (records)     (payloads)
//!   TempLog (nexus-templog) ◄── every create, release and table drop
//! ```
//!
//! # Example
//!
//! ```no_run
//! use nexus_blob::{BlobEngine, Metadata};
//! use nexus_common::config::EngineConfig;
//! use nexus_common::types::RefId;
//!
//! # fn main() -> nexus_common::error::BlobResult<()> {
//! let engine = BlobEngine::init(EngineConfig::new("./data/blobs"))?;
//! let db = engine.database("shop")?;
//! let items = db.table_or_create("items")?;
//!
//! let temp = db.create_blob(items, b"hello", Metadata::new().with_alias("greeting")?)?;
//! let mut txn = db.begin();
//! let handle = txn.reference(&temp, items, 2, RefId::new(1))?;
//! txn.commit()?;
//!
//! assert_eq!(&db.read_by_alias("greeting")?[..], b"hello");
//! db.dereference_blob(&handle, items, RefId::new(1))?;
//! # Ok(())
//! # }
//! ```

#![warn(clippy::all)]

pub mod backup;
pub mod cloud;
mod compactor;
mod database;
mod deferred;
mod engine;
pub mod indirection;
mod lifecycle;
mod meta;
mod reader;
pub mod record;
pub mod repository;
mod stats;
pub mod table;
mod txn;
mod worker;

pub use backup::{BackupDescriptor, BackupState, BackupStatus, DumpManifest, RestoreSummary};
pub use cloud::{CloudKey, CloudStore, FsCloudStore};
pub use compactor::CompactionReport;
pub use database::Database;
pub use engine::BlobEngine;
pub use reader::BlobReader;
pub use record::{BlobStatus, Metadata};
pub use repository::RepoLockState;
pub use stats::{BlobInfo, DatabaseStatsSnapshot, ReferenceInfo, RepositoryInfo};
pub use txn::BlobTxn;

pub use nexus_common::types::BlobHandle;
