//! Database statistics and introspection records.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use nexus_common::config::StorageType;
use nexus_common::types::{BlobId, RefId, RepoId, TableId, Timestamp};

use crate::record::BlobStatus;
use crate::repository::RepoLockState;

/// Running counters of one database.
#[derive(Debug, Default)]
pub struct DatabaseStats {
    /// BLOBs created.
    pub blobs_created: AtomicU64,
    /// Payload bytes written by creates.
    pub bytes_written: AtomicU64,
    /// BLOB reads served.
    pub blobs_read: AtomicU64,
    /// Payload bytes returned by reads.
    pub bytes_read: AtomicU64,
    /// References added.
    pub references_added: AtomicU64,
    /// References removed.
    pub references_removed: AtomicU64,
    /// Transactions committed.
    pub commits: AtomicU64,
    /// Transactions rolled back.
    pub rollbacks: AtomicU64,
    /// Records moved because their header outgrew its space.
    pub relocations: AtomicU64,
    /// BLOBs reclaimed by the deferred-action processor.
    pub blobs_deleted: AtomicU64,
    /// Deferred actions applied.
    pub actions_applied: AtomicU64,
    /// Deferred actions that no longer matched their BLOB.
    pub actions_skipped: AtomicU64,
    /// Repository files compacted.
    pub compactions: AtomicU64,
    /// Records copied by the compactor.
    pub records_copied: AtomicU64,
    /// Bytes released by deleting compacted files.
    pub bytes_reclaimed: AtomicU64,
}

impl DatabaseStats {
    pub(crate) fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Point-in-time copy of [`DatabaseStats`] plus storage totals.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DatabaseStatsSnapshot {
    pub blobs_created: u64,
    pub bytes_written: u64,
    pub blobs_read: u64,
    pub bytes_read: u64,
    pub references_added: u64,
    pub references_removed: u64,
    pub commits: u64,
    pub rollbacks: u64,
    pub relocations: u64,
    pub blobs_deleted: u64,
    pub actions_applied: u64,
    pub actions_skipped: u64,
    pub compactions: u64,
    pub records_copied: u64,
    pub bytes_reclaimed: u64,
    /// Repository files.
    pub repositories: u64,
    /// Sum of repository sizes.
    pub repository_bytes: u64,
    /// Sum of repository garbage counters.
    pub garbage_bytes: u64,
    /// Temp log segments on disk.
    pub temp_log_segments: u64,
    /// Entries in the alias index.
    pub aliases: u64,
}

impl DatabaseStats {
    pub(crate) fn snapshot(&self) -> DatabaseStatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        DatabaseStatsSnapshot {
            blobs_created: load(&self.blobs_created),
            bytes_written: load(&self.bytes_written),
            blobs_read: load(&self.blobs_read),
            bytes_read: load(&self.bytes_read),
            references_added: load(&self.references_added),
            references_removed: load(&self.references_removed),
            commits: load(&self.commits),
            rollbacks: load(&self.rollbacks),
            relocations: load(&self.relocations),
            blobs_deleted: load(&self.blobs_deleted),
            actions_applied: load(&self.actions_applied),
            actions_skipped: load(&self.actions_skipped),
            compactions: load(&self.compactions),
            records_copied: load(&self.records_copied),
            bytes_reclaimed: load(&self.bytes_reclaimed),
            ..DatabaseStatsSnapshot::default()
        }
    }
}

/// One repository file as seen by [`Database::repositories`](crate::Database::repositories).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RepositoryInfo {
    pub id: RepoId,
    pub size: u64,
    pub garbage: u64,
    pub garbage_percent: u64,
    #[serde(serialize_with = "serialize_display")]
    pub lock_state: RepoLockState,
    pub delete_pending: bool,
}

/// State of one BLOB.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlobInfo {
    #[serde(serialize_with = "serialize_debug")]
    pub status: BlobStatus,
    pub storage_type: StorageType,
    pub repo_id: RepoId,
    pub offset: u64,
    pub head_size: usize,
    pub data_size: u64,
    pub committed_refs: usize,
    pub pending_refs: usize,
    pub deletion_pending: bool,
    pub create_time: Timestamp,
    pub mod_time: Timestamp,
    pub last_access: Timestamp,
    pub access_count: u32,
    pub alias: Option<String>,
    /// Hex MD5 of the payload.
    pub checksum: String,
}

/// One row-level reference to a BLOB.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReferenceInfo {
    pub table_id: TableId,
    /// The BLOB's id within `table_id`.
    pub blob_id: BlobId,
    pub column: u16,
    pub ref_id: u64,
    pub committed: bool,
}

impl ReferenceInfo {
    pub(crate) fn new(table_id: TableId, blob_id: BlobId, column: u16, ref_id: RefId) -> Self {
        Self {
            table_id,
            blob_id,
            column,
            ref_id: ref_id.id(),
            committed: !ref_id.is_uncommitted(),
        }
    }
}

fn serialize_display<T: std::fmt::Display, S: serde::Serializer>(
    value: &T,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.collect_str(value)
}

fn serialize_debug<T: std::fmt::Debug, S: serde::Serializer>(
    value: &T,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&format!("{value:?}"))
}

pub(crate) fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
