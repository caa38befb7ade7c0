//! Repository compaction.
//!
//! A repository whose garbage ratio reaches the configured threshold is
//! rewritten: live records are copied into another repository, their
//! indirection entries repointed, and the old file deleted. Deletion waits
//! for a running backup to finish.

use serde::Serialize;

use nexus_common::config::StorageType;
use nexus_common::error::BlobResult;

use crate::database::Database;
use crate::indirection::BlobLocation;
use crate::record::BlobStatus;
use crate::repository::{RepoHeader, RepoStateGuard, Repository};
use crate::stats::DatabaseStats;

/// What one compaction pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CompactionReport {
    /// Repository files compacted.
    pub repositories: u64,
    /// Live records copied.
    pub records_copied: u64,
    /// Dead or orphaned records dropped.
    pub records_dropped: u64,
    /// Bytes released by deleting compacted files.
    pub bytes_reclaimed: u64,
    /// Repositories skipped because a writer held them.
    pub skipped_busy: u64,
    /// Repositories whose compaction failed.
    pub failed: u64,
}

pub(crate) fn run_pass(db: &Database) -> BlobResult<CompactionReport> {
    let _pass = db.compaction.lock();
    let threshold = u64::from(db.config.garbage_threshold);
    let mut report = CompactionReport::default();

    for repo in db.repositories_snapshot() {
        if repo.is_delete_pending() {
            if !repo.is_backing_up() {
                let size = repo.size();
                db.remove_repository(repo.id())?;
                report.bytes_reclaimed += size;
            }
            continue;
        }
        if repo.garbage() == 0 || repo.garbage_percent() < threshold {
            continue;
        }
        let source = match repo.begin_compact() {
            Ok(guard) => guard,
            Err(e) if e.is_recoverable() => {
                tracing::debug!(repo = %repo.id(), error = %e, "repository busy, compaction deferred");
                report.skipped_busy += 1;
                continue;
            }
            Err(e) => return Err(e),
        };
        if let Err(e) = compact_repository(db, &source, &mut report) {
            tracing::error!(repo = %repo.id(), error = %e, "compaction aborted");
            report.failed += 1;
        }
    }

    if report.repositories > 0 {
        tracing::info!(
            db = %db.id,
            repositories = report.repositories,
            copied = report.records_copied,
            dropped = report.records_dropped,
            reclaimed = report.bytes_reclaimed,
            "compaction pass finished"
        );
    }
    Ok(report)
}

fn compact_repository(db: &Database, source: &RepoStateGuard, report: &mut CompactionReport) -> BlobResult<()> {
    let src: &Repository = source;
    let garbage = src.garbage();
    let mut dest: Option<RepoStateGuard> = None;
    let mut copied = 0u64;
    let mut dropped = 0u64;

    let mut scanner = src.scan()?;
    for scanned in scanner.by_ref() {
        let offset = scanned?.offset;
        let _guard = src.lock_record(offset);
        let mut header = src.read_header(offset)?;
        if !header.status.is_live() {
            dropped += 1;
            continue;
        }

        // Table references whose indirection moved on are dead.
        let mut stale = Vec::new();
        for (index, table_id, blob_id) in header.table_refs() {
            let current = match db.tables.indirection(table_id) {
                Ok(table) => table.points_at(blob_id, src.id(), offset)?,
                Err(e) if e.is_not_found() => false,
                Err(e) => return Err(e),
            };
            if !current {
                stale.push(index);
            }
        }
        for index in stale {
            header.free_table_ref(index);
        }
        if header.table_refs().next().is_none() {
            if header.storage_type == StorageType::Cloud && !src.is_backing_up() {
                let key = db.cloud_key(&header);
                if let Err(e) = db.cloud_store().and_then(|store| store.delete(&key)) {
                    tracing::warn!(key = %key, error = %e, "failed to delete orphaned cloud object");
                }
            }
            dropped += 1;
            continue;
        }

        let record_size = header.record_size();
        let target: &RepoStateGuard = match &mut dest {
            Some(d)
                if d.size() <= RepoHeader::SIZE as u64
                    || d.size() + record_size <= db.config.repository_threshold =>
            {
                d
            }
            slot => slot.insert(db.writable_repo(record_size)?),
        };

        let new_offset = target.append_copy(&header, src, offset, header.head_size())?;
        let location = BlobLocation {
            repo_id: target.id(),
            offset: new_offset,
            head_size: header.head_size() as u16,
            size: header.data_size,
            auth_code: header.auth_code,
        };
        for (_, table_id, blob_id) in header.table_refs() {
            db.tables
                .indirection(table_id)?
                .relocate(blob_id, src.id(), offset, location)?;
        }
        header.status = if src.is_backing_up() {
            BlobStatus::Moved
        } else {
            BlobStatus::Deleted
        };
        src.write_header(offset, &header)?;
        copied += 1;
    }
    if scanner.skipped() > 0 {
        tracing::warn!(repo = %src.id(), skipped = scanner.skipped(), "compaction skipped unreadable bytes");
    }
    drop(dest);

    let size = src.size();
    if src.is_backing_up() {
        src.defer_delete();
    } else {
        db.remove_repository(src.id())?;
        report.bytes_reclaimed += size;
        DatabaseStats::add(&db.stats.bytes_reclaimed, size);
    }
    report.repositories += 1;
    report.records_copied += copied;
    report.records_dropped += dropped;
    DatabaseStats::inc(&db.stats.compactions);
    DatabaseStats::add(&db.stats.records_copied, copied);
    tracing::info!(repo = %src.id(), size, garbage, copied, dropped, "compacted repository");
    Ok(())
}
