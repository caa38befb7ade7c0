//! Restoring a dump into a fresh database.

use std::collections::HashSet;
use std::io::Read;
use std::path::Path;
use std::sync::atomic::Ordering;

use bytes::Buf;
use serde::Serialize;

use nexus_common::config::StorageType;
use nexus_common::error::{BlobError, BlobResult};
use nexus_common::types::{BackupId, BlobHandle, DatabaseId, TableId};

use super::dump::{DumpManifest, DumpReader, FrameKind};
use crate::cloud::CloudKey;
use crate::database::Database;
use crate::indirection::BlobLocation;
use crate::record::{BlobHeader, BlobStatus, MIN_HEAD_SIZE};

/// What a restore did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RestoreSummary {
    /// Name of the restored database.
    pub database: String,
    /// Id of the restored database.
    pub db_id: DatabaseId,
    /// Id of the database the dump was taken from.
    pub source_db: DatabaseId,
    /// Backup the dump belongs to.
    pub backup_id: BackupId,
    /// Tables recreated.
    pub tables_restored: usize,
    /// Tables left out because their format is not supported.
    pub tables_skipped: usize,
    /// Records written.
    pub blobs_restored: u64,
    /// Records dropped because none of their tables was restored.
    pub blobs_skipped: u64,
}

/// Replays the dump at `path` into `db`, which must be empty.
pub(crate) fn restore_into(db: &Database, path: &Path) -> BlobResult<RestoreSummary> {
    let _workers = db.suspend_workers();
    let file = std::fs::File::open(path)?;
    let mut reader = DumpReader::new(std::io::BufReader::new(file));

    let manifest = match reader.next_head()? {
        Some(head) if head.kind == FrameKind::Manifest => DumpManifest::decode(&reader.read_body(&head)?)?,
        _ => return Err(BlobError::corruption("dump does not start with a manifest")),
    };
    tracing::info!(
        db = %db.id(),
        source = %manifest.source_db,
        backup = %manifest.backup_id,
        tables = manifest.tables.len(),
        "restoring dump"
    );

    let mut summary = RestoreSummary {
        database: db.name().to_string(),
        db_id: db.id(),
        source_db: manifest.source_db,
        backup_id: manifest.backup_id,
        tables_restored: 0,
        tables_skipped: 0,
        blobs_restored: 0,
        blobs_skipped: 0,
    };

    let mut restored = HashSet::new();
    for entry in &manifest.tables {
        match db.tables.restore_table(entry) {
            Ok(_) => {
                restored.insert(entry.id);
                summary.tables_restored += 1;
            }
            Err(e @ BlobError::ProtocolMismatch { .. }) => {
                tracing::error!(table = %entry.name, error = %e, "table not restored");
                summary.tables_skipped += 1;
            }
            Err(e) => return Err(e),
        }
    }

    let mut expected = None;
    while let Some(head) = reader.next_head()? {
        match head.kind {
            FrameKind::Blob => {
                let mut body = reader.body(&head);
                if restore_blob(db, &manifest, &restored, &mut body, head.len)? {
                    summary.blobs_restored += 1;
                } else {
                    summary.blobs_skipped += 1;
                }
                body.verify()?;
            }
            FrameKind::End => {
                let body = reader.read_body(&head)?;
                if body.len() != 8 {
                    return Err(BlobError::corruption("malformed dump end frame"));
                }
                expected = Some((&body[..]).get_u64());
                break;
            }
            FrameKind::Manifest => {
                return Err(BlobError::corruption("unexpected manifest frame in dump"));
            }
        }
    }

    let Some(expected) = expected else {
        return Err(BlobError::corruption("dump is truncated"));
    };
    let seen = summary.blobs_restored + summary.blobs_skipped;
    if seen != expected {
        return Err(BlobError::corruption(format!(
            "dump holds {seen} records, end frame says {expected}"
        )));
    }
    db.sync()?;
    tracing::info!(
        db = %db.id(),
        blobs = summary.blobs_restored,
        skipped = summary.blobs_skipped,
        "restore finished"
    );
    Ok(summary)
}

/// Restores one record from a blob frame. Returns false if no table it
/// belongs to was restored.
fn restore_blob(
    db: &Database,
    manifest: &DumpManifest,
    restored: &HashSet<TableId>,
    body: &mut dyn Read,
    frame_len: u32,
) -> BlobResult<bool> {
    let mut head = vec![0u8; MIN_HEAD_SIZE];
    body.read_exact(&mut head)?;
    let fixed = BlobHeader::peek_fixed(&head)?;
    head.resize(fixed.head_size, 0);
    body.read_exact(&mut head[MIN_HEAD_SIZE..])?;
    let mut header = BlobHeader::decode(&head)?;
    if u64::from(frame_len) != header.record_size() {
        return Err(BlobError::corruption(format!(
            "blob frame of {frame_len} bytes holds a {} byte record",
            header.record_size()
        )));
    }

    let lost: Vec<usize> = header
        .table_refs()
        .filter(|(_, table_id, _)| !restored.contains(table_id))
        .map(|(i, _, _)| i)
        .collect();
    for index in lost {
        header.free_table_ref(index);
    }
    if header.committed_ref_count() == 0 {
        return Ok(false);
    }
    header.status = BlobStatus::Referenced;

    let repo = db.writable_repo(header.record_size())?;
    let offset = match header.storage_type {
        StorageType::Repository => {
            let stored = header.checksum;
            let offset = repo.append_stream(&mut header, body)?;
            if header.checksum != stored {
                repo.add_garbage(header.record_size())?;
                return Err(BlobError::corruption(format!(
                    "checksum mismatch restoring a {} byte blob",
                    header.data_size
                )));
            }
            offset
        }
        StorageType::Cloud => {
            let source_key = CloudKey {
                db_id: manifest.source_db,
                create_time: header.create_time,
                seq: header.cloud_seq,
                cloud_ref: header.cloud_ref,
            };
            db.cloud_store()?
                .restore_copy(&source_key, header.backup_id.as_u32(), db.id())?;
            db.cloud_seq
                .fetch_max(header.cloud_seq.wrapping_add(1), Ordering::AcqRel);
            repo.append(&header, &[])?
        }
    };

    let location = BlobLocation {
        repo_id: repo.id(),
        offset,
        head_size: header.head_size() as u16,
        size: header.data_size,
        auth_code: header.auth_code,
    };
    let mut handle = None;
    for (_, table_id, blob_id) in header.table_refs() {
        db.tables.indirection(table_id)?.set_location(blob_id, location)?;
        handle.get_or_insert_with(|| {
            BlobHandle::new(db.id(), table_id, blob_id, header.auth_code, header.data_size)
        });
    }
    if let (Some(alias), Some(handle)) = (header.alias(), handle) {
        db.aliases.insert(alias.to_string(), Some(handle));
    }
    Ok(true)
}
