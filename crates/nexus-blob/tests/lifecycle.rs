//! Reference counting and deferred deletion.

mod common;

use nexus_blob::{BlobHandle, BlobStatus, Metadata};
use nexus_common::error::BlobError;
use nexus_common::types::{AuthCode, RefId};
use tempfile::TempDir;

/// A BLOB shared by two rows survives the first dereference, is deleted after
/// the second one, and compaction gives its bytes back.
#[test]
fn test_shared_blob_lifecycle() {
    let dir = TempDir::new().unwrap();
    let engine = common::engine(&dir);
    let db = engine.database("scenario").expect("Failed to open database");
    let t = db.table_or_create("t").unwrap();

    // A live neighbour keeps the repository in use after compaction.
    let a = db.create_blob(t, b"keep me", Metadata::new()).unwrap();
    let a = db.reference_blob(&a, t, 1, RefId::new(100)).unwrap();
    let baseline = db.stats().garbage_bytes;

    let payload = common::payload(1000, 7);
    let b = db.create_blob(t, &payload, Metadata::new()).unwrap();
    let mut txn = db.begin();
    let b = txn.reference(&b, t, 1, RefId::new(1)).unwrap();
    txn.reference(&b, t, 1, RefId::new(2)).unwrap();
    txn.commit().unwrap();

    let info = db.blob_info(&b).unwrap();
    assert_eq!(info.status, BlobStatus::Referenced);
    assert_eq!(info.committed_refs, 2);
    assert_eq!(db.references(&b).unwrap().len(), 2);

    db.dereference_blob(&b, t, RefId::new(1)).unwrap();
    common::pass_grace_period(&db);
    let info = db.blob_info(&b).unwrap();
    assert_eq!(info.status, BlobStatus::Referenced);
    assert_eq!(info.committed_refs, 1);
    assert!(!info.deletion_pending);

    db.dereference_blob(&b, t, RefId::new(2)).unwrap();
    assert!(db.blob_info(&b).unwrap().deletion_pending);
    assert_eq!(&db.read_blob(&b, ..).unwrap()[..], &payload[..]);

    common::pass_grace_period(&db);
    assert!(db.read_blob(&b, ..).unwrap_err().is_not_found());
    assert!(db.stats().garbage_bytes > baseline);

    let report = db.compact_now().unwrap();
    assert_eq!(report.repositories, 1);
    assert_eq!(report.records_copied, 1);
    assert_eq!(db.stats().garbage_bytes, baseline);
    assert_eq!(&db.read_blob(&a, ..).unwrap()[..], b"keep me");
}

/// A BLOB nobody references is reclaimed once the grace period passes.
#[test]
fn test_unreferenced_blob_is_reclaimed() {
    let dir = TempDir::new().unwrap();
    let engine = common::engine(&dir);
    let db = engine.database("temp").unwrap();
    let t = db.table_or_create("t").unwrap();

    let h = db.create_blob(t, b"scratch", Metadata::new()).unwrap();
    let info = db.blob_info(&h).unwrap();
    assert_eq!(info.status, BlobStatus::Allocated);
    assert!(info.deletion_pending);
    assert_eq!(&db.read_blob(&h, ..).unwrap()[..], b"scratch");

    common::pass_grace_period(&db);
    assert!(matches!(db.read_blob(&h, ..), Err(BlobError::NotFound { .. })));
    assert_eq!(db.stats().blobs_deleted, 1);
}

/// Dereferencing a reference that does not exist is NotFound and changes
/// nothing.
#[test]
fn test_dereference_missing_reference() {
    let dir = TempDir::new().unwrap();
    let engine = common::engine(&dir);
    let db = engine.database("missing").unwrap();
    let t = db.table_or_create("t").unwrap();

    let h = db.create_blob(t, b"x", Metadata::new()).unwrap();
    let h = db.reference_blob(&h, t, 1, RefId::new(1)).unwrap();

    let err = db.dereference_blob(&h, t, RefId::new(2)).unwrap_err();
    assert!(err.is_not_found());
    assert_eq!(db.blob_info(&h).unwrap().committed_refs, 1);

    let err = db.reference_blob(&h, t, 1, RefId::new(1)).unwrap_err();
    assert!(matches!(err, BlobError::Duplicate { .. }));
}

/// Rolled back references do not keep a BLOB alive.
#[test]
fn test_rollback_requeues_deletion() {
    let dir = TempDir::new().unwrap();
    let engine = common::engine(&dir);
    let db = engine.database("rollback").unwrap();
    let t = db.table_or_create("t").unwrap();

    let h = db.create_blob(t, b"maybe", Metadata::new()).unwrap();
    let mut txn = db.begin();
    txn.reference(&h, t, 3, RefId::new(9)).unwrap();
    let info = db.blob_info(&h).unwrap();
    assert_eq!(info.committed_refs, 0);
    assert_eq!(info.pending_refs, 1);
    assert!(!info.deletion_pending);
    txn.rollback().unwrap();

    let info = db.blob_info(&h).unwrap();
    assert_eq!(info.pending_refs, 0);
    assert!(info.deletion_pending);

    common::pass_grace_period(&db);
    assert!(db.read_blob(&h, ..).unwrap_err().is_not_found());
}

/// Dropping an unfinished transaction rolls it back, but leaves earlier
/// committed references alone.
#[test]
fn test_dropped_txn_rolls_back() {
    let dir = TempDir::new().unwrap();
    let engine = common::engine(&dir);
    let db = engine.database("dropped-txn").unwrap();
    let t = db.table_or_create("t").unwrap();

    let h = db.create_blob(t, b"kept", Metadata::new()).unwrap();
    let h = db.reference_blob(&h, t, 1, RefId::new(1)).unwrap();
    {
        let mut txn = db.begin();
        txn.reference(&h, t, 1, RefId::new(2)).unwrap();
        txn.dereference(&h, t, RefId::new(1)).unwrap();
    }

    let info = db.blob_info(&h).unwrap();
    assert_eq!(info.committed_refs, 1);
    assert_eq!(info.pending_refs, 0);
    assert!(!info.deletion_pending);
    assert_eq!(db.stats().rollbacks, 1);

    common::pass_grace_period(&db);
    assert_eq!(&db.read_blob(&h, ..).unwrap()[..], b"kept");
}

/// Referencing from another table hands out a handle in that table.
#[test]
fn test_reference_from_second_table() {
    let dir = TempDir::new().unwrap();
    let engine = common::engine(&dir);
    let db = engine.database("shared").unwrap();
    let photos = db.table_or_create("photos").unwrap();
    let albums = db.table_or_create("albums").unwrap();

    let created = db.create_blob(photos, b"sunset", Metadata::new()).unwrap();
    let in_albums = db.reference_blob(&created, albums, 2, RefId::new(5)).unwrap();
    assert_eq!(in_albums.table_id, albums);
    assert_ne!(in_albums, created);

    let refs = db.references(&in_albums).unwrap();
    assert_eq!(refs.len(), 1);
    assert_eq!(refs[0].table_id, albums);
    assert_eq!(refs[0].column, 2);
    assert!(refs[0].committed);

    common::pass_grace_period(&db);
    assert_eq!(&db.read_blob(&created, ..).unwrap()[..], b"sunset");
    assert_eq!(&db.read_blob(&in_albums, ..).unwrap()[..], b"sunset");

    db.dereference_blob(&in_albums, albums, RefId::new(5)).unwrap();
    common::pass_grace_period(&db);
    assert!(db.read_blob(&created, ..).unwrap_err().is_not_found());
    assert!(db.read_blob(&in_albums, ..).unwrap_err().is_not_found());
}

/// A handle survives its text form, and a forged auth code is rejected.
#[test]
fn test_handle_text_and_auth_code() {
    let dir = TempDir::new().unwrap();
    let engine = common::engine(&dir);
    let db = engine.database("handles").unwrap();
    let t = db.table_or_create("t").unwrap();

    let h = db.create_blob(t, b"abc", Metadata::new()).unwrap();
    let parsed: BlobHandle = h.to_string().parse().unwrap();
    assert_eq!(parsed, h);
    assert_eq!(&db.read_blob(&parsed, 1..).unwrap()[..], b"bc");

    let forged = BlobHandle {
        auth_code: AuthCode::new(h.auth_code.as_u32() ^ 1),
        ..h
    };
    assert!(db.read_blob(&forged, ..).unwrap_err().is_not_found());

    let other = engine.database("other").unwrap();
    assert!(matches!(
        other.read_blob(&h, ..),
        Err(BlobError::InvalidArgument { .. })
    ));
}

/// Reads are counted in the record header.
#[test]
fn test_reads_update_access_count() {
    let dir = TempDir::new().unwrap();
    let engine = common::engine(&dir);
    let db = engine.database("access").unwrap();
    let t = db.table_or_create("t").unwrap();

    let h = db.create_blob(t, b"counted", Metadata::new()).unwrap();
    db.read_blob(&h, ..).unwrap();
    db.read_blob(&h, 0..3).unwrap();
    assert!(db.verify_checksum(&h).unwrap());

    let info = db.blob_info(&h).unwrap();
    assert_eq!(info.access_count, 2);
    assert!(info.last_access >= info.create_time);
}

/// Replaying the temp log after a restart does not apply anything twice.
#[test]
fn test_replay_after_restart_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let (gone, kept, garbage) = {
        let engine = common::engine(&dir);
        let db = engine.database("replay").unwrap();
        let t = db.table_or_create("t").unwrap();

        let gone = db.create_blob(t, &common::payload(300, 1), Metadata::new()).unwrap();
        let gone = db.reference_blob(&gone, t, 1, RefId::new(1)).unwrap();
        let kept = db.create_blob(t, &common::payload(300, 2), Metadata::new()).unwrap();
        let kept = db.reference_blob(&kept, t, 1, RefId::new(2)).unwrap();
        db.dereference_blob(&gone, t, RefId::new(1)).unwrap();

        common::pass_grace_period(&db);
        assert!(db.read_blob(&gone, ..).unwrap_err().is_not_found());
        assert_eq!(db.stats().blobs_deleted, 1);
        (gone, kept, db.stats().garbage_bytes)
    };

    let engine = common::engine(&dir);
    let db = engine.database("replay").unwrap();
    db.flush_deferred().unwrap();
    let stats = db.stats();
    assert_eq!(stats.actions_applied, 0);
    assert_eq!(stats.blobs_deleted, 0);
    assert_eq!(stats.garbage_bytes, garbage);
    assert!(db.read_blob(&gone, ..).unwrap_err().is_not_found());
    assert_eq!(&db.read_blob(&kept, ..).unwrap()[..], &common::payload(300, 2)[..]);
}

/// An unreferenced BLOB created before a restart is still reclaimed after it.
#[test]
fn test_pending_deletion_survives_restart() {
    let dir = TempDir::new().unwrap();
    let h = {
        let engine = common::engine(&dir);
        let db = engine.database("restart").unwrap();
        let t = db.table_or_create("t").unwrap();
        db.create_blob(t, b"orphan", Metadata::new()).unwrap()
    };

    let engine = common::engine(&dir);
    let db = engine.database("restart").unwrap();
    assert_eq!(&db.read_blob(&h, ..).unwrap()[..], b"orphan");
    common::pass_grace_period(&db);
    assert!(db.read_blob(&h, ..).unwrap_err().is_not_found());
}

/// References from transactions cut off by a crash are dropped at the next
/// open: a BLOB held only by one is reclaimed, committed references stay.
#[test]
fn test_uncommitted_reference_discarded_on_restart() {
    let dir = TempDir::new().unwrap();
    let (orphan, shared) = {
        let engine = common::engine(&dir);
        let db = engine.database("crash").unwrap();
        let t = db.table_or_create("t").unwrap();

        let orphan = db.create_blob(t, b"never committed", Metadata::new()).unwrap();
        let shared = db.create_blob(t, b"committed once", Metadata::new()).unwrap();
        let shared = db.reference_blob(&shared, t, 1, RefId::new(1)).unwrap();

        let mut txn = db.begin();
        txn.reference(&orphan, t, 1, RefId::new(7)).unwrap();
        txn.reference(&shared, t, 1, RefId::new(8)).unwrap();
        // Neither commit nor rollback runs.
        std::mem::forget(txn);
        assert_eq!(db.blob_info(&orphan).unwrap().pending_refs, 1);
        (orphan, shared)
    };

    let engine = common::engine(&dir);
    let db = engine.database("crash").unwrap();
    let info = db.blob_info(&orphan).unwrap();
    assert_eq!(info.pending_refs, 0);
    assert_eq!(info.committed_refs, 0);
    assert!(info.deletion_pending);

    let info = db.blob_info(&shared).unwrap();
    assert_eq!(info.pending_refs, 0);
    assert_eq!(info.committed_refs, 1);
    assert!(!info.deletion_pending);

    common::pass_grace_period(&db);
    assert!(db.read_blob(&orphan, ..).unwrap_err().is_not_found());
    assert_eq!(&db.read_blob(&shared, ..).unwrap()[..], b"committed once");
}

/// Operations on a closed database fail with Closed.
#[test]
fn test_closed_database() {
    let dir = TempDir::new().unwrap();
    let engine = common::engine(&dir);
    let db = engine.database("closing").unwrap();
    let t = db.table_or_create("t").unwrap();
    let h = db.create_blob(t, b"x", Metadata::new()).unwrap();

    engine.shutdown().unwrap();
    assert!(matches!(db.read_blob(&h, ..), Err(BlobError::Closed)));
    assert!(matches!(
        db.create_blob(t, b"y", Metadata::new()),
        Err(BlobError::Closed)
    ));
}
