//! Online backup and restore.

mod common;

use nexus_blob::{BackupState, BlobHandle, Metadata};
use nexus_common::config::{CloudConfig, EngineConfig};
use nexus_common::constants::{DUMP_FILE_NAME, TERMINATED_SUFFIX};
use nexus_common::error::BlobError;
use nexus_common::types::RefId;
use tempfile::TempDir;

fn in_copy(handle: &BlobHandle, copy: &nexus_blob::Database) -> BlobHandle {
    BlobHandle {
        db_id: copy.id(),
        ..*handle
    }
}

/// A dump holds every committed BLOB and nothing else, and restores into a
/// database of its own.
#[test]
fn test_backup_and_restore_round_trip() {
    let dir = TempDir::new().unwrap();
    let engine = common::engine(&dir);
    let db = engine.database("live").unwrap();
    let photos = db.create_table("photos").unwrap();
    let docs = db.create_table("docs").unwrap();

    let big = common::payload(100_000, 4);
    let a = db.create_blob(photos, &big, Metadata::new().with_alias("hero").unwrap()).unwrap();
    let a = db.reference_blob(&a, photos, 1, RefId::new(1)).unwrap();
    let shared = db.create_blob(docs, b"shared doc", Metadata::new()).unwrap();
    let shared = db.reference_blob(&shared, docs, 2, RefId::new(1)).unwrap();
    let shared_in_photos = db.reference_blob(&shared, photos, 3, RefId::new(2)).unwrap();

    let temp = db.create_blob(docs, b"never referenced", Metadata::new()).unwrap();
    let pending = db.create_blob(docs, b"uncommitted", Metadata::new()).unwrap();
    let mut txn = db.begin();
    let pending = txn.reference(&pending, docs, 1, RefId::new(9)).unwrap();

    let target = dir.path().join("dump-1");
    let id = engine.start_backup("live", &target).unwrap();
    let descriptor = engine.wait_for_backup("live").unwrap().unwrap();
    txn.commit().unwrap();

    assert_eq!(descriptor.id, id);
    assert_eq!(descriptor.state, BackupState::Completed);
    assert_eq!(descriptor.blobs, 2);
    assert!(target.join(DUMP_FILE_NAME).is_file());
    assert!(engine.backups().iter().any(|d| d.id == id && d.state == BackupState::Completed));
    let status = engine.backup_status("live").unwrap().unwrap();
    assert!(!status.running);
    assert!(status.bytes_done > 0);

    let summary = engine.restore("copy", &target).unwrap();
    assert_eq!(summary.source_db, db.id());
    assert_eq!(summary.backup_id, id);
    assert_eq!(summary.tables_restored, 2);
    assert_eq!(summary.blobs_restored, 2);

    let copy = engine.database("copy").unwrap();
    assert_eq!(summary.db_id, copy.id());
    assert_ne!(copy.id(), db.id());
    assert_eq!(copy.table_id("photos").unwrap(), photos);

    assert_eq!(&copy.read_blob(&in_copy(&a, &copy), ..).unwrap()[..], &big[..]);
    assert!(copy.verify_checksum(&in_copy(&a, &copy)).unwrap());
    assert_eq!(copy.lookup_alias("hero").unwrap(), in_copy(&a, &copy));
    assert_eq!(&copy.read_blob(&in_copy(&shared, &copy), ..).unwrap()[..], b"shared doc");
    assert_eq!(
        &copy.read_blob(&in_copy(&shared_in_photos, &copy), ..).unwrap()[..],
        b"shared doc"
    );
    assert_eq!(copy.blob_info(&in_copy(&shared, &copy)).unwrap().committed_refs, 2);

    assert!(copy.read_blob(&in_copy(&temp, &copy), ..).is_err());
    assert!(copy.read_blob(&in_copy(&pending, &copy), ..).is_err());

    // The source is untouched.
    assert_eq!(&db.read_blob(&pending, ..).unwrap()[..], b"uncommitted");
    assert_eq!(&db.read_blob(&a, ..).unwrap()[..], &big[..]);
}

/// Restoring over an existing database or from a missing dump is refused.
#[test]
fn test_restore_preconditions() {
    let dir = TempDir::new().unwrap();
    let engine = common::engine(&dir);
    let db = engine.database("src").unwrap();
    let t = db.table_or_create("t").unwrap();
    let h = db.create_blob(t, b"x", Metadata::new()).unwrap();
    db.reference_blob(&h, t, 1, RefId::new(1)).unwrap();

    let target = dir.path().join("dump");
    engine.start_backup("src", &target).unwrap();
    engine.wait_for_backup("src").unwrap();

    assert!(matches!(engine.restore("src", &target), Err(BlobError::Duplicate { .. })));
    assert!(engine
        .restore("fresh", &dir.path().join("nowhere"))
        .unwrap_err()
        .is_not_found());
    assert!(!engine.list_databases().unwrap().contains(&"fresh".to_string()));

    assert!(matches!(
        engine.start_backup("src", &target),
        Err(BlobError::Duplicate { .. })
    ));
}

/// A truncated dump fails the restore and leaves no database behind.
#[test]
fn test_truncated_dump_rejected() {
    let dir = TempDir::new().unwrap();
    let engine = common::engine(&dir);
    let db = engine.database("src").unwrap();
    let t = db.table_or_create("t").unwrap();
    let h = db.create_blob(t, &common::payload(5000, 1), Metadata::new()).unwrap();
    db.reference_blob(&h, t, 1, RefId::new(1)).unwrap();

    let target = dir.path().join("dump");
    engine.start_backup("src", &target).unwrap();
    engine.wait_for_backup("src").unwrap();

    let dump = target.join(DUMP_FILE_NAME);
    let len = std::fs::metadata(&dump).unwrap().len();
    let file = std::fs::OpenOptions::new().write(true).open(&dump).unwrap();
    file.set_len(len - 100).unwrap();
    drop(file);

    let err = engine.restore("broken", &target).unwrap_err();
    assert!(err.is_corruption() || matches!(err, BlobError::Io { .. }));
    assert!(!engine.list_databases().unwrap().contains(&"broken".to_string()));
}

/// Terminating a backup sets its destination aside.
#[test]
fn test_terminate_backup() {
    let dir = TempDir::new().unwrap();
    let engine = common::engine(&dir);
    let db = engine.database("big").unwrap();
    let t = db.table_or_create("t").unwrap();
    for i in 0..40u8 {
        let h = db.create_blob(t, &common::payload(200_000, i), Metadata::new()).unwrap();
        db.reference_blob(&h, t, 1, RefId::new(u64::from(i))).unwrap();
    }

    let target = dir.path().join("slow");
    let id = engine.start_backup("big", &target).unwrap();

    match engine.terminate_backup("big") {
        Ok(terminated) => {
            assert_eq!(terminated, id);
            let mut aside = target.clone().into_os_string();
            aside.push(TERMINATED_SUFFIX);
            assert!(std::path::PathBuf::from(aside).is_dir());
            assert!(!target.exists());
            let state = engine.backups().into_iter().find(|d| d.id == id).unwrap().state;
            assert!(matches!(state, BackupState::Terminated | BackupState::Completed));
        }
        // The backup beat us to it.
        Err(e) => assert!(e.is_not_found()),
    }
    assert!(engine.terminate_backup("big").unwrap_err().is_not_found());
    assert!(!engine.backup_status("big").unwrap().unwrap().running);
}

/// Deletions and compaction during a backup do not corrupt the dump, and
/// BLOBs nobody touched are all in it.
#[test]
fn test_backup_during_deletes_and_compaction() {
    let dir = TempDir::new().unwrap();
    let engine = common::engine_with(
        EngineConfig::for_testing(dir.path().join("data")).with_garbage_threshold(1),
    );
    let db = engine.database("busy").unwrap();
    let t = db.table_or_create("t").unwrap();
    let mut handles = Vec::new();
    for i in 0..20u8 {
        let h = db.create_blob(t, &common::payload(3000, i), Metadata::new()).unwrap();
        handles.push(db.reference_blob(&h, t, 1, RefId::new(u64::from(i))).unwrap());
    }

    let target = dir.path().join("dump");
    engine.start_backup("busy", &target).unwrap();
    for (i, h) in handles.iter().enumerate().take(10) {
        db.dereference_blob(h, t, RefId::new(i as u64)).unwrap();
    }
    common::pass_grace_period(&db);
    db.compact_now().unwrap();
    let descriptor = engine.wait_for_backup("busy").unwrap().unwrap();
    assert_eq!(descriptor.state, BackupState::Completed);
    assert!((10..=20).contains(&descriptor.blobs));

    // Once the backup is done the compacted files go away.
    db.compact_now().unwrap();
    assert!(db.repositories().iter().all(|r| !r.delete_pending));

    let summary = engine.restore("snapshot", &target).unwrap();
    assert_eq!(summary.blobs_restored, descriptor.blobs);
    let copy = engine.database("snapshot").unwrap();
    for (i, h) in handles.iter().enumerate() {
        let h = in_copy(h, &copy);
        match copy.read_blob(&h, ..) {
            Ok(bytes) => assert_eq!(&bytes[..], &common::payload(3000, i as u8)[..]),
            // Dereferenced before the scan reached it.
            Err(e) => assert!(i < 10 && e.is_not_found()),
        }
    }
    for (i, h) in handles.iter().enumerate() {
        if i < 10 {
            assert!(db.read_blob(h, ..).unwrap_err().is_not_found());
        } else {
            assert_eq!(&db.read_blob(h, ..).unwrap()[..], &common::payload(3000, i as u8)[..]);
        }
    }
}

/// Cloud payloads are copied aside by the backup and brought back under the
/// restored database.
#[test]
fn test_cloud_backup_and_restore() {
    let dir = TempDir::new().unwrap();
    let cloud = CloudConfig {
        server: format!("file://{}", dir.path().join("cloud").display()),
        bucket: "blobs".into(),
        public_key: "access".into(),
        private_key: "secret".into(),
    };
    let engine = common::engine_with(EngineConfig::for_testing(dir.path().join("data")).with_cloud(cloud));
    let db = engine.database("remote").unwrap();
    let t = db.table_or_create("t").unwrap();

    let payload = common::payload(10_000, 6);
    let h = db.create_blob(t, &payload, Metadata::new()).unwrap();
    let h = db.reference_blob(&h, t, 1, RefId::new(1)).unwrap();
    assert_eq!(&db.read_blob(&h, 100..200).unwrap()[..], &payload[100..200]);
    assert!(db.verify_checksum(&h).unwrap());

    let target = dir.path().join("dump");
    engine.start_backup("remote", &target).unwrap();
    let descriptor = engine.wait_for_backup("remote").unwrap().unwrap();
    assert_eq!(descriptor.state, BackupState::Completed);
    assert!(dir.path().join("cloud/blobs/backups").is_dir());
    let dump = std::fs::read(target.join(DUMP_FILE_NAME)).unwrap();
    assert!(!dump.windows(6).any(|w| w == b"secret"));

    engine.restore("restored", &target).unwrap();
    let copy = engine.database("restored").unwrap();
    let restored = in_copy(&h, &copy);
    assert_eq!(&copy.read_blob(&restored, ..).unwrap()[..], &payload[..]);

    // Reclaiming the original leaves the copy's object alone.
    db.dereference_blob(&h, t, RefId::new(1)).unwrap();
    common::pass_grace_period(&db);
    assert!(db.read_blob(&h, ..).unwrap_err().is_not_found());
    assert_eq!(&copy.read_blob(&restored, ..).unwrap()[..], &payload[..]);
}
