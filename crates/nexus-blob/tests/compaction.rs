//! Compaction and concurrent access.

mod common;

use std::io::{Read, Seek, SeekFrom};
use std::sync::Arc;
use std::thread;

use nexus_blob::{BlobHandle, Metadata};
use nexus_common::config::EngineConfig;
use nexus_common::types::{RefId, TableId};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tempfile::TempDir;

/// Compaction copies live records out, keeps payloads and digests intact,
/// and deletes the old file.
#[test]
fn test_compaction_preserves_live_blobs() {
    let dir = TempDir::new().unwrap();
    let engine =
        common::engine_with(EngineConfig::for_testing(dir.path().join("data")).with_garbage_threshold(10));
    let db = engine.database("compact").unwrap();
    let t = db.table_or_create("t").unwrap();

    let mut handles = Vec::new();
    for i in 0..30u8 {
        let h = db.create_blob(t, &common::payload(2048, i), Metadata::new()).unwrap();
        handles.push(db.reference_blob(&h, t, 1, RefId::new(u64::from(i))).unwrap());
    }
    let before: Vec<_> = db.repositories().into_iter().map(|r| r.id).collect();

    for (i, h) in handles.iter().enumerate().filter(|(i, _)| i % 3 != 0) {
        db.dereference_blob(h, t, RefId::new(i as u64)).unwrap();
    }
    common::pass_grace_period(&db);

    let report = db.compact_now().unwrap();
    assert_eq!(report.repositories, before.len() as u64);
    assert_eq!(report.records_copied, 10);
    assert_eq!(report.records_dropped, 20);
    assert!(report.bytes_reclaimed > 0);

    let after = db.repositories();
    assert!(after.iter().all(|r| !before.contains(&r.id)));
    assert!(after.iter().all(|r| r.garbage == 0));

    for (i, h) in handles.iter().enumerate() {
        if i % 3 == 0 {
            assert_eq!(&db.read_blob(h, ..).unwrap()[..], &common::payload(2048, i as u8)[..]);
            assert!(db.verify_checksum(h).unwrap());
        } else {
            assert!(db.read_blob(h, ..).unwrap_err().is_not_found());
        }
    }
    assert_eq!(db.stats().compactions, before.len() as u64);
}

/// Repositories below the garbage threshold are left alone.
#[test]
fn test_clean_repository_not_compacted() {
    let dir = TempDir::new().unwrap();
    let engine = common::engine(&dir);
    let db = engine.database("clean").unwrap();
    let t = db.table_or_create("t").unwrap();

    for i in 0..5u8 {
        let h = db.create_blob(t, &common::payload(512, i), Metadata::new()).unwrap();
        db.reference_blob(&h, t, 1, RefId::new(u64::from(i))).unwrap();
    }
    let report = db.compact_now().unwrap();
    assert_eq!(report.repositories, 0);
    assert_eq!(report.records_copied, 0);
}

/// Records that are still waiting for their grace period are copied too.
#[test]
fn test_compaction_keeps_pending_blobs() {
    let dir = TempDir::new().unwrap();
    let engine =
        common::engine_with(EngineConfig::for_testing(dir.path().join("data")).with_garbage_threshold(1));
    let db = engine.database("pending").unwrap();
    let t = db.table_or_create("t").unwrap();

    let dead = db.create_blob(t, &common::payload(4096, 1), Metadata::new()).unwrap();
    let dead = db.reference_blob(&dead, t, 1, RefId::new(1)).unwrap();
    db.dereference_blob(&dead, t, RefId::new(1)).unwrap();
    common::pass_grace_period(&db);

    let fresh = db.create_blob(t, b"not yet referenced", Metadata::new()).unwrap();
    db.compact_now().unwrap();

    let info = db.blob_info(&fresh).unwrap();
    assert!(info.deletion_pending);
    let fresh = db.reference_blob(&fresh, t, 1, RefId::new(2)).unwrap();
    assert_eq!(&db.read_blob(&fresh, ..).unwrap()[..], b"not yet referenced");
}

/// A reader streams and seeks within the payload.
#[test]
fn test_streaming_reader() {
    let dir = TempDir::new().unwrap();
    let engine = common::engine(&dir);
    let db = engine.database("stream").unwrap();
    let t = db.table_or_create("t").unwrap();

    let payload = common::payload(200_000, 9);
    let h = db
        .create_blob_from_reader(t, &mut &payload[..], payload.len() as u64, Metadata::new())
        .unwrap();

    let mut reader = db.open_blob(&h).unwrap();
    assert_eq!(reader.len(), payload.len() as u64);
    let mut all = Vec::new();
    reader.read_to_end(&mut all).unwrap();
    assert_eq!(all, payload);

    reader.seek(SeekFrom::Start(150_000)).unwrap();
    let mut chunk = [0u8; 16];
    reader.read_exact(&mut chunk).unwrap();
    assert_eq!(&chunk[..], &payload[150_000..150_016]);

    let mut rng = StdRng::seed_from_u64(11);
    for _ in 0..50 {
        let start = rng.gen_range(0..payload.len() as u64);
        let end = rng.gen_range(start..=payload.len() as u64);
        let bytes = db.read_blob(&h, start..end).unwrap();
        assert_eq!(&bytes[..], &payload[start as usize..end as usize]);
    }

    let short = db.create_blob_from_reader(t, &mut &payload[..10], 20, Metadata::new());
    assert!(short.is_err());
}

fn churn(db: &nexus_blob::Database, t: TableId, worker: u8) -> Vec<(BlobHandle, Vec<u8>)> {
    let mut kept = Vec::new();
    for i in 0..25u8 {
        let payload = common::payload(700 + usize::from(i) * 13, worker.wrapping_mul(50).wrapping_add(i));
        let row = RefId::new(u64::from(worker) * 1000 + u64::from(i));
        let h = db.create_blob(t, &payload, Metadata::new()).unwrap();
        let h = db.reference_blob(&h, t, 1, row).unwrap();
        assert_eq!(&db.read_blob(&h, ..).unwrap()[..], &payload[..]);
        if i % 2 == 0 {
            db.dereference_blob(&h, t, row).unwrap();
        } else {
            kept.push((h, payload));
        }
    }
    kept
}

/// Threads working on distinct BLOBs of the same repositories do not
/// interfere.
#[test]
fn test_concurrent_reference_churn() {
    let dir = TempDir::new().unwrap();
    let engine = common::engine(&dir);
    let db = engine.database("churn").unwrap();
    let t = db.table_or_create("t").unwrap();

    let workers: Vec<_> = (0..8u8)
        .map(|worker| {
            let db = Arc::clone(&db);
            thread::spawn(move || churn(&db, t, worker))
        })
        .collect();
    let kept: Vec<_> = workers
        .into_iter()
        .flat_map(|w| w.join().expect("worker panicked"))
        .collect();
    assert_eq!(kept.len(), 8 * 12);

    common::pass_grace_period(&db);
    assert_eq!(db.stats().blobs_deleted, 8 * 13);
    db.compact_now().unwrap();

    for (h, payload) in &kept {
        assert_eq!(&db.read_blob(h, ..).unwrap()[..], &payload[..]);
        assert_eq!(db.blob_info(h).unwrap().committed_refs, 1);
    }
}
