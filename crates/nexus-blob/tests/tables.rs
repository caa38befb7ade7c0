//! Table directory operations.

mod common;

use nexus_blob::Metadata;
use nexus_common::error::BlobError;
use nexus_common::types::RefId;
use tempfile::TempDir;

/// Dropping a table releases its references once the grace period passes.
/// BLOBs still referenced from another table survive.
#[test]
fn test_drop_table_releases_references() {
    let dir = TempDir::new().unwrap();
    let engine = common::engine(&dir);
    let db = engine.database("drop").unwrap();
    let orders = db.create_table("orders").unwrap();
    let archive = db.create_table("archive").unwrap();

    let only = db.create_blob(orders, b"only in orders", Metadata::new()).unwrap();
    let only = db.reference_blob(&only, orders, 1, RefId::new(1)).unwrap();
    let shared = db.create_blob(orders, b"shared", Metadata::new()).unwrap();
    let shared = db.reference_blob(&shared, orders, 1, RefId::new(2)).unwrap();
    let archived = db.reference_blob(&shared, archive, 4, RefId::new(7)).unwrap();

    db.drop_table("orders").unwrap();
    assert!(db.table_id("orders").unwrap_err().is_not_found());
    assert!(matches!(
        db.create_blob(orders, b"late", Metadata::new()),
        Err(BlobError::NotFound { .. })
    ));
    assert!(db.tables().iter().any(|e| e.id == orders && e.to_delete));

    common::pass_grace_period(&db);
    assert!(db.tables().iter().all(|e| e.id != orders));
    assert!(db.read_blob(&only, ..).unwrap_err().is_not_found());

    assert_eq!(&db.read_blob(&archived, ..).unwrap()[..], b"shared");
    let refs = db.references(&archived).unwrap();
    assert_eq!(refs.len(), 1);
    assert_eq!(refs[0].table_id, archive);
    assert_eq!(db.blob_info(&archived).unwrap().committed_refs, 1);

    // The name is free again.
    assert_ne!(db.create_table("orders").unwrap(), orders);
}

/// Once its last remaining table lets go, a BLOB that outlived a dropped
/// table is reclaimed like any other.
#[test]
fn test_survivor_of_dropped_table_is_reclaimed_later() {
    let dir = TempDir::new().unwrap();
    let engine = common::engine(&dir);
    let db = engine.database("survivor").unwrap();
    let a = db.create_table("a").unwrap();
    let b = db.create_table("b").unwrap();

    let h = db.create_blob(a, b"payload", Metadata::new()).unwrap();
    let in_b = db.reference_blob(&h, b, 1, RefId::new(1)).unwrap();
    db.drop_table("a").unwrap();
    common::pass_grace_period(&db);
    assert_eq!(&db.read_blob(&in_b, ..).unwrap()[..], b"payload");

    db.dereference_blob(&in_b, b, RefId::new(1)).unwrap();
    common::pass_grace_period(&db);
    assert!(db.read_blob(&in_b, ..).unwrap_err().is_not_found());
}

/// Renaming keeps the id; the old name disappears.
#[test]
fn test_rename_table() {
    let dir = TempDir::new().unwrap();
    let engine = common::engine(&dir);
    let db = engine.database("rename").unwrap();
    let id = db.create_table("draft").unwrap();

    db.rename_table("draft", "final").unwrap();
    assert_eq!(db.table_id("final").unwrap(), id);
    assert!(db.table_id("draft").unwrap_err().is_not_found());
    assert_eq!(db.table_or_create("final").unwrap(), id);

    db.create_table("other").unwrap();
    assert!(matches!(
        db.rename_table("final", "other"),
        Err(BlobError::Duplicate { .. })
    ));
}

/// Table names are unique and the directory survives a restart.
#[test]
fn test_tables_persist() {
    let dir = TempDir::new().unwrap();
    let id = {
        let engine = common::engine(&dir);
        let db = engine.database("persist").unwrap();
        let id = db.create_table("t").unwrap();
        assert!(matches!(db.create_table("t"), Err(BlobError::Duplicate { .. })));
        id
    };

    let engine = common::engine(&dir);
    let db = engine.database("persist").unwrap();
    assert_eq!(db.table_id("t").unwrap(), id);
    assert_eq!(db.tables().len(), 1);
}
