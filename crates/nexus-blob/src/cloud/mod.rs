//! Cloud tier.
//!
//! When a record's storage type is cloud, its payload lives in an external
//! object store and the record keeps only the header. The object key is
//! derived from header fields, so nothing else needs to be persisted:
//!
//! ```text
//! <database id>/<create time>-<sequence>-<cloud ref>
//! ```

mod fs;

use std::fmt;
use std::io::Read;
use std::sync::Arc;

use nexus_common::config::CloudConfig;
use nexus_common::error::{BlobError, BlobResult};
use nexus_common::types::{DatabaseId, Timestamp};

pub use fs::FsCloudStore;

/// Identifies one object in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CloudKey {
    /// Owning database.
    pub db_id: DatabaseId,
    /// Record creation time.
    pub create_time: Timestamp,
    /// Per-record sequence number.
    pub seq: u32,
    /// Store configuration the object was written under.
    pub cloud_ref: u32,
}

impl CloudKey {
    /// Object name relative to the bucket.
    pub fn object_name(&self) -> String {
        format!(
            "{}/{}-{}-{}",
            self.db_id.as_u32(),
            self.create_time.as_secs(),
            self.seq,
            self.cloud_ref
        )
    }

    /// The same object re-homed under another database.
    pub fn with_db(self, db_id: DatabaseId) -> Self {
        Self { db_id, ..self }
    }
}

impl fmt::Display for CloudKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.object_name())
    }
}

/// External object storage.
pub trait CloudStore: Send + Sync + fmt::Debug {
    /// Stable id of this store configuration, recorded in each header.
    fn cloud_ref(&self) -> u32;

    /// Stores `size` bytes read from `data`.
    fn put(&self, key: &CloudKey, data: &mut dyn Read, size: u64) -> BlobResult<()>;

    /// Reads `buf.len()` bytes starting at `start`.
    fn get_range(&self, key: &CloudKey, start: u64, buf: &mut [u8]) -> BlobResult<()>;

    /// Deletes an object. Deleting a missing object succeeds.
    fn delete(&self, key: &CloudKey) -> BlobResult<()>;

    /// Copies an object aside under backup number `backup_no`.
    fn backup_copy(&self, key: &CloudKey, backup_no: u32) -> BlobResult<()>;

    /// Copies a backed-up object back, re-homed under `db_id`.
    fn restore_copy(&self, key: &CloudKey, backup_no: u32, db_id: DatabaseId) -> BlobResult<()>;
}

/// Builds the store selected by `config`. Only `file://` servers are
/// supported; that store needs no access keys.
pub fn from_config(config: &CloudConfig) -> BlobResult<Arc<dyn CloudStore>> {
    if let Some(root) = config.server.strip_prefix("file://") {
        let store = FsCloudStore::open(root, &config.bucket)?;
        return Ok(Arc::new(store));
    }
    Err(BlobError::config(format!(
        "unsupported cloud server {:?}",
        config.server
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_name() {
        let key = CloudKey {
            db_id: DatabaseId::new(2),
            create_time: Timestamp::from_secs(1700),
            seq: 9,
            cloud_ref: 4,
        };
        assert_eq!(key.object_name(), "2/1700-9-4");
        assert_eq!(key.with_db(DatabaseId::new(5)).object_name(), "5/1700-9-4");
    }

    #[test]
    fn test_file_store_without_keys() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = CloudConfig {
            server: format!("file://{}", dir.path().display()),
            bucket: "b".into(),
            public_key: String::new(),
            private_key: String::new(),
        };
        let store = from_config(&config).unwrap();
        let key = CloudKey {
            db_id: DatabaseId::new(1),
            create_time: Timestamp::from_secs(10),
            seq: 1,
            cloud_ref: store.cloud_ref(),
        };
        store.put(&key, &mut &b"payload"[..], 7).unwrap();
        let mut buf = [0u8; 4];
        store.get_range(&key, 3, &mut buf).unwrap();
        assert_eq!(&buf, b"load");
    }

    #[test]
    fn test_unsupported_server() {
        let config = CloudConfig {
            server: "https://s3.example.com".into(),
            bucket: "b".into(),
            public_key: String::new(),
            private_key: String::new(),
        };
        assert!(matches!(
            from_config(&config).unwrap_err(),
            BlobError::Config { .. }
        ));
    }
}
