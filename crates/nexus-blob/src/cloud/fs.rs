//! Filesystem-backed object store for `file://` servers.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use nexus_common::error::{BlobError, BlobResult};
use nexus_common::types::DatabaseId;

use super::{CloudKey, CloudStore};

const BACKUP_DIR: &str = "backups";

/// Object store keeping each object as a file under `<root>/<bucket>/`.
#[derive(Debug)]
pub struct FsCloudStore {
    bucket_dir: PathBuf,
    cloud_ref: u32,
}

impl FsCloudStore {
    /// Opens the store rooted at `root`, creating the bucket directory.
    pub fn open(root: impl AsRef<Path>, bucket: &str) -> BlobResult<Self> {
        if bucket.is_empty() || bucket.contains('/') {
            return Err(BlobError::config(format!("invalid bucket name {bucket:?}")));
        }
        let root = root.as_ref();
        let bucket_dir = root.join(bucket);
        fs::create_dir_all(&bucket_dir)?;
        let cloud_ref = crc32fast::hash(bucket_dir.to_string_lossy().as_bytes()) & 0x7FFF_FFFF;
        tracing::debug!(bucket = %bucket_dir.display(), cloud_ref, "opened filesystem cloud store");
        Ok(Self {
            bucket_dir,
            cloud_ref,
        })
    }

    fn object_path(&self, key: &CloudKey) -> PathBuf {
        self.bucket_dir.join(key.object_name())
    }

    fn backup_path(&self, key: &CloudKey, backup_no: u32) -> PathBuf {
        self.bucket_dir
            .join(BACKUP_DIR)
            .join(backup_no.to_string())
            .join(key.object_name())
    }

    fn copy_object(from: &Path, to: &Path) -> BlobResult<()> {
        if let Some(parent) = to.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(from, to).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => BlobError::not_found(format!("cloud object {}", from.display())),
            _ => e.into(),
        })?;
        Ok(())
    }
}

impl CloudStore for FsCloudStore {
    fn cloud_ref(&self) -> u32 {
        self.cloud_ref
    }

    fn put(&self, key: &CloudKey, data: &mut dyn Read, size: u64) -> BlobResult<()> {
        let path = self.object_path(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("part");
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp)?;
        let copied = io::copy(&mut data.take(size), &mut file)?;
        if copied != size {
            drop(file);
            let _ = fs::remove_file(&tmp);
            return Err(BlobError::invalid_argument(format!(
                "payload ended after {copied} of {size} bytes"
            )));
        }
        file.flush()?;
        file.sync_all()?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn get_range(&self, key: &CloudKey, start: u64, buf: &mut [u8]) -> BlobResult<()> {
        let file = File::open(self.object_path(key)).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => BlobError::cloud(format!("object {key} is missing")),
            _ => e.into(),
        })?;
        file.read_exact_at(buf, start)?;
        Ok(())
    }

    fn delete(&self, key: &CloudKey) -> BlobResult<()> {
        match fs::remove_file(self.object_path(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn backup_copy(&self, key: &CloudKey, backup_no: u32) -> BlobResult<()> {
        Self::copy_object(&self.object_path(key), &self.backup_path(key, backup_no))
    }

    fn restore_copy(&self, key: &CloudKey, backup_no: u32, db_id: DatabaseId) -> BlobResult<()> {
        Self::copy_object(
            &self.backup_path(key, backup_no),
            &self.object_path(&key.with_db(db_id)),
        )
    }
}
