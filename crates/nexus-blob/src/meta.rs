//! Small metadata files written with atomic replacement.
//!
//! ```text
//! | magic (4) | length (4) | crc32 (4) | bincode body (length) |
//! ```
//!
//! Saves write a temporary file, sync it, rename it over the target and sync
//! the directory.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::Path;

use bytes::{Buf, BufMut};
use serde::de::DeserializeOwned;
use serde::Serialize;

use nexus_common::error::{BlobError, BlobResult};

const FRAME_HEADER: usize = 12;

/// Writes `value` to `path` atomically.
pub(crate) fn save<T: Serialize>(path: &Path, magic: u32, value: &T) -> BlobResult<()> {
    let body = bincode::serialize(value)
        .map_err(|e| BlobError::serialization(format!("{}: {e}", path.display())))?;
    let len = u32::try_from(body.len())
        .map_err(|_| BlobError::serialization(format!("{} is too large", path.display())))?;

    let mut buf = Vec::with_capacity(FRAME_HEADER + body.len());
    buf.put_u32(magic);
    buf.put_u32(len);
    buf.put_u32(crc32fast::hash(&body));
    buf.put_slice(&body);

    let tmp_path = path.with_extension("tmp");
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&tmp_path)?;
    file.write_all(&buf)?;
    file.sync_all()?;
    drop(file);

    fs::rename(&tmp_path, path)?;
    if let Some(dir) = path.parent() {
        if let Ok(dir) = File::open(dir) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

/// Reads a file written by [`save`]; `None` if it does not exist.
pub(crate) fn load<T: DeserializeOwned>(path: &Path, magic: u32) -> BlobResult<Option<T>> {
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes)?;
    if bytes.len() < FRAME_HEADER {
        return Err(BlobError::corruption(format!("{} is truncated", path.display())));
    }

    let mut header = &bytes[..FRAME_HEADER];
    let stored_magic = header.get_u32();
    if stored_magic != magic {
        return Err(BlobError::corruption(format!(
            "{} has magic {stored_magic:#010x}, expected {magic:#010x}",
            path.display()
        )));
    }
    let len = header.get_u32() as usize;
    let crc = header.get_u32();
    let body = bytes
        .get(FRAME_HEADER..FRAME_HEADER + len)
        .ok_or_else(|| BlobError::corruption(format!("{} is truncated", path.display())))?;
    if crc32fast::hash(body) != crc {
        return Err(BlobError::corruption(format!(
            "{} checksum mismatch",
            path.display()
        )));
    }

    bincode::deserialize(body)
        .map(Some)
        .map_err(|e| BlobError::serialization(format!("{}: {e}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_save_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("x.meta");
        assert!(load::<Vec<u32>>(&path, 7).unwrap().is_none());

        save(&path, 7, &vec![1u32, 2, 3]).unwrap();
        assert_eq!(load::<Vec<u32>>(&path, 7).unwrap(), Some(vec![1, 2, 3]));
        assert!(load::<Vec<u32>>(&path, 8).unwrap_err().is_corruption());
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn test_detects_damage() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("x.meta");
        save(&path, 7, &"hello".to_string()).unwrap();
        let mut bytes = fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        fs::write(&path, bytes).unwrap();
        assert!(load::<String>(&path, 7).unwrap_err().is_corruption());
    }
}
