//! Repository file header.
//!
//! ```text
//! +--------+---------+-----------+----------------+----------+----------+
//! | magic  | version | head_size | blob_head_size | ref_size | reserved |
//! |   4    |    2    |     2     |       2        |    2     |    4     |
//! +--------+---------+-----------+----------------+----------+----------+
//! | garbage (8) | recovery_offset (8) | last_temp_time (4) | create (4) |
//! +-------------+---------------------+--------------------+------------+
//! | reserved (20)                                          | crc32 (4)  |
//! +--------------------------------------------------------+------------+
//! ```

use bytes::{Buf, BufMut};

use nexus_common::constants::{REF_SLOT_SIZE, REPO_HEADER_SIZE, REPO_MAGIC, REPO_VERSION};
use nexus_common::error::{BlobError, BlobResult};
use nexus_common::types::Timestamp;

use crate::record::MIN_HEAD_SIZE;

/// Persistent header at offset 0 of every repository file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RepoHeader {
    /// Default record header size for new records.
    pub blob_head_size: u16,
    /// Bytes occupied by dead records.
    pub garbage: u64,
    /// Offset up to which the file is known to be consistent.
    pub recovery_offset: u64,
    /// Time of the last temp-log action applied to this file.
    pub last_temp_time: Timestamp,
    /// Creation time.
    pub create_time: Timestamp,
}

impl RepoHeader {
    /// Header size in bytes.
    pub const SIZE: usize = REPO_HEADER_SIZE;

    /// Creates the header of an empty repository.
    pub fn new(default_ref_slots: u16) -> Self {
        let blob_head_size = MIN_HEAD_SIZE + usize::from(default_ref_slots) * REF_SLOT_SIZE;
        Self {
            blob_head_size: u16::try_from(blob_head_size).unwrap_or(u16::MAX),
            garbage: 0,
            recovery_offset: Self::SIZE as u64,
            last_temp_time: Timestamp::ZERO,
            create_time: Timestamp::now(),
        }
    }

    /// Serializes the header.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        let mut cursor = &mut buf[..];
        cursor.put_u32(REPO_MAGIC);
        cursor.put_u16(REPO_VERSION);
        cursor.put_u16(Self::SIZE as u16);
        cursor.put_u16(self.blob_head_size);
        cursor.put_u16(REF_SLOT_SIZE as u16);
        cursor.put_u32(0);
        cursor.put_u64(self.garbage);
        cursor.put_u64(self.recovery_offset);
        cursor.put_u32(self.last_temp_time.as_secs());
        cursor.put_u32(self.create_time.as_secs());

        let crc = crc32fast::hash(&buf[..Self::SIZE - 4]);
        buf[Self::SIZE - 4..].copy_from_slice(&crc.to_be_bytes());
        buf
    }

    /// Deserializes and validates a header.
    pub fn from_bytes(bytes: &[u8]) -> BlobResult<Self> {
        if bytes.len() < Self::SIZE {
            return Err(BlobError::corruption("repository header is truncated"));
        }
        let stored = (&bytes[Self::SIZE - 4..Self::SIZE]).get_u32();
        let computed = crc32fast::hash(&bytes[..Self::SIZE - 4]);
        if stored != computed {
            return Err(BlobError::corruption(format!(
                "repository header checksum mismatch: stored {stored:#010x}, computed {computed:#010x}"
            )));
        }

        let mut buf = bytes;
        let magic = buf.get_u32();
        if magic != REPO_MAGIC {
            return Err(BlobError::corruption(format!(
                "invalid repository magic {magic:#010x}"
            )));
        }
        let version = buf.get_u16();
        if version != REPO_VERSION {
            return Err(BlobError::protocol_mismatch(format!(
                "repository version {version}, expected {REPO_VERSION}"
            )));
        }
        let head_size = usize::from(buf.get_u16());
        let blob_head_size = buf.get_u16();
        let ref_size = usize::from(buf.get_u16());
        if head_size != Self::SIZE || ref_size != REF_SLOT_SIZE {
            return Err(BlobError::corruption(format!(
                "repository header declares head size {head_size} and ref size {ref_size}"
            )));
        }
        let _reserved = buf.get_u32();

        Ok(Self {
            blob_head_size,
            garbage: buf.get_u64(),
            recovery_offset: buf.get_u64(),
            last_temp_time: Timestamp::from_secs(buf.get_u32()),
            create_time: Timestamp::from_secs(buf.get_u32()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip() {
        let mut header = RepoHeader::new(4);
        header.garbage = 12345;
        header.last_temp_time = Timestamp::from_secs(99);
        let bytes = header.to_bytes();
        assert_eq!(RepoHeader::from_bytes(&bytes).unwrap(), header);
        assert_eq!(usize::from(header.blob_head_size), MIN_HEAD_SIZE + 4 * REF_SLOT_SIZE);
    }

    #[test]
    fn test_header_checksum() {
        let mut bytes = RepoHeader::new(4).to_bytes();
        bytes[20] ^= 0x01;
        assert!(RepoHeader::from_bytes(&bytes).unwrap_err().is_corruption());
        assert!(RepoHeader::from_bytes(&bytes[..10]).is_err());
    }
}
