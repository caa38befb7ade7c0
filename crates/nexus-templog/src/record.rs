//! Temp log record formats.
//!
//! A segment starts with a 32-byte [`SegmentHeader`] followed by fixed-size
//! 32-byte [`ActionRecord`]s. Records are never rewritten in place.
//!
//! ```text
//! +--------+-------+----------+----------+-------------+----------+----------+----------+-------+
//! | Type(1)| Rsv(1)| Rsv(2)   | Table(4) | BlobId(8)   | Auth(4)  | Time(4)  | Rsv(4)   | CRC(4)|
//! +--------+-------+----------+----------+-------------+----------+----------+----------+-------+
//! ```

use std::fmt;

use bitflags::bitflags;
use bytes::{Buf, BufMut};

use nexus_common::constants::{TEMP_LOG_MAGIC, TEMP_LOG_VERSION};
use nexus_common::types::{AuthCode, BlobId, TableId, Timestamp};

use crate::error::{TempLogError, TempLogResult};

/// Kind of deferred action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ActionType {
    /// A BLOB was created and has not been referenced yet.
    TempBlob = 1,
    /// The last reference to a BLOB was released.
    ReleaseBlob = 2,
    /// A table was soft-deleted.
    DropTable = 3,
}

impl ActionType {
    /// Converts the action type to a u8.
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Creates an action type from a u8.
    pub fn from_u8(value: u8) -> TempLogResult<Self> {
        match value {
            1 => Ok(Self::TempBlob),
            2 => Ok(Self::ReleaseBlob),
            3 => Ok(Self::DropTable),
            _ => Err(TempLogError::deserialization_error(format!(
                "unknown action type: {value}"
            ))),
        }
    }

    /// Returns true if the action targets a single BLOB.
    pub const fn is_blob_action(self) -> bool {
        matches!(self, Self::TempBlob | Self::ReleaseBlob)
    }
}

/// Location of a record in the temp log.
///
/// A BLOB header's deletion marker stores this position; the action only
/// takes effect if the marker still matches when the record is processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct LogPosition {
    /// Segment id.
    pub log_id: u32,
    /// Byte offset of the record within the segment.
    pub offset: u32,
}

impl LogPosition {
    /// Creates a new position.
    pub const fn new(log_id: u32, offset: u32) -> Self {
        Self { log_id, offset }
    }

    /// Returns the position of the first record of a segment.
    pub const fn segment_start(log_id: u32) -> Self {
        Self::new(log_id, SegmentHeader::SIZE as u32)
    }

    /// Returns the position of the following record.
    pub const fn next_record(self) -> Self {
        Self::new(self.log_id, self.offset + ActionRecord::SIZE as u32)
    }
}

impl fmt::Display for LogPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.log_id, self.offset)
    }
}

/// One deferred action (32 bytes on disk).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActionRecord {
    /// What to do.
    pub action: ActionType,
    /// Table the action applies to.
    pub table_id: TableId,
    /// BLOB the action applies to (invalid for table actions).
    pub blob_id: BlobId,
    /// Auth code of the BLOB when the action was queued.
    pub auth_code: AuthCode,
    /// When the action was queued.
    pub time: Timestamp,
}

impl ActionRecord {
    /// Size of a record in bytes.
    pub const SIZE: usize = 32;

    /// Creates a BLOB action.
    pub fn blob(
        action: ActionType,
        table_id: TableId,
        blob_id: BlobId,
        auth_code: AuthCode,
        time: Timestamp,
    ) -> Self {
        Self {
            action,
            table_id,
            blob_id,
            auth_code,
            time,
        }
    }

    /// Creates a drop-table action.
    pub fn drop_table(table_id: TableId, time: Timestamp) -> Self {
        Self {
            action: ActionType::DropTable,
            table_id,
            blob_id: BlobId::INVALID,
            auth_code: AuthCode::new(0),
            time,
        }
    }

    /// Returns the time at which the action becomes due.
    pub fn due_at(&self, grace_secs: u64) -> Timestamp {
        self.time.add_secs(grace_secs)
    }

    fn serialize_body(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.action.as_u8());
        buf.put_u8(0); // reserved
        buf.put_u16(0); // reserved
        buf.put_u32(self.table_id.as_u32());
        buf.put_u64(self.blob_id.as_u64());
        buf.put_u32(self.auth_code.as_u32());
        buf.put_u32(self.time.as_secs());
        buf.put_u32(0); // reserved
    }

    /// Serializes the record, including its checksum.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        {
            let mut cursor = &mut buf[..Self::SIZE - 4];
            self.serialize_body(&mut cursor);
        }
        let crc = crc32fast::hash(&buf[..Self::SIZE - 4]);
        buf[Self::SIZE - 4..].copy_from_slice(&crc.to_be_bytes());
        buf
    }

    /// Returns true if the slice is an all-zero (never written) record.
    pub fn is_blank(bytes: &[u8]) -> bool {
        bytes.iter().all(|b| *b == 0)
    }

    /// Deserializes a record, verifying its checksum.
    pub fn from_bytes(bytes: &[u8], position: LogPosition) -> TempLogResult<Self> {
        if bytes.len() < Self::SIZE {
            return Err(TempLogError::deserialization_error(format!(
                "not enough bytes for action record: {} < {}",
                bytes.len(),
                Self::SIZE
            )));
        }

        let computed = crc32fast::hash(&bytes[..Self::SIZE - 4]);
        let mut tail = &bytes[Self::SIZE - 4..Self::SIZE];
        let expected = tail.get_u32();
        if computed != expected {
            return Err(TempLogError::ChecksumMismatch {
                position,
                expected,
                computed,
            });
        }

        let mut buf = &bytes[..Self::SIZE - 4];
        let action = ActionType::from_u8(buf.get_u8())?;
        let _reserved = buf.get_u8();
        let _reserved = buf.get_u16();
        let table_id = TableId::new(buf.get_u32());
        let blob_id = BlobId::new(buf.get_u64());
        let auth_code = AuthCode::new(buf.get_u32());
        let time = Timestamp::from_secs(buf.get_u32());

        Ok(Self {
            action,
            table_id,
            blob_id,
            auth_code,
            time,
        })
    }
}

bitflags! {
    /// Segment header flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SegmentFlags: u8 {
        /// No further records will be appended.
        const SEALED = 0x01;
    }
}

/// Header at the start of every segment (32 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentHeader {
    /// Segment id.
    pub log_id: u32,
    /// Size of each action record.
    pub record_size: u16,
    /// Segment flags.
    pub flags: SegmentFlags,
    /// Creation time.
    pub create_time: Timestamp,
}

impl SegmentHeader {
    /// Size of the header in bytes.
    pub const SIZE: usize = 32;

    /// Creates a header for a new segment.
    pub fn new(log_id: u32) -> Self {
        Self {
            log_id,
            record_size: ActionRecord::SIZE as u16,
            flags: SegmentFlags::empty(),
            create_time: Timestamp::now(),
        }
    }

    /// Serializes the header.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        {
            let mut cursor = &mut buf[..Self::SIZE - 4];
            cursor.put_u32(TEMP_LOG_MAGIC);
            cursor.put_u16(TEMP_LOG_VERSION);
            cursor.put_u16(Self::SIZE as u16);
            cursor.put_u16(self.record_size);
            cursor.put_u8(self.flags.bits());
            cursor.put_u8(0);
            cursor.put_u32(self.log_id);
            cursor.put_u32(self.create_time.as_secs());
            cursor.put_bytes(0, 8);
        }
        let crc = crc32fast::hash(&buf[..Self::SIZE - 4]);
        buf[Self::SIZE - 4..].copy_from_slice(&crc.to_be_bytes());
        buf
    }

    /// Deserializes and validates a header.
    pub fn from_bytes(bytes: &[u8]) -> TempLogResult<Self> {
        if bytes.len() < Self::SIZE {
            return Err(TempLogError::deserialization_error(
                "segment header is truncated",
            ));
        }

        let mut buf = bytes;
        let magic = buf.get_u32();
        if magic != TEMP_LOG_MAGIC {
            return Err(TempLogError::InvalidMagic {
                expected: TEMP_LOG_MAGIC,
                found: magic,
            });
        }
        let version = buf.get_u16();
        if version != TEMP_LOG_VERSION {
            return Err(TempLogError::UnsupportedVersion {
                expected: TEMP_LOG_VERSION,
                found: version,
            });
        }
        let head_size = buf.get_u16();
        let record_size = buf.get_u16();
        let flags = SegmentFlags::from_bits_truncate(buf.get_u8());
        let _reserved = buf.get_u8();
        let log_id = buf.get_u32();
        let create_time = Timestamp::from_secs(buf.get_u32());

        let computed = crc32fast::hash(&bytes[..Self::SIZE - 4]);
        let mut tail = &bytes[Self::SIZE - 4..Self::SIZE];
        if tail.get_u32() != computed {
            return Err(TempLogError::segment_corrupted(
                log_id,
                "segment header checksum mismatch",
            ));
        }
        if head_size as usize != Self::SIZE || record_size as usize != ActionRecord::SIZE {
            return Err(TempLogError::segment_corrupted(
                log_id,
                format!("unexpected layout: head {head_size}, record {record_size}"),
            ));
        }

        Ok(Self {
            log_id,
            record_size,
            flags,
            create_time,
        })
    }

    /// Returns true if the segment has been sealed.
    pub fn is_sealed(&self) -> bool {
        self.flags.contains(SegmentFlags::SEALED)
    }
}
