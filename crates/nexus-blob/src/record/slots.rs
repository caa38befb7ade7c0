//! Reference slots.
//!
//! Each slot is 16 bytes. The first u16 is a tag:
//!
//! ```text
//! 0x0000          free
//! 0xFFFF          table reference   | tag | rsv(2) | table_id(4) | blob_id(8)          |
//! 0xFFFE          deletion marker   | tag | rsv(2) | log_id(4) | offset(4) | time(4)  |
//! anything else   blob reference    | tag | column(2) | ref_id(8) | rsv(4)            |
//! ```
//!
//! For a blob reference the tag is the 1-based index of the table reference
//! it belongs to.

use bytes::{Buf, BufMut};

use nexus_common::constants::REF_SLOT_SIZE;
use nexus_common::types::{BlobId, RefId, TableId, Timestamp};
use nexus_templog::LogPosition;

const TAG_FREE: u16 = 0x0000;
const TAG_TABLE: u16 = 0xFFFF;
const TAG_DELETION: u16 = 0xFFFE;

/// Largest table-reference index a blob reference can carry.
pub const MAX_TABLE_INDEX: u16 = TAG_DELETION - 1;

/// One reference slot of a BLOB record header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefSlot {
    /// Unused slot.
    Free,
    /// A table that points at this BLOB.
    Table {
        /// Referencing table.
        table_id: TableId,
        /// The BLOB's id within that table.
        blob_id: BlobId,
    },
    /// Pending deletion queued in the temp log.
    Deletion {
        /// Position of the queued action.
        log: LogPosition,
        /// When the action was queued.
        queued: Timestamp,
    },
    /// One row-level pointer.
    Blob {
        /// 1-based index of the owning table reference.
        table_index: u16,
        /// Column ordinal in the referencing row.
        column: u16,
        /// Reference id, possibly tagged uncommitted.
        ref_id: RefId,
    },
}

impl RefSlot {
    /// Size of a slot in bytes.
    pub const SIZE: usize = REF_SLOT_SIZE;

    /// Serializes the slot.
    pub fn encode(&self, buf: &mut impl BufMut) {
        match *self {
            Self::Free => buf.put_bytes(0, Self::SIZE),
            Self::Table { table_id, blob_id } => {
                buf.put_u16(TAG_TABLE);
                buf.put_u16(0);
                buf.put_u32(table_id.as_u32());
                buf.put_u64(blob_id.as_u64());
            }
            Self::Deletion { log, queued } => {
                buf.put_u16(TAG_DELETION);
                buf.put_u16(0);
                buf.put_u32(log.log_id);
                buf.put_u32(log.offset);
                buf.put_u32(queued.as_secs());
            }
            Self::Blob {
                table_index,
                column,
                ref_id,
            } => {
                buf.put_u16(table_index);
                buf.put_u16(column);
                buf.put_u64(ref_id.raw());
                buf.put_u32(0);
            }
        }
    }

    /// Deserializes a slot from exactly [`RefSlot::SIZE`] bytes.
    pub fn decode(mut buf: &[u8]) -> Self {
        let tag = buf.get_u16();
        match tag {
            TAG_FREE => Self::Free,
            TAG_TABLE => {
                let _reserved = buf.get_u16();
                Self::Table {
                    table_id: TableId::new(buf.get_u32()),
                    blob_id: BlobId::new(buf.get_u64()),
                }
            }
            TAG_DELETION => {
                let _reserved = buf.get_u16();
                let log_id = buf.get_u32();
                let offset = buf.get_u32();
                Self::Deletion {
                    log: LogPosition::new(log_id, offset),
                    queued: Timestamp::from_secs(buf.get_u32()),
                }
            }
            table_index => Self::Blob {
                table_index,
                column: buf.get_u16(),
                ref_id: RefId::from_raw(buf.get_u64()),
            },
        }
    }

    /// Returns true for a free slot.
    pub fn is_free(&self) -> bool {
        matches!(self, Self::Free)
    }

    /// Returns true for a committed blob reference.
    pub fn is_committed_ref(&self) -> bool {
        matches!(self, Self::Blob { ref_id, .. } if !ref_id.is_uncommitted())
    }

    /// Returns true for an uncommitted blob reference.
    pub fn is_uncommitted_ref(&self) -> bool {
        matches!(self, Self::Blob { ref_id, .. } if ref_id.is_uncommitted())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(slot: RefSlot) -> RefSlot {
        let mut buf = Vec::new();
        slot.encode(&mut buf);
        assert_eq!(buf.len(), RefSlot::SIZE);
        RefSlot::decode(&buf)
    }

    #[test]
    fn test_slot_variants() {
        let slots = [
            RefSlot::Free,
            RefSlot::Table {
                table_id: TableId::new(9),
                blob_id: BlobId::new(1234),
            },
            RefSlot::Deletion {
                log: LogPosition::new(2, 96),
                queued: Timestamp::from_secs(77),
            },
            RefSlot::Blob {
                table_index: 1,
                column: 3,
                ref_id: RefId::new(55).uncommitted(),
            },
        ];
        for slot in slots {
            assert_eq!(roundtrip(slot), slot);
        }
    }

    #[test]
    fn test_ref_classification() {
        let committed = RefSlot::Blob {
            table_index: 1,
            column: 0,
            ref_id: RefId::new(1),
        };
        let pending = RefSlot::Blob {
            table_index: 1,
            column: 0,
            ref_id: RefId::new(1).uncommitted(),
        };
        assert!(committed.is_committed_ref());
        assert!(!committed.is_uncommitted_ref());
        assert!(pending.is_uncommitted_ref());
        assert!(!RefSlot::Free.is_committed_ref());
        assert!(RefSlot::decode(&[0u8; 16]).is_free());
    }
}
