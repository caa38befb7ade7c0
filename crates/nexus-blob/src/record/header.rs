//! BLOB record header codec.
//!
//! ```text
//! offset  size  field
//!      0     4  magic
//!      4     2  head_size        total header size, fixed + variable region
//!      6     2  ref_size         size of one reference slot
//!      8     2  ref_count        number of reference slots
//!     10     2  mdata_size       size of the metadata block
//!     12     1  storage_type
//!     13     1  status
//!     14     1  flags
//!     15     1  reserved
//!     16     4  alias_hash
//!     20     4  auth_code
//!     24     8  repo_size        bytes following the header in the repository
//!     32     8  data_size        logical BLOB size
//!     40    16  checksum         MD5 of the payload
//!     56     4  create_time
//!     60     4  mod_time
//!     64     4  last_access
//!     68     4  access_count
//!     72     4  backup_id
//!     76     4  cloud_ref
//!     80     4  cloud_seq
//!     84     4  reserved
//!     88        variable region: ref slots ->      <- metadata block
//! ```
//!
//! The variable region is shared by two independent growth directions. All
//! growth goes through [`BlobHeader::try_grow_refs`] and
//! [`BlobHeader::try_grow_metadata`], which never overflow the declared
//! `head_size`; when growth does not fit they return [`Growth::Relocate`] and
//! the caller moves the record.

use bitflags::bitflags;
use bytes::{Buf, BufMut};

use nexus_common::config::StorageType;
use nexus_common::constants::{BLOB_MAGIC, REF_SLOT_SIZE};
use nexus_common::error::{BlobError, BlobResult};
use nexus_common::types::{AuthCode, BackupId, BlobId, RefId, TableId, Timestamp};
use nexus_templog::LogPosition;

use super::metadata::{alias_hash, Metadata};
use super::slots::{RefSlot, MAX_TABLE_INDEX};

/// Size of the fixed part of a record header.
pub const MIN_HEAD_SIZE: usize = 88;

/// Reference slots added on top of the required size when a record is
/// relocated, so the next few references do not relocate again.
const RELOCATION_SLACK_SLOTS: usize = 4;

/// Largest record a repository file can hold; file offsets are signed.
const MAX_REPO_SIZE: u64 = i64::MAX as u64;

bitflags! {
    /// Record header flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BlobFlags: u8 {
        /// Metadata contains an alias.
        const HAS_ALIAS = 0x01;
        /// Metadata block is non-empty.
        const HAS_METADATA = 0x02;
    }
}

/// Lifecycle state of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum BlobStatus {
    /// Created; may have no committed references yet.
    Allocated = 1,
    /// At least one committed blob reference.
    Referenced = 2,
    /// No references left; reclaimable.
    Deleted = 3,
    /// Superseded while a backup was running; reclaim deferred.
    Moved = 4,
}

impl BlobStatus {
    /// Converts from the on-disk byte.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Allocated),
            2 => Some(Self::Referenced),
            3 => Some(Self::Deleted),
            4 => Some(Self::Moved),
            _ => None,
        }
    }

    /// Returns true if the record is reachable through a handle.
    pub fn is_live(self) -> bool {
        matches!(self, Self::Allocated | Self::Referenced)
    }
}

/// Result of a growth attempt on the variable region.
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Growth {
    /// The change was applied in place.
    Fits,
    /// The record must be moved to a header of at least this size.
    Relocate {
        /// Header size that would hold the change.
        required_head_size: usize,
    },
}

/// The fields needed to walk a repository without decoding slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedHeader {
    /// Total header size.
    pub head_size: usize,
    /// Bytes following the header.
    pub repo_size: u64,
    /// Lifecycle state.
    pub status: BlobStatus,
}

impl FixedHeader {
    /// Total size of the record in the repository, or None if the sizes
    /// overflow.
    pub fn record_size(&self) -> Option<u64> {
        (self.head_size as u64).checked_add(self.repo_size)
    }
}

/// Decoded BLOB record header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobHeader {
    head_size: usize,
    /// Where the payload lives.
    pub storage_type: StorageType,
    /// Lifecycle state.
    pub status: BlobStatus,
    /// Capability value.
    pub auth_code: AuthCode,
    /// Bytes following the header in the repository.
    pub repo_size: u64,
    /// Logical BLOB size.
    pub data_size: u64,
    /// MD5 of the payload.
    pub checksum: [u8; 16],
    /// Creation time.
    pub create_time: Timestamp,
    /// Last header modification.
    pub mod_time: Timestamp,
    /// Last read.
    pub last_access: Timestamp,
    /// Number of reads.
    pub access_count: u32,
    /// Backup that last copied this record.
    pub backup_id: BackupId,
    /// Cloud configuration the object was stored under.
    pub cloud_ref: u32,
    /// Per-record sequence number for the cloud key.
    pub cloud_seq: u32,
    refs: Vec<RefSlot>,
    metadata: Metadata,
}

impl BlobHeader {
    /// Creates a header for a new record with `ref_slots` free slots.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        storage_type: StorageType,
        auth_code: AuthCode,
        data_size: u64,
        repo_size: u64,
        checksum: [u8; 16],
        metadata: Metadata,
        ref_slots: u16,
    ) -> BlobResult<Self> {
        let head_size =
            MIN_HEAD_SIZE + usize::from(ref_slots) * REF_SLOT_SIZE + metadata.encoded_len();
        Self::check_head_size(head_size)?;
        let now = Timestamp::now();

        Ok(Self {
            head_size,
            storage_type,
            status: BlobStatus::Allocated,
            auth_code,
            repo_size,
            data_size,
            checksum,
            create_time: now,
            mod_time: now,
            last_access: now,
            access_count: 0,
            backup_id: BackupId::INVALID,
            cloud_ref: 0,
            cloud_seq: 0,
            refs: vec![RefSlot::Free; usize::from(ref_slots)],
            metadata,
        })
    }

    fn check_head_size(head_size: usize) -> BlobResult<()> {
        if head_size > usize::from(u16::MAX) {
            return Err(BlobError::invalid_argument(format!(
                "record header of {head_size} bytes exceeds {} bytes",
                u16::MAX
            )));
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Sizes and growth
    // -------------------------------------------------------------------------

    /// Total header size.
    pub fn head_size(&self) -> usize {
        self.head_size
    }

    /// Total size of the record in the repository.
    pub fn record_size(&self) -> u64 {
        self.head_size as u64 + self.repo_size
    }

    /// Unused bytes in the variable region.
    pub fn var_space(&self) -> usize {
        self.head_size - self.used_size()
    }

    fn used_size(&self) -> usize {
        MIN_HEAD_SIZE + self.refs.len() * REF_SLOT_SIZE + self.metadata.encoded_len()
    }

    fn relocation_size(&self, extra: usize) -> usize {
        self.used_size() + extra + RELOCATION_SLACK_SLOTS * REF_SLOT_SIZE
    }

    /// Adds `count` free reference slots if they fit.
    pub fn try_grow_refs(&mut self, count: usize) -> Growth {
        let needed = count * REF_SLOT_SIZE;
        if needed <= self.var_space() {
            self.refs
                .extend(std::iter::repeat(RefSlot::Free).take(count));
            Growth::Fits
        } else {
            Growth::Relocate {
                required_head_size: self.relocation_size(needed),
            }
        }
    }

    /// Replaces the metadata block if the new one fits.
    ///
    /// On [`Growth::Relocate`] the header is left unchanged.
    pub fn try_grow_metadata(&mut self, metadata: Metadata) -> Growth {
        let current = self.metadata.encoded_len();
        let wanted = metadata.encoded_len();
        if wanted <= current || wanted - current <= self.var_space() {
            self.metadata = metadata;
            Growth::Fits
        } else {
            Growth::Relocate {
                required_head_size: self.relocation_size(wanted - current),
            }
        }
    }

    /// Enlarges the header to `head_size` bytes, for relocation.
    pub fn grow_to(&mut self, head_size: usize) -> BlobResult<()> {
        Self::check_head_size(head_size)?;
        if head_size > self.head_size {
            self.head_size = head_size;
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Reference slots
    // -------------------------------------------------------------------------

    /// All reference slots.
    pub fn refs(&self) -> &[RefSlot] {
        &self.refs
    }

    /// Overwrites one slot.
    pub fn set_slot(&mut self, index: usize, slot: RefSlot) {
        self.refs[index] = slot;
    }

    /// Places `slot` in a free slot, growing the slot array if it fits.
    pub fn insert_slot(&mut self, slot: RefSlot) -> Result<usize, Growth> {
        if let Some(index) = self.refs.iter().position(RefSlot::is_free) {
            self.refs[index] = slot;
            return Ok(index);
        }
        match self.try_grow_refs(1) {
            Growth::Fits => {
                let index = self.refs.len() - 1;
                self.refs[index] = slot;
                Ok(index)
            }
            relocate => Err(relocate),
        }
    }

    /// Returns the 0-based index of the table reference for `table_id`.
    pub fn table_ref_index(&self, table_id: TableId) -> Option<usize> {
        self.refs.iter().position(
            |slot| matches!(slot, RefSlot::Table { table_id: t, .. } if *t == table_id),
        )
    }

    /// Iterates over table references as `(index, table_id, blob_id)`.
    pub fn table_refs(&self) -> impl Iterator<Item = (usize, TableId, BlobId)> + '_ {
        self.refs.iter().enumerate().filter_map(|(i, slot)| match *slot {
            RefSlot::Table { table_id, blob_id } => Some((i, table_id, blob_id)),
            _ => None,
        })
    }

    /// Iterates over blob references of one table reference as
    /// `(index, column, ref_id)`.
    pub fn blob_refs_of(&self, table_index: usize) -> impl Iterator<Item = (usize, u16, RefId)> + '_ {
        let tag = table_index + 1;
        self.refs.iter().enumerate().filter_map(move |(i, slot)| match *slot {
            RefSlot::Blob {
                table_index,
                column,
                ref_id,
            } if usize::from(table_index) == tag => Some((i, column, ref_id)),
            _ => None,
        })
    }

    /// Finds the slot of a blob reference by id and commit state.
    pub fn find_blob_ref(&self, table_index: usize, ref_id: RefId, uncommitted: bool) -> Option<usize> {
        let wanted = if uncommitted {
            ref_id.uncommitted()
        } else {
            ref_id.committed()
        };
        self.blob_refs_of(table_index)
            .find(|(_, _, r)| *r == wanted)
            .map(|(i, _, _)| i)
    }

    /// Creates the blob reference slot pointing at a table reference.
    pub fn blob_ref_slot(table_index: usize, column: u16, ref_id: RefId) -> BlobResult<RefSlot> {
        let tag = u16::try_from(table_index + 1)
            .ok()
            .filter(|t| *t <= MAX_TABLE_INDEX)
            .ok_or_else(|| BlobError::invalid_argument("too many table references"))?;
        Ok(RefSlot::Blob {
            table_index: tag,
            column,
            ref_id,
        })
    }

    /// Number of committed blob references.
    pub fn committed_ref_count(&self) -> usize {
        self.refs.iter().filter(|s| s.is_committed_ref()).count()
    }

    /// Number of uncommitted blob references.
    pub fn uncommitted_ref_count(&self) -> usize {
        self.refs.iter().filter(|s| s.is_uncommitted_ref()).count()
    }

    /// Number of committed blob references through one table reference.
    pub fn committed_refs_of(&self, table_index: usize) -> usize {
        self.blob_refs_of(table_index)
            .filter(|(_, _, r)| !r.is_uncommitted())
            .count()
    }

    /// Returns the pending deletion marker as `(index, position, queued)`.
    pub fn deletion_marker(&self) -> Option<(usize, LogPosition, Timestamp)> {
        self.refs.iter().enumerate().find_map(|(i, slot)| match *slot {
            RefSlot::Deletion { log, queued } => Some((i, log, queued)),
            _ => None,
        })
    }

    /// Frees a table reference and every blob reference bound to it.
    pub fn free_table_ref(&mut self, table_index: usize) {
        let bound: Vec<usize> = self.blob_refs_of(table_index).map(|(i, _, _)| i).collect();
        for i in bound {
            self.refs[i] = RefSlot::Free;
        }
        self.refs[table_index] = RefSlot::Free;
    }

    /// Frees every uncommitted blob reference. Returns how many were freed.
    pub fn discard_uncommitted(&mut self) -> usize {
        let mut freed = 0;
        for slot in self.refs.iter_mut().filter(|s| s.is_uncommitted_ref()) {
            *slot = RefSlot::Free;
            freed += 1;
        }
        freed
    }

    /// Clears every slot that is not a committed reference or a table
    /// reference holding one. Used when copying a record into a backup.
    pub fn retain_committed(&mut self) {
        let keep_tables: Vec<usize> = self
            .table_refs()
            .filter(|(i, _, _)| self.committed_refs_of(*i) > 0)
            .map(|(i, _, _)| i)
            .collect();
        for (i, slot) in self.refs.iter_mut().enumerate() {
            let keep = match slot {
                RefSlot::Table { .. } => keep_tables.contains(&i),
                RefSlot::Blob { ref_id, .. } => !ref_id.is_uncommitted(),
                _ => false,
            };
            if !keep {
                *slot = RefSlot::Free;
            }
        }
    }

    // -------------------------------------------------------------------------
    // Metadata
    // -------------------------------------------------------------------------

    /// The metadata block.
    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// Returns the alias, if any.
    pub fn alias(&self) -> Option<&str> {
        self.metadata.alias()
    }

    // -------------------------------------------------------------------------
    // Codec
    // -------------------------------------------------------------------------

    /// Serializes the header to exactly `head_size` bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mdata_size = self.metadata.encoded_len();
        let mut flags = BlobFlags::empty();
        if self.metadata.alias().is_some() {
            flags |= BlobFlags::HAS_ALIAS;
        }
        if mdata_size > 0 {
            flags |= BlobFlags::HAS_METADATA;
        }

        let mut buf = Vec::with_capacity(self.head_size);
        buf.put_u32(BLOB_MAGIC);
        buf.put_u16(self.head_size as u16);
        buf.put_u16(REF_SLOT_SIZE as u16);
        buf.put_u16(self.refs.len() as u16);
        buf.put_u16(mdata_size as u16);
        buf.put_u8(self.storage_type as u8);
        buf.put_u8(self.status as u8);
        buf.put_u8(flags.bits());
        buf.put_u8(0);
        buf.put_u32(self.metadata.alias().map_or(0, alias_hash));
        buf.put_u32(self.auth_code.as_u32());
        buf.put_u64(self.repo_size);
        buf.put_u64(self.data_size);
        buf.put_slice(&self.checksum);
        buf.put_u32(self.create_time.as_secs());
        buf.put_u32(self.mod_time.as_secs());
        buf.put_u32(self.last_access.as_secs());
        buf.put_u32(self.access_count);
        buf.put_u32(self.backup_id.as_u32());
        buf.put_u32(self.cloud_ref);
        buf.put_u32(self.cloud_seq);
        buf.put_u32(0);
        debug_assert_eq!(buf.len(), MIN_HEAD_SIZE);

        for slot in &self.refs {
            slot.encode(&mut buf);
        }
        buf.resize(self.head_size - mdata_size, 0);
        self.metadata.encode(&mut buf);
        debug_assert_eq!(buf.len(), self.head_size);
        buf
    }

    /// Validates the fixed part and returns the sizes needed to skip the
    /// record. Fails with `Corruption` on any structural inconsistency.
    pub fn peek_fixed(bytes: &[u8]) -> BlobResult<FixedHeader> {
        if bytes.len() < MIN_HEAD_SIZE {
            return Err(BlobError::corruption("record header is truncated"));
        }
        let mut buf = bytes;
        let magic = buf.get_u32();
        if magic != BLOB_MAGIC {
            return Err(BlobError::corruption(format!(
                "invalid record magic {magic:#010x}"
            )));
        }
        let head_size = usize::from(buf.get_u16());
        let ref_size = usize::from(buf.get_u16());
        let ref_count = usize::from(buf.get_u16());
        let mdata_size = usize::from(buf.get_u16());
        let storage_type = buf.get_u8();
        let status = buf.get_u8();

        if ref_size != REF_SLOT_SIZE {
            return Err(BlobError::corruption(format!("invalid ref size {ref_size}")));
        }
        if MIN_HEAD_SIZE + ref_count * ref_size + mdata_size > head_size {
            return Err(BlobError::corruption(format!(
                "{ref_count} refs and {mdata_size} metadata bytes exceed header size {head_size}"
            )));
        }
        if StorageType::from_u8(storage_type).is_none() {
            return Err(BlobError::corruption(format!(
                "invalid storage type {storage_type}"
            )));
        }
        let status = BlobStatus::from_u8(status)
            .ok_or_else(|| BlobError::corruption(format!("invalid status {status}")))?;

        let mut rest = &bytes[24..32];
        let repo_size = rest.get_u64();
        if repo_size > MAX_REPO_SIZE - head_size as u64 {
            return Err(BlobError::corruption(format!(
                "record size {repo_size} exceeds the largest repository file"
            )));
        }

        Ok(FixedHeader {
            head_size,
            repo_size,
            status,
        })
    }

    /// Deserializes a full header.
    pub fn decode(bytes: &[u8]) -> BlobResult<Self> {
        let fixed = Self::peek_fixed(bytes)?;
        if bytes.len() < fixed.head_size {
            return Err(BlobError::corruption(format!(
                "record header needs {} bytes, got {}",
                fixed.head_size,
                bytes.len()
            )));
        }

        let mut buf = &bytes[8..];
        let ref_count = usize::from(buf.get_u16());
        let mdata_size = usize::from(buf.get_u16());
        let storage_type = StorageType::from_u8(buf.get_u8())
            .ok_or_else(|| BlobError::corruption("invalid storage type"))?;
        let _status = buf.get_u8();
        let _flags = BlobFlags::from_bits_truncate(buf.get_u8());
        let _reserved = buf.get_u8();
        let _alias_hash = buf.get_u32();
        let auth_code = AuthCode::new(buf.get_u32());
        let repo_size = buf.get_u64();
        let data_size = buf.get_u64();
        let mut checksum = [0u8; 16];
        buf.copy_to_slice(&mut checksum);
        let create_time = Timestamp::from_secs(buf.get_u32());
        let mod_time = Timestamp::from_secs(buf.get_u32());
        let last_access = Timestamp::from_secs(buf.get_u32());
        let access_count = buf.get_u32();
        let backup_id = BackupId::new(buf.get_u32());
        let cloud_ref = buf.get_u32();
        let cloud_seq = buf.get_u32();

        let refs: Vec<RefSlot> = bytes[MIN_HEAD_SIZE..MIN_HEAD_SIZE + ref_count * REF_SLOT_SIZE]
            .chunks_exact(REF_SLOT_SIZE)
            .map(RefSlot::decode)
            .collect();

        for slot in &refs {
            if let RefSlot::Blob { table_index, .. } = slot {
                let target = usize::from(*table_index);
                let valid = target >= 1
                    && target <= refs.len()
                    && matches!(refs[target - 1], RefSlot::Table { .. });
                if !valid {
                    return Err(BlobError::corruption(format!(
                        "blob reference points at slot {table_index} which is not a table reference"
                    )));
                }
            }
        }

        let metadata =
            Metadata::decode(&bytes[fixed.head_size - mdata_size..fixed.head_size])?;

        Ok(Self {
            head_size: fixed.head_size,
            storage_type,
            status: fixed.status,
            auth_code,
            repo_size,
            data_size,
            checksum,
            create_time,
            mod_time,
            last_access,
            access_count,
            backup_id,
            cloud_ref,
            cloud_seq,
            refs,
            metadata,
        })
    }
}
