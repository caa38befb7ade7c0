//! Table indirection files.
//!
//! Each table owns a file mapping its BLOB ids to physical record locations.
//! Ids are slot numbers (slot index + 1) and stay stable while records move
//! between repositories; only the slot is rewritten.
//!
//! ```text
//! table-00000003.bst
//! +--------------------------------------------------------------+
//! | header (32): magic, version, head size, slot size, table, crc|
//! +--------------------------------------------------------------+
//! | slot 1 (32) | slot 2 (32) | ...                              |
//! +--------------------------------------------------------------+
//!
//! slot: | state(1) | rsv(1) | head_size(2) | repo(4) | offset(8) |
//!       | size(8)  | auth(4) | rsv(4)                           |
//! ```

use std::collections::BTreeSet;
use std::fs::{self, File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use bytes::{Buf, BufMut};
use parking_lot::Mutex;

use nexus_common::constants::{MAX_BLOB_ID, TABLE_HEADER_SIZE, TABLE_MAGIC, TABLE_SLOT_SIZE, TABLE_VERSION};
use nexus_common::error::{BlobError, BlobResult};
use nexus_common::types::{AuthCode, BlobId, RepoId, TableId};

const SLOT_FREE: u8 = 0;
const SLOT_ALLOCATED: u8 = 1;
const SLOT_IN_USE: u8 = 2;

/// Physical location of a BLOB record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlobLocation {
    /// Repository holding the record.
    pub repo_id: RepoId,
    /// Offset of the record header.
    pub offset: u64,
    /// Record header size.
    pub head_size: u16,
    /// Logical BLOB size.
    pub size: u64,
    /// Capability value.
    pub auth_code: AuthCode,
}

impl BlobLocation {
    /// Returns true if the location names the record at `(repo_id, offset)`.
    pub fn is_at(&self, repo_id: RepoId, offset: u64) -> bool {
        self.repo_id == repo_id && self.offset == offset
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Free,
    Allocated,
    InUse(BlobLocation),
}

impl Slot {
    fn encode(&self) -> [u8; TABLE_SLOT_SIZE] {
        let mut buf = [0u8; TABLE_SLOT_SIZE];
        let mut cursor = &mut buf[..];
        match self {
            Self::Free => {}
            Self::Allocated => cursor.put_u8(SLOT_ALLOCATED),
            Self::InUse(loc) => {
                cursor.put_u8(SLOT_IN_USE);
                cursor.put_u8(0);
                cursor.put_u16(loc.head_size);
                cursor.put_u32(loc.repo_id.as_u32());
                cursor.put_u64(loc.offset);
                cursor.put_u64(loc.size);
                cursor.put_u32(loc.auth_code.as_u32());
            }
        }
        buf
    }

    fn decode(mut buf: &[u8]) -> Self {
        match buf.get_u8() {
            SLOT_ALLOCATED => Self::Allocated,
            SLOT_IN_USE => {
                let _reserved = buf.get_u8();
                let head_size = buf.get_u16();
                Self::InUse(BlobLocation {
                    repo_id: RepoId::new(buf.get_u32()),
                    offset: buf.get_u64(),
                    head_size,
                    size: buf.get_u64(),
                    auth_code: AuthCode::new(buf.get_u32()),
                })
            }
            // Unknown states are treated as free.
            _ => Self::Free,
        }
    }
}

struct Inner {
    file: File,
    slot_count: u64,
    free: BTreeSet<u64>,
}

/// Indirection file of one table.
pub struct TableIndirection {
    table_id: TableId,
    path: PathBuf,
    inner: Mutex<Inner>,
}

impl TableIndirection {
    /// File name of the indirection file of `table_id`.
    pub fn file_name(table_id: TableId) -> String {
        format!("table-{:08}.bst", table_id.as_u32())
    }

    fn encode_header(table_id: TableId) -> [u8; TABLE_HEADER_SIZE] {
        let mut buf = [0u8; TABLE_HEADER_SIZE];
        let mut cursor = &mut buf[..];
        cursor.put_u32(TABLE_MAGIC);
        cursor.put_u16(TABLE_VERSION);
        cursor.put_u16(TABLE_HEADER_SIZE as u16);
        cursor.put_u16(TABLE_SLOT_SIZE as u16);
        cursor.put_u16(0);
        cursor.put_u32(table_id.as_u32());
        let crc = crc32fast::hash(&buf[..TABLE_HEADER_SIZE - 4]);
        buf[TABLE_HEADER_SIZE - 4..].copy_from_slice(&crc.to_be_bytes());
        buf
    }

    fn check_header(bytes: &[u8], table_id: TableId) -> BlobResult<()> {
        let stored = (&bytes[TABLE_HEADER_SIZE - 4..]).get_u32();
        if stored != crc32fast::hash(&bytes[..TABLE_HEADER_SIZE - 4]) {
            return Err(BlobError::corruption(format!(
                "indirection header checksum mismatch for table {table_id}"
            )));
        }
        let mut buf = bytes;
        if buf.get_u32() != TABLE_MAGIC {
            return Err(BlobError::corruption("invalid indirection file magic"));
        }
        let version = buf.get_u16();
        if version != TABLE_VERSION {
            return Err(BlobError::protocol_mismatch(format!(
                "indirection version {version}, expected {TABLE_VERSION}"
            )));
        }
        let head_size = usize::from(buf.get_u16());
        let slot_size = usize::from(buf.get_u16());
        let _reserved = buf.get_u16();
        let stored_table = TableId::new(buf.get_u32());
        if head_size != TABLE_HEADER_SIZE || slot_size != TABLE_SLOT_SIZE || stored_table != table_id {
            return Err(BlobError::corruption(format!(
                "indirection file of table {table_id} has head size {head_size}, slot size {slot_size}, table {stored_table}"
            )));
        }
        Ok(())
    }

    /// Creates an empty indirection file in `dir`.
    pub fn create(table_id: TableId, dir: &Path) -> BlobResult<Self> {
        let path = dir.join(Self::file_name(table_id));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;
        file.write_all_at(&Self::encode_header(table_id), 0)?;
        file.sync_all()?;

        Ok(Self {
            table_id,
            path,
            inner: Mutex::new(Inner {
                file,
                slot_count: 0,
                free: BTreeSet::new(),
            }),
        })
    }

    /// Opens an indirection file and rebuilds its free list.
    ///
    /// Ids that were handed out but never located are reusable afterwards.
    pub fn open(table_id: TableId, path: PathBuf) -> BlobResult<Self> {
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let len = file.metadata()?.len();
        if len < TABLE_HEADER_SIZE as u64 {
            return Err(BlobError::corruption(format!(
                "indirection file {} is truncated",
                path.display()
            )));
        }
        let mut header = [0u8; TABLE_HEADER_SIZE];
        file.read_exact_at(&mut header, 0)?;
        Self::check_header(&header, table_id)?;

        let slot_count = (len - TABLE_HEADER_SIZE as u64) / TABLE_SLOT_SIZE as u64;
        let mut free = BTreeSet::new();
        let mut buf = [0u8; TABLE_SLOT_SIZE];
        for index in 0..slot_count {
            file.read_exact_at(&mut buf, Self::slot_offset(index))?;
            if !matches!(Slot::decode(&buf), Slot::InUse(_)) {
                free.insert(index);
            }
        }
        tracing::debug!(table = %table_id, slots = slot_count, free = free.len(), "opened indirection file");

        Ok(Self {
            table_id,
            path,
            inner: Mutex::new(Inner {
                file,
                slot_count,
                free,
            }),
        })
    }

    fn slot_offset(index: u64) -> u64 {
        TABLE_HEADER_SIZE as u64 + index * TABLE_SLOT_SIZE as u64
    }

    fn read_slot(inner: &Inner, index: u64) -> BlobResult<Slot> {
        let mut buf = [0u8; TABLE_SLOT_SIZE];
        inner.file.read_exact_at(&mut buf, Self::slot_offset(index))?;
        Ok(Slot::decode(&buf))
    }

    fn write_slot(inner: &Inner, index: u64, slot: Slot) -> BlobResult<()> {
        inner
            .file
            .write_all_at(&slot.encode(), Self::slot_offset(index))?;
        Ok(())
    }

    fn index_of(blob_id: BlobId) -> BlobResult<u64> {
        if !blob_id.is_valid() || blob_id.as_u64() > MAX_BLOB_ID {
            return Err(BlobError::not_found(format!("blob id {blob_id}")));
        }
        Ok(blob_id.slot_index())
    }

    /// Table id.
    pub fn table_id(&self) -> TableId {
        self.table_id
    }

    /// File path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Hands out an unused BLOB id.
    pub fn allocate_handle(&self) -> BlobResult<BlobId> {
        let mut inner = self.inner.lock();
        let index = match inner.free.pop_first() {
            Some(index) => index,
            None => {
                let index = inner.slot_count;
                if index >= MAX_BLOB_ID {
                    return Err(BlobError::busy(format!(
                        "table {} has no free blob ids",
                        self.table_id
                    )));
                }
                inner.slot_count += 1;
                index
            }
        };
        if let Err(e) = Self::write_slot(&inner, index, Slot::Allocated) {
            inner.free.insert(index);
            return Err(e);
        }
        Ok(BlobId::from_slot_index(index))
    }

    /// Stores the location of `blob_id`, extending the file if needed.
    pub fn set_location(&self, blob_id: BlobId, location: BlobLocation) -> BlobResult<()> {
        let index = Self::index_of(blob_id)?;
        let mut inner = self.inner.lock();
        while inner.slot_count <= index {
            let gap = inner.slot_count;
            Self::write_slot(&inner, gap, Slot::Free)?;
            inner.free.insert(gap);
            inner.slot_count += 1;
        }
        Self::write_slot(&inner, index, Slot::InUse(location))?;
        inner.free.remove(&index);
        Ok(())
    }

    /// Repoints `blob_id` only if it still names `(repo_id, offset)`.
    pub fn relocate(
        &self,
        blob_id: BlobId,
        repo_id: RepoId,
        offset: u64,
        location: BlobLocation,
    ) -> BlobResult<bool> {
        let index = Self::index_of(blob_id)?;
        let inner = self.inner.lock();
        if index >= inner.slot_count {
            return Ok(false);
        }
        match Self::read_slot(&inner, index)? {
            Slot::InUse(current) if current.is_at(repo_id, offset) => {
                Self::write_slot(&inner, index, Slot::InUse(location))?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Resolves `blob_id`; NotFound if the id is free or out of range.
    pub fn resolve(&self, blob_id: BlobId) -> BlobResult<BlobLocation> {
        let index = Self::index_of(blob_id)?;
        let inner = self.inner.lock();
        if index >= inner.slot_count {
            return Err(BlobError::not_found(format!(
                "blob {blob_id} in table {}",
                self.table_id
            )));
        }
        match Self::read_slot(&inner, index)? {
            Slot::InUse(location) => Ok(location),
            _ => Err(BlobError::not_found(format!(
                "blob {blob_id} in table {}",
                self.table_id
            ))),
        }
    }

    /// Returns true if `blob_id` currently names `(repo_id, offset)`.
    pub fn points_at(&self, blob_id: BlobId, repo_id: RepoId, offset: u64) -> BlobResult<bool> {
        match self.resolve(blob_id) {
            Ok(location) => Ok(location.is_at(repo_id, offset)),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Releases `blob_id`.
    pub fn free(&self, blob_id: BlobId) -> BlobResult<()> {
        let index = Self::index_of(blob_id)?;
        let mut inner = self.inner.lock();
        if index >= inner.slot_count {
            return Ok(());
        }
        Self::write_slot(&inner, index, Slot::Free)?;
        inner.free.insert(index);
        Ok(())
    }

    /// Releases `blob_id` only if it still names `(repo_id, offset)`.
    pub fn free_if_at(&self, blob_id: BlobId, repo_id: RepoId, offset: u64) -> BlobResult<bool> {
        let index = Self::index_of(blob_id)?;
        let mut inner = self.inner.lock();
        if index >= inner.slot_count {
            return Ok(false);
        }
        match Self::read_slot(&inner, index)? {
            Slot::InUse(current) if current.is_at(repo_id, offset) => {
                Self::write_slot(&inner, index, Slot::Free)?;
                inner.free.insert(index);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Lists every located BLOB.
    pub fn entries(&self) -> BlobResult<Vec<(BlobId, BlobLocation)>> {
        let inner = self.inner.lock();
        let mut entries = Vec::new();
        for index in 0..inner.slot_count {
            if let Slot::InUse(location) = Self::read_slot(&inner, index)? {
                entries.push((BlobId::from_slot_index(index), location));
            }
        }
        Ok(entries)
    }

    /// Number of slots in the file.
    pub fn slot_count(&self) -> u64 {
        self.inner.lock().slot_count
    }

    /// Flushes the file.
    pub fn sync(&self) -> BlobResult<()> {
        self.inner.lock().file.sync_data()?;
        Ok(())
    }

    /// Deletes the file.
    pub fn remove_file(&self) -> BlobResult<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl std::fmt::Debug for TableIndirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableIndirection")
            .field("table_id", &self.table_id)
            .field("path", &self.path)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn location(repo: u32, offset: u64) -> BlobLocation {
        BlobLocation {
            repo_id: RepoId::new(repo),
            offset,
            head_size: 152,
            size: 1000,
            auth_code: AuthCode::new(0xFEED),
        }
    }

    #[test]
    fn test_allocate_locate_resolve() {
        let dir = TempDir::new().unwrap();
        let table = TableIndirection::create(TableId::new(3), dir.path()).unwrap();
        let a = table.allocate_handle().unwrap();
        let b = table.allocate_handle().unwrap();
        assert_eq!(a, BlobId::new(1));
        assert_eq!(b, BlobId::new(2));

        // Allocated but not located.
        assert!(table.resolve(a).unwrap_err().is_not_found());
        table.set_location(a, location(1, 64)).unwrap();
        assert_eq!(table.resolve(a).unwrap(), location(1, 64));
        assert!(table.resolve(BlobId::new(99)).unwrap_err().is_not_found());
        assert!(table.resolve(BlobId::INVALID).is_err());
    }

    #[test]
    fn test_free_and_reuse() {
        let dir = TempDir::new().unwrap();
        let table = TableIndirection::create(TableId::new(1), dir.path()).unwrap();
        let a = table.allocate_handle().unwrap();
        table.set_location(a, location(1, 64)).unwrap();
        let _b = table.allocate_handle().unwrap();

        assert!(!table.free_if_at(a, RepoId::new(2), 64).unwrap());
        assert!(table.free_if_at(a, RepoId::new(1), 64).unwrap());
        assert!(table.resolve(a).is_err());
        assert_eq!(table.allocate_handle().unwrap(), a);
    }

    #[test]
    fn test_relocate_is_conditional() {
        let dir = TempDir::new().unwrap();
        let table = TableIndirection::create(TableId::new(1), dir.path()).unwrap();
        let a = table.allocate_handle().unwrap();
        table.set_location(a, location(1, 64)).unwrap();
        assert!(table.relocate(a, RepoId::new(1), 64, location(2, 64)).unwrap());
        assert!(!table.relocate(a, RepoId::new(1), 64, location(3, 64)).unwrap());
        assert_eq!(table.resolve(a).unwrap().repo_id, RepoId::new(2));
        assert!(table.points_at(a, RepoId::new(2), 64).unwrap());
    }

    #[test]
    fn test_reopen_rebuilds_free_list() {
        let dir = TempDir::new().unwrap();
        let path = {
            let table = TableIndirection::create(TableId::new(5), dir.path()).unwrap();
            let a = table.allocate_handle().unwrap();
            let _never_located = table.allocate_handle().unwrap();
            table.set_location(a, location(1, 64)).unwrap();
            table.path().to_path_buf()
        };
        let table = TableIndirection::open(TableId::new(5), path.clone()).unwrap();
        assert_eq!(table.slot_count(), 2);
        assert_eq!(table.entries().unwrap().len(), 1);
        assert_eq!(table.allocate_handle().unwrap(), BlobId::new(2));

        assert!(TableIndirection::open(TableId::new(6), path).is_err());
    }

    #[test]
    fn test_set_location_extends() {
        let dir = TempDir::new().unwrap();
        let table = TableIndirection::create(TableId::new(1), dir.path()).unwrap();
        table.set_location(BlobId::new(4), location(1, 64)).unwrap();
        assert_eq!(table.slot_count(), 4);
        assert_eq!(table.allocate_handle().unwrap(), BlobId::new(1));
        assert_eq!(table.resolve(BlobId::new(4)).unwrap(), location(1, 64));
    }
}
