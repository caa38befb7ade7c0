//! BLOB lifecycle.
//!
//! Every header mutation goes through [`Database::edit_record`]: resolve the
//! handle, take the record's offset lock, re-check that the indirection
//! still points at the record, then apply the change in memory and write the
//! header back in one positional write. A change that does not fit the
//! header's variable region relocates the record to a larger one.

use std::cell::Cell;
use std::io::{self, Read};
use std::ops::{Bound, RangeBounds};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use md5::{Digest, Md5};

use nexus_common::config::StorageType;
use nexus_common::error::{BlobError, BlobResult};
use nexus_common::types::{AuthCode, BlobHandle, BlobId, RefId, TableId, Timestamp};
use nexus_templog::{ActionRecord, ActionType, LogEntry};

use crate::database::Database;
use crate::indirection::{BlobLocation, TableIndirection};
use crate::reader::{BlobReader, ReaderSource};
use crate::record::{BlobHeader, BlobStatus, Growth, Metadata, RefSlot, ALIAS_KEY};
use crate::repository::Repository;
use crate::stats::{hex, BlobInfo, DatabaseStats, ReferenceInfo};

/// Attempts before giving up on a record that keeps moving.
const MAX_EDIT_ATTEMPTS: usize = 8;

/// Outcome of applying a change to a header in memory.
pub(crate) enum Edit<R> {
    /// Nothing to write.
    Keep(R),
    /// Write the header back.
    Write(R),
    /// The change needs a header of at least this size.
    Relocate(usize),
}

impl<R> Edit<R> {
    fn relocate(growth: Growth) -> Self {
        match growth {
            Growth::Relocate { required_head_size } => Self::Relocate(required_head_size),
            Growth::Fits => Self::Relocate(0),
        }
    }
}

/// Reserves an alias in the index while the header change is in flight.
struct AliasReservation<'a> {
    aliases: &'a DashMap<String, Option<BlobHandle>>,
    alias: String,
    committed: bool,
}

impl<'a> AliasReservation<'a> {
    fn reserve(aliases: &'a DashMap<String, Option<BlobHandle>>, alias: &str) -> BlobResult<Self> {
        match aliases.entry(alias.to_string()) {
            Entry::Occupied(_) => Err(BlobError::duplicate(format!("alias {alias:?}"))),
            Entry::Vacant(slot) => {
                slot.insert(None);
                Ok(Self {
                    aliases,
                    alias: alias.to_string(),
                    committed: false,
                })
            }
        }
    }

    fn commit(mut self, handle: BlobHandle) {
        self.aliases.insert(self.alias.clone(), Some(handle));
        self.committed = true;
    }
}

impl Drop for AliasReservation<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.aliases.remove_if(&self.alias, |_, v| v.is_none());
        }
    }
}

/// Hashes a payload on its way into the cloud store.
struct HashingReader<'a> {
    inner: &'a mut dyn Read,
    hasher: Md5,
}

impl Read for HashingReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }
}

fn byte_range(range: impl RangeBounds<u64>, size: u64) -> BlobResult<(u64, u64)> {
    let start = match range.start_bound() {
        Bound::Included(s) => *s,
        Bound::Excluded(s) => s.saturating_add(1),
        Bound::Unbounded => 0,
    };
    let end = match range.end_bound() {
        Bound::Included(e) => e.saturating_add(1),
        Bound::Excluded(e) => *e,
        Bound::Unbounded => size,
    };
    if start > end || end > size {
        return Err(BlobError::invalid_argument(format!(
            "range {start}..{end} outside blob of {size} bytes"
        )));
    }
    Ok((start, end))
}

impl Database {
    // -------------------------------------------------------------------------
    // Record access
    // -------------------------------------------------------------------------

    fn locate(&self, handle: &BlobHandle) -> BlobResult<(Arc<TableIndirection>, BlobLocation)> {
        if handle.db_id != self.id {
            return Err(BlobError::invalid_argument(format!(
                "handle {handle} belongs to database {}",
                handle.db_id
            )));
        }
        let table = self.tables.indirection(handle.table_id)?;
        let location = table.resolve(handle.blob_id)?;
        if location.auth_code != handle.auth_code {
            return Err(BlobError::not_found(format!("blob {handle}")));
        }
        Ok((table, location))
    }

    /// Applies `apply` to the header of the BLOB behind `handle` under its
    /// offset lock, then runs `finish` with the record's final location while
    /// the lock is still held.
    ///
    /// `apply` runs a second time against an enlarged copy of the original
    /// header when it asks for relocation.
    pub(crate) fn edit_record<R, T>(
        &self,
        handle: &BlobHandle,
        mut apply: impl FnMut(&mut BlobHeader) -> BlobResult<Edit<R>>,
        finish: impl FnOnce(R, &BlobLocation) -> BlobResult<T>,
    ) -> BlobResult<T> {
        self.check_open()?;
        for _ in 0..MAX_EDIT_ATTEMPTS {
            let (table, location) = self.locate(handle)?;
            let repo = match self.repository(location.repo_id) {
                Ok(repo) => repo,
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e),
            };
            let _guard = repo.lock_record(location.offset);
            if !table.points_at(handle.blob_id, repo.id(), location.offset)? {
                continue;
            }

            let mut header = repo.read_header(location.offset)?;
            if !header.status.is_live() {
                return Err(BlobError::not_found(format!("blob {handle}")));
            }
            let original = header.clone();
            return match apply(&mut header)? {
                Edit::Keep(r) => finish(r, &location),
                Edit::Write(r) => {
                    repo.write_header(location.offset, &header)?;
                    finish(r, &location)
                }
                Edit::Relocate(head_size) => {
                    let mut grown = original.clone();
                    grown.grow_to(head_size)?;
                    match apply(&mut grown)? {
                        Edit::Relocate(_) => Err(BlobError::invalid_argument(format!(
                            "record header of blob {handle} cannot hold the change"
                        ))),
                        Edit::Keep(r) | Edit::Write(r) => {
                            let moved = self.relocate_record(&repo, location.offset, &original, &grown)?;
                            finish(r, &moved)
                        }
                    }
                }
            };
        }
        Err(BlobError::busy(format!("blob {handle} kept moving")))
    }

    /// Moves a record into a larger header. Called with the source offset
    /// lock held.
    fn relocate_record(
        &self,
        src: &Repository,
        offset: u64,
        original: &BlobHeader,
        grown: &BlobHeader,
    ) -> BlobResult<BlobLocation> {
        let dest = self.writable_repo(grown.record_size())?;
        let new_offset = dest.append_copy(grown, src, offset, original.head_size())?;
        let location = BlobLocation {
            repo_id: dest.id(),
            offset: new_offset,
            head_size: grown.head_size() as u16,
            size: grown.data_size,
            auth_code: grown.auth_code,
        };
        for (_, table_id, blob_id) in grown.table_refs() {
            if let Ok(table) = self.tables.indirection(table_id) {
                table.relocate(blob_id, src.id(), offset, location)?;
            }
        }
        drop(dest);

        let mut old = original.clone();
        old.status = if src.is_backing_up() {
            BlobStatus::Moved
        } else {
            BlobStatus::Deleted
        };
        src.write_header(offset, &old)?;
        src.add_garbage(original.record_size())?;
        DatabaseStats::inc(&self.stats.relocations);
        tracing::debug!(
            from = %src.id(),
            offset,
            to = %location.repo_id,
            new_offset,
            head_size = grown.head_size(),
            "relocated record"
        );
        Ok(location)
    }

    /// Queues a release action and records its marker in the header, unless
    /// one is already pending.
    pub(crate) fn queue_deletion(&self, header: &mut BlobHeader) -> BlobResult<()> {
        if header.deletion_marker().is_some() {
            return Ok(());
        }
        let (table_id, blob_id) = header
            .table_refs()
            .find(|(_, table_id, _)| self.tables.is_live(*table_id))
            .or_else(|| header.table_refs().next())
            .map(|(_, table_id, blob_id)| (table_id, blob_id))
            .ok_or_else(|| BlobError::corruption("record has no table reference"))?;
        let now = Timestamp::now();
        let log = self.temp_log.append(&ActionRecord::blob(
            ActionType::ReleaseBlob,
            table_id,
            blob_id,
            header.auth_code,
            now,
        ))?;
        header
            .insert_slot(RefSlot::Deletion { log, queued: now })
            .map_err(|_| BlobError::corruption("no free slot for a deletion marker"))?;
        Ok(())
    }

    /// Marks a record dead and releases everything that points at it.
    /// Called with the record's offset lock held.
    pub(crate) fn retire_record(
        &self,
        repo: &Repository,
        offset: u64,
        header: &mut BlobHeader,
    ) -> BlobResult<()> {
        header.status = if repo.is_backing_up() {
            BlobStatus::Moved
        } else {
            BlobStatus::Deleted
        };
        repo.write_header(offset, header)?;
        for (_, table_id, blob_id) in header.table_refs() {
            if let Ok(table) = self.tables.indirection(table_id) {
                table.free_if_at(blob_id, repo.id(), offset)?;
            }
        }
        if let Some(alias) = header.alias() {
            self.aliases.remove_if(alias, |_, v| v.is_some());
        }
        repo.add_garbage(header.record_size())?;

        if header.status == BlobStatus::Deleted && header.storage_type == StorageType::Cloud {
            let key = self.cloud_key(header);
            if let Err(e) = self.cloud_store().and_then(|store| store.delete(&key)) {
                tracing::warn!(key = %key, error = %e, "failed to delete cloud object");
            }
        }
        DatabaseStats::inc(&self.stats.blobs_deleted);
        Ok(())
    }

    /// Applies a due `TempBlob` or `ReleaseBlob` action. Returns false if the
    /// BLOB was referenced again, moved on or is already gone.
    pub(crate) fn check_blob(&self, entry: &LogEntry) -> BlobResult<bool> {
        let record = &entry.record;
        let Ok(table) = self.tables.indirection(record.table_id) else {
            return Ok(false);
        };
        for _ in 0..MAX_EDIT_ATTEMPTS {
            let location = match table.resolve(record.blob_id) {
                Ok(location) => location,
                Err(e) if e.is_not_found() => return Ok(false),
                Err(e) => return Err(e),
            };
            if location.auth_code != record.auth_code {
                return Ok(false);
            }
            let repo = match self.repository(location.repo_id) {
                Ok(repo) => repo,
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e),
            };
            let _guard = repo.lock_record(location.offset);
            if !table.points_at(record.blob_id, repo.id(), location.offset)? {
                continue;
            }
            let mut header = repo.read_header(location.offset)?;
            if !header.status.is_live() {
                return Ok(false);
            }
            match header.deletion_marker() {
                Some((_, position, _)) if position == entry.position => {}
                _ => return Ok(false),
            }
            if header.committed_ref_count() + header.uncommitted_ref_count() > 0 {
                return Ok(false);
            }
            self.retire_record(&repo, location.offset, &mut header)?;
            repo.set_last_temp_time(record.time);
            tracing::debug!(
                table = %record.table_id,
                blob = %record.blob_id,
                repo = %repo.id(),
                offset = location.offset,
                status = ?header.status,
                "reclaimed blob"
            );
            return Ok(true);
        }
        Ok(false)
    }

    // -------------------------------------------------------------------------
    // Creation
    // -------------------------------------------------------------------------

    /// Stores a new BLOB owned by `table`.
    ///
    /// The BLOB starts out unreferenced and is reclaimed after the grace
    /// period unless a reference is added first.
    pub fn create_blob(&self, table: TableId, payload: &[u8], metadata: Metadata) -> BlobResult<BlobHandle> {
        let mut reader = payload;
        self.create_blob_from_reader(table, &mut reader, payload.len() as u64, metadata)
    }

    /// Stores a new BLOB of `size` bytes streamed from `reader`.
    pub fn create_blob_from_reader(
        &self,
        table_id: TableId,
        reader: &mut dyn Read,
        size: u64,
        metadata: Metadata,
    ) -> BlobResult<BlobHandle> {
        self.check_open()?;
        if !self.tables.is_live(table_id) {
            return Err(BlobError::not_found(format!("table {table_id}")));
        }
        let reservation = metadata
            .alias()
            .map(|alias| AliasReservation::reserve(&self.aliases, alias))
            .transpose()?;

        let table = self.tables.indirection(table_id)?;
        let blob_id = table.allocate_handle()?;
        match self.write_new_record(&table, blob_id, reader, size, metadata) {
            Ok(handle) => {
                if let Some(reservation) = reservation {
                    reservation.commit(handle);
                }
                DatabaseStats::inc(&self.stats.blobs_created);
                DatabaseStats::add(&self.stats.bytes_written, size);
                tracing::debug!(handle = %handle, size, "created blob");
                Ok(handle)
            }
            Err(e) => {
                if let Err(fe) = table.free(blob_id) {
                    tracing::warn!(table = %table_id, blob = %blob_id, error = %fe, "failed to release blob id");
                }
                Err(e)
            }
        }
    }

    fn write_new_record(
        &self,
        table: &TableIndirection,
        blob_id: BlobId,
        reader: &mut dyn Read,
        size: u64,
        metadata: Metadata,
    ) -> BlobResult<BlobHandle> {
        let table_id = table.table_id();
        let auth_code = AuthCode::generate();
        let now = Timestamp::now();
        let log = self.temp_log.append(&ActionRecord::blob(
            ActionType::TempBlob,
            table_id,
            blob_id,
            auth_code,
            now,
        ))?;

        let storage_type = self.config.storage_type;
        let repo_size = match storage_type {
            StorageType::Repository => size,
            StorageType::Cloud => 0,
        };
        let mut header = BlobHeader::new(
            storage_type,
            auth_code,
            size,
            repo_size,
            [0; 16],
            metadata,
            self.config.default_ref_slots,
        )?;
        header.set_slot(0, RefSlot::Table { table_id, blob_id });
        header.set_slot(1, RefSlot::Deletion { log, queued: now });

        let repo = self.writable_repo(header.record_size())?;
        let offset = match storage_type {
            StorageType::Repository => repo.append_stream(&mut header, reader)?,
            StorageType::Cloud => {
                let store = self.cloud_store()?;
                header.cloud_ref = store.cloud_ref();
                header.cloud_seq = self
                    .cloud_seq
                    .fetch_add(1, std::sync::atomic::Ordering::AcqRel);
                let key = self.cloud_key(&header);
                let mut hashing = HashingReader {
                    inner: reader,
                    hasher: Md5::new(),
                };
                store.put(&key, &mut hashing, size)?;
                header.checksum = hashing.hasher.finalize().into();
                repo.append(&header, &[])?
            }
        };
        table.set_location(
            blob_id,
            BlobLocation {
                repo_id: repo.id(),
                offset,
                head_size: header.head_size() as u16,
                size,
                auth_code,
            },
        )?;
        Ok(BlobHandle::new(self.id, table_id, blob_id, auth_code, size))
    }

    // -------------------------------------------------------------------------
    // References
    // -------------------------------------------------------------------------

    /// Adds an uncommitted reference from `table_id`. Returns the handle of
    /// the BLOB as seen through that table.
    pub(crate) fn add_reference(
        &self,
        handle: &BlobHandle,
        table_id: TableId,
        column: u16,
        ref_id: RefId,
    ) -> BlobResult<BlobHandle> {
        if !self.tables.is_live(table_id) {
            return Err(BlobError::not_found(format!("table {table_id}")));
        }
        let target = self.tables.indirection(table_id)?;
        let allocated: Cell<Option<BlobId>> = Cell::new(None);

        let result = self.edit_record(
            handle,
            |header| {
                let table_index = match header.table_ref_index(table_id) {
                    Some(index) => index,
                    None => {
                        let blob_id = match allocated.get() {
                            Some(id) => id,
                            None => {
                                let id = target.allocate_handle()?;
                                allocated.set(Some(id));
                                id
                            }
                        };
                        match header.insert_slot(RefSlot::Table { table_id, blob_id }) {
                            Ok(index) => index,
                            Err(growth) => return Ok(Edit::relocate(growth)),
                        }
                    }
                };
                if header.find_blob_ref(table_index, ref_id, true).is_some()
                    || header.find_blob_ref(table_index, ref_id, false).is_some()
                {
                    return Err(BlobError::duplicate(format!(
                        "reference {} from table {table_id}",
                        ref_id.id()
                    )));
                }
                let slot = BlobHeader::blob_ref_slot(table_index, column, ref_id.uncommitted())?;
                if let Err(growth) = header.insert_slot(slot) {
                    return Ok(Edit::relocate(growth));
                }
                if let Some((index, _, _)) = header.deletion_marker() {
                    header.set_slot(index, RefSlot::Free);
                }
                header.mod_time = Timestamp::now();
                let blob_id = match header.refs()[table_index] {
                    RefSlot::Table { blob_id, .. } => blob_id,
                    _ => return Err(BlobError::corruption("table reference slot changed")),
                };
                Ok(Edit::Write((blob_id, header.auth_code, header.data_size)))
            },
            |(blob_id, auth_code, size), location| {
                if allocated.get() == Some(blob_id) {
                    target.set_location(blob_id, *location)?;
                }
                Ok(BlobHandle::new(self.id, table_id, blob_id, auth_code, size))
            },
        );

        match result {
            Ok(referenced) => {
                DatabaseStats::inc(&self.stats.references_added);
                tracing::debug!(handle = %referenced, ref_id = ref_id.id(), column, "added reference");
                Ok(referenced)
            }
            Err(e) => {
                if let Some(id) = allocated.get() {
                    if let Err(fe) = target.free(id) {
                        tracing::warn!(table = %table_id, blob = %id, error = %fe, "failed to release blob id");
                    }
                }
                Err(e)
            }
        }
    }

    /// Returns true if a committed reference `ref_id` from `table_id` exists.
    pub(crate) fn has_reference(&self, handle: &BlobHandle, table_id: TableId, ref_id: RefId) -> BlobResult<bool> {
        self.edit_record(
            handle,
            |header| {
                let found = header
                    .table_ref_index(table_id)
                    .and_then(|index| header.find_blob_ref(index, ref_id, false))
                    .is_some();
                Ok(Edit::Keep(found))
            },
            |found, _| Ok(found),
        )
    }

    /// Marks an uncommitted reference committed.
    pub(crate) fn commit_reference(&self, handle: &BlobHandle, table_id: TableId, ref_id: RefId) -> BlobResult<()> {
        self.edit_record(
            handle,
            |header| {
                let index = header
                    .table_ref_index(table_id)
                    .and_then(|ti| header.find_blob_ref(ti, ref_id, true))
                    .ok_or_else(|| BlobError::not_found(format!("pending reference {}", ref_id.id())))?;
                if let RefSlot::Blob {
                    table_index, column, ..
                } = header.refs()[index]
                {
                    header.set_slot(
                        index,
                        RefSlot::Blob {
                            table_index,
                            column,
                            ref_id: ref_id.committed(),
                        },
                    );
                }
                header.status = BlobStatus::Referenced;
                header.mod_time = Timestamp::now();
                Ok(Edit::Write(()))
            },
            |(), _| Ok(()),
        )
    }

    /// Removes a reference, queueing the BLOB for deletion if it was the
    /// last one.
    pub(crate) fn remove_reference(
        &self,
        handle: &BlobHandle,
        table_id: TableId,
        ref_id: RefId,
        uncommitted: bool,
    ) -> BlobResult<()> {
        self.edit_record(
            handle,
            |header| {
                let index = header
                    .table_ref_index(table_id)
                    .and_then(|ti| header.find_blob_ref(ti, ref_id, uncommitted))
                    .ok_or_else(|| {
                        BlobError::not_found(format!(
                            "reference {} from table {table_id}",
                            ref_id.id()
                        ))
                    })?;
                header.set_slot(index, RefSlot::Free);
                if header.committed_ref_count() + header.uncommitted_ref_count() == 0 {
                    self.queue_deletion(header)?;
                }
                header.mod_time = Timestamp::now();
                Ok(Edit::Write(()))
            },
            |(), _| Ok(()),
        )?;
        DatabaseStats::inc(&self.stats.references_removed);
        tracing::debug!(handle = %handle, table = %table_id, ref_id = ref_id.id(), uncommitted, "removed reference");
        Ok(())
    }

    /// Adds and commits a reference in one step.
    pub fn reference_blob(
        &self,
        handle: &BlobHandle,
        table_id: TableId,
        column: u16,
        ref_id: RefId,
    ) -> BlobResult<BlobHandle> {
        let mut txn = self.begin();
        let referenced = txn.reference(handle, table_id, column, ref_id)?;
        txn.commit()?;
        Ok(referenced)
    }

    /// Removes a committed reference in one step.
    pub fn dereference_blob(&self, handle: &BlobHandle, table_id: TableId, ref_id: RefId) -> BlobResult<()> {
        let mut txn = self.begin();
        txn.dereference(handle, table_id, ref_id)?;
        txn.commit()
    }

    // -------------------------------------------------------------------------
    // Reads
    // -------------------------------------------------------------------------

    fn open_source(&self, handle: &BlobHandle, touch: bool) -> BlobResult<(BlobReader, StorageType, [u8; 16])> {
        self.edit_record(
            handle,
            |header| {
                let view = (
                    header.storage_type,
                    header.checksum,
                    header.data_size,
                    self.cloud_key(header),
                );
                if touch {
                    header.access_count = header.access_count.saturating_add(1);
                    header.last_access = Timestamp::now();
                    Ok(Edit::Write(view))
                } else {
                    Ok(Edit::Keep(view))
                }
            },
            |(storage_type, checksum, size, key), location| {
                let source = match storage_type {
                    StorageType::Repository => ReaderSource::File {
                        file: self.repository(location.repo_id)?.file()?,
                        base: location.offset + u64::from(location.head_size),
                    },
                    StorageType::Cloud => ReaderSource::Cloud {
                        store: Arc::clone(self.cloud_store()?),
                        key,
                    },
                };
                Ok((BlobReader::new(source, size), storage_type, checksum))
            },
        )
    }

    /// Opens a streaming reader over the BLOB's payload.
    pub fn open_blob(&self, handle: &BlobHandle) -> BlobResult<BlobReader> {
        let (reader, _, _) = self.open_source(handle, true)?;
        DatabaseStats::inc(&self.stats.blobs_read);
        Ok(reader)
    }

    /// Reads a byte range of the BLOB's payload.
    pub fn read_blob(&self, handle: &BlobHandle, range: impl RangeBounds<u64>) -> BlobResult<Bytes> {
        let (mut reader, _, _) = self.open_source(handle, true)?;
        let (start, end) = byte_range(range, reader.len())?;
        reader.seek_to(start);
        let mut buf = vec![0u8; (end - start) as usize];
        reader.read_exact(&mut buf)?;
        DatabaseStats::inc(&self.stats.blobs_read);
        DatabaseStats::add(&self.stats.bytes_read, buf.len() as u64);
        Ok(Bytes::from(buf))
    }

    /// Recomputes the payload digest and compares it with the stored one.
    /// Cloud BLOBs always pass.
    pub fn verify_checksum(&self, handle: &BlobHandle) -> BlobResult<bool> {
        let (mut reader, storage_type, stored) = self.open_source(handle, false)?;
        if storage_type == StorageType::Cloud {
            return Ok(true);
        }
        let mut hasher = Md5::new();
        io::copy(&mut reader, &mut hasher)?;
        let actual: [u8; 16] = hasher.finalize().into();
        if actual != stored {
            tracing::warn!(handle = %handle, stored = %hex(&stored), actual = %hex(&actual), "checksum mismatch");
        }
        Ok(actual == stored)
    }

    // -------------------------------------------------------------------------
    // Metadata and aliases
    // -------------------------------------------------------------------------

    fn replace_metadata<R>(
        &self,
        handle: &BlobHandle,
        change: impl Fn(&mut Metadata) -> BlobResult<R>,
    ) -> BlobResult<R> {
        self.edit_record(
            handle,
            |header| {
                let mut metadata = header.metadata().clone();
                let result = change(&mut metadata)?;
                match header.try_grow_metadata(metadata) {
                    Growth::Fits => {
                        header.mod_time = Timestamp::now();
                        Ok(Edit::Write(result))
                    }
                    growth => Ok(Edit::relocate(growth)),
                }
            },
            |result, _| Ok(result),
        )
    }

    /// Sets a metadata field.
    pub fn set_metadata(&self, handle: &BlobHandle, name: &str, value: &str) -> BlobResult<()> {
        if name == ALIAS_KEY {
            return Err(BlobError::invalid_argument("use set_alias to change the alias"));
        }
        self.replace_metadata(handle, |metadata| metadata.set(name, value))
    }

    /// Removes a metadata field, returning its old value.
    pub fn remove_metadata(&self, handle: &BlobHandle, name: &str) -> BlobResult<Option<String>> {
        if name == ALIAS_KEY {
            return Err(BlobError::invalid_argument("use remove_alias to drop the alias"));
        }
        self.replace_metadata(handle, |metadata| Ok(metadata.remove(name)))
    }

    /// Returns the BLOB's metadata.
    pub fn metadata(&self, handle: &BlobHandle) -> BlobResult<Metadata> {
        self.edit_record(
            handle,
            |header| Ok(Edit::Keep(header.metadata().clone())),
            |metadata, _| Ok(metadata),
        )
    }

    /// Gives the BLOB an alias, replacing any previous one. Aliases are
    /// unique per database.
    pub fn set_alias(&self, handle: &BlobHandle, alias: &str) -> BlobResult<()> {
        if let Some(existing) = self.aliases.get(alias).and_then(|h| *h.value()) {
            if existing == *handle {
                return Ok(());
            }
        }
        let reservation = AliasReservation::reserve(&self.aliases, alias)?;
        let previous = self.replace_metadata(handle, |metadata| {
            let previous = metadata.alias().map(str::to_string);
            metadata.set_alias(alias)?;
            Ok(previous)
        })?;
        reservation.commit(*handle);
        if let Some(previous) = previous.filter(|p| p != alias) {
            self.aliases.remove(&previous);
        }
        tracing::debug!(handle = %handle, alias, "set alias");
        Ok(())
    }

    /// Removes the BLOB's alias, returning it.
    pub fn remove_alias(&self, handle: &BlobHandle) -> BlobResult<Option<String>> {
        let removed = self.replace_metadata(handle, |metadata| Ok(metadata.clear_alias()))?;
        if let Some(alias) = &removed {
            self.aliases.remove(alias);
        }
        Ok(removed)
    }

    /// Resolves an alias.
    pub fn lookup_alias(&self, alias: &str) -> BlobResult<BlobHandle> {
        self.aliases
            .get(alias)
            .and_then(|h| *h.value())
            .ok_or_else(|| BlobError::not_found(format!("alias {alias:?}")))
    }

    /// Reads the whole payload of the BLOB named by `alias`.
    pub fn read_by_alias(&self, alias: &str) -> BlobResult<Bytes> {
        let handle = self.lookup_alias(alias)?;
        self.read_blob(&handle, ..)
    }

    // -------------------------------------------------------------------------
    // Introspection
    // -------------------------------------------------------------------------

    /// Describes the BLOB behind `handle`.
    pub fn blob_info(&self, handle: &BlobHandle) -> BlobResult<BlobInfo> {
        self.edit_record(
            handle,
            |header| Ok(Edit::Keep(header.clone())),
            |header, location| {
                Ok(BlobInfo {
                    status: header.status,
                    storage_type: header.storage_type,
                    repo_id: location.repo_id,
                    offset: location.offset,
                    head_size: header.head_size(),
                    data_size: header.data_size,
                    committed_refs: header.committed_ref_count(),
                    pending_refs: header.uncommitted_ref_count(),
                    deletion_pending: header.deletion_marker().is_some(),
                    create_time: header.create_time,
                    mod_time: header.mod_time,
                    last_access: header.last_access,
                    access_count: header.access_count,
                    alias: header.alias().map(str::to_string),
                    checksum: hex(&header.checksum),
                })
            },
        )
    }

    /// Lists every row-level reference to the BLOB.
    pub fn references(&self, handle: &BlobHandle) -> BlobResult<Vec<ReferenceInfo>> {
        self.edit_record(
            handle,
            |header| {
                let refs = header
                    .table_refs()
                    .flat_map(|(index, table_id, blob_id)| {
                        header
                            .blob_refs_of(index)
                            .map(move |(_, column, ref_id)| ReferenceInfo::new(table_id, blob_id, column, ref_id))
                    })
                    .collect();
                Ok(Edit::Keep(refs))
            },
            |refs, _| Ok(refs),
        )
    }
}
