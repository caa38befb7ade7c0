//! Repository files.
//!
//! A repository is an append-only file of BLOB records behind a 64-byte
//! header. Records are never moved inside a file; dead records are counted as
//! garbage until the compactor copies the live ones elsewhere and deletes the
//! file.
//!
//! ```text
//! repo-00000001.bs
//! +-------------+----------------------+-----------------------+-----
//! | RepoHeader  | record: header|data  | record: header|data   | ...
//! +-------------+----------------------+-----------------------+-----
//!  0            64
//! ```

mod header;
mod locks;
mod pool;
mod scan;
mod state;

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use md5::{Digest, Md5};
use parking_lot::Mutex;

use nexus_common::constants::COPY_BUFFER_SIZE;
use nexus_common::error::{BlobError, BlobResult};
use nexus_common::types::{RepoId, Timestamp};

use crate::record::{BlobHeader, MIN_HEAD_SIZE};

pub use header::RepoHeader;
pub use locks::{OffsetGuard, OffsetLocks};
pub use pool::{FilePool, FilePoolStats, PooledFile};
pub use scan::{RecordScanner, ScannedRecord};
pub use state::{LockEvent, RepoLockState, RepoStateGuard};

/// One repository file.
pub struct Repository {
    id: RepoId,
    path: PathBuf,
    pool: Arc<FilePool>,
    header: Mutex<RepoHeader>,
    size: AtomicU64,
    state: Mutex<RepoLockState>,
    locks: OffsetLocks,
    delete_pending: AtomicBool,
}

impl Repository {
    /// File name of repository `id`.
    pub fn file_name(id: RepoId) -> String {
        format!("repo-{:08}.bs", id.as_u32())
    }

    /// Parses a repository id out of a file name.
    pub fn parse_file_name(name: &str) -> Option<RepoId> {
        let id = name.strip_prefix("repo-")?.strip_suffix(".bs")?;
        id.parse().ok().map(RepoId::new)
    }

    /// Creates an empty repository file in `dir`.
    pub fn create(
        id: RepoId,
        dir: &Path,
        pool: Arc<FilePool>,
        default_ref_slots: u16,
    ) -> BlobResult<Arc<Self>> {
        let path = dir.join(Self::file_name(id));
        let header = RepoHeader::new(default_ref_slots);
        let file = pool.create(&path)?;
        file.write_all_at(&header.to_bytes(), 0)?;
        file.sync()?;
        tracing::debug!(repo = %id, path = %path.display(), "created repository");

        Ok(Arc::new(Self {
            id,
            path,
            pool,
            header: Mutex::new(header),
            size: AtomicU64::new(RepoHeader::SIZE as u64),
            state: Mutex::new(RepoLockState::Unlocked),
            locks: OffsetLocks::new(),
            delete_pending: AtomicBool::new(false),
        }))
    }

    /// Opens an existing repository file.
    pub fn open(id: RepoId, path: PathBuf, pool: Arc<FilePool>) -> BlobResult<Arc<Self>> {
        let file = pool.get(&path)?;
        let len = file.file_len()?;
        let mut bytes = [0u8; RepoHeader::SIZE];
        if len < RepoHeader::SIZE as u64 {
            return Err(BlobError::corruption(format!(
                "repository {} is shorter than its header",
                path.display()
            )));
        }
        file.read_exact_at(&mut bytes, 0)?;
        let header = RepoHeader::from_bytes(&bytes)?;
        if header.recovery_offset != len {
            tracing::debug!(
                repo = %id,
                recorded = header.recovery_offset,
                actual = len,
                "repository size differs from last recorded size"
            );
        }

        Ok(Arc::new(Self {
            id,
            path,
            pool,
            header: Mutex::new(header),
            size: AtomicU64::new(len),
            state: Mutex::new(RepoLockState::Unlocked),
            locks: OffsetLocks::new(),
            delete_pending: AtomicBool::new(false),
        }))
    }

    /// Repository id.
    pub fn id(&self) -> RepoId {
        self.id
    }

    /// File path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current file size, including the header.
    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    /// Bytes occupied by records.
    pub fn data_bytes(&self) -> u64 {
        self.size().saturating_sub(RepoHeader::SIZE as u64)
    }

    /// Bytes occupied by dead records.
    pub fn garbage(&self) -> u64 {
        self.header.lock().garbage
    }

    /// Garbage as a percentage of record bytes.
    pub fn garbage_percent(&self) -> u64 {
        let data = self.data_bytes();
        if data == 0 {
            return 0;
        }
        self.garbage().saturating_mul(100) / data
    }

    /// Default record header size for new records.
    pub fn default_head_size(&self) -> usize {
        usize::from(self.header.lock().blob_head_size).max(MIN_HEAD_SIZE)
    }

    /// Snapshot of the persistent header.
    pub fn header(&self) -> RepoHeader {
        *self.header.lock()
    }

    // -------------------------------------------------------------------------
    // Lock state
    // -------------------------------------------------------------------------

    /// Current lock state.
    pub fn lock_state(&self) -> RepoLockState {
        *self.state.lock()
    }

    pub(crate) fn apply_event(&self, event: LockEvent) -> BlobResult<RepoLockState> {
        let mut state = self.state.lock();
        *state = state.transition(event)?;
        Ok(*state)
    }

    /// Takes the file for appending.
    pub fn begin_write(self: &Arc<Self>) -> BlobResult<RepoStateGuard> {
        self.apply_event(LockEvent::BeginWrite)?;
        Ok(RepoStateGuard::new(Arc::clone(self), LockEvent::EndWrite))
    }

    /// Takes the file for compaction.
    pub fn begin_compact(self: &Arc<Self>) -> BlobResult<RepoStateGuard> {
        self.apply_event(LockEvent::BeginCompact)?;
        Ok(RepoStateGuard::new(Arc::clone(self), LockEvent::EndCompact))
    }

    /// Marks the file as being backed up until the guard is dropped.
    pub fn begin_backup(self: &Arc<Self>) -> BlobResult<RepoStateGuard> {
        self.apply_event(LockEvent::BeginBackup)?;
        Ok(RepoStateGuard::new(Arc::clone(self), LockEvent::EndBackup))
    }

    /// Returns true while a backup runs on this file.
    pub fn is_backing_up(&self) -> bool {
        self.lock_state().is_backing_up()
    }

    /// Locks the header bucket of the record at `offset`.
    pub fn lock_record(&self, offset: u64) -> OffsetGuard<'_> {
        self.locks.lock(offset)
    }

    // -------------------------------------------------------------------------
    // Records
    // -------------------------------------------------------------------------

    /// Borrows the file handle.
    pub fn file(&self) -> BlobResult<PooledFile> {
        self.pool.get(&self.path)
    }

    /// Reads and validates the record header at `offset`.
    pub fn read_header(&self, offset: u64) -> BlobResult<BlobHeader> {
        let size = self.size();
        let fixed_end = offset.checked_add(MIN_HEAD_SIZE as u64);
        if offset < RepoHeader::SIZE as u64 || fixed_end.map_or(true, |end| end > size) {
            return Err(BlobError::corruption(format!(
                "record offset {offset} outside repository {} of {size} bytes",
                self.id
            )));
        }
        let file = self.file()?;
        let mut fixed = [0u8; MIN_HEAD_SIZE];
        file.read_exact_at(&mut fixed, offset)?;
        let peek = BlobHeader::peek_fixed(&fixed)?;
        let record_end = peek.record_size().and_then(|s| offset.checked_add(s));
        if record_end.map_or(true, |end| end > size) {
            return Err(BlobError::corruption(format!(
                "record at {offset} in repository {} runs past end of file",
                self.id
            )));
        }
        let mut head = vec![0u8; peek.head_size];
        file.read_exact_at(&mut head, offset)?;
        BlobHeader::decode(&head)
    }

    /// Rewrites a record header in place. The header size must not change.
    pub fn write_header(&self, offset: u64, header: &BlobHeader) -> BlobResult<()> {
        let bytes = header.encode();
        self.file()?.write_all_at(&bytes, offset)
    }

    /// Reads payload bytes of the record at `offset` starting at `start`.
    pub fn read_payload(
        &self,
        offset: u64,
        head_size: usize,
        start: u64,
        buf: &mut [u8],
    ) -> BlobResult<()> {
        self.file()?
            .read_exact_at(buf, offset + head_size as u64 + start)
    }

    fn reserve(&self, len: u64) -> u64 {
        self.size.fetch_add(len, Ordering::AcqRel)
    }

    /// Appends a record, returning its offset.
    pub fn append(&self, header: &BlobHeader, payload: &[u8]) -> BlobResult<u64> {
        debug_assert_eq!(header.repo_size, payload.len() as u64);
        let offset = self.reserve(header.record_size());
        let result = (|| {
            let file = self.file()?;
            file.write_all_at(payload, offset + header.head_size() as u64)?;
            file.write_all_at(&header.encode(), offset)
        })();
        self.settle_append(result, offset, header.record_size())
    }

    /// Appends a record whose payload is streamed from `reader`.
    ///
    /// Exactly `header.repo_size` bytes are read. The checksum is computed on
    /// the way and stored in `header` before it is written.
    pub fn append_stream(&self, header: &mut BlobHeader, reader: &mut dyn Read) -> BlobResult<u64> {
        let offset = self.reserve(header.record_size());
        let result = (|| {
            let file = self.file()?;
            let mut hasher = Md5::new();
            let mut buf = vec![0u8; COPY_BUFFER_SIZE];
            let mut pos = offset + header.head_size() as u64;
            let mut remaining = header.repo_size;
            while remaining > 0 {
                let want = remaining.min(buf.len() as u64) as usize;
                let n = reader.read(&mut buf[..want])?;
                if n == 0 {
                    return Err(BlobError::invalid_argument(format!(
                        "payload ended {remaining} bytes short of the declared size"
                    )));
                }
                hasher.update(&buf[..n]);
                file.write_all_at(&buf[..n], pos)?;
                pos += n as u64;
                remaining -= n as u64;
            }
            header.checksum = hasher.finalize().into();
            file.write_all_at(&header.encode(), offset)
        })();
        self.settle_append(result, offset, header.record_size())
    }

    /// Copies a record from `src` into this repository with a possibly larger
    /// header, returning the new offset.
    pub fn append_copy(
        &self,
        header: &BlobHeader,
        src: &Repository,
        src_offset: u64,
        src_head_size: usize,
    ) -> BlobResult<u64> {
        let offset = self.reserve(header.record_size());
        let result = (|| {
            let dst = self.file()?;
            let from = src.file()?;
            let mut buf = vec![0u8; COPY_BUFFER_SIZE];
            let mut done = 0u64;
            while done < header.repo_size {
                let n = (header.repo_size - done).min(buf.len() as u64) as usize;
                from.read_exact_at(&mut buf[..n], src_offset + src_head_size as u64 + done)?;
                dst.write_all_at(&buf[..n], offset + header.head_size() as u64 + done)?;
                done += n as u64;
            }
            dst.write_all_at(&header.encode(), offset)
        })();
        self.settle_append(result, offset, header.record_size())
    }

    fn settle_append(&self, result: BlobResult<()>, offset: u64, len: u64) -> BlobResult<u64> {
        match result {
            Ok(()) => Ok(offset),
            Err(e) => {
                // The reserved range can't be reused; account for it.
                if let Err(ge) = self.add_garbage(len) {
                    tracing::warn!(repo = %self.id, error = %ge, "failed to record garbage");
                }
                Err(e)
            }
        }
    }

    /// Counts `bytes` as garbage and persists the header.
    pub fn add_garbage(&self, bytes: u64) -> BlobResult<()> {
        let mut header = self.header.lock();
        header.garbage = header.garbage.saturating_add(bytes);
        header.recovery_offset = self.size();
        self.file()?.write_all_at(&header.to_bytes(), 0)
    }

    /// Records the time of the last applied temp-log action.
    pub fn set_last_temp_time(&self, time: Timestamp) {
        let mut header = self.header.lock();
        if time > header.last_temp_time {
            header.last_temp_time = time;
        }
    }

    /// Persists the header and flushes the file.
    pub fn sync(&self) -> BlobResult<()> {
        let file = self.file()?;
        {
            let mut header = self.header.lock();
            header.recovery_offset = self.size();
            file.write_all_at(&header.to_bytes(), 0)?;
        }
        file.sync_data()
    }

    /// Scans records up to the current end of file.
    pub fn scan(&self) -> BlobResult<RecordScanner<'_>> {
        self.scan_to(self.size())
    }

    /// Scans records up to `end`.
    pub fn scan_to(&self, end: u64) -> BlobResult<RecordScanner<'_>> {
        Ok(RecordScanner::new(self, self.file()?, end))
    }

    // -------------------------------------------------------------------------
    // Deletion
    // -------------------------------------------------------------------------

    /// Requests deletion once the running backup has finished.
    pub fn defer_delete(&self) {
        self.delete_pending.store(true, Ordering::Release);
    }

    /// Returns true if deletion was deferred.
    pub fn is_delete_pending(&self) -> bool {
        self.delete_pending.load(Ordering::Acquire)
    }

    /// Deletes the file.
    pub fn remove_file(&self) -> BlobResult<()> {
        self.pool.remove(&self.path);
        match fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        tracing::debug!(repo = %self.id, "deleted repository file");
        Ok(())
    }
}

impl std::fmt::Debug for Repository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repository")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("size", &self.size())
            .field("state", &self.lock_state())
            .finish()
    }
}
