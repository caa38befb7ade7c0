//! Temp log segment management.
//!
//! This module handles individual segment files.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};

use crate::error::{TempLogError, TempLogResult};
use crate::record::{ActionRecord, LogPosition, SegmentFlags, SegmentHeader};

/// A single temp log segment file.
pub struct TempLogSegment {
    /// Segment id.
    log_id: u32,
    /// Path to the segment file.
    path: PathBuf,
    /// File handle.
    file: Mutex<File>,
    /// Current write position.
    write_pos: AtomicU64,
    /// In-memory copy of the header.
    header: RwLock<SegmentHeader>,
}

impl TempLogSegment {
    /// Creates a new segment file.
    pub fn create(log_id: u32, path: impl AsRef<Path>) -> TempLogResult<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;

        let header = SegmentHeader::new(log_id);
        file.write_all(&header.to_bytes())?;
        file.sync_all()?;

        Ok(Self {
            log_id,
            path,
            file: Mutex::new(file),
            write_pos: AtomicU64::new(SegmentHeader::SIZE as u64),
            header: RwLock::new(header),
        })
    }

    /// Opens an existing segment file.
    pub fn open(log_id: u32, path: impl AsRef<Path>) -> TempLogResult<Self> {
        let path = path.as_ref().to_path_buf();

        let mut file = OpenOptions::new().read(true).write(true).open(&path)?;

        let mut header_bytes = [0u8; SegmentHeader::SIZE];
        file.read_exact(&mut header_bytes).map_err(|_| {
            TempLogError::segment_corrupted(log_id, "file shorter than segment header")
        })?;
        let header = SegmentHeader::from_bytes(&header_bytes)?;

        if header.log_id != log_id {
            return Err(TempLogError::segment_corrupted(
                log_id,
                format!(
                    "segment id mismatch: expected {}, found {}",
                    log_id, header.log_id
                ),
            ));
        }

        let write_pos = Self::find_end_position(&mut file)?;

        Ok(Self {
            log_id,
            path,
            file: Mutex::new(file),
            write_pos: AtomicU64::new(write_pos),
            header: RwLock::new(header),
        })
    }

    /// Finds the end of the written records.
    ///
    /// A torn final record is dropped; trailing blank records are ignored.
    fn find_end_position(file: &mut File) -> TempLogResult<u64> {
        let file_len = file.metadata()?.len();
        let head = SegmentHeader::SIZE as u64;
        let rec = ActionRecord::SIZE as u64;
        if file_len <= head {
            return Ok(head);
        }

        let mut end = head + (file_len - head) / rec * rec;
        let mut buf = [0u8; ActionRecord::SIZE];
        while end > head {
            file.seek(SeekFrom::Start(end - rec))?;
            file.read_exact(&mut buf)?;
            if !ActionRecord::is_blank(&buf) {
                break;
            }
            end -= rec;
        }
        Ok(end)
    }

    /// Appends a record, returning its position.
    pub fn append(&self, record: &ActionRecord, sync: bool) -> TempLogResult<LogPosition> {
        let bytes = record.to_bytes();

        let mut file = self.file.lock();
        let pos = self.write_pos.load(Ordering::Acquire);
        let offset = u32::try_from(pos)
            .map_err(|_| TempLogError::segment_corrupted(self.log_id, "segment exceeds 4 GiB"))?;

        file.seek(SeekFrom::Start(pos))?;
        file.write_all(&bytes)?;
        if sync {
            file.sync_data()?;
        } else {
            file.flush()?;
        }

        self.write_pos
            .store(pos + ActionRecord::SIZE as u64, Ordering::Release);

        Ok(LogPosition::new(self.log_id, offset))
    }

    /// Reads the raw bytes of the record at `offset`.
    ///
    /// Returns `None` if the offset is at or beyond the end of the segment.
    pub fn read_raw(&self, offset: u32) -> TempLogResult<Option<[u8; ActionRecord::SIZE]>> {
        let offset = u64::from(offset);
        if offset + ActionRecord::SIZE as u64 > self.size() {
            return Ok(None);
        }

        let mut buf = [0u8; ActionRecord::SIZE];
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(&mut buf)?;
        Ok(Some(buf))
    }

    /// Reads and decodes the record at `offset`.
    pub fn read(&self, offset: u32) -> TempLogResult<Option<ActionRecord>> {
        match self.read_raw(offset)? {
            Some(bytes) => {
                ActionRecord::from_bytes(&bytes, LogPosition::new(self.log_id, offset)).map(Some)
            }
            None => Ok(None),
        }
    }

    /// Marks the segment as sealed and persists the flag.
    pub fn seal(&self) -> TempLogResult<()> {
        let mut header = self.header.write();
        if header.is_sealed() {
            return Ok(());
        }
        header.flags |= SegmentFlags::SEALED;

        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&header.to_bytes())?;
        file.sync_all()?;
        Ok(())
    }

    /// Syncs the segment to disk.
    pub fn sync(&self) -> TempLogResult<()> {
        self.file.lock().sync_data()?;
        Ok(())
    }

    /// Returns the segment id.
    pub fn log_id(&self) -> u32 {
        self.log_id
    }

    /// Returns the segment path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the current size of the segment in bytes.
    pub fn size(&self) -> u64 {
        self.write_pos.load(Ordering::Acquire)
    }

    /// Returns the number of records in the segment.
    pub fn record_count(&self) -> u64 {
        (self.size() - SegmentHeader::SIZE as u64) / ActionRecord::SIZE as u64
    }

    /// Returns true if the segment is sealed.
    pub fn is_sealed(&self) -> bool {
        self.header.read().is_sealed()
    }
}

impl std::fmt::Debug for TempLogSegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TempLogSegment")
            .field("log_id", &self.log_id)
            .field("path", &self.path)
            .field("size", &self.size())
            .field("sealed", &self.is_sealed())
            .finish()
    }
}
