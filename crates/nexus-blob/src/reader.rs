//! Streaming access to BLOB payloads.

use std::io::{self, Read, Seek, SeekFrom};
use std::sync::Arc;

use crate::cloud::{CloudKey, CloudStore};
use crate::repository::PooledFile;

/// Where a reader pulls payload bytes from.
#[derive(Debug)]
pub(crate) enum ReaderSource {
    /// Payload inline in a repository file, starting at `base`.
    File { file: PooledFile, base: u64 },
    /// Payload held by the cloud store.
    Cloud {
        store: Arc<dyn CloudStore>,
        key: CloudKey,
    },
}

/// Reads a BLOB payload.
///
/// The reader keeps its repository file handle open, so it stays valid when
/// the compactor moves the record and deletes the old file.
#[derive(Debug)]
pub struct BlobReader {
    source: ReaderSource,
    pos: u64,
    len: u64,
}

impl BlobReader {
    pub(crate) fn new(source: ReaderSource, len: u64) -> Self {
        Self { source, pos: 0, len }
    }

    /// Payload size.
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Returns true for an empty payload.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Current read position.
    pub fn position(&self) -> u64 {
        self.pos
    }

    pub(crate) fn seek_to(&mut self, pos: u64) {
        self.pos = pos.min(self.len);
    }
}

impl Read for BlobReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = self.len - self.pos;
        let n = remaining.min(buf.len() as u64) as usize;
        if n == 0 {
            return Ok(0);
        }
        let buf = &mut buf[..n];
        let read = match &self.source {
            ReaderSource::File { file, base } => file.read_at(buf, base + self.pos).map_err(io::Error::other)?,
            ReaderSource::Cloud { store, key } => {
                store.get_range(key, self.pos, buf).map_err(io::Error::other)?;
                n
            }
        };
        if read == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "repository file ends inside the payload",
            ));
        }
        self.pos += read as u64;
        Ok(read)
    }
}

impl Seek for BlobReader {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(p) => Some(p),
            SeekFrom::End(d) => self.len.checked_add_signed(d),
            SeekFrom::Current(d) => self.pos.checked_add_signed(d),
        };
        match target {
            Some(p) if p <= self.len => {
                self.pos = p;
                Ok(p)
            }
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek outside the payload",
            )),
        }
    }
}
