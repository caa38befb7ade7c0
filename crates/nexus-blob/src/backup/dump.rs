//! Backup dump framing.
//!
//! A dump is a sequence of frames:
//!
//! ```text
//! +---------+---------+------+------------------+
//! | len u32 | crc u32 | kind | body (len bytes) |
//! +---------+---------+------+------------------+
//! ```
//!
//! The crc covers the kind byte and the body. The first frame is the
//! manifest, followed by one frame per BLOB record and a closing end frame
//! carrying the record count.

use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Read, Seek, SeekFrom, Take, Write};
use std::path::Path;

use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};

use nexus_common::config::EngineConfig;
use nexus_common::constants::{COPY_BUFFER_SIZE, DUMP_MAGIC, DUMP_VERSION};
use nexus_common::error::{BlobError, BlobResult};
use nexus_common::types::{BackupId, DatabaseId, Timestamp};

use crate::table::TableEntry;

const FRAME_HEAD_SIZE: usize = 9;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum FrameKind {
    Manifest = 1,
    Blob = 2,
    End = 3,
}

impl FrameKind {
    fn from_u8(value: u8) -> BlobResult<Self> {
        match value {
            1 => Ok(Self::Manifest),
            2 => Ok(Self::Blob),
            3 => Ok(Self::End),
            other => Err(BlobError::corruption(format!("unknown dump frame kind {other}"))),
        }
    }
}

/// Describes the database a dump was taken from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DumpManifest {
    /// Database the dump was taken from.
    pub source_db: DatabaseId,
    /// Name of that database.
    pub source_name: String,
    /// Backup that wrote the dump.
    pub backup_id: BackupId,
    /// Default record header size of the source.
    pub blob_head_size: u16,
    /// Live tables at the time of the cut.
    pub tables: Vec<TableEntry>,
    /// Configuration of the source engine.
    pub config: EngineConfig,
    /// When the dump was started.
    pub created: Timestamp,
}

impl DumpManifest {
    pub(crate) fn encode(&self) -> BlobResult<Vec<u8>> {
        let body = bincode::serialize(self)
            .map_err(|e| BlobError::serialization(format!("failed to encode manifest: {e}")))?;
        let mut buf = Vec::with_capacity(6 + body.len());
        buf.put_u32(DUMP_MAGIC);
        buf.put_u16(DUMP_VERSION);
        buf.extend_from_slice(&body);
        Ok(buf)
    }

    pub(crate) fn decode(bytes: &[u8]) -> BlobResult<Self> {
        if bytes.len() < 6 {
            return Err(BlobError::corruption("manifest frame is truncated"));
        }
        let mut buf = bytes;
        let magic = buf.get_u32();
        if magic != DUMP_MAGIC {
            return Err(BlobError::protocol_mismatch(format!(
                "dump magic {magic:#010x}, expected {DUMP_MAGIC:#010x}"
            )));
        }
        let version = buf.get_u16();
        if version != DUMP_VERSION {
            return Err(BlobError::protocol_mismatch(format!(
                "dump version {version}, expected {DUMP_VERSION}"
            )));
        }
        bincode::deserialize(buf)
            .map_err(|e| BlobError::serialization(format!("failed to decode manifest: {e}")))
    }
}

fn frame_len(len: u64) -> BlobResult<u32> {
    u32::try_from(len)
        .map_err(|_| BlobError::invalid_argument(format!("dump frame of {len} bytes is too large")))
}

fn frame_head(kind: FrameKind, len: u32, crc: u32) -> [u8; FRAME_HEAD_SIZE] {
    let mut head = [0u8; FRAME_HEAD_SIZE];
    let mut cursor = &mut head[..];
    cursor.put_u32(len);
    cursor.put_u32(crc);
    cursor.put_u8(kind as u8);
    head
}

/// Writes frames to a dump file.
pub(crate) struct DumpWriter {
    out: BufWriter<File>,
    written: u64,
}

impl DumpWriter {
    pub(crate) fn create(path: &Path) -> BlobResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;
        Ok(Self {
            out: BufWriter::new(file),
            written: 0,
        })
    }

    pub(crate) fn write_frame(&mut self, kind: FrameKind, body: &[u8]) -> BlobResult<()> {
        let len = frame_len(body.len() as u64)?;
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&[kind as u8]);
        hasher.update(body);
        self.out.write_all(&frame_head(kind, len, hasher.finalize()))?;
        self.out.write_all(body)?;
        self.written += (FRAME_HEAD_SIZE + body.len()) as u64;
        Ok(())
    }

    /// Writes a frame whose body is `head` followed by `payload_len` bytes
    /// streamed from `payload`. The crc is patched in afterwards.
    pub(crate) fn write_streamed(
        &mut self,
        kind: FrameKind,
        head: &[u8],
        payload: &mut dyn Read,
        payload_len: u64,
    ) -> BlobResult<()> {
        let len = frame_len(head.len() as u64 + payload_len)?;
        let start = self.out.stream_position()?;
        self.out.write_all(&frame_head(kind, len, 0))?;

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&[kind as u8]);
        hasher.update(head);
        self.out.write_all(head)?;

        let mut buf = vec![0u8; COPY_BUFFER_SIZE];
        let mut remaining = payload_len;
        while remaining > 0 {
            let want = remaining.min(buf.len() as u64) as usize;
            payload.read_exact(&mut buf[..want])?;
            hasher.update(&buf[..want]);
            self.out.write_all(&buf[..want])?;
            remaining -= want as u64;
        }

        let end = self.out.stream_position()?;
        self.out.seek(SeekFrom::Start(start + 4))?;
        self.out.write_all(&hasher.finalize().to_be_bytes())?;
        self.out.seek(SeekFrom::Start(end))?;
        self.written += FRAME_HEAD_SIZE as u64 + u64::from(len);
        Ok(())
    }

    /// Flushes and syncs the dump, returning its size.
    pub(crate) fn finish(mut self) -> BlobResult<u64> {
        self.out.flush()?;
        self.out.get_ref().sync_all()?;
        Ok(self.written)
    }
}

/// Frame header as read back.
#[derive(Debug, Clone, Copy)]
pub(crate) struct FrameHead {
    pub(crate) kind: FrameKind,
    pub(crate) len: u32,
    crc: u32,
}

/// Reads frames from a dump.
pub(crate) struct DumpReader<R> {
    input: R,
}

impl<R: Read> DumpReader<R> {
    pub(crate) fn new(input: R) -> Self {
        Self { input }
    }

    /// Reads the next frame header; `None` at a clean end of input.
    pub(crate) fn next_head(&mut self) -> BlobResult<Option<FrameHead>> {
        let mut head = [0u8; FRAME_HEAD_SIZE];
        let mut filled = 0;
        while filled < FRAME_HEAD_SIZE {
            let n = self.input.read(&mut head[filled..])?;
            if n == 0 {
                if filled == 0 {
                    return Ok(None);
                }
                return Err(BlobError::corruption("dump ends inside a frame header"));
            }
            filled += n;
        }
        let mut buf = &head[..];
        let len = buf.get_u32();
        let crc = buf.get_u32();
        let kind = FrameKind::from_u8(buf.get_u8())?;
        Ok(Some(FrameHead { kind, len, crc }))
    }

    /// Reads a whole frame body and checks its crc.
    pub(crate) fn read_body(&mut self, head: &FrameHead) -> BlobResult<Vec<u8>> {
        let mut body = self.body(head);
        let mut bytes = Vec::with_capacity(head.len as usize);
        body.read_to_end(&mut bytes)?;
        body.verify()?;
        Ok(bytes)
    }

    /// Streams a frame body. Call [`FrameBody::verify`] when done.
    pub(crate) fn body(&mut self, head: &FrameHead) -> FrameBody<'_, R> {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&[head.kind as u8]);
        FrameBody {
            input: (&mut self.input).take(u64::from(head.len)),
            hasher,
            expected: head.crc,
        }
    }
}

/// Reader over one frame body that tracks its crc.
pub(crate) struct FrameBody<'a, R> {
    input: Take<&'a mut R>,
    hasher: crc32fast::Hasher,
    expected: u32,
}

impl<R: Read> Read for FrameBody<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.input.read(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }
}

impl<R: Read> FrameBody<'_, R> {
    /// Consumes the rest of the body and checks the crc.
    pub(crate) fn verify(mut self) -> BlobResult<()> {
        io::copy(&mut self, &mut io::sink())?;
        if self.input.limit() > 0 {
            return Err(BlobError::corruption("dump ends inside a frame body"));
        }
        if self.hasher.finalize() != self.expected {
            return Err(BlobError::corruption("dump frame checksum mismatch"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::BufReader;
    use tempfile::TempDir;

    #[test]
    fn test_frames_read_back() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("blobs.dump");
        let mut writer = DumpWriter::create(&path).unwrap();
        writer.write_frame(FrameKind::Manifest, b"manifest").unwrap();
        writer
            .write_streamed(FrameKind::Blob, b"head", &mut &b"payload bytes"[..], 13)
            .unwrap();
        writer.write_frame(FrameKind::End, &1u64.to_be_bytes()).unwrap();
        let size = writer.finish().unwrap();
        assert_eq!(size, std::fs::metadata(&path).unwrap().len());

        let mut reader = DumpReader::new(BufReader::new(File::open(&path).unwrap()));
        let head = reader.next_head().unwrap().unwrap();
        assert_eq!(head.kind, FrameKind::Manifest);
        assert_eq!(reader.read_body(&head).unwrap(), b"manifest");

        let head = reader.next_head().unwrap().unwrap();
        assert_eq!(head.kind, FrameKind::Blob);
        let mut body = reader.body(&head);
        let mut prefix = [0u8; 4];
        body.read_exact(&mut prefix).unwrap();
        assert_eq!(&prefix, b"head");
        body.verify().unwrap();

        let head = reader.next_head().unwrap().unwrap();
        assert_eq!(head.kind, FrameKind::End);
        reader.read_body(&head).unwrap();
        assert!(reader.next_head().unwrap().is_none());
    }

    #[test]
    fn test_damaged_frame_detected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("blobs.dump");
        let mut writer = DumpWriter::create(&path).unwrap();
        writer.write_frame(FrameKind::Blob, b"some record").unwrap();
        writer.finish().unwrap();

        let mut bytes = std::fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        let mut reader = DumpReader::new(&bytes[..]);
        let head = reader.next_head().unwrap().unwrap();
        assert!(reader.read_body(&head).unwrap_err().is_corruption());

        let mut truncated = DumpReader::new(&bytes[..5]);
        assert!(truncated.next_head().unwrap_err().is_corruption());
    }

    #[test]
    fn test_manifest_version_checked() {
        let manifest = DumpManifest {
            source_db: DatabaseId::new(1),
            source_name: "db".into(),
            backup_id: BackupId::new(2),
            blob_head_size: 152,
            tables: Vec::new(),
            config: EngineConfig::default(),
            created: Timestamp::from_secs(10),
        };
        let mut bytes = manifest.encode().unwrap();
        assert_eq!(DumpManifest::decode(&bytes).unwrap().backup_id, BackupId::new(2));

        bytes[5] = bytes[5].wrapping_add(1);
        assert!(matches!(
            DumpManifest::decode(&bytes).unwrap_err(),
            BlobError::ProtocolMismatch { .. }
        ));
    }
}
