//! Forward scan over the records of a repository file.
//!
//! Structurally invalid headers are treated as garbage: the scanner advances
//! one byte and tries again, so a torn write never hides the records behind it.

use nexus_common::error::BlobResult;

use crate::record::{BlobHeader, MIN_HEAD_SIZE};

use super::header::RepoHeader;
use super::pool::PooledFile;
use super::Repository;

/// A record found by the scanner.
#[derive(Debug, Clone)]
pub struct ScannedRecord {
    /// Offset of the record header.
    pub offset: u64,
    /// Decoded header.
    pub header: BlobHeader,
}

/// Iterator over the valid records in `[REPO_HEADER, end)`.
pub struct RecordScanner<'a> {
    repo: &'a Repository,
    file: PooledFile,
    offset: u64,
    end: u64,
    skip_start: Option<u64>,
    skipped: u64,
    failed: bool,
}

impl<'a> RecordScanner<'a> {
    pub(crate) fn new(repo: &'a Repository, file: PooledFile, end: u64) -> Self {
        Self {
            repo,
            file,
            offset: RepoHeader::SIZE as u64,
            end,
            skip_start: None,
            skipped: 0,
            failed: false,
        }
    }

    /// Bytes skipped as garbage so far.
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    /// Offset the scan has reached.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    fn skip_byte(&mut self) {
        if self.skip_start.is_none() {
            self.skip_start = Some(self.offset);
        }
        self.offset += 1;
        self.skipped += 1;
    }

    fn report_skip(&mut self) {
        if let Some(start) = self.skip_start.take() {
            tracing::warn!(
                repo = %self.repo.id(),
                start,
                bytes = self.offset - start,
                "skipped unreadable region in repository"
            );
        }
    }

    fn next_record(&mut self) -> BlobResult<Option<ScannedRecord>> {
        let mut fixed = [0u8; MIN_HEAD_SIZE];
        while self.offset + MIN_HEAD_SIZE as u64 <= self.end {
            self.file.read_exact_at(&mut fixed, self.offset)?;
            let Ok(peek) = BlobHeader::peek_fixed(&fixed) else {
                self.skip_byte();
                continue;
            };
            let record_end = peek
                .record_size()
                .and_then(|size| self.offset.checked_add(size))
                .filter(|end| *end <= self.end);
            let Some(record_end) = record_end else {
                self.skip_byte();
                continue;
            };

            let mut head = vec![0u8; peek.head_size];
            self.file.read_exact_at(&mut head, self.offset)?;
            match BlobHeader::decode(&head) {
                Ok(header) => {
                    self.report_skip();
                    let record = ScannedRecord {
                        offset: self.offset,
                        header,
                    };
                    self.offset = record_end;
                    return Ok(Some(record));
                }
                Err(_) => self.skip_byte(),
            }
        }
        self.offset = self.offset.max(self.end);
        self.report_skip();
        Ok(None)
    }
}

impl Iterator for RecordScanner<'_> {
    type Item = BlobResult<ScannedRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        match self.next_record() {
            Ok(record) => record.map(Ok),
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}
