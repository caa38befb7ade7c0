//! Sequential reader over the deferred-action log.
//!
//! The reader is a cursor: [`TempLogReader::peek`] returns the next valid
//! record without consuming it, so a processor can wait for the record's
//! grace period to elapse and then call [`TempLogReader::consume`].

use crate::error::TempLogResult;
use crate::log::TempLog;
use crate::record::{ActionRecord, LogPosition};

/// A record together with its position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogEntry {
    /// Where the record lives.
    pub position: LogPosition,
    /// The decoded record.
    pub record: ActionRecord,
}

/// Cursor over the records of a [`TempLog`].
#[derive(Debug, Clone)]
pub struct TempLogReader {
    position: LogPosition,
    skipped: u64,
}

impl TempLogReader {
    /// Creates a reader starting at `position`.
    pub fn new(position: LogPosition) -> Self {
        Self {
            position,
            skipped: 0,
        }
    }

    /// Returns the current position.
    pub fn position(&self) -> LogPosition {
        self.position
    }

    /// Returns the number of damaged records skipped so far.
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    /// Returns the next valid record without consuming it.
    ///
    /// Crosses segment boundaries once a segment is sealed and exhausted.
    /// Damaged records are logged and skipped.
    pub fn peek(&mut self, log: &TempLog) -> TempLogResult<Option<LogEntry>> {
        loop {
            let segment = match log.segment(self.position.log_id) {
                Some(segment) => segment,
                None => match log.next_segment(self.position.log_id) {
                    Some(next) => {
                        self.position = LogPosition::segment_start(next.log_id());
                        continue;
                    }
                    None => return Ok(None),
                },
            };

            match segment.read_raw(self.position.offset)? {
                Some(bytes) => match ActionRecord::from_bytes(&bytes, self.position) {
                    Ok(record) => {
                        return Ok(Some(LogEntry {
                            position: self.position,
                            record,
                        }))
                    }
                    Err(e) => {
                        tracing::warn!(position = %self.position, error = %e, "skipping damaged temp log record");
                        self.skipped += 1;
                        self.position = self.position.next_record();
                    }
                },
                None => {
                    if segment.is_sealed() || log.active_log_id() != segment.log_id() {
                        match log.next_segment(segment.log_id()) {
                            Some(next) => {
                                self.position = LogPosition::segment_start(next.log_id());
                                continue;
                            }
                            None => return Ok(None),
                        }
                    }
                    return Ok(None);
                }
            }
        }
    }

    /// Advances past the record returned by the last [`peek`](Self::peek).
    pub fn consume(&mut self) {
        self.position = self.position.next_record();
    }

    /// Returns the ids of segments entirely behind the cursor.
    pub fn finished_segments(&self, log: &TempLog) -> Vec<u32> {
        log.segment_ids()
            .into_iter()
            .filter(|id| *id < self.position.log_id)
            .collect()
    }

    /// Reads every remaining record, consuming them.
    pub fn read_all(&mut self, log: &TempLog) -> TempLogResult<Vec<LogEntry>> {
        let mut entries = Vec::new();
        while let Some(entry) = self.peek(log)? {
            entries.push(entry);
            self.consume();
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TempLogConfig;
    use crate::record::ActionType;
    use nexus_common::types::{AuthCode, BlobId, TableId, Timestamp};
    use std::fs::OpenOptions;
    use std::io::{Seek, SeekFrom, Write};
    use tempfile::TempDir;

    fn record(blob: u64) -> ActionRecord {
        ActionRecord::blob(
            ActionType::TempBlob,
            TableId::new(1),
            BlobId::new(blob),
            AuthCode::new(3),
            Timestamp::from_secs(10),
        )
    }

    #[test]
    fn test_reads_across_segments() {
        let dir = TempDir::new().unwrap();
        let log = TempLog::open(TempLogConfig::new(dir.path()).with_segment_threshold(32 + 2 * 32))
            .unwrap();
        for i in 1..=5 {
            log.append(&record(i)).unwrap();
        }

        let mut reader = log.reader();
        let entries = reader.read_all(&log).unwrap();
        let blobs: Vec<u64> = entries.iter().map(|e| e.record.blob_id.as_u64()).collect();
        assert_eq!(blobs, vec![1, 2, 3, 4, 5]);
        assert_eq!(reader.finished_segments(&log), vec![1, 2]);

        // Later appends become visible to the same cursor.
        log.append(&record(6)).unwrap();
        assert_eq!(reader.peek(&log).unwrap().unwrap().record, record(6));
    }

    #[test]
    fn test_peek_does_not_consume() {
        let dir = TempDir::new().unwrap();
        let log = TempLog::open(TempLogConfig::new(dir.path())).unwrap();
        log.append(&record(1)).unwrap();
        log.append(&record(2)).unwrap();

        let mut reader = log.reader();
        let first = reader.peek(&log).unwrap().unwrap();
        assert_eq!(reader.peek(&log).unwrap().unwrap(), first);
        reader.consume();
        assert_eq!(reader.peek(&log).unwrap().unwrap().record, record(2));
        reader.consume();
        assert!(reader.peek(&log).unwrap().is_none());
    }

    #[test]
    fn test_skips_damaged_record() {
        let dir = TempDir::new().unwrap();
        let log = TempLog::open(TempLogConfig::new(dir.path())).unwrap();
        let p1 = log.append(&record(1)).unwrap();
        log.append(&record(2)).unwrap();

        let mut file = OpenOptions::new()
            .write(true)
            .open(dir.path().join("temp-00000001.bs"))
            .unwrap();
        file.seek(SeekFrom::Start(u64::from(p1.offset) + 5)).unwrap();
        file.write_all(&[0xEE]).unwrap();
        file.sync_all().unwrap();

        let mut reader = log.reader();
        let entries = reader.read_all(&log).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].record, record(2));
        assert_eq!(reader.skipped(), 1);
    }
}
