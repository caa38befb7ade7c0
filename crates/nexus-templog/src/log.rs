//! The deferred-action log manager.
//!
//! Owns the set of segments of one database, appends to the active segment,
//! rotates past the size threshold and removes segments once processed.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::config::TempLogConfig;
use crate::error::{TempLogError, TempLogResult};
use crate::reader::TempLogReader;
use crate::record::{ActionRecord, LogPosition};
use crate::segment::TempLogSegment;

/// Temp log statistics.
#[derive(Debug, Default)]
pub struct TempLogStats {
    /// Total records appended.
    pub records_written: AtomicU64,
    /// Number of segment rotations.
    pub segment_rotations: AtomicU64,
    /// Number of segments removed after processing.
    pub segments_removed: AtomicU64,
}

/// The deferred-action log of one database.
pub struct TempLog {
    /// Configuration.
    config: Arc<TempLogConfig>,
    /// All segments, by id.
    segments: RwLock<BTreeMap<u32, Arc<TempLogSegment>>>,
    /// Segment receiving appends.
    active: RwLock<Arc<TempLogSegment>>,
    /// Statistics.
    stats: TempLogStats,
    /// Whether the log is closed.
    closed: AtomicBool,
}

impl TempLog {
    /// Opens the log in `config.dir`, creating the first segment if needed.
    pub fn open(config: TempLogConfig) -> TempLogResult<Self> {
        config.validate().map_err(TempLogError::config_error)?;
        std::fs::create_dir_all(&config.dir)?;

        let mut segments = BTreeMap::new();
        for entry in std::fs::read_dir(&config.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(log_id) = name.to_str().and_then(TempLogConfig::parse_segment_id) else {
                continue;
            };
            match TempLogSegment::open(log_id, entry.path()) {
                Ok(segment) => {
                    segments.insert(log_id, Arc::new(segment));
                }
                Err(e) if e.is_corruption() => {
                    tracing::warn!(log_id, error = %e, "skipping unreadable temp log segment");
                }
                Err(e) => return Err(e),
            }
        }

        let active = match segments.values().next_back() {
            Some(last) if !last.is_sealed() => Arc::clone(last),
            last => {
                let log_id = last.map_or(1, |s| s.log_id() + 1);
                let segment = Arc::new(TempLogSegment::create(
                    log_id,
                    config.segment_path(log_id),
                )?);
                segments.insert(log_id, Arc::clone(&segment));
                segment
            }
        };

        tracing::debug!(
            dir = %config.dir.display(),
            segments = segments.len(),
            active = active.log_id(),
            "opened temp log"
        );

        Ok(Self {
            config: Arc::new(config),
            segments: RwLock::new(segments),
            active: RwLock::new(active),
            stats: TempLogStats::default(),
            closed: AtomicBool::new(false),
        })
    }

    /// Returns the configuration.
    pub fn config(&self) -> &TempLogConfig {
        &self.config
    }

    fn check_closed(&self) -> TempLogResult<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(TempLogError::Closed)
        } else {
            Ok(())
        }
    }

    /// Appends a record, returning its position.
    pub fn append(&self, record: &ActionRecord) -> TempLogResult<LogPosition> {
        self.check_closed()?;

        let needs_rotation = self.active.read().size() >= self.config.segment_threshold;
        if needs_rotation {
            self.rotate_segment()?;
        }

        let active = self.active.read();
        let position = active.append(record, self.config.sync_on_append)?;
        self.stats.records_written.fetch_add(1, Ordering::Relaxed);

        tracing::trace!(%position, action = ?record.action, "queued deferred action");
        Ok(position)
    }

    /// Seals the active segment and starts a new one.
    pub fn rotate_segment(&self) -> TempLogResult<Arc<TempLogSegment>> {
        let mut active = self.active.write();
        if active.size() < self.config.segment_threshold && active.record_count() == 0 {
            return Ok(Arc::clone(&active));
        }

        active.seal()?;
        let log_id = active.log_id() + 1;
        let segment = Arc::new(TempLogSegment::create(
            log_id,
            self.config.segment_path(log_id),
        )?);

        self.segments.write().insert(log_id, Arc::clone(&segment));
        *active = Arc::clone(&segment);
        self.stats.segment_rotations.fetch_add(1, Ordering::Relaxed);

        tracing::debug!(log_id, "rotated temp log segment");
        Ok(segment)
    }

    /// Reads the record at `position`.
    pub fn read(&self, position: LogPosition) -> TempLogResult<Option<ActionRecord>> {
        match self.segment(position.log_id) {
            Some(segment) => segment.read(position.offset),
            None => Err(TempLogError::SegmentNotFound {
                log_id: position.log_id,
            }),
        }
    }

    /// Returns a segment by id.
    pub fn segment(&self, log_id: u32) -> Option<Arc<TempLogSegment>> {
        self.segments.read().get(&log_id).cloned()
    }

    /// Returns the first segment with an id greater than `log_id`.
    pub fn next_segment(&self, log_id: u32) -> Option<Arc<TempLogSegment>> {
        self.segments
            .read()
            .range(log_id.saturating_add(1)..)
            .next()
            .map(|(_, s)| Arc::clone(s))
    }

    /// Returns the ids of all segments, oldest first.
    pub fn segment_ids(&self) -> Vec<u32> {
        self.segments.read().keys().copied().collect()
    }

    /// Returns the id of the segment receiving appends.
    pub fn active_log_id(&self) -> u32 {
        self.active.read().log_id()
    }

    /// Returns the position of the oldest record still on disk.
    pub fn oldest_position(&self) -> LogPosition {
        let first = self
            .segments
            .read()
            .keys()
            .next()
            .copied()
            .unwrap_or_else(|| self.active_log_id());
        LogPosition::segment_start(first)
    }

    /// Returns the position the next append will receive.
    pub fn end_position(&self) -> LogPosition {
        let active = self.active.read();
        LogPosition::new(active.log_id(), u32::try_from(active.size()).unwrap_or(u32::MAX))
    }

    /// Returns a reader positioned at the oldest record.
    pub fn reader(&self) -> TempLogReader {
        TempLogReader::new(self.oldest_position())
    }

    /// Deletes a fully processed segment.
    pub fn remove_segment(&self, log_id: u32) -> TempLogResult<()> {
        if log_id == self.active_log_id() {
            return Err(TempLogError::SegmentActive { log_id });
        }
        let segment = self
            .segments
            .write()
            .remove(&log_id)
            .ok_or(TempLogError::SegmentNotFound { log_id })?;

        std::fs::remove_file(segment.path())?;
        self.stats.segments_removed.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(log_id, "removed processed temp log segment");
        Ok(())
    }

    /// Syncs the active segment.
    pub fn sync(&self) -> TempLogResult<()> {
        self.active.read().sync()
    }

    /// Returns statistics.
    pub fn stats(&self) -> &TempLogStats {
        &self.stats
    }

    /// Closes the log. Further appends fail with [`TempLogError::Closed`].
    pub fn close(&self) -> TempLogResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.sync()
    }

    /// Returns true if the log is closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for TempLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TempLog")
            .field("dir", &self.config.dir)
            .field("segments", &self.segment_ids())
            .field("active", &self.active_log_id())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::ActionType;
    use nexus_common::types::{AuthCode, BlobId, TableId, Timestamp};
    use tempfile::TempDir;

    fn record(blob: u64) -> ActionRecord {
        ActionRecord::blob(
            ActionType::ReleaseBlob,
            TableId::new(2),
            BlobId::new(blob),
            AuthCode::new(1),
            Timestamp::from_secs(50),
        )
    }

    fn small_config(dir: &TempDir) -> TempLogConfig {
        // Header plus four records per segment.
        TempLogConfig::new(dir.path()).with_segment_threshold(32 + 4 * 32)
    }

    #[test]
    fn test_append_and_read() {
        let dir = TempDir::new().unwrap();
        let log = TempLog::open(TempLogConfig::new(dir.path())).unwrap();
        let pos = log.append(&record(5)).unwrap();
        assert_eq!(log.read(pos).unwrap(), Some(record(5)));
        assert_eq!(log.end_position(), pos.next_record());
        assert_eq!(log.stats().records_written.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_rotation_past_threshold() {
        let dir = TempDir::new().unwrap();
        let log = TempLog::open(small_config(&dir)).unwrap();
        let positions: Vec<_> = (1..=10).map(|i| log.append(&record(i)).unwrap()).collect();

        assert_eq!(positions[0].log_id, 1);
        assert_eq!(positions[4].log_id, 2);
        assert_eq!(positions[9].log_id, 3);
        assert_eq!(log.segment_ids(), vec![1, 2, 3]);
        assert!(log.segment(1).unwrap().is_sealed());
        assert_eq!(log.read(positions[7]).unwrap(), Some(record(8)));
    }

    #[test]
    fn test_reopen_continues_active_segment() {
        let dir = TempDir::new().unwrap();
        let last = {
            let log = TempLog::open(small_config(&dir)).unwrap();
            for i in 1..=6 {
                log.append(&record(i)).unwrap();
            }
            log.close().unwrap();
            log.end_position()
        };

        let log = TempLog::open(small_config(&dir)).unwrap();
        assert_eq!(log.end_position(), last);
        assert_eq!(log.oldest_position(), LogPosition::segment_start(1));
        let next = log.append(&record(7)).unwrap();
        assert_eq!(next, last);
    }

    #[test]
    fn test_remove_segment() {
        let dir = TempDir::new().unwrap();
        let log = TempLog::open(small_config(&dir)).unwrap();
        for i in 1..=6 {
            log.append(&record(i)).unwrap();
        }
        let active = log.active_log_id();
        assert!(matches!(
            log.remove_segment(active),
            Err(TempLogError::SegmentActive { .. })
        ));

        log.remove_segment(1).unwrap();
        assert_eq!(log.segment_ids(), vec![2]);
        assert!(!dir.path().join("temp-00000001.bs").exists());
        assert_eq!(log.oldest_position(), LogPosition::segment_start(2));
    }

    #[test]
    fn test_closed_log_rejects_appends() {
        let dir = TempDir::new().unwrap();
        let log = TempLog::open(TempLogConfig::new(dir.path())).unwrap();
        log.close().unwrap();
        assert!(matches!(log.append(&record(1)), Err(TempLogError::Closed)));
    }
}
