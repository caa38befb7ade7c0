//! Temp log configuration.

use std::path::PathBuf;

use nexus_common::constants::DEFAULT_TEMP_LOG_THRESHOLD;

use crate::record::{ActionRecord, SegmentHeader};

/// Configuration for the deferred-action log.
#[derive(Debug, Clone)]
pub struct TempLogConfig {
    /// Directory where segments are stored.
    pub dir: PathBuf,

    /// Size past which appends go to a new segment.
    pub segment_threshold: u64,

    /// Whether to fsync after every append.
    pub sync_on_append: bool,
}

impl Default for TempLogConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("data/templog"),
            segment_threshold: DEFAULT_TEMP_LOG_THRESHOLD,
            sync_on_append: false,
        }
    }
}

impl TempLogConfig {
    /// Creates a new configuration with the specified directory.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Default::default()
        }
    }

    /// Sets the segment threshold.
    #[must_use]
    pub fn with_segment_threshold(mut self, bytes: u64) -> Self {
        self.segment_threshold = bytes;
        self
    }

    /// Sets whether every append is synced.
    #[must_use]
    pub fn with_sync_on_append(mut self, sync: bool) -> Self {
        self.sync_on_append = sync;
        self
    }

    /// Returns the path of a segment file.
    pub fn segment_path(&self, log_id: u32) -> PathBuf {
        self.dir.join(format!("temp-{:08}.bs", log_id))
    }

    /// Parses a segment id from a file name.
    pub fn parse_segment_id(name: &str) -> Option<u32> {
        name.strip_prefix("temp-")?
            .strip_suffix(".bs")?
            .parse()
            .ok()
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), String> {
        let minimum = (SegmentHeader::SIZE + ActionRecord::SIZE) as u64;
        if self.segment_threshold < minimum {
            return Err(format!(
                "segment threshold must be at least {minimum} bytes"
            ));
        }
        if u32::try_from(self.segment_threshold).is_err() {
            return Err("segment threshold must fit in 32 bits".into());
        }
        Ok(())
    }
}
