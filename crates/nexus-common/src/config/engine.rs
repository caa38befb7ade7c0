//! Engine configuration structures.
//!
//! [`EngineConfig`] can be built in code with the `with_*` builders or loaded
//! from a TOML file:
//!
//! ```toml
//! data_dir = "/var/lib/nexus-blob"
//! repository_threshold = 134217728
//! garbage_threshold = 50
//! temp_blob_timeout_secs = 600
//!
//! [cloud]
//! server = "file:///srv/objects"
//! bucket = "blobs"
//! public_key = "AK"
//! private_key = "SK"
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::constants::{
    DEFAULT_COMPACTOR_POLL_MS, DEFAULT_GARBAGE_THRESHOLD, DEFAULT_MAX_OPEN_FILES,
    DEFAULT_REF_SLOTS, DEFAULT_REPOSITORY_THRESHOLD, DEFAULT_TEMP_BLOB_TIMEOUT_SECS,
    DEFAULT_TEMP_LOG_THRESHOLD, REPO_HEADER_SIZE,
};
use crate::error::{BlobError, BlobResult};

/// Where a BLOB's payload bytes live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum StorageType {
    /// Payload stored inline in a repository file.
    #[default]
    Repository = 1,
    /// Payload stored in the external object store.
    Cloud = 2,
}

impl StorageType {
    /// Converts from the on-disk byte.
    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Repository),
            2 => Some(Self::Cloud),
            _ => None,
        }
    }
}

/// Connection settings for the cloud tier.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloudConfig {
    /// Object store endpoint. `file://` URLs select the bundled filesystem store.
    pub server: String,
    /// Bucket holding this engine's objects.
    pub bucket: String,
    /// Access key id. The filesystem store does not authenticate and
    /// ignores it.
    #[serde(default)]
    pub public_key: String,
    /// Secret access key. Ignored by the filesystem store.
    #[serde(default)]
    pub private_key: String,
}

impl std::fmt::Debug for CloudConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloudConfig")
            .field("server", &self.server)
            .field("bucket", &self.bucket)
            .field("public_key", &self.public_key)
            .field("private_key", &"<redacted>")
            .finish()
    }
}

/// Top-level configuration of a BLOB engine instance.
///
/// # Example
///
/// ```rust
/// use nexus_common::config::EngineConfig;
///
/// let config = EngineConfig::new("/tmp/blobs").with_garbage_threshold(30);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Root directory; each database gets a subdirectory.
    pub data_dir: PathBuf,

    /// Size past which a repository file no longer receives new records.
    pub repository_threshold: u64,

    /// Garbage percentage that makes a repository eligible for compaction.
    pub garbage_threshold: u8,

    /// Grace period before an unreferenced BLOB is deleted, in seconds.
    pub temp_blob_timeout_secs: u64,

    /// Interval between compactor passes, in milliseconds.
    pub compactor_poll_interval_ms: u64,

    /// Size past which a new temp log segment is started.
    pub temp_log_threshold: u64,

    /// Maximum number of repository file handles kept open per database.
    pub max_open_files: usize,

    /// Number of reference slots reserved in a new record header.
    pub default_ref_slots: u16,

    /// Storage type of newly created BLOBs.
    pub storage_type: StorageType,

    /// Cloud tier settings; required when `storage_type` is cloud.
    pub cloud: Option<CloudConfig>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data/blobs"),
            repository_threshold: DEFAULT_REPOSITORY_THRESHOLD,
            garbage_threshold: DEFAULT_GARBAGE_THRESHOLD,
            temp_blob_timeout_secs: DEFAULT_TEMP_BLOB_TIMEOUT_SECS,
            compactor_poll_interval_ms: DEFAULT_COMPACTOR_POLL_MS,
            temp_log_threshold: DEFAULT_TEMP_LOG_THRESHOLD,
            max_open_files: DEFAULT_MAX_OPEN_FILES,
            default_ref_slots: DEFAULT_REF_SLOTS,
            storage_type: StorageType::Repository,
            cloud: None,
        }
    }
}

impl EngineConfig {
    /// Creates a configuration rooted at `data_dir`.
    #[must_use]
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }

    /// Creates a configuration for tests: a one second grace period, small
    /// files, and background workers that stay idle unless woken, so tests
    /// drive them explicitly.
    #[must_use]
    pub fn for_testing(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            repository_threshold: 1024 * 1024,
            temp_blob_timeout_secs: 1,
            compactor_poll_interval_ms: 60 * 60 * 1000,
            temp_log_threshold: 4 * 1024,
            max_open_files: 8,
            ..Default::default()
        }
    }

    /// Loads configuration from a TOML file.
    pub fn from_file(path: &Path) -> BlobResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self =
            toml::from_str(&content).map_err(|e| BlobError::config(e.to_string()))?;
        config.validate().map_err(BlobError::config)?;
        Ok(config)
    }

    /// Converts the configuration to a TOML string.
    pub fn to_toml(&self) -> BlobResult<String> {
        toml::to_string_pretty(self).map_err(|e| BlobError::config(e.to_string()))
    }

    /// Saves the configuration to a TOML file.
    pub fn save(&self, path: &Path) -> BlobResult<()> {
        let content = self.to_toml()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Sets the repository file threshold.
    #[must_use]
    pub fn with_repository_threshold(mut self, bytes: u64) -> Self {
        self.repository_threshold = bytes;
        self
    }

    /// Sets the garbage percentage threshold.
    #[must_use]
    pub fn with_garbage_threshold(mut self, percent: u8) -> Self {
        self.garbage_threshold = percent;
        self
    }

    /// Sets the temp BLOB grace period.
    #[must_use]
    pub fn with_temp_blob_timeout(mut self, timeout: Duration) -> Self {
        self.temp_blob_timeout_secs = timeout.as_secs();
        self
    }

    /// Sets the compactor poll interval.
    #[must_use]
    pub fn with_compactor_poll_interval(mut self, interval: Duration) -> Self {
        self.compactor_poll_interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Sets the temp log segment threshold.
    #[must_use]
    pub fn with_temp_log_threshold(mut self, bytes: u64) -> Self {
        self.temp_log_threshold = bytes;
        self
    }

    /// Sets the number of pooled file handles.
    #[must_use]
    pub fn with_max_open_files(mut self, count: usize) -> Self {
        self.max_open_files = count;
        self
    }

    /// Sets the reference slots reserved per record.
    #[must_use]
    pub fn with_default_ref_slots(mut self, count: u16) -> Self {
        self.default_ref_slots = count;
        self
    }

    /// Enables the cloud tier for new BLOBs.
    #[must_use]
    pub fn with_cloud(mut self, cloud: CloudConfig) -> Self {
        self.cloud = Some(cloud);
        self.storage_type = StorageType::Cloud;
        self
    }

    /// Returns the grace period as a duration.
    #[must_use]
    pub fn temp_blob_timeout(&self) -> Duration {
        Duration::from_secs(self.temp_blob_timeout_secs)
    }

    /// Returns the compactor poll interval as a duration.
    #[must_use]
    pub fn compactor_poll_interval(&self) -> Duration {
        Duration::from_millis(self.compactor_poll_interval_ms)
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.repository_threshold <= REPO_HEADER_SIZE as u64 {
            return Err(format!(
                "repository_threshold must exceed the {REPO_HEADER_SIZE} byte file header"
            ));
        }
        if self.garbage_threshold == 0 || self.garbage_threshold > 100 {
            return Err("garbage_threshold must be between 1 and 100".into());
        }
        if self.compactor_poll_interval_ms == 0 {
            return Err("compactor_poll_interval_ms must be positive".into());
        }
        if self.temp_log_threshold == 0 {
            return Err("temp_log_threshold must be positive".into());
        }
        if self.max_open_files == 0 {
            return Err("max_open_files must be positive".into());
        }
        if self.default_ref_slots < 2 {
            return Err("default_ref_slots must leave room for a table and a blob reference".into());
        }
        if self.storage_type == StorageType::Cloud && self.cloud.is_none() {
            return Err("storage_type = \"cloud\" requires a [cloud] section".into());
        }
        if let Some(cloud) = &self.cloud {
            if cloud.server.is_empty() || cloud.bucket.is_empty() {
                return Err("cloud server and bucket must be set".into());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn cloud() -> CloudConfig {
        CloudConfig {
            server: "file:///tmp/objects".into(),
            bucket: "blobs".into(),
            public_key: "AK".into(),
            private_key: "SK".into(),
        }
    }

    #[test]
    fn test_cloud_keys_optional() {
        let config: EngineConfig = toml::from_str(
            "storage_type = \"cloud\"\n[cloud]\nserver = \"file:///srv/objects\"\nbucket = \"b\"\n",
        )
        .unwrap();
        let cloud = config.cloud.as_ref().unwrap();
        assert!(cloud.public_key.is_empty());
        assert!(cloud.private_key.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.repository_threshold, 128 * 1024 * 1024);
        assert_eq!(config.garbage_threshold, 50);
        assert_eq!(config.temp_blob_timeout(), Duration::from_secs(600));
        assert_eq!(config.compactor_poll_interval(), Duration::from_millis(3000));
        assert_eq!(config.temp_log_threshold, 32 * 1024 * 1024);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation() {
        assert!(EngineConfig::default().with_garbage_threshold(0).validate().is_err());
        assert!(EngineConfig::default().with_garbage_threshold(101).validate().is_err());
        assert!(EngineConfig::default().with_repository_threshold(10).validate().is_err());

        let mut config = EngineConfig::default();
        config.storage_type = StorageType::Cloud;
        assert!(config.validate().is_err());
        assert!(EngineConfig::default().with_cloud(cloud()).validate().is_ok());
    }

    #[test]
    fn test_toml_roundtrip_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("engine.toml");
        let config = EngineConfig::new(dir.path().join("data"))
            .with_garbage_threshold(25)
            .with_cloud(cloud());
        config.save(&path).unwrap();
        let loaded = EngineConfig::from_file(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: EngineConfig = toml::from_str("garbage_threshold = 10").unwrap();
        assert_eq!(config.garbage_threshold, 10);
        assert_eq!(config.repository_threshold, DEFAULT_REPOSITORY_THRESHOLD);
        assert_eq!(config.storage_type, StorageType::Repository);
    }

    #[test]
    fn test_debug_redacts_secret() {
        let text = format!("{:?}", cloud());
        assert!(!text.contains("SK"));
        assert!(text.contains("AK"));
    }
}
