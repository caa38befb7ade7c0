//! Configuration file support for the CLI.
//!
//! The file is TOML: CLI settings at the top level and the engine settings
//! under `[engine]`.
//!
//! ```toml
//! output_format = "json"
//!
//! [engine]
//! data_dir = "/var/lib/nexus-blob"
//! garbage_threshold = 40
//! ```

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use nexus_common::config::EngineConfig;

/// CLI configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CliConfig {
    /// Default output format.
    #[serde(default = "default_format")]
    pub output_format: String,

    /// Engine settings.
    #[serde(default)]
    pub engine: EngineConfig,
}

fn default_format() -> String {
    "table".to_string()
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            output_format: default_format(),
            engine: EngineConfig::default(),
        }
    }
}

impl CliConfig {
    /// Loads configuration from a file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config: Self =
            toml::from_str(&content).with_context(|| format!("parsing {}", path.display()))?;
        Ok(config)
    }

    /// Saves configuration to a file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Loads the default configuration file.
    ///
    /// Looks in the following locations:
    /// 1. ~/.config/nexus-blob/config.toml
    /// 2. ~/.nexus-blob/config.toml
    /// 3. Returns default if not found
    pub fn load_default() -> Result<Self> {
        for path in Self::default_locations() {
            if path.exists() {
                return Self::from_file(&path);
            }
        }
        Ok(Self::default())
    }

    fn default_locations() -> Vec<PathBuf> {
        let mut paths = Vec::new();
        if let Some(config_dir) = dirs::config_dir() {
            paths.push(config_dir.join("nexus-blob").join("config.toml"));
        }
        if let Some(home) = dirs::home_dir() {
            paths.push(home.join(".nexus-blob").join("config.toml"));
        }
        paths
    }
}
