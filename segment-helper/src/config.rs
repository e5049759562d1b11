//! Configuration management for the segment helper.
//!
//! Loads configuration from a TOML file; every field has a default so an
//! empty or missing file is valid.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HelperConfig {
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub pipe: PipeConfig,
    #[serde(default)]
    pub compression: CompressionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Directory for `gpbackup_helper_<YYYYMMDD>.log`; stderr only when unset
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipeConfig {
    /// How often a blocked helper re-checks its handoff and skip files
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Interval between heartbeat events
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressionConfig {
    /// Compression level (1-22 for zstd)
    #[serde(default = "default_compression_level")]
    pub level: i32,
}

// Default values
fn default_log_level() -> String {
    "info".to_string()
}

fn default_poll_interval_ms() -> u64 {
    50
}

fn default_heartbeat_interval_ms() -> u64 {
    1000
}

fn default_compression_level() -> i32 {
    crate::transfer::codec::DEFAULT_ZSTD_LEVEL
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            dir: None,
        }
    }
}

impl Default for PipeConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
        }
    }
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            level: default_compression_level(),
        }
    }
}

impl PipeConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}

impl HelperConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: HelperConfig = toml::from_str(&content)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_uses_defaults() {
        let config: HelperConfig = toml::from_str("").unwrap();
        assert_eq!(config.log.level, "info");
        assert_eq!(config.pipe.poll_interval(), Duration::from_millis(50));
        assert_eq!(config.compression.level, 3);
    }

    #[test]
    fn test_partial_override() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("helper.toml");
        std::fs::write(
            &path,
            "[pipe]\nheartbeat_interval_ms = 250\n\n[log]\ndir = \"/var/log/gpbackup\"\n",
        )
        .unwrap();

        let config = HelperConfig::from_file(&path).unwrap();
        assert_eq!(config.pipe.heartbeat_interval(), Duration::from_millis(250));
        assert_eq!(config.pipe.poll_interval_ms, 50);
        assert_eq!(config.log.dir, Some(PathBuf::from("/var/log/gpbackup")));
    }
}
