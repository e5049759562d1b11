//! Coordinator settings.
//!
//! Layered with the `config` crate: built-in defaults, then an optional
//! settings file, then `GPBACKUP_*` environment variables (a `.env` file is
//! loaded first).

use crate::error::{CoordinatorError, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// How helpers are started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HelperMode {
    /// Tokio tasks inside the coordinator; single-host clusters and tests.
    InProcess,
    /// `gpbackup_helper` processes, over SSH for remote hosts.
    Process,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default = "default_helper_mode")]
    pub helper_mode: HelperMode,
    #[serde(default = "default_helper_path")]
    pub helper_path: PathBuf,
    #[serde(default)]
    pub helper_config: Option<PathBuf>,
    #[serde(default = "default_helper_timeout_secs")]
    pub helper_timeout_secs: u64,
    #[serde(default = "default_helper_exit_wait_secs")]
    pub helper_exit_wait_secs: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    #[serde(default = "default_ssh_user")]
    pub ssh_user: String,
    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,
    #[serde(default)]
    pub ssh_key_path: Option<PathBuf>,

    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
    /// Defaults to `gpbackup_history.db` in the coordinator data directory.
    #[serde(default)]
    pub history_db: Option<PathBuf>,

    #[serde(default = "default_pg_host")]
    pub pg_host: String,
    #[serde(default = "default_pg_port")]
    pub pg_port: u16,
    #[serde(default = "default_ssh_user")]
    pub pg_user: String,
    #[serde(default)]
    pub pg_password: Option<String>,
}

fn default_helper_mode() -> HelperMode {
    HelperMode::Process
}

fn default_helper_path() -> PathBuf {
    PathBuf::from("gpbackup_helper")
}

fn default_helper_timeout_secs() -> u64 {
    120
}

fn default_helper_exit_wait_secs() -> u64 {
    5
}

fn default_poll_interval_ms() -> u64 {
    50
}

fn default_heartbeat_interval_ms() -> u64 {
    1000
}

fn default_ssh_user() -> String {
    std::env::var("USER").unwrap_or_else(|_| "gpadmin".into())
}

fn default_ssh_port() -> u16 {
    22
}

fn default_log_level() -> String {
    "info".into()
}

fn default_pg_host() -> String {
    std::env::var("PGHOST").unwrap_or_else(|_| "localhost".into())
}

fn default_pg_port() -> u16 {
    std::env::var("PGPORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(5432)
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            helper_mode: default_helper_mode(),
            helper_path: default_helper_path(),
            helper_config: None,
            helper_timeout_secs: default_helper_timeout_secs(),
            helper_exit_wait_secs: default_helper_exit_wait_secs(),
            poll_interval_ms: default_poll_interval_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            ssh_user: default_ssh_user(),
            ssh_port: default_ssh_port(),
            ssh_key_path: None,
            log_level: default_log_level(),
            log_dir: None,
            history_db: None,
            pg_host: default_pg_host(),
            pg_port: default_pg_port(),
            pg_user: default_ssh_user(),
            pg_password: None,
        }
    }
}

impl Settings {
    pub fn load(file: Option<&Path>) -> Result<Self> {
        let _ = dotenvy::dotenv();

        let mut builder = config::Config::builder();
        if let Some(path) = file {
            builder = builder.add_source(config::File::from(path.to_path_buf()));
        }
        builder
            .add_source(config::Environment::with_prefix("GPBACKUP").try_parsing(true))
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| CoordinatorError::Config(e.to_string()))
    }

    pub fn helper_timeout(&self) -> Duration {
        Duration::from_secs(self.helper_timeout_secs)
    }

    pub fn helper_exit_wait(&self) -> Duration {
        Duration::from_secs(self.helper_exit_wait_secs)
    }

    pub fn pipe_config(&self) -> segment_helper::config::PipeConfig {
        segment_helper::config::PipeConfig {
            poll_interval_ms: self.poll_interval_ms,
            heartbeat_interval_ms: self.heartbeat_interval_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_layer_overrides_defaults() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("gpbackup.toml");
        std::fs::write(
            &path,
            "helper_mode = \"in_process\"\nhelper_timeout_secs = 7\nlog_dir = \"/tmp/gpAdminLogs\"\n",
        )
        .unwrap();

        let settings = Settings::load(Some(&path)).unwrap();
        assert_eq!(settings.helper_mode, HelperMode::InProcess);
        assert_eq!(settings.helper_timeout(), Duration::from_secs(7));
        assert_eq!(settings.helper_exit_wait(), Duration::from_secs(5));
        assert_eq!(settings.log_dir, Some(PathBuf::from("/tmp/gpAdminLogs")));
    }

    #[test]
    fn test_missing_file_is_an_error() {
        assert!(Settings::load(Some(Path::new("/nonexistent/gpbackup.toml"))).is_err());
    }
}
