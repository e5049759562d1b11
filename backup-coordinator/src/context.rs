//! Per-run configuration, built once from the command line and passed by
//! reference to every component of the run.

use crate::config::Settings;
use crate::error::{CoordinatorError, Result};
use crate::scope::Scope;
use segment_helper::transfer::codec::Compression;
use segment_helper::BackupTimestamp;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct BackupOptions {
    pub dbname: String,
    pub backup_dir: Option<PathBuf>,
    pub scope: Scope,
    pub metadata_only: bool,
    pub data_only: bool,
    pub without_globals: bool,
    pub with_stats: bool,
    pub leaf_partition_data: bool,
    pub single_data_file: bool,
    pub compression: Compression,
    pub incremental: bool,
    pub from_timestamp: Option<BackupTimestamp>,
    pub jobs: usize,
    pub plugin_config: Option<PathBuf>,
}

impl BackupOptions {
    pub fn new(dbname: impl Into<String>) -> Self {
        Self {
            dbname: dbname.into(),
            backup_dir: None,
            scope: Scope::unfiltered(),
            metadata_only: false,
            data_only: false,
            without_globals: false,
            with_stats: false,
            leaf_partition_data: false,
            single_data_file: false,
            compression: Compression::default(),
            incremental: false,
            from_timestamp: None,
            jobs: 1,
            plugin_config: None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        exclusive(self.metadata_only, "--metadata-only", self.data_only, "--data-only")?;
        exclusive(self.single_data_file, "--single-data-file", self.jobs > 1, "--jobs")?;
        exclusive(self.metadata_only, "--metadata-only", self.incremental, "--incremental")?;
        if self.incremental && !self.leaf_partition_data {
            return Err(CoordinatorError::InvalidFlags(
                "--leaf-partition-data must be specified with --incremental".into(),
            ));
        }
        if self.from_timestamp.is_some() && !self.incremental {
            return Err(CoordinatorError::InvalidFlags(
                "--from-timestamp must be specified with --incremental".into(),
            ));
        }
        if self.scope.redirect_schema().is_some() {
            return Err(CoordinatorError::InvalidFlags(
                "--redirect-schema is a restore option".into(),
            ));
        }
        if self.jobs == 0 {
            return Err(CoordinatorError::InvalidFlags("--jobs must be at least 1".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct RestoreOptions {
    pub dbname: Option<String>,
    pub timestamp: BackupTimestamp,
    pub backup_dir: Option<PathBuf>,
    pub redirect_db: Option<String>,
    pub create_db: bool,
    pub scope: Scope,
    pub metadata_only: bool,
    pub data_only: bool,
    pub with_globals: bool,
    pub with_stats: bool,
    pub run_analyze: bool,
    pub truncate_table: bool,
    pub on_error_continue: bool,
    pub resize_cluster: bool,
    pub incremental: bool,
    pub jobs: usize,
    pub plugin_config: Option<PathBuf>,
}

impl RestoreOptions {
    pub fn new(timestamp: BackupTimestamp) -> Self {
        Self {
            dbname: None,
            timestamp,
            backup_dir: None,
            redirect_db: None,
            create_db: false,
            scope: Scope::unfiltered(),
            metadata_only: false,
            data_only: false,
            with_globals: false,
            with_stats: false,
            run_analyze: false,
            truncate_table: false,
            on_error_continue: false,
            resize_cluster: false,
            incremental: false,
            jobs: 1,
            plugin_config: None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        exclusive(self.metadata_only, "--metadata-only", self.data_only, "--data-only")?;
        exclusive(self.truncate_table, "--truncate-table", self.metadata_only, "--metadata-only")?;
        exclusive(self.run_analyze, "--run-analyze", self.with_stats, "--with-stats")?;
        exclusive(self.truncate_table, "--truncate-table", self.incremental, "--incremental")?;
        if self.truncate_table && !self.scope.has_relation_include() {
            return Err(CoordinatorError::InvalidFlags(
                "--truncate-table must be specified with --include-table or --include-table-file"
                    .into(),
            ));
        }
        if self.incremental && !self.data_only {
            return Err(CoordinatorError::InvalidFlags(
                "--incremental must be specified with --data-only".into(),
            ));
        }
        if self.jobs == 0 {
            return Err(CoordinatorError::InvalidFlags("--jobs must be at least 1".into()));
        }
        Ok(())
    }
}

fn exclusive(a: bool, a_flag: &str, b: bool, b_flag: &str) -> Result<()> {
    if a && b {
        return Err(CoordinatorError::InvalidFlags(format!(
            "{a_flag} and {b_flag} cannot be used together"
        )));
    }
    Ok(())
}

/// Everything one backup or restore invocation needs. Immutable once built.
#[derive(Debug, Clone)]
pub struct RunContext<O> {
    pub options: O,
    pub settings: Arc<Settings>,
    /// Coordinator process id used in helper control file names.
    pub pid: u32,
    pub cancel: CancellationToken,
}

impl<O> RunContext<O> {
    pub fn new(options: O, settings: Arc<Settings>, cancel: CancellationToken) -> Self {
        Self {
            options,
            settings,
            pid: std::process::id(),
            cancel,
        }
    }

    pub fn with_pid(mut self, pid: u32) -> Self {
        self.pid = pid;
        self
    }
}
