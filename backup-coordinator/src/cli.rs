//! Command-line flags of `gpbackup` and `gprestore`.

use crate::context::{BackupOptions, RestoreOptions};
use crate::error::{CoordinatorError, Result};
use crate::scope::{Scope, ScopeFilters};
use clap::{Args, Parser};
use segment_helper::transfer::codec::{Compression, DEFAULT_ZSTD_LEVEL};
use segment_helper::BackupTimestamp;
use std::path::PathBuf;

/// Include and exclude filters shared by both programs.
#[derive(Args, Debug, Default, Clone)]
pub struct FilterArgs {
    /// Schema to include; may be repeated
    #[arg(long = "include-schema", value_name = "SCHEMA")]
    pub include_schema: Vec<String>,

    /// File with one schema per line to include
    #[arg(long, value_name = "FILE")]
    pub include_schema_file: Option<PathBuf>,

    /// Schema to exclude; may be repeated
    #[arg(long = "exclude-schema", value_name = "SCHEMA")]
    pub exclude_schema: Vec<String>,

    /// File with one schema per line to exclude
    #[arg(long, value_name = "FILE")]
    pub exclude_schema_file: Option<PathBuf>,

    /// Qualified table to include; may be repeated
    #[arg(long = "include-table", value_name = "SCHEMA.TABLE")]
    pub include_table: Vec<String>,

    /// File with one qualified table per line to include
    #[arg(long, value_name = "FILE")]
    pub include_table_file: Option<PathBuf>,

    /// Qualified table to exclude; may be repeated
    #[arg(long = "exclude-table", value_name = "SCHEMA.TABLE")]
    pub exclude_table: Vec<String>,

    /// File with one qualified table per line to exclude
    #[arg(long, value_name = "FILE")]
    pub exclude_table_file: Option<PathBuf>,
}

impl FilterArgs {
    pub fn filters(&self) -> Result<ScopeFilters> {
        let mut filters = ScopeFilters {
            include_schemas: self.include_schema.clone(),
            exclude_schemas: self.exclude_schema.clone(),
            include_relations: self.include_table.clone(),
            exclude_relations: self.exclude_table.clone(),
        };
        for (file, target) in [
            (&self.include_schema_file, &mut filters.include_schemas),
            (&self.exclude_schema_file, &mut filters.exclude_schemas),
            (&self.include_table_file, &mut filters.include_relations),
            (&self.exclude_table_file, &mut filters.exclude_relations),
        ] {
            if let Some(path) = file {
                ScopeFilters::extend_from_file(target, path)?;
            }
        }
        Ok(filters)
    }
}

/// Logging and configuration flags shared by both programs.
#[derive(Args, Debug, Default, Clone)]
pub struct CommonArgs {
    /// Settings file (TOML, YAML or JSON)
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Print debug log lines
    #[arg(long, conflicts_with = "quiet")]
    pub verbose: bool,

    /// Print warnings and errors only
    #[arg(long)]
    pub quiet: bool,
}

impl CommonArgs {
    pub fn log_level<'a>(&self, configured: &'a str) -> &'a str {
        if self.verbose {
            "debug"
        } else if self.quiet {
            "warn"
        } else {
            configured
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "gpbackup", author, version, about = "Back up a database across every segment of a cluster")]
pub struct BackupArgs {
    /// Database to back up
    #[arg(long)]
    pub dbname: String,

    /// Absolute path of the directory backup files are written to
    #[arg(long, value_name = "DIR")]
    pub backup_dir: Option<PathBuf>,

    #[command(flatten)]
    pub filters: FilterArgs,

    #[arg(long, conflicts_with = "data_only")]
    pub metadata_only: bool,

    #[arg(long)]
    pub data_only: bool,

    /// Skip roles and other cluster-wide objects
    #[arg(long)]
    pub without_globals: bool,

    /// Back up query planner statistics
    #[arg(long)]
    pub with_stats: bool,

    /// One data file per leaf partition instead of one per root
    #[arg(long)]
    pub leaf_partition_data: bool,

    /// One data file per segment for all tables
    #[arg(long)]
    pub single_data_file: bool,

    #[arg(long, conflicts_with = "compression_level")]
    pub no_compression: bool,

    /// zstd level, 1 to 19
    #[arg(long, value_parser = clap::value_parser!(i32).range(1..=19))]
    pub compression_level: Option<i32>,

    /// Copy only tables changed since the base backup
    #[arg(long)]
    pub incremental: bool,

    /// Base backup of an incremental backup
    #[arg(long, value_name = "TIMESTAMP", requires = "incremental")]
    pub from_timestamp: Option<String>,

    /// Tables copied in parallel
    #[arg(long, default_value_t = 1)]
    pub jobs: usize,

    #[arg(long, value_name = "FILE")]
    pub plugin_config: Option<PathBuf>,

    #[command(flatten)]
    pub common: CommonArgs,
}

impl BackupArgs {
    pub fn options(&self) -> Result<BackupOptions> {
        let compression = match (self.no_compression, self.compression_level) {
            (true, _) => Compression::None,
            (false, level) => Compression::Zstd {
                level: level.unwrap_or(DEFAULT_ZSTD_LEVEL),
            },
        };
        let from_timestamp = self
            .from_timestamp
            .as_deref()
            .map(BackupTimestamp::parse)
            .transpose()?;
        Ok(BackupOptions {
            backup_dir: self.backup_dir.clone(),
            scope: Scope::new(self.filters.filters()?, None)?,
            metadata_only: self.metadata_only,
            data_only: self.data_only,
            without_globals: self.without_globals,
            with_stats: self.with_stats,
            leaf_partition_data: self.leaf_partition_data,
            single_data_file: self.single_data_file,
            compression,
            incremental: self.incremental,
            from_timestamp,
            jobs: self.jobs,
            plugin_config: self.plugin_config.clone(),
            ..BackupOptions::new(self.dbname.clone())
        })
    }
}

#[derive(Parser, Debug)]
#[command(name = "gprestore", author, version, about = "Restore a backup set onto a cluster")]
pub struct RestoreArgs {
    /// Timestamp key of the backup to restore
    #[arg(long)]
    pub timestamp: String,

    /// Database to restore into; defaults to the backed-up database
    #[arg(long)]
    pub dbname: Option<String>,

    /// Directory the backup was written to
    #[arg(long, value_name = "DIR")]
    pub backup_dir: Option<PathBuf>,

    /// Restore into this database instead
    #[arg(long, value_name = "DATABASE")]
    pub redirect_db: Option<String>,

    /// Restore every in-scope object into this existing schema
    #[arg(long, value_name = "SCHEMA")]
    pub redirect_schema: Option<String>,

    /// Create the target database first
    #[arg(long)]
    pub create_db: bool,

    #[command(flatten)]
    pub filters: FilterArgs,

    #[arg(long, conflicts_with = "data_only")]
    pub metadata_only: bool,

    #[arg(long)]
    pub data_only: bool,

    /// Restore roles and other cluster-wide objects
    #[arg(long)]
    pub with_globals: bool,

    /// Restore query planner statistics
    #[arg(long, conflicts_with = "run_analyze")]
    pub with_stats: bool,

    /// Run ANALYZE on restored tables
    #[arg(long)]
    pub run_analyze: bool,

    /// Truncate included tables before loading them
    #[arg(long)]
    pub truncate_table: bool,

    /// Record failed objects and keep going
    #[arg(long)]
    pub on_error_continue: bool,

    /// Allow restoring onto a cluster with a different segment count
    #[arg(long)]
    pub resize_cluster: bool,

    /// Reload tables of an incremental backup set into existing tables
    #[arg(long)]
    pub incremental: bool,

    /// Tables loaded in parallel
    #[arg(long, default_value_t = 1)]
    pub jobs: usize,

    #[arg(long, value_name = "FILE")]
    pub plugin_config: Option<PathBuf>,

    #[command(flatten)]
    pub common: CommonArgs,
}

impl RestoreArgs {
    pub fn options(&self) -> Result<RestoreOptions> {
        let timestamp = BackupTimestamp::parse(&self.timestamp)?;
        Ok(RestoreOptions {
            dbname: self.dbname.clone(),
            backup_dir: self.backup_dir.clone(),
            redirect_db: self.redirect_db.clone(),
            create_db: self.create_db,
            scope: Scope::new(self.filters.filters()?, self.redirect_schema.clone())?,
            metadata_only: self.metadata_only,
            data_only: self.data_only,
            with_globals: self.with_globals,
            with_stats: self.with_stats,
            run_analyze: self.run_analyze,
            truncate_table: self.truncate_table,
            on_error_continue: self.on_error_continue,
            resize_cluster: self.resize_cluster,
            incremental: self.incremental,
            jobs: self.jobs,
            plugin_config: self.plugin_config.clone(),
            ..RestoreOptions::new(timestamp)
        })
    }
}

/// Line printed for a failed run.
pub fn critical(error: &anyhow::Error) -> String {
    let cause = match error.downcast_ref::<CoordinatorError>() {
        Some(e) => e.to_string(),
        None => format!("{error:#}"),
    };
    format!("CRITICAL: {cause}")
}
