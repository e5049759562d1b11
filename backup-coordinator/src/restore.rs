//! One `gprestore` invocation.
//!
//! Replays a backup set in this order:
//! 1. session settings, then global objects with `--with-globals`
//! 2. predata DDL
//! 3. table data, one helper pass per backup set in the restore plan
//! 4. postdata DDL in category tiers
//! 5. statistics with `--with-stats`, or `ANALYZE` with `--run-analyze`
//!
//! The segment counts of the backup and the cluster are checked before
//! anything is applied. Per-table failures under `--on-error-continue` end up
//! in the `_data` and `_metadata` error-table files and the run exits
//! non-zero after finishing everything else.

use crate::backup_config::BackupConfig;
use crate::cluster::Cluster;
use crate::context::{RestoreOptions, RunContext};
use crate::database::{copy_statement, restore_program, CopyOptions, Database, DatabaseConnector};
use crate::error::{CoordinatorError, Result};
use crate::helpers::{self, HelperPlan, HelperRun, RunHandle};
use crate::postdata::apply_in_tiers;
use crate::report::{write_error_tables, RestoreReport};
use crate::resize::SegmentMapping;
use crate::scope::Scope;
use crate::storage::{self, StorageBackend};
use crate::toc::{read_statements, DataEntry, MetadataEntry, Statement, Toc, TocFilter, SESSION_GUCS};
use chrono::Local;
use segment_helper::executor::Direction;
use segment_helper::pipe::SkipSignal;
use segment_helper::protocol::ScriptEntry;
use segment_helper::transfer::codec::{Compression, DEFAULT_ZSTD_LEVEL};
use segment_helper::transfer::progress::ProgressTracker;
use segment_helper::{BackupTimestamp, FilePathInfo};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// Database used to read the cluster layout before the target is known.
pub const MAINTENANCE_DB: &str = "postgres";

#[derive(Debug)]
pub struct RestoreSummary {
    pub restore_timestamp: BackupTimestamp,
    pub database: String,
    pub tables_restored: usize,
    pub tables_total: usize,
}

/// Tables of one backup set in the restore plan.
#[derive(Debug)]
struct Phase {
    paths: FilePathInfo,
    entries: Vec<DataEntry>,
}

/// A table that finished loading.
#[derive(Debug, Clone)]
struct Loaded {
    entry: DataEntry,
    target: String,
}

struct RestoreRun<'a> {
    ctx: &'a RunContext<RestoreOptions>,
    db: Arc<dyn Database>,
    cluster: Cluster,
    file_paths: FilePathInfo,
    storage: Box<dyn StorageBackend>,
    config: BackupConfig,
    toc: Toc,
    mapping: SegmentMapping,
    compression: Compression,
    data_errors: BTreeSet<String>,
    metadata_errors: BTreeSet<String>,
    loaded: Vec<Loaded>,
    tables_total: usize,
}

fn filter(scope: &Scope) -> Option<&dyn TocFilter> {
    scope.is_filtered().then_some(scope as &dyn TocFilter)
}

/// Original qualified name recorded for a failed object, usable as an
/// `--include-table-file` line on retry.
fn error_table_name(entry: &MetadataEntry) -> String {
    match entry.relation() {
        Some((schema, name)) => format!("{schema}.{name}"),
        None => entry.display_name(),
    }
}

pub async fn run_restore(
    ctx: &RunContext<RestoreOptions>,
    connector: &dyn DatabaseConnector,
) -> Result<RestoreSummary> {
    let options = &ctx.options;
    options.validate()?;
    let start = Local::now();
    let restore_timestamp = BackupTimestamp::now();
    tracing::info!("Restore Key = {}", options.timestamp);

    let admin = connector.connect(MAINTENANCE_DB).await?;
    let cluster = Cluster::new(admin.segment_configuration().await?)?;
    let file_paths = cluster.file_paths(options.timestamp.clone(), options.backup_dir.clone(), ctx.pid);
    let storage = storage::open(options.plugin_config.as_deref()).await?;

    storage.get(&file_paths.config_path()).await?;
    let config = BackupConfig::read_from(&file_paths.config_path())
        .await
        .map_err(|e| {
            CoordinatorError::Config(format!(
                "cannot read backup config {}: {}",
                file_paths.config_path().display(),
                e
            ))
        })?;

    let mapping = SegmentMapping::resolve(
        config.segmentcount,
        cluster.segment_count(),
        options.resize_cluster,
        options.timestamp.as_str(),
    )?;
    if mapping.is_resize() && options.backup_dir.is_none() {
        return Err(CoordinatorError::InvalidFlags(
            "--resize-cluster onto a cluster of a different size requires --backup-dir".into(),
        ));
    }
    if options.with_stats && !config.withstatistics {
        return Err(CoordinatorError::InvalidFlags(format!(
            "Backup {} was taken without --with-stats",
            options.timestamp
        )));
    }
    if mapping.is_resize() {
        tracing::info!(
            source = mapping.source_count(),
            destination = mapping.dest_count(),
            "Resize restore"
        );
    }

    storage.get(&file_paths.toc_path()).await?;
    storage.get(&file_paths.metadata_path()).await?;
    if options.with_stats {
        storage.get(&file_paths.statistics_path()).await?;
    }
    let toc = Toc::read_from(&file_paths.toc_path(), filter(&options.scope)).await?;
    check_includes(&options.scope, &toc, &config)?;

    let compression = if config.compressed {
        Compression::from_type(&config.compressiontype, DEFAULT_ZSTD_LEVEL)?
    } else {
        Compression::None
    };

    let database = options
        .redirect_db
        .clone()
        .or_else(|| options.dbname.clone())
        .unwrap_or_else(|| config.databasename.clone());
    if options.create_db {
        tracing::info!(database = %database, "Creating database");
        connector.create_database(&database).await?;
    }
    let db = connector.connect(&database).await?;
    let database_version = db.version().await?;

    let mut run = RestoreRun {
        ctx,
        db,
        cluster,
        file_paths,
        storage,
        config,
        toc,
        mapping,
        compression,
        data_errors: BTreeSet::new(),
        metadata_errors: BTreeSet::new(),
        loaded: Vec::new(),
        tables_total: 0,
    };
    let result = run.execute().await;

    let mut error_path = None;
    for (phase, tables) in [("data", &run.data_errors), ("metadata", &run.metadata_errors)] {
        let path = run.file_paths.error_tables_path(phase);
        match write_error_tables(&path, tables).await {
            Ok(true) => error_path = error_path.or(Some(path)),
            Ok(false) => {}
            Err(e) => tracing::warn!(error = %e, "Failed to write error tables"),
        }
    }

    let report = RestoreReport {
        backup_timestamp: options.timestamp.to_string(),
        restore_timestamp: restore_timestamp.to_string(),
        database: database.clone(),
        database_version,
        start,
        end: Local::now(),
        tables_restored: run.loaded.len(),
        tables_total: run.tables_total,
        data_errors: run.data_errors.len(),
        metadata_errors: run.metadata_errors.len(),
        error: result.as_ref().err().map(ToString::to_string),
    };
    if let Err(e) = report
        .write_to(&run.file_paths.restore_report_path(&restore_timestamp))
        .await
    {
        tracing::warn!(error = %e, "Failed to write restore report");
    }

    result?;
    let errors = run.data_errors.len() + run.metadata_errors.len();
    if errors > 0 {
        tracing::error!("Restore completed with errors");
        return Err(CoordinatorError::PartialRestore {
            count: errors,
            path: error_path
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
        });
    }
    tracing::info!("Restore completed successfully");
    Ok(RestoreSummary {
        restore_timestamp,
        database,
        tables_restored: run.loaded.len(),
        tables_total: run.tables_total,
    })
}

/// Every `--include-table` must name something in the backup.
fn check_includes(scope: &Scope, toc: &Toc, config: &BackupConfig) -> Result<()> {
    let mut known: BTreeSet<String> = toc.dataentries.iter().map(DataEntry::fqn).collect();
    known.extend(
        toc.predataentries
            .iter()
            .filter_map(|e| e.relation().map(|(s, n)| format!("{s}.{n}"))),
    );
    known.extend(config.restoreplan.iter().flat_map(|p| p.tablefqns.iter().cloned()));
    let missing = scope.missing_relations(&known);
    if missing.is_empty() {
        Ok(())
    } else {
        Err(CoordinatorError::ScopeFilter(format!(
            "Could not find relation {} in the backup set",
            missing.join(", ")
        )))
    }
}

impl RestoreRun<'_> {
    fn options(&self) -> &RestoreOptions {
        &self.ctx.options
    }

    async fn execute(&mut self) -> Result<()> {
        let ctx = self.ctx;
        let options = &ctx.options;
        let metadata = tokio::fs::read(self.file_paths.metadata_path()).await?;

        let globals = read_statements(&metadata, &self.toc.globalentries)?;
        for statement in globals {
            if statement.entry.objecttype == SESSION_GUCS {
                self.db.execute(&statement.sql).await?;
            } else if options.with_globals {
                self.apply(&statement).await?;
            }
        }

        if !options.data_only {
            let predata = read_statements(&metadata, &self.toc.predataentries)?;
            tracing::info!(statements = predata.len(), "Restoring pre-data metadata");
            for statement in &predata {
                self.apply(statement).await?;
            }
        }

        if !options.metadata_only {
            self.restore_data().await?;
        }

        if !options.data_only {
            let postdata = read_statements(&metadata, &self.toc.postdataentries)?;
            tracing::info!(statements = postdata.len(), "Restoring post-data metadata");
            self.apply_postdata(postdata).await?;
        }

        if options.with_stats {
            let sql = tokio::fs::read(self.file_paths.statistics_path()).await?;
            let statistics = read_statements(&sql, &self.toc.statisticsentries)?;
            tracing::info!(statements = statistics.len(), "Restoring query planner statistics");
            for statement in &statistics {
                self.apply(statement).await?;
            }
        }

        if options.run_analyze && !self.loaded.is_empty() {
            self.analyze().await?;
        }
        Ok(())
    }

    /// Run one metadata statement. A failure is recorded under
    /// on-error-continue and fatal otherwise.
    async fn apply(&mut self, statement: &Statement) -> Result<()> {
        let sql = self.options().scope.rewrite(&statement.entry, &statement.sql);
        match self.db.execute(&sql).await {
            Ok(()) => Ok(()),
            Err(e) if statement.entry.objecttype == "SCHEMA" && e.to_string().contains("already exists") => {
                tracing::debug!(schema = %statement.entry.name, "Schema already exists");
                Ok(())
            }
            Err(e) => self.metadata_failure(&statement.entry, e),
        }
    }

    fn metadata_failure(&mut self, entry: &MetadataEntry, cause: CoordinatorError) -> Result<()> {
        let object = error_table_name(entry);
        let error = CoordinatorError::MetadataApply {
            object: object.clone(),
            cause: cause.to_string(),
        };
        if self.options().on_error_continue {
            tracing::error!(error = %error, "Recording metadata error");
            self.metadata_errors.insert(object);
            Ok(())
        } else {
            Err(error)
        }
    }

    async fn apply_postdata(&mut self, statements: Vec<Statement>) -> Result<()> {
        let db = self.db.clone();
        let scope = self.options().scope.clone();
        let failures = apply_in_tiers(
            statements,
            self.options().jobs,
            !self.options().on_error_continue,
            |statement| {
                let db = db.clone();
                let sql = scope.rewrite(&statement.entry, &statement.sql);
                async move {
                    let result = db.execute(&sql).await;
                    (statement, result)
                }
            },
        )
        .await;
        for (statement, error) in failures {
            self.metadata_failure(&statement.entry, error)?;
        }
        Ok(())
    }

    /// One phase per backup set in the restore plan, oldest first.
    async fn plan_phases(&self) -> Result<Vec<Phase>> {
        let scope = &self.options().scope;
        let own = self.file_paths.timestamp().as_str().to_string();
        if self.config.restoreplan.is_empty() {
            return Ok(vec![Phase {
                paths: self.file_paths.clone(),
                entries: self.toc.dataentries.clone(),
            }]);
        }

        let mut phases = Vec::new();
        for plan in &self.config.restoreplan {
            let wanted: BTreeSet<&str> = plan.tablefqns.iter().map(String::as_str).collect();
            let paths = self
                .file_paths
                .with_timestamp(BackupTimestamp::parse(&plan.timestamp)?);
            let entries: Vec<DataEntry> = if plan.timestamp == own {
                self.toc.dataentries.clone()
            } else {
                self.storage.get(&paths.toc_path()).await?;
                Toc::read_from(&paths.toc_path(), filter(scope)).await?.dataentries
            };
            let entries: Vec<DataEntry> = entries
                .into_iter()
                .filter(|e| wanted.contains(e.fqn().as_str()) && scope.keep_data(e))
                .collect();
            if !entries.is_empty() {
                phases.push(Phase { paths, entries });
            }
        }
        Ok(phases)
    }

    async fn restore_data(&mut self) -> Result<()> {
        let phases = self.plan_phases().await?;
        self.tables_total = phases.iter().map(|p| p.entries.len()).sum();
        tracing::info!(tables = self.tables_total, phases = phases.len(), "Restoring data");
        let mut progress = ProgressTracker::new(self.tables_total);

        for phase in phases {
            if phase.paths.timestamp() != self.file_paths.timestamp() {
                tracing::info!(timestamp = %phase.paths.timestamp(), "Restoring data from backup set");
            }
            self.fetch_data_files(&phase).await?;
            let result = self.restore_phase(&phase, &mut progress).await;
            helpers::remove_artifacts(&phase.paths, self.cluster.contents());
            result?;
        }

        tracing::info!("{}", progress.summary());

        if self.mapping.is_resize() {
            self.redistribute().await?;
        }
        Ok(())
    }

    async fn fetch_data_files(&self, phase: &Phase) -> Result<()> {
        if self.storage.name().is_empty() {
            return Ok(());
        }
        for source in self.mapping.sources() {
            let paths = phase.paths.segment(source);
            if self.config.singledatafile {
                self.storage.get(&paths.single_data(source)).await?;
                self.storage.get(&paths.segment_toc(source)).await?;
            } else {
                for entry in &phase.entries {
                    let file = paths.table_data(source, entry.oid, self.compression.extension());
                    self.storage.get(&file).await?;
                }
            }
        }
        Ok(())
    }

    fn helper_plan(&self, phase: &Phase) -> HelperPlan {
        let options = self.options();
        let pipe_template = phase.paths.pipe_template();
        let poll_secs = self.ctx.settings.poll_interval_ms as f64 / 1000.0;
        let hosts: BTreeMap<i32, String> = self
            .cluster
            .primaries()
            .map(|d| (d.content, d.hostname.clone()))
            .collect();
        let assignments = hosts
            .keys()
            .map(|dest| {
                let entries = phase
                    .entries
                    .iter()
                    .flat_map(|e| self.mapping.entries(e.oid, *dest, e.isreplicated))
                    .collect();
                (*dest, entries)
            })
            .collect();
        let scripts = phase
            .entries
            .iter()
            .map(|e| ScriptEntry {
                oid: e.oid,
                table: e.fqn(),
                command: copy_statement(
                    &options.scope.target_fqn(&e.schema, &e.name),
                    &e.attributestring,
                    false,
                    &restore_program(
                        &pipe_template,
                        e.oid,
                        self.mapping.batch_count(e.isreplicated),
                        poll_secs,
                    ),
                ),
            })
            .collect();
        HelperPlan {
            direction: Direction::Restore,
            file_paths: phase.paths.clone(),
            hosts,
            assignments,
            scripts,
            source_dirs: self
                .mapping
                .sources()
                .map(|s| (s, phase.paths.segment_dir(s)))
                .collect(),
            compression: self.compression,
            single_data_file: self.config.singledatafile,
            on_error_continue: options.on_error_continue,
        }
    }

    async fn restore_phase(&mut self, phase: &Phase, progress: &mut ProgressTracker) -> Result<()> {
        let options = self.options().clone();
        let mut entries = Vec::with_capacity(phase.entries.len());
        for entry in &phase.entries {
            let target = options.scope.target_fqn(&entry.schema, &entry.name);
            if options.truncate_table || options.incremental {
                if let Err(e) = self.db.truncate(&target).await {
                    self.data_failure(entry, e)?;
                    continue;
                }
            }
            entries.push(entry.clone());
        }
        if entries.is_empty() {
            return Ok(());
        }

        let plan = self.helper_plan(&Phase {
            paths: phase.paths.clone(),
            entries: entries.clone(),
        });
        let run = HelperRun::start(plan, self.ctx.settings.clone(), SkipSignal::new(), self.ctx.cancel.clone()).await?;
        let loads = LoadJob {
            handle: run.handle(),
            db: self.db.clone(),
            scope: options.scope.clone(),
            mapping: self.mapping,
            on_error_continue: options.on_error_continue,
        };
        let results = loads.run(&entries, options.jobs).await;

        let mut fatal = None;
        for (entry, result) in results {
            match result {
                Ok((target, rows)) => {
                    tracing::info!("{}", progress.table_rows(&target, rows));
                    self.loaded.push(Loaded { entry, target });
                }
                Err(CoordinatorError::Cancelled) => {}
                Err(e) if e.is_recoverable() && options.on_error_continue => {
                    self.data_failure(&entry, e)?;
                }
                Err(e) => {
                    tracing::error!(table = %entry.fqn(), error = %e, "Failed to restore table");
                    fatal.get_or_insert(e);
                }
            }
        }

        if let Some(e) = fatal {
            run.abort().await;
            return Err(e);
        }
        if self.ctx.cancel.is_cancelled() {
            run.abort().await;
            return Err(CoordinatorError::Cancelled);
        }
        run.finish().await
    }

    fn data_failure(&mut self, entry: &DataEntry, cause: CoordinatorError) -> Result<()> {
        let error = match cause {
            e @ CoordinatorError::DataLoad { .. } => e,
            other => CoordinatorError::DataLoad {
                table: entry.fqn(),
                cause: other.to_string(),
            },
        };
        if self.options().on_error_continue {
            tracing::error!(error = %error, "Recording data error");
            self.data_errors.insert(entry.fqn());
            Ok(())
        } else {
            Err(error)
        }
    }

    /// Spread resized tables over the destination segments.
    async fn redistribute(&mut self) -> Result<()> {
        let numsegments = self.mapping.dest_count();
        let loaded = std::mem::take(&mut self.loaded);
        let mut kept = Vec::with_capacity(loaded.len());
        for table in loaded {
            match self
                .db
                .redistribute(&table.target, numsegments, table.entry.isreplicated)
                .await
            {
                Ok(()) => kept.push(table),
                Err(e) => self.data_failure(&table.entry, e)?,
            }
        }
        self.loaded = kept;
        tracing::info!(tables = self.loaded.len(), numsegments, "Redistributed restored tables");
        Ok(())
    }

    /// Analyze restored tables, then the roots of restored leaf partitions.
    async fn analyze(&mut self) -> Result<()> {
        tracing::info!(tables = self.loaded.len(), "Running ANALYZE on restored tables");
        let mut roots = BTreeSet::new();
        for table in &self.loaded {
            self.db.analyze(&table.target).await?;
            if let Some((schema, name)) = table.entry.partitionroot.split_once('.') {
                roots.insert(self.options().scope.target_fqn(schema, name));
            }
        }
        for root in roots {
            self.db.analyze_root_partition(&root).await?;
        }
        Ok(())
    }
}

/// Concurrent table loads of one phase.
struct LoadJob {
    handle: RunHandle,
    db: Arc<dyn Database>,
    scope: Scope,
    mapping: SegmentMapping,
    on_error_continue: bool,
}

impl LoadJob {
    /// Load every table, at most `jobs` at a time, taking permits in table
    /// order. Results come back in completion order.
    async fn run(&self, entries: &[DataEntry], jobs: usize) -> Vec<(DataEntry, Result<(String, u64)>)> {
        let cancel = self.handle.cancel_token();
        let permits = Arc::new(Semaphore::new(jobs.max(1)));
        let mut tasks = JoinSet::new();

        for entry in entries {
            let permit = tokio::select! {
                permit = permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = cancel.cancelled() => break,
            };
            let entry = entry.clone();
            let handle = self.handle.clone();
            let db = self.db.clone();
            let target = self.scope.target_fqn(&entry.schema, &entry.name);
            let batches = self.mapping.batch_count(entry.isreplicated);
            let options = CopyOptions {
                resize: self.mapping.is_resize(),
            };
            let on_error_continue = self.on_error_continue;
            tasks.spawn(async move {
                let pipes = handle.pipe_set(entry.oid, batches);
                let result = db
                    .copy_from_segments(&target, &entry.attributestring, &pipes, &options)
                    .await
                    .and_then(|rows| check_row_count(&entry, rows))
                    .map_err(|e| load_error(&entry, &handle, e));
                drop(permit);
                match &result {
                    Ok(_) | Err(CoordinatorError::Cancelled) => {}
                    Err(_) if on_error_continue => {
                        handle.skip_table(entry.oid);
                    }
                    Err(_) => handle.cancel_token().cancel(),
                }
                (entry, result.map(|rows| (target, rows)))
            });
        }

        let mut results = Vec::with_capacity(entries.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(e) => tracing::error!(error = %e, "Table load task failed"),
            }
        }
        results
    }
}

fn check_row_count(entry: &DataEntry, rows: u64) -> Result<u64> {
    if entry.isreplicated || rows == entry.rowscopied {
        return Ok(rows);
    }
    Err(CoordinatorError::DataLoad {
        table: entry.fqn(),
        cause: format!(
            "Expected to restore {} rows, but restored {} instead",
            entry.rowscopied, rows
        ),
    })
}

/// Per-table failure with the helper's own error when it had one.
fn load_error(entry: &DataEntry, handle: &RunHandle, error: CoordinatorError) -> CoordinatorError {
    match error {
        CoordinatorError::Cancelled => CoordinatorError::Cancelled,
        e @ CoordinatorError::DataLoad { .. } => e,
        other => CoordinatorError::DataLoad {
            table: entry.fqn(),
            cause: handle
                .helper_failure(entry.oid)
                .unwrap_or_else(|| other.to_string()),
        },
    }
}
