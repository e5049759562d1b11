//! One `gpbackup` invocation.
//!
//! Order of work:
//! 1. read the cluster layout and pick a fresh timestamp
//! 2. select in-scope relations and dump their metadata (and statistics)
//! 3. for `--incremental`, find the base backup and drop unchanged tables
//! 4. stream table data through one helper per segment
//! 5. write the TOC, config and report, push files to storage and record
//!    the backup in the history database
//!
//! Helper artifacts are removed from every segment directory however the run
//! ends.

use crate::backup_config::{BackupConfig, BackupStatus, RestorePlanEntry};
use crate::cluster::Cluster;
use crate::config::Settings;
use crate::context::{BackupOptions, RunContext};
use crate::database::{backup_program, copy_statement, Database, Relation};
use crate::error::{CoordinatorError, Result};
use crate::helpers::{self, HelperPlan, HelperRun, RunHandle};
use crate::history::{History, HISTORY_FILE};
use crate::report::BackupReport;
use crate::storage::{self, StorageBackend};
use crate::toc::{DataEntry, MetadataWriter, Section, Toc, SESSION_GUCS};
use chrono::Local;
use segment_helper::executor::Direction;
use segment_helper::fs::walker;
use segment_helper::pipe::SkipSignal;
use segment_helper::protocol::{OidEntry, ScriptEntry};
use segment_helper::transfer::progress::ProgressTracker;
use segment_helper::{BackupTimestamp, FilePathInfo};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// Session settings replayed before anything else on restore.
pub const SESSION_GUCS_SQL: &str = "SET client_encoding = 'UTF8';\nSET standard_conforming_strings = on;\nSET default_with_oids = false;";

#[derive(Debug)]
pub struct BackupOutcome {
    pub timestamp: BackupTimestamp,
    pub config: BackupConfig,
    pub file_paths: FilePathInfo,
    pub tables: usize,
}

/// History database location: the setting, else the coordinator data
/// directory.
pub fn history_path(settings: &Settings, cluster: &Cluster) -> PathBuf {
    match &settings.history_db {
        Some(path) => path.clone(),
        None => cluster
            .coordinator()
            .map(|c| c.datadir.join(HISTORY_FILE))
            .unwrap_or_else(|| PathBuf::from(HISTORY_FILE)),
    }
}

/// Timestamp whose coordinator directory does not exist yet, with that
/// directory created.
async fn new_backup_paths(cluster: &Cluster, backup_dir: Option<PathBuf>, pid: u32) -> Result<FilePathInfo> {
    loop {
        let paths = cluster.file_paths(BackupTimestamp::now(), backup_dir.clone(), pid);
        let dir = paths.coordinator_dir();
        if !dir.exists() {
            tokio::fs::create_dir_all(&dir).await?;
            return Ok(paths);
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}

/// Relations the backup touches, and those among them whose data is copied.
pub fn select_relations(relations: Vec<Relation>, options: &BackupOptions) -> Result<(Vec<Relation>, Vec<Relation>)> {
    let known: BTreeSet<String> = relations.iter().map(Relation::fqn).collect();
    let missing = options.scope.missing_relations(&known);
    if !missing.is_empty() {
        return Err(CoordinatorError::ScopeFilter(format!(
            "Relation {} does not exist",
            missing.join(", ")
        )));
    }

    let scoped: Vec<Relation> = relations
        .into_iter()
        .filter(|r| {
            options
                .scope
                .includes_relation(&r.schema, &r.name, r.partition_root.as_deref())
        })
        .collect();
    let data = scoped
        .iter()
        .filter(|r| {
            if options.leaf_partition_data {
                !r.is_partition_parent
            } else {
                r.partition_root.is_none()
            }
        })
        .cloned()
        .collect();
    Ok((scoped, data))
}

/// Whether `relation` changed since the base backup. Heap tables are always
/// copied; append-optimized tables only when their modification state moved.
fn changed_since(relation: &Relation, base: &Toc, current: &BTreeMap<String, crate::toc::AoEntry>) -> bool {
    if !relation.is_append_optimized {
        return true;
    }
    let fqn = relation.fqn();
    base.incrementalmetadata.ao.get(&fqn) != current.get(&fqn)
}

/// Restore plan of a new backup: the base plan minus whatever this backup
/// copies or no longer contains, then this backup's own tables.
pub fn restore_plan(
    base: &[RestorePlanEntry],
    timestamp: &str,
    copied: &[String],
    present: &BTreeSet<String>,
) -> Vec<RestorePlanEntry> {
    let copied_set: BTreeSet<&str> = copied.iter().map(String::as_str).collect();
    let mut plan: Vec<RestorePlanEntry> = base
        .iter()
        .filter_map(|entry| {
            let tablefqns: Vec<String> = entry
                .tablefqns
                .iter()
                .filter(|t| present.contains(*t) && !copied_set.contains(t.as_str()))
                .cloned()
                .collect();
            (!tablefqns.is_empty()).then(|| RestorePlanEntry {
                timestamp: entry.timestamp.clone(),
                tablefqns,
            })
        })
        .collect();
    plan.push(RestorePlanEntry {
        timestamp: timestamp.to_string(),
        tablefqns: copied.to_vec(),
    });
    plan
}

struct BackupRun<'a> {
    ctx: &'a RunContext<BackupOptions>,
    db: Arc<dyn Database>,
    cluster: Cluster,
    file_paths: FilePathInfo,
    history: History,
    storage: Box<dyn StorageBackend>,
    config: BackupConfig,
    toc: Toc,
    object_counts: BTreeMap<String, usize>,
}

pub async fn run_backup(ctx: &RunContext<BackupOptions>, db: Arc<dyn Database>) -> Result<BackupOutcome> {
    let options = &ctx.options;
    options.validate()?;
    let start = Local::now();

    let cluster = Cluster::new(db.segment_configuration().await?)?;
    let file_paths = new_backup_paths(&cluster, options.backup_dir.clone(), ctx.pid).await?;
    let timestamp = file_paths.timestamp().clone();
    tracing::info!("Backup Timestamp = {}", timestamp);
    tracing::info!("Backup Database = {}", options.dbname);

    let history = History::open(&history_path(&ctx.settings, &cluster)).await?;
    let storage = storage::open(options.plugin_config.as_deref()).await?;
    let config = initial_config(options, &db.version().await?, &cluster, &timestamp, storage.name());
    history.record(&config).await?;

    let mut run = BackupRun {
        ctx,
        db,
        cluster,
        file_paths,
        history,
        storage,
        config,
        toc: Toc::default(),
        object_counts: BTreeMap::new(),
    };
    let result = run.execute().await;
    helpers::remove_artifacts(&run.file_paths, run.cluster.contents());

    let tables = match result {
        Ok(tables) => tables,
        Err(e) => {
            tracing::error!(error = %e, "Backup failed");
            run.config.status = BackupStatus::Failure;
            if let Err(report_err) = run.write_files(start, Some(e.to_string())).await {
                tracing::warn!(error = %report_err, "Failed to write backup report");
            }
            if let Err(history_err) = run.history.record(&run.config).await {
                tracing::warn!(error = %history_err, "Failed to record failed backup");
            }
            return Err(e);
        }
    };

    run.config.status = BackupStatus::Success;
    run.write_files(start, None).await?;
    run.push_to_storage().await?;
    run.history.record(&run.config).await?;
    tracing::info!("Backup completed successfully");

    Ok(BackupOutcome {
        timestamp,
        config: run.config,
        file_paths: run.file_paths,
        tables,
    })
}

fn initial_config(
    options: &BackupOptions,
    database_version: &str,
    cluster: &Cluster,
    timestamp: &BackupTimestamp,
    plugin: &str,
) -> BackupConfig {
    let filters = options.scope.filters();
    BackupConfig {
        backupdir: options
            .backup_dir
            .as_ref()
            .map(|d| d.display().to_string())
            .unwrap_or_default(),
        backupversion: env!("CARGO_PKG_VERSION").to_string(),
        compressed: options.compression.is_compressed(),
        compressiontype: options.compression.type_name().to_string(),
        databasename: options.dbname.clone(),
        databaseversion: database_version.to_string(),
        segmentcount: Some(cluster.segment_count()),
        dataonly: options.data_only,
        metadataonly: options.metadata_only,
        withoutglobals: options.without_globals,
        withstatistics: options.with_stats,
        leafpartitiondata: options.leaf_partition_data,
        incremental: options.incremental,
        singledatafile: options.single_data_file,
        includeschemas: filters.include_schemas,
        excludeschemas: filters.exclude_schemas,
        includerelations: filters.include_relations,
        excluderelations: filters.exclude_relations,
        plugin: plugin.to_string(),
        restoreplan: Vec::new(),
        timestamp: timestamp.to_string(),
        endtime: String::new(),
        status: BackupStatus::InProgress,
    }
}

impl BackupRun<'_> {
    /// Everything up to the data pass. Returns the number of tables copied.
    async fn execute(&mut self) -> Result<usize> {
        let ctx = self.ctx;
        let options = &ctx.options;
        let (scoped, data_relations) = select_relations(self.db.relations().await?, options)?;
        tracing::info!(
            relations = scoped.len(),
            data_tables = data_relations.len(),
            "Gathered relations in scope"
        );

        self.dump_metadata(&scoped).await?;
        if options.with_stats {
            self.dump_statistics(&scoped).await?;
        }

        let modcounts = self.db.modification_counts(&data_relations).await?;
        self.toc.incrementalmetadata.ao = modcounts.clone();

        if options.metadata_only {
            return Ok(0);
        }

        let mut to_copy = data_relations.clone();
        let mut base_plan = Vec::new();
        if options.incremental {
            let (base_config, base_toc) = self.incremental_base().await?;
            tracing::info!(base = %base_config.timestamp, "Taking incremental backup");
            to_copy.retain(|r| changed_since(r, &base_toc, &modcounts));
            base_plan = base_config.restoreplan;
        }

        let copied: Vec<String> = to_copy.iter().map(Relation::fqn).collect();
        let present: BTreeSet<String> = data_relations.iter().map(Relation::fqn).collect();
        self.config.restoreplan = restore_plan(&base_plan, &self.config.timestamp, &copied, &present);

        let rows = if to_copy.is_empty() {
            BTreeMap::new()
        } else {
            self.back_up_data(&to_copy).await?
        };
        for relation in &to_copy {
            self.toc.dataentries.push(DataEntry {
                oid: relation.oid,
                schema: relation.schema.clone(),
                name: relation.name.clone(),
                attributestring: relation.attribute_string(),
                rowscopied: rows.get(&relation.oid).copied().unwrap_or_default(),
                partitionroot: relation.partition_root.clone().unwrap_or_default(),
                isreplicated: relation.is_replicated,
            });
        }
        Ok(to_copy.len())
    }

    async fn dump_metadata(&mut self, scoped: &[Relation]) -> Result<()> {
        let ctx = self.ctx;
        let options = &ctx.options;
        let mut writer = MetadataWriter::new();
        let gucs = writer.append("", "", SESSION_GUCS, "", SESSION_GUCS_SQL);
        self.toc.push(Section::Global, gucs);

        if !options.data_only {
            let objects = self.db.metadata(scoped, !options.without_globals).await?;
            for object in objects {
                let entry = writer.append(
                    &object.schema,
                    &object.name,
                    &object.objecttype,
                    &object.referenceobject,
                    &object.statement,
                );
                *self.object_counts.entry(object.objecttype.clone()).or_default() += 1;
                self.toc.push(object.section, entry);
            }
        }
        tracing::info!(
            predata = self.toc.predataentries.len(),
            postdata = self.toc.postdataentries.len(),
            "Writing metadata to file"
        );
        tokio::fs::write(self.file_paths.metadata_path(), writer.into_bytes()).await?;
        Ok(())
    }

    async fn dump_statistics(&mut self, scoped: &[Relation]) -> Result<()> {
        let mut writer = MetadataWriter::new();
        for object in self.db.statistics(scoped).await? {
            let entry = writer.append(
                &object.schema,
                &object.name,
                &object.objecttype,
                &object.referenceobject,
                &object.statement,
            );
            self.toc.push(Section::Statistics, entry);
        }
        tracing::info!(entries = self.toc.statisticsentries.len(), "Writing query planner statistics to file");
        tokio::fs::write(self.file_paths.statistics_path(), writer.into_bytes()).await?;
        Ok(())
    }

    /// Config and TOC of the backup this incremental backup builds on.
    async fn incremental_base(&self) -> Result<(BackupConfig, Toc)> {
        let base = match &self.ctx.options.from_timestamp {
            Some(ts) => {
                let config = match self.history.find(ts.as_str()).await? {
                    Some(config) => config,
                    None => {
                        let path = self.file_paths.with_timestamp(ts.clone()).config_path();
                        self.storage.get(&path).await?;
                        BackupConfig::read_from(&path).await.map_err(|e| {
                            CoordinatorError::InvalidFlags(format!(
                                "Cannot read config of backup {ts}: {e}"
                            ))
                        })?
                    }
                };
                if config.status != BackupStatus::Success || !config.same_scope(&self.config) {
                    return Err(CoordinatorError::InvalidFlags(format!(
                        "Backup {ts} cannot be the base of this incremental backup: it failed or was taken with different flags"
                    )));
                }
                config
            }
            None => self.history.latest_compatible(&self.config).await?.ok_or_else(|| {
                CoordinatorError::InvalidFlags(
                    "There was no matching previous backup found with the flags provided. Please take a full backup."
                        .into(),
                )
            })?,
        };

        let base_ts = BackupTimestamp::parse(&base.timestamp)?;
        let toc_path = self.file_paths.with_timestamp(base_ts).toc_path();
        self.storage.get(&toc_path).await?;
        let toc = Toc::read_from(&toc_path, None).await?;
        Ok((base, toc))
    }

    async fn back_up_data(&self, tables: &[Relation]) -> Result<BTreeMap<u32, u64>> {
        let options = &self.ctx.options;
        let pipe_template = self.file_paths.pipe_template();
        let hosts: BTreeMap<i32, String> = self
            .cluster
            .primaries()
            .map(|d| (d.content, d.hostname.clone()))
            .collect();
        let assignments = hosts
            .keys()
            .map(|c| (*c, tables.iter().map(|t| OidEntry::new(t.oid, 0, *c)).collect()))
            .collect();
        let scripts = tables
            .iter()
            .map(|t| ScriptEntry {
                oid: t.oid,
                table: t.fqn(),
                command: copy_statement(
                    &t.fqn(),
                    &t.attribute_string(),
                    true,
                    &backup_program(&pipe_template, t.oid),
                ),
            })
            .collect();

        let plan = HelperPlan {
            direction: Direction::Backup,
            file_paths: self.file_paths.clone(),
            hosts,
            assignments,
            scripts,
            source_dirs: BTreeMap::new(),
            compression: options.compression,
            single_data_file: options.single_data_file,
            on_error_continue: false,
        };
        tracing::info!(tables = tables.len(), jobs = options.jobs, "Writing data to file");
        let run = HelperRun::start(plan, self.ctx.settings.clone(), SkipSignal::new(), self.ctx.cancel.clone()).await?;

        match copy_tables(run.handle(), self.db.clone(), tables, options.jobs).await {
            Ok(rows) => {
                run.finish().await?;
                Ok(rows)
            }
            Err(CoordinatorError::Cancelled) => {
                let fatal = run.check().err();
                run.abort().await;
                Err(fatal.unwrap_or(CoordinatorError::Cancelled))
            }
            Err(e) => {
                run.abort().await;
                Err(e)
            }
        }
    }

    /// Config, TOC and report. The TOC and metadata are only meaningful for a
    /// successful run but are written either way.
    async fn write_files(&mut self, start: chrono::DateTime<Local>, error: Option<String>) -> Result<()> {
        let end = Local::now();
        self.config.endtime = end.format("%Y%m%d%H%M%S").to_string();
        if error.is_none() {
            self.toc.write_to(&self.file_paths.toc_path()).await?;
        }
        if let Some(plugin_config) = &self.ctx.options.plugin_config {
            tokio::fs::copy(plugin_config, self.file_paths.plugin_config_path()).await?;
        }
        self.config.write_to(&self.file_paths.config_path()).await?;
        BackupReport {
            config: &self.config,
            start,
            end,
            object_counts: self.object_counts.clone(),
            error,
        }
        .write_to(&self.file_paths.report_path())
        .await
    }

    async fn push_to_storage(&self) -> Result<()> {
        if self.storage.name().is_empty() {
            return Ok(());
        }
        let ts = self.file_paths.timestamp();
        let mut dirs = vec![self.file_paths.coordinator_dir()];
        dirs.extend(self.cluster.contents().into_iter().map(|c| self.file_paths.segment_dir(c)));
        for dir in dirs {
            for file in walker::list_backup_files(&dir, ts)? {
                self.storage.put(&file.path).await?;
            }
        }
        tracing::info!(plugin = %self.storage.name(), "Backup files pushed to storage");
        Ok(())
    }
}

/// Copy every table out to the helpers, at most `jobs` at a time. Permits
/// are taken in table order, the order helpers consume tables in.
async fn copy_tables(
    handle: RunHandle,
    db: Arc<dyn Database>,
    tables: &[Relation],
    jobs: usize,
) -> Result<BTreeMap<u32, u64>> {
    let cancel = handle.cancel_token();
    let permits = Arc::new(Semaphore::new(jobs.max(1)));
    let mut tasks = JoinSet::new();

    for table in tables {
        let permit = tokio::select! {
            permit = permits.clone().acquire_owned() => permit.map_err(|_| CoordinatorError::Cancelled)?,
            _ = cancel.cancelled() => break,
        };
        let db = db.clone();
        let table = table.clone();
        let pipes = handle.pipe_set(table.oid, 1);
        let cancel = cancel.clone();
        tasks.spawn(async move {
            let result = db.copy_to_segments(&table, &pipes).await;
            drop(permit);
            if result.is_err() {
                cancel.cancel();
            }
            (table, result)
        });
    }

    let mut progress = ProgressTracker::new(tables.len());
    let mut rows = BTreeMap::new();
    let mut first_error: Option<CoordinatorError> = None;
    while let Some(joined) = tasks.join_next().await {
        let (table, result) = joined.map_err(|e| CoordinatorError::Helper(format!("copy task failed: {e}")))?;
        match result {
            Ok(count) => {
                tracing::info!("{}", progress.table_rows(&table.fqn(), count));
                rows.insert(table.oid, count);
            }
            Err(CoordinatorError::Cancelled) if first_error.is_some() => {}
            Err(e) => {
                tracing::error!(table = %table.fqn(), error = %e, "Failed to back up table");
                first_error.get_or_insert(e);
            }
        }
    }
    if let Some(e) = first_error {
        return Err(e);
    }
    if cancel.is_cancelled() {
        return Err(CoordinatorError::Cancelled);
    }
    tracing::info!("{}", progress.summary());
    Ok(rows)
}
