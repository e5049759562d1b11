//! Segment helper executor - moves one segment's table data.
//!
//! The helper reads its oid file and walks the assigned tables in order:
//! - Backup: wait for the database to publish each table's handoff file,
//!   compress it and write it to a per-table file or the segment's single
//!   data file (plus segment TOC)
//! - Restore: read each batch's data from the source segment's backup files,
//!   publish it as a handoff file and wait until the database consumes it
//!
//! Every wait goes through [`SkipWatcher`], so a table the coordinator has
//! given up on is abandoned even while the helper is blocked on it.

use crate::config::PipeConfig;
use crate::events::{EventSink, HelperEvent};
use crate::fs::paths::SegmentPaths;
use crate::pipe::{self, SkipSignal, SkipWatcher, WaitOutcome};
use crate::protocol::{self, OidEntry};
use crate::segment_toc::{self, SegmentToc};
use crate::state::TableState;
use crate::transfer::codec::Compression;
use crate::utils::errors::{HelperError, Result};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Direction {
    Backup,
    Restore,
}

/// Work description for one helper.
#[derive(Debug, Clone)]
pub struct HelperJob {
    pub direction: Direction,
    /// This helper's directory and control files.
    pub paths: SegmentPaths,
    /// Restore only: backup directory of each source content in the oid file.
    pub source_dirs: BTreeMap<i32, PathBuf>,
    pub compression: Compression,
    pub single_data_file: bool,
    pub on_error_continue: bool,
}

/// Outcome counts for one helper run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HelperSummary {
    pub done: usize,
    pub skipped: usize,
    pub failed: usize,
    pub bytes: u64,
}

/// Batches of one table, in oid file order.
#[derive(Debug, Clone)]
struct TableWork {
    oid: u32,
    batches: Vec<OidEntry>,
}

fn group_by_table(entries: Vec<OidEntry>) -> Vec<TableWork> {
    let mut tables: Vec<TableWork> = Vec::new();
    for entry in entries {
        match tables.last_mut() {
            Some(last) if last.oid == entry.oid => last.batches.push(entry),
            _ => tables.push(TableWork {
                oid: entry.oid,
                batches: vec![entry],
            }),
        }
    }
    tables
}

/// Open single data file being appended to during a backup.
struct SingleFileWriter {
    file: tokio::fs::File,
    offset: u64,
    toc: SegmentToc,
}

pub struct Helper {
    job: HelperJob,
    sink: EventSink,
    watcher: SkipWatcher,
    heartbeat_interval: Duration,
    cancel: CancellationToken,
    states: HashMap<u32, TableState>,
    tables: HashMap<u32, String>,
    source_tocs: HashMap<i32, SegmentToc>,
}

impl Helper {
    pub fn new(
        job: HelperJob,
        pipe_config: &PipeConfig,
        signal: SkipSignal,
        sink: EventSink,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            job,
            sink,
            watcher: SkipWatcher::new(signal, pipe_config.poll_interval()),
            heartbeat_interval: pipe_config.heartbeat_interval(),
            cancel,
            states: HashMap::new(),
            tables: HashMap::new(),
            source_tocs: HashMap::new(),
        }
    }

    fn content(&self) -> i32 {
        self.job.paths.content()
    }

    fn table_name(&self, oid: u32) -> String {
        self.tables
            .get(&oid)
            .cloned()
            .unwrap_or_else(|| format!("oid {oid}"))
    }

    fn set_state(&mut self, oid: u32, to: TableState) -> Result<()> {
        let from = self.states.get(&oid).copied().unwrap_or(TableState::Idle);
        let next = from.transition(oid, to)?;
        self.states.insert(oid, next);
        Ok(())
    }

    /// Run the helper to completion.
    pub async fn run(mut self) -> Result<HelperSummary> {
        let content = self.content();
        let entries = protocol::read_oid_file(&self.job.paths.oid_file()).await?;
        let script = protocol::read_script_file(&self.job.paths.script_file()).await?;
        self.tables = script.into_iter().map(|s| (s.oid, s.table)).collect();
        let tables = group_by_table(entries);

        info!(
            "Helper for segment {} starting {:?} of {} tables",
            content,
            self.job.direction,
            tables.len()
        );
        self.sink.emit(HelperEvent::Started {
            content,
            tables: tables.len(),
        });

        let heartbeat_stop = self.cancel.child_token();
        let heartbeat = spawn_heartbeat(
            self.sink.clone(),
            content,
            self.heartbeat_interval,
            heartbeat_stop.clone(),
        );

        let result = self.process_tables(tables).await;

        heartbeat_stop.cancel();
        let _ = heartbeat.await;

        match &result {
            Ok(summary) => {
                info!(
                    "Helper for segment {} finished: {} done, {} skipped, {} failed",
                    content, summary.done, summary.skipped, summary.failed
                );
                self.sink.emit(HelperEvent::Finished {
                    content,
                    success: summary.failed == 0,
                    error: None,
                });
            }
            Err(e) => {
                error!("Helper for segment {} failed: {}", content, e);
                self.sink.emit(HelperEvent::Finished {
                    content,
                    success: false,
                    error: Some(e.to_string()),
                });
            }
        }
        result
    }

    async fn process_tables(&mut self, tables: Vec<TableWork>) -> Result<HelperSummary> {
        let mut summary = HelperSummary::default();
        let mut single = match (self.job.direction, self.job.single_data_file) {
            (Direction::Backup, true) => Some(self.open_single_file().await?),
            _ => None,
        };

        for table in tables {
            let oid = table.oid;
            self.set_state(oid, TableState::Assigned)?;
            self.sink.emit(HelperEvent::TableStarted {
                content: self.content(),
                oid,
            });

            let outcome = match self.job.direction {
                Direction::Backup => self.backup_table(&table, single.as_mut()).await,
                Direction::Restore => self.restore_table(&table).await,
            };

            match outcome {
                Ok(Some(bytes)) => {
                    self.set_state(oid, TableState::Done)?;
                    summary.done += 1;
                    summary.bytes += bytes;
                    self.sink.emit(HelperEvent::TableDone {
                        content: self.content(),
                        oid,
                        bytes,
                    });
                }
                Ok(None) => {
                    self.set_state(oid, TableState::Skipped)?;
                    summary.skipped += 1;
                    self.sink.emit(HelperEvent::TableSkipped {
                        content: self.content(),
                        oid,
                    });
                }
                Err(HelperError::Cancelled) => return Err(HelperError::Cancelled),
                Err(e) => {
                    let table_name = self.table_name(oid);
                    error!(
                        "Segment {}: table {} failed: {}",
                        self.content(),
                        table_name,
                        e
                    );
                    self.set_state(oid, TableState::Failed)?;
                    summary.failed += 1;
                    protocol::append_error(&self.job.paths.error_file(), oid, &e.to_string())?;
                    self.sink.emit(HelperEvent::TableFailed {
                        content: self.content(),
                        oid,
                        error: e.to_string(),
                    });
                    if !self.job.on_error_continue {
                        return Err(e);
                    }
                }
            }
        }

        if let Some(writer) = single {
            self.finish_single_file(writer).await?;
        }
        Ok(summary)
    }

    /// `Some(bytes)` when stored, `None` when skipped.
    async fn backup_table(
        &mut self,
        table: &TableWork,
        single: Option<&mut SingleFileWriter>,
    ) -> Result<Option<u64>> {
        let oid = table.oid;
        let handoff = self.job.paths.table_pipe(oid, 0);
        let skip_file = self.job.paths.skip_file(oid);

        let outcome = self
            .watcher
            .wait_for(&skip_file, || handoff.exists(), &self.cancel)
            .await;
        match outcome {
            WaitOutcome::Ready => {}
            WaitOutcome::Skipped => {
                info!("Skip file has been discovered for entry {}", oid);
                return Ok(None);
            }
            WaitOutcome::Cancelled => return Err(HelperError::Cancelled),
        }

        self.set_state(oid, TableState::Streaming)?;
        let rows = pipe::take(&handoff).await?.unwrap_or_default();
        self.watcher.signal().raise();
        let encoded = self.job.compression.encode(&rows)?;

        match single {
            Some(writer) => {
                writer.file.write_all(&encoded).await?;
                let start = writer.offset;
                writer.offset += encoded.len() as u64;
                writer.toc.add(oid, start, writer.offset);
            }
            None => {
                let path = self.job.paths.table_data(
                    self.content(),
                    oid,
                    self.job.compression.extension(),
                );
                tokio::fs::write(&path, &encoded).await?;
            }
        }

        debug!(
            "Segment {}: backed up {} ({} bytes, {} stored)",
            self.content(),
            self.table_name(oid),
            rows.len(),
            encoded.len()
        );
        Ok(Some(rows.len() as u64))
    }

    async fn restore_table(&mut self, table: &TableWork) -> Result<Option<u64>> {
        let oid = table.oid;
        let skip_file = self.job.paths.skip_file(oid);
        if skip_file.exists() {
            info!("Skip file has been discovered for entry {}", oid);
            return Ok(None);
        }

        let mut bytes = 0u64;
        for entry in &table.batches {
            let rows = self.load_batch(entry).await?;
            if self.states.get(&oid) == Some(&TableState::Assigned) {
                self.set_state(oid, TableState::Streaming)?;
            }

            let handoff = self.job.paths.table_pipe(oid, entry.batch);
            pipe::publish(&handoff, &rows).await?;
            self.watcher.signal().raise();

            let outcome = self
                .watcher
                .wait_for(&skip_file, || !handoff.exists(), &self.cancel)
                .await;
            match outcome {
                WaitOutcome::Ready => bytes += rows.len() as u64,
                WaitOutcome::Skipped => {
                    info!("Skip file has been discovered for entry {}", oid);
                    pipe::remove_if_exists(&handoff).await?;
                    return Ok(None);
                }
                WaitOutcome::Cancelled => {
                    pipe::remove_if_exists(&handoff).await?;
                    return Err(HelperError::Cancelled);
                }
            }
        }
        Ok(Some(bytes))
    }

    /// Decompressed rows for one batch of a restore.
    async fn load_batch(&mut self, entry: &OidEntry) -> Result<Vec<u8>> {
        if !entry.has_data() {
            return Ok(Vec::new());
        }
        let source = entry.source_content;
        let dir = self.job.source_dirs.get(&source).cloned().ok_or_else(|| {
            HelperError::Config(format!("no backup directory for source segment {source}"))
        })?;
        let source_paths = SegmentPaths::new(
            dir,
            source,
            self.job.paths.timestamp().clone(),
            self.job.paths.pid(),
        );

        let stored = if self.job.single_data_file {
            if !self.source_tocs.contains_key(&source) {
                let toc = SegmentToc::read_from(&source_paths.segment_toc(source)).await?;
                self.source_tocs.insert(source, toc);
            }
            let range = match self.source_tocs.get(&source) {
                Some(toc) => toc.entry(entry.oid)?,
                None => return Err(HelperError::MissingTocEntry(entry.oid)),
            };
            read_range(&source_paths.single_data(source), entry.oid, range).await?
        } else {
            let path = source_paths.table_data(source, entry.oid, self.job.compression.extension());
            tokio::fs::read(&path).await.map_err(|e| {
                HelperError::Io(std::io::Error::new(
                    e.kind(),
                    format!("{}: {}", path.display(), e),
                ))
            })?
        };
        self.job.compression.decode(&stored)
    }

    async fn open_single_file(&self) -> Result<SingleFileWriter> {
        let path = self.job.paths.single_data(self.content());
        let file = tokio::fs::File::create(&path).await?;
        Ok(SingleFileWriter {
            file,
            offset: 0,
            toc: SegmentToc::new(),
        })
    }

    async fn finish_single_file(&self, mut writer: SingleFileWriter) -> Result<()> {
        writer.file.flush().await?;
        writer
            .toc
            .write_to(&self.job.paths.segment_toc(self.content()))
            .await?;
        info!(
            "Segment {}: wrote single data file with {} tables ({} bytes)",
            self.content(),
            writer.toc.dataentries.len(),
            writer.offset
        );
        Ok(())
    }
}

async fn read_range(
    path: &std::path::Path,
    oid: u32,
    range: segment_toc::SegmentDataEntry,
) -> Result<Vec<u8>> {
    let mut file = tokio::fs::File::open(path).await?;
    let len = file.metadata().await?.len();
    if range.endbyte > len {
        return Err(HelperError::CorruptToc(format!(
            "entry {oid} ends at byte {} past the end of {}",
            range.endbyte,
            path.display()
        )));
    }
    file.seek(std::io::SeekFrom::Start(range.startbyte)).await?;
    let mut buf = vec![0u8; (range.endbyte - range.startbyte) as usize];
    file.read_exact(&mut buf).await?;
    Ok(buf)
}

fn spawn_heartbeat(
    sink: EventSink,
    content: i32,
    interval: Duration,
    stop: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => sink.emit(HelperEvent::Heartbeat { content }),
                _ = stop.cancelled() => break,
            }
        }
    })
}

/// Remove handoff files this helper published but nobody consumed.
pub async fn remove_unconsumed(paths: &SegmentPaths, entries: &[OidEntry]) {
    for entry in entries {
        let handoff = paths.table_pipe(entry.oid, entry.batch);
        if let Err(e) = pipe::remove_if_exists(&handoff).await {
            warn!("Failed to remove {}: {}", handoff.display(), e);
        }
    }
}
