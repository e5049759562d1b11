//! Coordinator side of the segment helpers for one backup or restore pass.
//!
//! [`HelperRun::start`] writes each segment's oid and script files, starts a
//! helper per segment and follows their events:
//! - per-table states live on a shared board keyed by `(content, oid)`
//! - a table a helper failed on is skipped everywhere under
//!   on-error-continue, and cancels the run otherwise
//! - a helper silent for longer than the helper timeout is hung; the run is
//!   cancelled and [`HelperRun::finish`] terminates every helper
//! - a helper process that exits non-zero before reporting completion fails
//!   the pass as soon as it exits
//!
//! Nothing here removes artifacts; the orchestrators clean the segment
//! directories once the pass is over.

pub mod launcher;

use crate::config::Settings;
use crate::database::PipeSet;
use crate::error::{CoordinatorError, Result};
use dashmap::DashMap;
use futures_util::future::join_all;
use launcher::{HelperSpec, Launcher, RunningHelper};
use segment_helper::events::HelperEvent;
use segment_helper::executor::Direction;
use segment_helper::pipe::{create_marker, SkipSignal, SkipWatcher};
use segment_helper::protocol::{self, OidEntry, ScriptEntry};
use segment_helper::state::TableState;
use segment_helper::transfer::codec::Compression;
use segment_helper::{FilePathInfo, SegmentPaths};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Everything needed to start the helpers of one pass.
#[derive(Debug, Clone)]
pub struct HelperPlan {
    pub direction: Direction,
    pub file_paths: FilePathInfo,
    /// Destination segments and their hosts.
    pub hosts: BTreeMap<i32, String>,
    pub assignments: BTreeMap<i32, Vec<OidEntry>>,
    pub scripts: Vec<ScriptEntry>,
    /// Restore only: backup directories of the source segments.
    pub source_dirs: BTreeMap<i32, PathBuf>,
    pub compression: Compression,
    pub single_data_file: bool,
    pub on_error_continue: bool,
}

#[derive(Debug, Clone)]
enum Fatal {
    Timeout { content: i32, secs: u64 },
    Helper(String),
}

impl From<&Fatal> for CoordinatorError {
    fn from(fatal: &Fatal) -> Self {
        match fatal {
            Fatal::Timeout { content, secs } => CoordinatorError::HelperTimeout {
                content: *content,
                secs: *secs,
            },
            Fatal::Helper(message) => CoordinatorError::Helper(message.clone()),
        }
    }
}

/// State shared between the run and its event pump and watchdog.
struct Shared {
    board: DashMap<(i32, u32), TableState>,
    last_seen: DashMap<i32, Instant>,
    finished: DashMap<i32, bool>,
    helper_failures: DashMap<u32, String>,
    fatal: Mutex<Option<Fatal>>,
    segments: BTreeMap<i32, SegmentPaths>,
    signal: SkipSignal,
    on_error_continue: bool,
    cancel: CancellationToken,
}

impl Shared {
    fn set_fatal(&self, fatal: Fatal) {
        if let Ok(mut slot) = self.fatal.lock() {
            if slot.is_none() {
                *slot = Some(fatal);
            }
        }
        self.cancel.cancel();
    }

    fn fatal(&self) -> Option<CoordinatorError> {
        self.fatal
            .lock()
            .ok()
            .and_then(|slot| slot.as_ref().map(CoordinatorError::from))
    }

    fn advance(&self, content: i32, oid: u32, to: TableState) {
        let mut entry = self.board.entry((content, oid)).or_insert(TableState::Idle);
        let from = *entry;
        // Helpers report done without a separate streaming event.
        let from = if to == TableState::Done && from == TableState::Assigned {
            TableState::Streaming
        } else {
            from
        };
        match from.transition(oid, to) {
            Ok(next) => *entry = next,
            Err(e) => tracing::warn!(content, oid, error = %e, "Ignoring helper event"),
        }
    }

    /// Write the skip file for `oid` on every segment and wake blocked
    /// waiters. Returns how many skip files were new.
    fn skip_table(&self, oid: u32) -> usize {
        let mut created = 0;
        for paths in self.segments.values() {
            match create_marker(&paths.skip_file(oid)) {
                Ok(true) => created += 1,
                Ok(false) => {}
                Err(e) => tracing::warn!(
                    content = paths.content(),
                    oid,
                    error = %e,
                    "Failed to write skip file"
                ),
            }
        }
        self.signal.raise();
        created
    }

    fn handle(&self, event: HelperEvent) {
        let content = event.content();
        self.last_seen.insert(content, Instant::now());
        match event {
            HelperEvent::Started { tables, .. } => {
                tracing::debug!(content, tables, "Helper started");
            }
            HelperEvent::TableStarted { oid, .. } => self.advance(content, oid, TableState::Assigned),
            HelperEvent::TableDone { oid, bytes, .. } => {
                tracing::debug!(content, oid, bytes, "Helper finished table");
                self.advance(content, oid, TableState::Done);
            }
            HelperEvent::TableSkipped { oid, .. } => self.advance(content, oid, TableState::Skipped),
            HelperEvent::TableFailed { oid, error, .. } => {
                self.advance(content, oid, TableState::Failed);
                tracing::error!(content, oid, error = %error, "Helper failed table");
                self.helper_failures.entry(oid).or_insert_with(|| error.clone());
                if self.on_error_continue {
                    self.skip_table(oid);
                } else {
                    self.set_fatal(Fatal::Helper(format!(
                        "Helper for segment {content} failed on table oid {oid}: {error}"
                    )));
                }
            }
            HelperEvent::Heartbeat { .. } => {}
            HelperEvent::Finished { success, error, .. } => {
                self.finished.insert(content, true);
                if let Some(error) = error {
                    self.set_fatal(Fatal::Helper(format!(
                        "Helper for segment {content} exited: {error}"
                    )));
                } else if !success {
                    tracing::warn!(content, "Helper finished with failed tables");
                }
            }
        }
    }
}

/// Cloneable view of a running pass for table loads.
#[derive(Clone)]
pub struct RunHandle {
    shared: Arc<Shared>,
    watcher: SkipWatcher,
    pipe_template: String,
}

impl RunHandle {
    /// Token cancelled when the pass must stop.
    pub fn cancel_token(&self) -> CancellationToken {
        self.shared.cancel.clone()
    }

    pub fn pipe_set(&self, oid: u32, batches: usize) -> PipeSet {
        PipeSet {
            oid,
            batches,
            segments: self.shared.segments.clone(),
            pipe_template: self.pipe_template.clone(),
            watcher: self.watcher.clone(),
            cancel: self.shared.cancel.clone(),
        }
    }

    /// Give up on `oid` everywhere. Helpers blocked on it move on.
    pub fn skip_table(&self, oid: u32) -> usize {
        self.shared.skip_table(oid)
    }

    /// Error a helper reported for `oid`, if any.
    pub fn helper_failure(&self, oid: u32) -> Option<String> {
        self.shared.helper_failures.get(&oid).map(|e| e.clone())
    }

    /// The fatal condition that stopped the pass, if any.
    pub fn check(&self) -> Result<()> {
        match self.shared.fatal() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub fn table_state(&self, content: i32, oid: u32) -> TableState {
        self.shared
            .board
            .get(&(content, oid))
            .map(|s| *s)
            .unwrap_or(TableState::Idle)
    }
}

/// Helpers of one pass.
pub struct HelperRun {
    handle: RunHandle,
    running: Vec<RunningHelper>,
    pump: JoinHandle<()>,
    watchdog: JoinHandle<()>,
    exit_wait: Duration,
}

impl std::ops::Deref for HelperRun {
    type Target = RunHandle;

    fn deref(&self) -> &RunHandle {
        &self.handle
    }
}

impl HelperRun {
    pub async fn start(
        plan: HelperPlan,
        settings: Arc<Settings>,
        signal: SkipSignal,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let pid = plan.file_paths.pid();
        let mut segments = BTreeMap::new();
        for content in plan.hosts.keys() {
            let paths = plan.file_paths.segment(*content);
            tokio::fs::create_dir_all(paths.dir()).await?;
            let entries = plan.assignments.get(content).cloned().unwrap_or_default();
            protocol::write_oid_file(&paths.oid_file(), &entries).await?;
            protocol::write_script_file(&paths.script_file(), &plan.scripts).await?;
            segments.insert(*content, paths);
        }
        tracing::info!(
            helpers = segments.len(),
            direction = ?plan.direction,
            pid,
            "Starting segment helpers"
        );

        let run_cancel = cancel.child_token();
        let now = Instant::now();
        let shared = Arc::new(Shared {
            board: DashMap::new(),
            last_seen: segments.keys().map(|c| (*c, now)).collect(),
            finished: DashMap::new(),
            helper_failures: DashMap::new(),
            fatal: Mutex::new(None),
            segments: segments.clone(),
            signal: signal.clone(),
            on_error_continue: plan.on_error_continue,
            cancel: run_cancel.clone(),
        });

        let (tx, mut rx) = mpsc::unbounded_channel::<HelperEvent>();
        let pump_shared = shared.clone();
        let pump = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                pump_shared.handle(event);
            }
        });

        let launcher = Launcher::new(settings.clone(), signal.clone());
        let mut running = Vec::with_capacity(segments.len());
        for (content, paths) in &segments {
            let spec = HelperSpec {
                direction: plan.direction,
                host: plan.hosts.get(content).cloned().unwrap_or_default(),
                paths: paths.clone(),
                source_dirs: plan.source_dirs.clone(),
                compression: plan.compression,
                single_data_file: plan.single_data_file,
                on_error_continue: plan.on_error_continue,
            };
            match launcher.spawn(spec, tx.clone(), run_cancel.clone()).await {
                Ok(helper) => running.push(helper),
                Err(e) => {
                    run_cancel.cancel();
                    for helper in running.iter_mut() {
                        helper.kill().await;
                    }
                    pump.abort();
                    return Err(e);
                }
            }
        }
        drop(tx);

        let watchdog = spawn_watchdog(shared.clone(), settings.helper_timeout());
        Ok(Self {
            handle: RunHandle {
                shared,
                watcher: SkipWatcher::new(signal, settings.pipe_config().poll_interval()),
                pipe_template: plan.file_paths.pipe_template(),
            },
            running,
            pump,
            watchdog,
            exit_wait: settings.helper_exit_wait(),
        })
    }

    pub fn handle(&self) -> RunHandle {
        self.handle.clone()
    }

    /// Wait for every helper to exit, terminating those still running when
    /// the exit wait ends. Returns the fatal condition of the pass, if any.
    pub async fn finish(mut self) -> Result<()> {
        let exit_wait = self.exit_wait;
        for e in wait_all(&mut self.running, exit_wait).await {
            self.handle.shared.set_fatal(Fatal::Helper(e.to_string()));
        }
        self.watchdog.abort();
        if tokio::time::timeout(exit_wait, &mut self.pump).await.is_err() {
            self.pump.abort();
        }
        self.handle.check()
    }

    /// Cancel the pass and terminate every helper that does not stop within
    /// the exit wait.
    pub async fn abort(mut self) {
        self.handle.shared.cancel.cancel();
        wait_all(&mut self.running, self.exit_wait).await;
        self.watchdog.abort();
        self.pump.abort();
    }
}

/// Wait for all helpers under one deadline, then kill the ones still
/// running. Returns the errors of helpers that exited badly.
async fn wait_all(running: &mut [RunningHelper], exit_wait: Duration) -> Vec<CoordinatorError> {
    let deadline = tokio::time::Instant::now() + exit_wait;
    let outcomes = join_all(running.iter_mut().map(|helper| async move {
        let outcome = tokio::time::timeout_at(deadline, helper.wait()).await;
        (helper, outcome)
    }))
    .await;

    let mut errors = Vec::new();
    let mut hung = Vec::new();
    for (helper, outcome) in outcomes {
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => errors.push(e),
            Err(_) => {
                tracing::warn!(
                    content = helper.content(),
                    wait_secs = exit_wait.as_secs(),
                    "Helper did not exit in time"
                );
                hung.push(helper);
            }
        }
    }
    join_all(hung.into_iter().map(|helper| async move { helper.kill().await })).await;
    errors
}

fn spawn_watchdog(shared: Arc<Shared>, timeout: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval((timeout / 4).max(Duration::from_millis(10)));
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shared.cancel.cancelled() => break,
            }
            let hung = shared
                .last_seen
                .iter()
                .filter(|e| !shared.finished.contains_key(e.key()))
                .find(|e| e.value().elapsed() > timeout)
                .map(|e| *e.key());
            if let Some(content) = hung {
                tracing::error!(content, timeout_secs = timeout.as_secs(), "Helper is hung");
                shared.set_fatal(Fatal::Timeout {
                    content,
                    secs: timeout.as_secs(),
                });
                break;
            }
        }
    })
}

/// Remove every helper artifact of `file_paths` on every segment.
pub fn remove_artifacts(file_paths: &FilePathInfo, contents: impl IntoIterator<Item = i32>) {
    for content in contents {
        let dir = file_paths.segment_dir(content);
        match segment_helper::fs::walker::remove_helper_artifacts(&dir, file_paths.timestamp()) {
            Ok(0) => {}
            Ok(n) => tracing::debug!(content, removed = n, "Removed helper artifacts"),
            Err(e) => tracing::warn!(content, error = %e, "Failed to clean helper artifacts"),
        }
    }
}
