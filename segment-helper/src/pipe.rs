//! Handoff files and the skip-aware wait primitive.
//!
//! A table's data moves between a helper and the database through one handoff
//! file per `(oid, batch)`. The producer publishes it atomically (write to
//! `.part`, then rename) and the consumer removes it once read, so the file
//! existing means "published, not yet consumed".
//!
//! Anyone blocked on a handoff waits through [`SkipWatcher::wait_for`], which
//! also returns as soon as the coordinator drops a skip file for the table.

use crate::utils::errors::Result;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

fn part_path(path: &Path) -> PathBuf {
    let mut s = path.as_os_str().to_owned();
    s.push(".part");
    PathBuf::from(s)
}

/// Publish `data` at `path`. Readers never observe a partially written file.
pub async fn publish(path: &Path, data: &[u8]) -> Result<()> {
    let part = part_path(path);
    tokio::fs::write(&part, data).await?;
    tokio::fs::rename(&part, path).await?;
    Ok(())
}

/// Read and remove a published handoff file. `None` if nothing is published.
pub async fn take(path: &Path) -> Result<Option<Vec<u8>>> {
    match tokio::fs::read(path).await {
        Ok(data) => {
            remove_if_exists(path).await?;
            Ok(Some(data))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Remove a file, treating "already gone" as success.
pub async fn remove_if_exists(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Create an empty marker file. Returns `false` when it already existed, so a
/// skip file is written at most once per table.
pub fn create_marker(path: &Path) -> Result<bool> {
    match std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
    {
        Ok(_) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// In-process wakeup raised whenever skip files are written or a handoff
/// file is published or consumed.
#[derive(Debug, Clone, Default)]
pub struct SkipSignal {
    notify: Arc<Notify>,
}

impl SkipSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wake every waiter so it re-checks its condition and skip file now.
    pub fn raise(&self) {
        self.notify.notify_waiters();
    }
}

/// How a wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Ready,
    Skipped,
    Cancelled,
}

/// Blocks until a condition holds, a skip file appears, or the run is
/// cancelled.
///
/// Same-process writers wake waiters through the shared [`SkipSignal`];
/// skip files written by another process are seen on the next poll.
#[derive(Debug, Clone)]
pub struct SkipWatcher {
    signal: SkipSignal,
    poll_interval: Duration,
}

impl SkipWatcher {
    pub fn new(signal: SkipSignal, poll_interval: Duration) -> Self {
        Self {
            signal,
            poll_interval,
        }
    }

    pub fn signal(&self) -> &SkipSignal {
        &self.signal
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub async fn wait_for<F>(
        &self,
        skip_file: &Path,
        mut condition: F,
        cancel: &CancellationToken,
    ) -> WaitOutcome
    where
        F: FnMut() -> bool,
    {
        loop {
            // Register before checking so a raise between the check and the
            // select is not lost.
            let notified = self.signal.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if cancel.is_cancelled() {
                return WaitOutcome::Cancelled;
            }
            if condition() {
                return WaitOutcome::Ready;
            }
            if skip_file.exists() {
                return WaitOutcome::Skipped;
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = cancel.cancelled() => return WaitOutcome::Cancelled,
            }
        }
    }
}
