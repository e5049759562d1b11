//! Starting and stopping segment helpers.
//!
//! In-process helpers are tokio tasks sharing the coordinator's skip signal.
//! Process helpers run `gpbackup_helper` locally through `tokio::process`, or
//! over SSH for segments on other hosts; either way their events arrive as
//! JSON lines on stdout.

use crate::config::{HelperMode, Settings};
use crate::error::{CoordinatorError, Result};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use segment_helper::events::{EventSink, HelperEvent};
use segment_helper::executor::{Direction, Helper, HelperJob, HelperSummary};
use segment_helper::pipe::SkipSignal;
use segment_helper::transfer::codec::Compression;
use segment_helper::SegmentPaths;
use std::collections::BTreeMap;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, BufReader as AsyncBufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// What one helper is asked to do.
#[derive(Debug, Clone)]
pub struct HelperSpec {
    pub direction: Direction,
    pub host: String,
    pub paths: SegmentPaths,
    pub source_dirs: BTreeMap<i32, PathBuf>,
    pub compression: Compression,
    pub single_data_file: bool,
    pub on_error_continue: bool,
}

impl HelperSpec {
    fn job(&self) -> HelperJob {
        HelperJob {
            direction: self.direction,
            paths: self.paths.clone(),
            source_dirs: self.source_dirs.clone(),
            compression: self.compression,
            single_data_file: self.single_data_file,
            on_error_continue: self.on_error_continue,
        }
    }

    /// `gpbackup_helper` arguments for this helper.
    pub fn args(&self, helper_config: Option<&Path>) -> Vec<String> {
        let direction = match self.direction {
            Direction::Backup => "backup",
            Direction::Restore => "restore",
        };
        let mut args = vec![
            "--direction".to_string(),
            direction.to_string(),
            "--content".to_string(),
            self.paths.content().to_string(),
            "--timestamp".to_string(),
            self.paths.timestamp().to_string(),
            "--dir".to_string(),
            self.paths.dir().display().to_string(),
            "--pid".to_string(),
            self.paths.pid().to_string(),
            "--compression".to_string(),
            self.compression.to_string(),
        ];
        for (content, dir) in &self.source_dirs {
            args.push("--source-dir".to_string());
            args.push(format!("{}={}", content, dir.display()));
        }
        if self.single_data_file {
            args.push("--single-data-file".to_string());
        }
        if self.on_error_continue {
            args.push("--on-error-continue".to_string());
        }
        if let Some(config) = helper_config {
            args.push("--config".to_string());
            args.push(config.display().to_string());
        }
        args
    }
}

fn shell_quote(arg: &str) -> String {
    format!("'{}'", arg.replace('\'', r"'\''"))
}

#[derive(Debug, Clone)]
pub struct SshTarget {
    host: String,
    port: u16,
    user: String,
    key_path: Option<PathBuf>,
}

impl SshTarget {
    fn connect(&self) -> Result<ssh2::Session> {
        let tcp = std::net::TcpStream::connect((self.host.as_str(), self.port))?;
        let mut sess = ssh2::Session::new().map_err(ssh_error)?;
        sess.set_tcp_stream(tcp);
        sess.handshake().map_err(ssh_error)?;
        match &self.key_path {
            Some(key) => sess
                .userauth_pubkey_file(&self.user, None, key, None)
                .map_err(ssh_error)?,
            None => sess.userauth_agent(&self.user).map_err(ssh_error)?,
        }
        if !sess.authenticated() {
            return Err(CoordinatorError::Helper(format!(
                "SSH authentication to {} failed",
                self.host
            )));
        }
        Ok(sess)
    }

    fn exec(&self, cmd: &str) -> Result<String> {
        let sess = self.connect()?;
        let mut channel = sess.channel_session().map_err(ssh_error)?;
        channel.exec(cmd).map_err(ssh_error)?;
        let mut stdout = String::new();
        std::io::Read::read_to_string(&mut channel, &mut stdout)?;
        channel.wait_close().map_err(ssh_error)?;
        Ok(stdout)
    }
}

fn ssh_error(e: ssh2::Error) -> CoordinatorError {
    CoordinatorError::Helper(format!("SSH error: {e}"))
}

/// A started helper.
pub enum RunningHelper {
    Task {
        content: i32,
        handle: JoinHandle<segment_helper::Result<HelperSummary>>,
        cancel: CancellationToken,
    },
    Process {
        content: i32,
        pid: Option<u32>,
        stop: CancellationToken,
        monitor: JoinHandle<Result<()>>,
    },
    Remote {
        content: i32,
        target: SshTarget,
        pid: Arc<Mutex<Option<u32>>>,
        stop: CancellationToken,
        monitor: JoinHandle<Result<()>>,
    },
}

/// A process helper exited non-zero without reporting completion. The pass
/// hears about it as a failed `Finished` event right away.
fn unexpected_exit(
    content: i32,
    status: &str,
    events: &mpsc::UnboundedSender<HelperEvent>,
) -> CoordinatorError {
    let error = format!("{status} before reporting completion");
    let _ = events.send(HelperEvent::Finished {
        content,
        success: false,
        error: Some(error.clone()),
    });
    CoordinatorError::Helper(format!("helper for segment {content} exited with {error}"))
}

impl RunningHelper {
    pub fn content(&self) -> i32 {
        match self {
            RunningHelper::Task { content, .. }
            | RunningHelper::Process { content, .. }
            | RunningHelper::Remote { content, .. } => *content,
        }
    }

    /// Wait for the helper to exit. Table failures are reported through
    /// events; an error here means the helper did not run to completion.
    /// A helper stopped through [`RunningHelper::kill`] is not an error.
    pub async fn wait(&mut self) -> Result<()> {
        match self {
            RunningHelper::Task { handle, .. } => match handle.await {
                Ok(_) => Ok(()),
                Err(e) if e.is_cancelled() => Ok(()),
                Err(e) => Err(CoordinatorError::Helper(format!("helper task panicked: {e}"))),
            },
            RunningHelper::Process { monitor, .. } | RunningHelper::Remote { monitor, .. } => {
                match monitor.await {
                    Ok(result) => result,
                    Err(e) if e.is_cancelled() => Ok(()),
                    Err(e) => Err(CoordinatorError::Helper(format!("helper monitor panicked: {e}"))),
                }
            }
        }
    }

    /// Stop the helper now.
    pub async fn kill(&mut self) {
        let content = self.content();
        tracing::warn!(content, "Terminating helper");
        match self {
            RunningHelper::Task { handle, cancel, .. } => {
                cancel.cancel();
                handle.abort();
            }
            RunningHelper::Process { pid, stop, .. } => {
                stop.cancel();
                if let Some(pid) = pid {
                    if let Err(e) = signal::kill(Pid::from_raw(*pid as i32), Signal::SIGKILL) {
                        tracing::warn!(content, error = %e, "Failed to signal helper");
                    }
                }
            }
            RunningHelper::Remote {
                target,
                pid,
                stop,
                monitor,
                ..
            } => {
                stop.cancel();
                let remote_pid = pid.lock().ok().and_then(|p| *p);
                if let Some(remote_pid) = remote_pid {
                    let target = target.clone();
                    let killed = tokio::task::spawn_blocking(move || {
                        target.exec(&format!("kill -KILL {remote_pid}"))
                    })
                    .await;
                    if let Ok(Err(e)) = killed {
                        tracing::warn!(content, error = %e, "Failed to kill remote helper");
                    }
                }
                monitor.abort();
            }
        }
    }
}

pub struct Launcher {
    settings: Arc<Settings>,
    signal: SkipSignal,
    local_host: String,
}

impl Launcher {
    pub fn new(settings: Arc<Settings>, signal: SkipSignal) -> Self {
        let local_host = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "localhost".into());
        Self {
            settings,
            signal,
            local_host,
        }
    }

    fn is_local(&self, host: &str) -> bool {
        host == self.local_host || host == "localhost" || host == "127.0.0.1"
    }

    pub async fn spawn(
        &self,
        spec: HelperSpec,
        events: mpsc::UnboundedSender<HelperEvent>,
        cancel: CancellationToken,
    ) -> Result<RunningHelper> {
        let content = spec.paths.content();
        match self.settings.helper_mode {
            HelperMode::InProcess => {
                let cancel = cancel.child_token();
                let helper = Helper::new(
                    spec.job(),
                    &self.settings.pipe_config(),
                    self.signal.clone(),
                    EventSink::Channel(events),
                    cancel.clone(),
                );
                Ok(RunningHelper::Task {
                    content,
                    handle: tokio::spawn(helper.run()),
                    cancel,
                })
            }
            HelperMode::Process if self.is_local(&spec.host) => self.spawn_local(spec, events).await,
            HelperMode::Process => self.spawn_remote(spec, events),
        }
    }

    async fn spawn_local(
        &self,
        spec: HelperSpec,
        events: mpsc::UnboundedSender<HelperEvent>,
    ) -> Result<RunningHelper> {
        let content = spec.paths.content();
        let mut child = tokio::process::Command::new(&self.settings.helper_path)
            .args(spec.args(self.settings.helper_config.as_deref()))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                CoordinatorError::Helper(format!(
                    "cannot start {}: {}",
                    self.settings.helper_path.display(),
                    e
                ))
            })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| CoordinatorError::Helper("helper stdout not captured".into()))?;
        let pid = child.id();
        let stop = CancellationToken::new();
        let stopped = stop.clone();
        let monitor: JoinHandle<Result<()>> = tokio::spawn(async move {
            let mut finished = false;
            let mut lines = AsyncBufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if let Some(event) = HelperEvent::from_line(&line) {
                    finished |= matches!(event, HelperEvent::Finished { .. });
                    let _ = events.send(event);
                }
            }
            let status = child.wait().await?;
            if status.success() || finished || stopped.is_cancelled() {
                return Ok(());
            }
            Err(unexpected_exit(content, &status.to_string(), &events))
        });

        tracing::debug!(content, pid = ?pid, "Started local helper process");
        Ok(RunningHelper::Process {
            content,
            pid,
            stop,
            monitor,
        })
    }

    fn spawn_remote(
        &self,
        spec: HelperSpec,
        events: mpsc::UnboundedSender<HelperEvent>,
    ) -> Result<RunningHelper> {
        let content = spec.paths.content();
        let target = SshTarget {
            host: spec.host.clone(),
            port: self.settings.ssh_port,
            user: self.settings.ssh_user.clone(),
            key_path: self.settings.ssh_key_path.clone(),
        };
        let helper_config = self.settings.helper_config.clone();
        let args: Vec<String> = spec
            .args(helper_config.as_deref())
            .iter()
            .map(|a| shell_quote(a))
            .collect();
        let cmd = format!(
            "echo $$; exec {} {}",
            shell_quote(&self.settings.helper_path.display().to_string()),
            args.join(" ")
        );

        let pid = Arc::new(Mutex::new(None));
        let reader_pid = pid.clone();
        let reader_target = target.clone();
        let stop = CancellationToken::new();
        let stopped = stop.clone();
        let monitor = tokio::task::spawn_blocking(move || -> Result<()> {
            let sess = reader_target.connect()?;
            let mut channel = sess.channel_session().map_err(ssh_error)?;
            channel.exec(&cmd).map_err(ssh_error)?;

            let mut lines = BufReader::new(&mut channel).lines();
            if let Some(first) = lines.next() {
                let remote_pid = first?.trim().parse::<u32>().ok();
                if let Ok(mut slot) = reader_pid.lock() {
                    *slot = remote_pid;
                }
            }
            let mut finished = false;
            for line in lines {
                if let Some(event) = HelperEvent::from_line(&line?) {
                    finished |= matches!(event, HelperEvent::Finished { .. });
                    let _ = events.send(event);
                }
            }
            channel.wait_close().map_err(ssh_error)?;
            let code = channel.exit_status().map_err(ssh_error)?;
            if code == 0 || finished || stopped.is_cancelled() {
                return Ok(());
            }
            Err(unexpected_exit(content, &format!("exit status: {code}"), &events))
        });

        tracing::debug!(content, host = %target.host, "Started remote helper");
        Ok(RunningHelper::Remote {
            content,
            target,
            pid,
            stop,
            monitor,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use segment_helper::BackupTimestamp;

    fn spec() -> HelperSpec {
        let ts = BackupTimestamp::parse("20240101000000").unwrap();
        let mut source_dirs = BTreeMap::new();
        source_dirs.insert(2, PathBuf::from("/bk/seg2"));
        HelperSpec {
            direction: Direction::Restore,
            host: "sdw1".into(),
            paths: SegmentPaths::new(PathBuf::from("/bk/seg0"), 0, ts, 99),
            source_dirs,
            compression: Compression::None,
            single_data_file: true,
            on_error_continue: true,
        }
    }

    #[test]
    fn test_helper_args() {
        let args = spec().args(Some(Path::new("/etc/helper.toml")));
        let joined = args.join(" ");
        assert!(joined.starts_with("--direction restore --content 0 --timestamp 20240101000000 --dir /bk/seg0 --pid 99"));
        assert!(joined.contains("--compression none"));
        assert!(joined.contains("--source-dir 2=/bk/seg2"));
        assert!(joined.ends_with("--single-data-file --on-error-continue --config /etc/helper.toml"));
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("/data/it's"), r"'/data/it'\''s'");
    }

    #[tokio::test]
    async fn test_local_process_events_and_kill() {
        let dir = tempfile::TempDir::new().unwrap();
        let script = dir.path().join("fake_helper.sh");
        std::fs::write(
            &script,
            "#!/bin/sh\necho 'noise'\necho '{\"type\":\"helper:heartbeat\",\"payload\":{\"content\":0}}'\nexec sleep 30\n",
        )
        .unwrap();
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let settings = Settings {
            helper_mode: HelperMode::Process,
            helper_path: script,
            ..Settings::default()
        };
        let launcher = Launcher::new(Arc::new(settings), SkipSignal::new());
        let mut local = spec();
        local.host = "localhost".into();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut helper = launcher
            .spawn(local, tx, CancellationToken::new())
            .await
            .unwrap();
        let event = tokio::time::timeout(std::time::Duration::from_secs(5), rx.recv())
            .await
            .unwrap();
        assert_eq!(event, Some(HelperEvent::Heartbeat { content: 0 }));

        helper.kill().await;
        assert!(helper.wait().await.is_ok());
    }

    #[tokio::test]
    async fn test_local_process_exiting_non_zero_is_reported() {
        let dir = tempfile::TempDir::new().unwrap();
        let script = dir.path().join("broken_helper.sh");
        std::fs::write(&script, "#!/bin/sh\necho 'error: unexpected argument' >&2\nexit 2\n").unwrap();
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let settings = Settings {
            helper_mode: HelperMode::Process,
            helper_path: script,
            ..Settings::default()
        };
        let launcher = Launcher::new(Arc::new(settings), SkipSignal::new());
        let mut local = spec();
        local.host = "localhost".into();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut helper = launcher
            .spawn(local, tx, CancellationToken::new())
            .await
            .unwrap();
        let err = helper.wait().await.unwrap_err().to_string();
        assert!(err.contains("helper for segment 0 exited with exit status: 2"), "{err}");

        match rx.recv().await {
            Some(HelperEvent::Finished {
                content: 0,
                success: false,
                error: Some(error),
            }) => assert!(error.contains("before reporting completion")),
            other => panic!("unexpected event {other:?}"),
        }
    }
}
