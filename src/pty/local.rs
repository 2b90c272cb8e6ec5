//! Local agent subprocesses on an OS pseudo-terminal.

use nix::sys::signal::{Signal, kill, killpg};
use nix::unistd::Pid;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{EVENT_CHANNEL_SIZE, ManagedProcess, READ_BUFFER_SIZE, WRITE_CHANNEL_SIZE, WriteRequest};
use crate::config::{STRIPPED_ENV, TERM};
use crate::core::{ExitKind, ProcessEvent};

/// Everything needed to spawn a local agent.
#[derive(Debug, Clone)]
pub struct LocalSpawnSpec {
    /// Agent binary, normally `claude`.
    pub program: String,
    /// CLI arguments assembled by the session manager.
    pub args: Vec<String>,
    pub working_directory: PathBuf,
    /// Extra environment (`C3_SESSION_ID`, `C3_HUB_PORT`).
    pub env: Vec<(String, String)>,
    pub cols: u16,
    pub rows: u16,
}

/// A local PTY subprocess.
pub struct LocalPty {
    pid: i32,
    write_tx: mpsc::Sender<WriteRequest>,
    killed: Arc<AtomicBool>,
    cancel: CancellationToken,
}

/// Spawn the agent on a fresh PTY, returning the process handle and its
/// raw event stream.
pub(crate) fn spawn(
    spec: LocalSpawnSpec,
) -> anyhow::Result<(LocalPty, mpsc::Receiver<ProcessEvent>)> {
    let (pty, pts) = pty_process::open()?;
    pty.resize(pty_process::Size::new(spec.rows, spec.cols))?;

    let mut cmd = pty_process::Command::new(&spec.program);
    cmd = cmd
        .args(&spec.args)
        .current_dir(&spec.working_directory)
        .env("TERM", TERM);
    for (key, value) in &spec.env {
        cmd = cmd.env(key, value);
    }
    for key in STRIPPED_ENV {
        cmd = cmd.env_remove(key);
    }

    let mut child = cmd.spawn(pts)?;
    let pid = child
        .id()
        .and_then(|id| i32::try_from(id).ok())
        .ok_or_else(|| anyhow::anyhow!("spawned agent has no PID"))?;

    tracing::info!(
        pid,
        program = %spec.program,
        args = ?spec.args,
        dir = %spec.working_directory.display(),
        "Spawned local agent"
    );

    let (pty_reader, pty_writer) = pty.into_split();
    let (write_tx, write_rx) = mpsc::channel(WRITE_CHANNEL_SIZE);
    let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_SIZE);
    let killed = Arc::new(AtomicBool::new(false));
    let cancel = CancellationToken::new();

    {
        let event_tx = event_tx.clone();
        let killed = Arc::clone(&killed);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            reader_loop(pty_reader, event_tx.clone(), cancel).await;
            // PTY hit EOF (or the reader was cancelled): reap the child and
            // report how it went.
            let kind = match child.wait().await {
                Ok(status) if killed.load(Ordering::Relaxed) => {
                    tracing::debug!(pid, ?status, "Agent reaped after kill");
                    ExitKind::Killed
                }
                Ok(status) => ExitKind::Exited(status.code()),
                Err(e) => {
                    tracing::warn!(pid, error = %e, "Failed to reap agent");
                    ExitKind::Exited(None)
                }
            };
            let _ = event_tx.send(ProcessEvent::Exit(kind)).await;
        });
    }

    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            writer_loop(pty_writer, write_rx, cancel).await;
        });
    }

    Ok((
        LocalPty {
            pid,
            write_tx,
            killed,
            cancel,
        },
        event_rx,
    ))
}

async fn reader_loop(
    mut reader: pty_process::OwnedReadPty,
    event_tx: mpsc::Sender<ProcessEvent>,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        tokio::select! {
            result = reader.read(&mut buf) => {
                match result {
                    Ok(0) => break,
                    Ok(n) => {
                        if event_tx
                            .send(ProcessEvent::Data(buf[..n].to_vec()))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    // EIO is the normal "child side closed" signal on Linux.
                    Err(e) if e.raw_os_error() == Some(5) => break,
                    Err(e) => {
                        tracing::debug!(error = %e, "PTY read error");
                        break;
                    }
                }
            }
            () = cancel.cancelled() => break,
        }
    }
}

async fn writer_loop(
    mut writer: pty_process::OwnedWritePty,
    mut write_rx: mpsc::Receiver<WriteRequest>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            request = write_rx.recv() => {
                match request {
                    Some(WriteRequest::Bytes(bytes)) => {
                        if writer.write_all(&bytes).await.is_err() {
                            break;
                        }
                    }
                    Some(WriteRequest::Resize { cols, rows }) => {
                        if writer.resize(pty_process::Size::new(rows, cols)).is_err() {
                            break;
                        }
                    }
                    Some(WriteRequest::Kill) | None => break,
                }
            }
            () = cancel.cancelled() => break,
        }
    }
}

#[async_trait::async_trait]
impl ManagedProcess for LocalPty {
    async fn write(&self, bytes: Vec<u8>) -> anyhow::Result<()> {
        self.write_tx
            .send(WriteRequest::Bytes(bytes))
            .await
            .map_err(|_| anyhow::anyhow!("PTY write channel closed"))
    }

    async fn resize(&self, cols: u16, rows: u16) -> anyhow::Result<()> {
        self.write_tx
            .send(WriteRequest::Resize { cols, rows })
            .await
            .map_err(|_| anyhow::anyhow!("PTY write channel closed"))
    }

    async fn kill(&self) -> anyhow::Result<()> {
        self.killed.store(true, Ordering::Relaxed);
        let pid = Pid::from_raw(self.pid);
        // SIGTERM to the whole process group catches the agent's own
        // children; the agent is a session leader on its PTY so the group
        // id equals its PID.
        if let Err(group_err) = killpg(pid, Signal::SIGTERM) {
            tracing::debug!(pid = self.pid, error = %group_err, "killpg failed, trying direct kill");
            kill(pid, Signal::SIGTERM)?;
        }
        Ok(())
    }

    fn pid(&self) -> Option<i32> {
        Some(self.pid)
    }
}

impl Drop for LocalPty {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Probe whether a PID is alive without signaling it; used by crash
/// recovery.
#[must_use]
pub fn pid_is_alive(pid: i32) -> bool {
    kill(Pid::from_raw(pid), None).is_ok()
}
