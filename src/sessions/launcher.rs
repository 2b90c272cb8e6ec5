//! The seam between session activation and actual process spawning.
//!
//! The real launcher attaches a local PTY or a remote SSH shell through
//! the multiplexer. The mock launcher attaches a scripted process instead
//! so scheduler and lifecycle behavior can be exercised without an agent
//! binary.

use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};
use uuid::Uuid;

use crate::config::{ENV_HUB_PORT, ENV_SESSION_ID};
use crate::core::{ExitKind, HubError, ProcessEvent, Session, Worker, WorkerKind, WorkerStatus};
use crate::pty::{LocalSpawnSpec, ManagedProcess, PtyMultiplexer};
use crate::tunnel::TunnelManager;

use super::{extensions, remote_command_line};

/// Initial PTY geometry before the first client resize arrives.
const DEFAULT_COLS: u16 = 80;
const DEFAULT_ROWS: u16 = 24;

/// Launches an agent for a session on its worker, attaching the resulting
/// process to the multiplexer. Returns the local PID when there is one.
#[async_trait::async_trait]
pub trait AgentLauncher: Send + Sync {
    async fn launch(
        &self,
        session: &Session,
        worker: &Worker,
        args: Vec<String>,
    ) -> Result<Option<i32>, HubError>;
}

/// Production launcher: local PTY subprocesses and remote SSH shells.
pub struct PtyLauncher {
    mux: Arc<PtyMultiplexer>,
    tunnel: Arc<TunnelManager>,
    hub_port: u16,
}

impl PtyLauncher {
    #[must_use]
    pub fn new(mux: Arc<PtyMultiplexer>, tunnel: Arc<TunnelManager>, hub_port: u16) -> Self {
        Self {
            mux,
            tunnel,
            hub_port,
        }
    }
}

#[async_trait::async_trait]
impl AgentLauncher for PtyLauncher {
    async fn launch(
        &self,
        session: &Session,
        worker: &Worker,
        args: Vec<String>,
    ) -> Result<Option<i32>, HubError> {
        match worker.kind {
            WorkerKind::Local => {
                // Skill injection is prep, not a precondition.
                extensions::inject_extensions(&session.working_directory);

                let spec = LocalSpawnSpec {
                    program: "claude".to_owned(),
                    args,
                    working_directory: session.working_directory.clone(),
                    env: vec![
                        (ENV_SESSION_ID.to_owned(), session.id.to_string()),
                        (ENV_HUB_PORT.to_owned(), self.hub_port.to_string()),
                    ],
                    cols: DEFAULT_COLS,
                    rows: DEFAULT_ROWS,
                };
                let pid = self
                    .mux
                    .attach_local(session.id, spec)
                    .await
                    .map_err(HubError::Internal)?;
                Ok(Some(pid))
            }
            WorkerKind::Remote => {
                if worker.status != WorkerStatus::Connected {
                    return Err(HubError::ConnectionLost {
                        worker_id: worker.id,
                    });
                }

                let shell = self
                    .tunnel
                    .shell(worker.id, DEFAULT_COLS, DEFAULT_ROWS)
                    .await?;
                let command_line = remote_command_line(session, self.hub_port, &args);
                self.mux
                    .attach_remote(session.id, shell, command_line)
                    .await
                    .map_err(HubError::Internal)?;
                Ok(None)
            }
        }
    }
}

/// One recorded launch from the mock launcher.
#[derive(Debug, Clone)]
pub struct LaunchRecord {
    pub session_id: Uuid,
    pub worker_id: Uuid,
    pub args: Vec<String>,
}

/// Scripted process attached by [`MockLauncher`]: input is recorded,
/// `kill` ends it, and tests can inject output or exits through the
/// event sender.
pub struct MockProcess {
    event_tx: mpsc::Sender<ProcessEvent>,
    writes: Arc<Mutex<Vec<Vec<u8>>>>,
}

#[async_trait::async_trait]
impl ManagedProcess for MockProcess {
    async fn write(&self, bytes: Vec<u8>) -> anyhow::Result<()> {
        self.writes.lock().await.push(bytes);
        Ok(())
    }

    async fn resize(&self, _cols: u16, _rows: u16) -> anyhow::Result<()> {
        Ok(())
    }

    async fn kill(&self) -> anyhow::Result<()> {
        self.event_tx
            .send(ProcessEvent::Exit(ExitKind::Killed))
            .await
            .map_err(|_| anyhow::anyhow!("mock process already exited"))
    }

    fn pid(&self) -> Option<i32> {
        None
    }
}

/// Test launcher: attaches a [`MockProcess`] to the multiplexer for every
/// activation, so the full pump/lifecycle path runs without spawning
/// anything.
#[derive(Default)]
pub struct MockLauncher {
    launches: std::sync::Mutex<Vec<LaunchRecord>>,
    /// Event senders per session, for injecting output and exits.
    event_senders: std::sync::Mutex<Vec<(Uuid, mpsc::Sender<ProcessEvent>)>>,
    mux: std::sync::Mutex<Option<Arc<PtyMultiplexer>>>,
}

impl MockLauncher {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wire the multiplexer the mock attaches processes to.
    pub fn set_mux(&self, mux: Arc<PtyMultiplexer>) {
        *self.mux.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = Some(mux);
    }

    /// Every launch so far, in order.
    #[must_use]
    pub fn launches(&self) -> Vec<LaunchRecord> {
        self.launches
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// The event sender for a session's scripted process.
    #[must_use]
    pub fn event_sender(&self, session_id: Uuid) -> Option<mpsc::Sender<ProcessEvent>> {
        self.event_senders
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .iter()
            .rev()
            .find(|(id, _)| *id == session_id)
            .map(|(_, tx)| tx.clone())
    }
}

#[async_trait::async_trait]
impl AgentLauncher for MockLauncher {
    async fn launch(
        &self,
        session: &Session,
        worker: &Worker,
        args: Vec<String>,
    ) -> Result<Option<i32>, HubError> {
        let mux = self
            .mux
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
            .ok_or_else(|| HubError::Internal(anyhow::anyhow!("mock launcher has no mux")))?;

        let (event_tx, event_rx) = mpsc::channel(crate::pty::EVENT_CHANNEL_SIZE);
        let process = MockProcess {
            event_tx: event_tx.clone(),
            writes: Arc::new(Mutex::new(Vec::new())),
        };
        mux.attach_process(session.id, Box::new(process), event_rx);

        self.event_senders
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push((session.id, event_tx));
        self.launches
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(LaunchRecord {
                session_id: session.id,
                worker_id: worker.id,
                args,
            });
        Ok(None)
    }
}
