//! PTY multiplexer: one uniform interface over local PTY subprocesses and
//! remote SSH shell channels.
//!
//! Each attached session owns a reader/writer task pair inside its
//! [`ManagedProcess`] implementation. A pump task per session consumes the
//! raw [`ProcessEvent`] stream and layers on the shared concerns: throttled
//! scrollback persistence, board-command parsing, idle bookkeeping, and
//! fan-out to WebSocket subscribers over broadcast channels.

pub mod local;
pub mod osc;
pub mod remote;
pub mod scrollback;

use dashmap::DashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::core::{ControlEvent, LifecycleEvent, ProcessEvent};
use crate::tunnel::RemoteShell;

pub use local::LocalSpawnSpec;

/// Buffer size for PTY reads.
pub(crate) const READ_BUFFER_SIZE: usize = 8192;

/// Channel buffer size for write requests.
pub(crate) const WRITE_CHANNEL_SIZE: usize = 256;

/// Channel buffer size for raw process events.
pub(crate) const EVENT_CHANNEL_SIZE: usize = 256;

/// Broadcast capacity for output bytes; slow clients observe `Lagged` and
/// get a dropped-frames warning instead of stalling the PTY reader.
const OUTPUT_CHANNEL_SIZE: usize = 512;

/// Broadcast capacity for control events, which are never dropped in
/// practice (they are tiny and rare relative to output).
const CONTROL_CHANNEL_SIZE: usize = 64;

/// Silence threshold before a session is considered idle.
const IDLE_AFTER: Duration = Duration::from_secs(8);

/// Idle poller cadence.
const IDLE_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Requests accepted by every managed process implementation.
#[derive(Debug)]
pub(crate) enum WriteRequest {
    Bytes(Vec<u8>),
    Resize { cols: u16, rows: u16 },
    Kill,
}

/// Uniform capability set over a local PTY subprocess or a remote SSH
/// shell channel.
#[async_trait::async_trait]
pub trait ManagedProcess: Send + Sync {
    /// Forward input bytes to the agent.
    async fn write(&self, bytes: Vec<u8>) -> anyhow::Result<()>;

    /// Propagate a terminal resize.
    async fn resize(&self, cols: u16, rows: u16) -> anyhow::Result<()>;

    /// Terminate the agent. The exit event still flows through the event
    /// stream once the process is gone.
    async fn kill(&self) -> anyhow::Result<()>;

    /// OS PID for local processes, `None` for remote channels.
    fn pid(&self) -> Option<i32>;
}

/// Activity bookkeeping shared between a session's pump task, the idle
/// poller and the scheduler.
struct ActivityState {
    last_output_at: std::sync::Mutex<Instant>,
    input_seen: AtomicBool,
    idle_flagged: AtomicBool,
}

impl ActivityState {
    fn new() -> Self {
        Self {
            last_output_at: std::sync::Mutex::new(Instant::now()),
            input_seen: AtomicBool::new(false),
            idle_flagged: AtomicBool::new(false),
        }
    }

    fn touch_output(&self) {
        if let Ok(mut last) = self.last_output_at.lock() {
            *last = Instant::now();
        }
        self.idle_flagged.store(false, Ordering::Relaxed);
    }

    fn silent_for(&self, now: Instant) -> Duration {
        self.last_output_at
            .lock()
            .map(|last| now.duration_since(*last))
            .unwrap_or_default()
    }
}

/// A live session attached to the multiplexer.
pub struct ManagedSession {
    session_id: Uuid,
    process: Box<dyn ManagedProcess>,
    bytes_tx: broadcast::Sender<Vec<u8>>,
    control_tx: broadcast::Sender<ControlEvent>,
    activity: Arc<ActivityState>,
    pump_task: JoinHandle<()>,
}

impl ManagedSession {
    /// Subscribe to the output byte stream.
    #[must_use]
    pub fn subscribe_bytes(&self) -> broadcast::Receiver<Vec<u8>> {
        self.bytes_tx.subscribe()
    }

    /// Subscribe to the control event stream.
    #[must_use]
    pub fn subscribe_control(&self) -> broadcast::Receiver<ControlEvent> {
        self.control_tx.subscribe()
    }

    /// Whether the user has sent any input during this activation cycle.
    #[must_use]
    pub fn input_seen(&self) -> bool {
        self.activity.input_seen.load(Ordering::Relaxed)
    }
}

impl Drop for ManagedSession {
    fn drop(&mut self) {
        self.pump_task.abort();
    }
}

/// Owner of every live [`ManagedSession`], keyed by session id.
pub struct PtyMultiplexer {
    sessions: Arc<DashMap<Uuid, Arc<ManagedSession>>>,
    scrollback_dir: PathBuf,
    lifecycle_tx: mpsc::Sender<LifecycleEvent>,
    cancel: CancellationToken,
}

impl PtyMultiplexer {
    #[must_use]
    pub fn new(scrollback_dir: PathBuf, lifecycle_tx: mpsc::Sender<LifecycleEvent>) -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
            scrollback_dir,
            lifecycle_tx,
            cancel: CancellationToken::new(),
        }
    }

    /// Spawn a local agent subprocess on a fresh PTY and attach it.
    /// Returns the child PID.
    ///
    /// # Errors
    ///
    /// Returns an error if the PTY cannot be opened or the spawn fails.
    pub async fn attach_local(
        &self,
        session_id: Uuid,
        spec: LocalSpawnSpec,
    ) -> anyhow::Result<i32> {
        let (process, event_rx) = local::spawn(spec)?;
        let pid = process.pid().unwrap_or(0);
        self.attach_process(session_id, Box::new(process), event_rx);
        Ok(pid)
    }

    /// Attach a remote SSH shell channel, sending the composed agent
    /// command line as the first input.
    ///
    /// # Errors
    ///
    /// Returns an error if the initial command line cannot be written.
    pub async fn attach_remote(
        &self,
        session_id: Uuid,
        shell: RemoteShell,
        command_line: String,
    ) -> anyhow::Result<()> {
        let (process, event_rx) = remote::attach(shell, command_line).await?;
        self.attach_process(session_id, Box::new(process), event_rx);
        Ok(())
    }

    /// Attach an already-constructed managed process and its event
    /// stream. The local and remote paths funnel through here; tests
    /// attach scripted processes directly.
    pub fn attach_process(
        &self,
        session_id: Uuid,
        process: Box<dyn ManagedProcess>,
        mut event_rx: mpsc::Receiver<ProcessEvent>,
    ) {
        let (bytes_tx, _) = broadcast::channel(OUTPUT_CHANNEL_SIZE);
        let (control_tx, _) = broadcast::channel(CONTROL_CHANNEL_SIZE);
        let activity = Arc::new(ActivityState::new());

        let mut scrollback = scrollback::ScrollbackWriter::new(
            crate::config::scrollback_path_in(&self.scrollback_dir, session_id),
        );

        let pump_task = {
            let bytes_tx = bytes_tx.clone();
            let control_tx = control_tx.clone();
            let lifecycle_tx = self.lifecycle_tx.clone();
            let activity = Arc::clone(&activity);
            tokio::spawn(async move {
                let mut parser = osc::BoardCommandParser::new();
                while let Some(event) = event_rx.recv().await {
                    match event {
                        ProcessEvent::Data(bytes) => {
                            activity.touch_output();
                            for command in parser.scan(&bytes) {
                                let _ = control_tx.send(ControlEvent::BoardCommand(command));
                            }
                            scrollback.append(&bytes).await;
                            // Board commands stay in-band; the emulator sees
                            // the sequence too.
                            let _ = bytes_tx.send(bytes);
                        }
                        ProcessEvent::ConnectionLost => {
                            let _ = control_tx.send(ControlEvent::ConnectionLost);
                        }
                        ProcessEvent::Exit(kind) => {
                            scrollback.flush().await;
                            let _ = lifecycle_tx
                                .send(LifecycleEvent::SessionExited { session_id, kind })
                                .await;
                            break;
                        }
                    }
                }
            })
        };

        let session = Arc::new(ManagedSession {
            session_id,
            process,
            bytes_tx,
            control_tx,
            activity,
            pump_task,
        });
        self.sessions.insert(session_id, session);
    }

    /// Look up a live session.
    #[must_use]
    pub fn get(&self, session_id: Uuid) -> Option<Arc<ManagedSession>> {
        self.sessions.get(&session_id).map(|s| Arc::clone(&s))
    }

    /// Forward user input, marking the proof-of-work guard for this cycle.
    ///
    /// # Errors
    ///
    /// Fails when the session is not attached or the process is gone.
    pub async fn write(&self, session_id: Uuid, bytes: Vec<u8>) -> anyhow::Result<()> {
        let session = self
            .get(session_id)
            .ok_or_else(|| anyhow::anyhow!("session {session_id} is not attached"))?;
        session.activity.input_seen.store(true, Ordering::Relaxed);
        session.process.write(bytes).await
    }

    /// Propagate a terminal resize.
    ///
    /// # Errors
    ///
    /// Fails when the session is not attached.
    pub async fn resize(&self, session_id: Uuid, cols: u16, rows: u16) -> anyhow::Result<()> {
        let session = self
            .get(session_id)
            .ok_or_else(|| anyhow::anyhow!("session {session_id} is not attached"))?;
        session.process.resize(cols, rows).await
    }

    /// Terminate a session's process; the exit event follows through the
    /// lifecycle channel.
    ///
    /// # Errors
    ///
    /// Fails when the session is not attached.
    pub async fn kill(&self, session_id: Uuid) -> anyhow::Result<()> {
        let session = self
            .get(session_id)
            .ok_or_else(|| anyhow::anyhow!("session {session_id} is not attached"))?;
        session.process.kill().await
    }

    /// Send a control event to this session's WebSocket subscribers.
    pub fn send_control(&self, session_id: Uuid, event: ControlEvent) {
        if let Some(session) = self.get(session_id) {
            let _ = session.control_tx.send(event);
        }
    }

    /// Whether any user input arrived during the current activation cycle.
    #[must_use]
    pub fn input_seen(&self, session_id: Uuid) -> bool {
        self.get(session_id).is_some_and(|s| s.input_seen())
    }

    /// Detach a finished session. Scrollback stays on disk.
    pub fn detach(&self, session_id: Uuid) {
        self.sessions.remove(&session_id);
    }

    /// Detach and delete all per-session state including scrollback; used
    /// when a session row is deleted.
    pub async fn release(&self, session_id: Uuid) {
        if let Some((_, session)) = self.sessions.remove(&session_id) {
            let _ = session.process.kill().await;
        }
        let path = crate::config::scrollback_path_in(&self.scrollback_dir, session_id);
        if let Err(e) = tokio::fs::remove_file(&path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(session_id = %session_id, error = %e, "Failed to remove scrollback");
            }
        }
    }

    /// Read a session's persisted scrollback; empty when none exists.
    pub async fn load_scrollback(&self, session_id: Uuid) -> Vec<u8> {
        let path = crate::config::scrollback_path_in(&self.scrollback_dir, session_id);
        tokio::fs::read(&path).await.unwrap_or_default()
    }

    /// Run the global idle poller: a single 2 s tick across all attached
    /// sessions. Idle is advisory; the scheduler applies the suspension
    /// guards.
    pub fn spawn_idle_poller(self: &Arc<Self>) -> JoinHandle<()> {
        let mux = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(IDLE_POLL_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let now = Instant::now();
                        for entry in mux.sessions.iter() {
                            let session = entry.value();
                            if session.activity.silent_for(now) >= IDLE_AFTER
                                && !session.activity.idle_flagged.swap(true, Ordering::Relaxed)
                            {
                                let session_id = session.session_id;
                                tracing::debug!(session_id = %session_id, "Session went idle");
                                let _ = session.control_tx.send(ControlEvent::SessionIdle);
                                let _ = mux
                                    .lifecycle_tx
                                    .send(LifecycleEvent::SessionIdle { session_id })
                                    .await;
                            }
                        }
                    }
                    () = mux.cancel.cancelled() => break,
                }
            }
        })
    }

    /// Kill every attached process and flush scrollbacks; used at hub
    /// shutdown.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let ids: Vec<Uuid> = self.sessions.iter().map(|e| *e.key()).collect();
        for id in ids {
            if let Some(session) = self.get(id) {
                let _ = session.process.kill().await;
            }
        }
        // Give pump tasks a moment to observe exits and flush.
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}
