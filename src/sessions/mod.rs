//! Session lifecycle: creation, activation, exit handling and crash
//! recovery.

pub mod extensions;
pub mod launcher;

use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::config::{ENV_HUB_PORT, ENV_SESSION_ID, TERM};
use crate::core::{ControlEvent, ExitKind, HubError, Session, SessionStatus, Worker, WorkerKind};
use crate::pty::{PtyMultiplexer, local::pid_is_alive};
use crate::store::SqliteStore;
use crate::tunnel::TunnelManager;

pub use launcher::{AgentLauncher, LaunchRecord, MockLauncher, PtyLauncher};

/// Per-activation runtime flags; never persisted.
#[derive(Debug, Clone, Copy, Default)]
pub struct RuntimeFlags {
    /// The scheduler decided to suspend and is waiting for the exit event.
    pub suspend_pending: bool,
    /// Loop-prevention guard: the session was already suspended during
    /// this activation cycle. Reset on each activation.
    pub suspended_this_cycle: bool,
    /// Request-scoped flag: skip the transparent auto-continue on the
    /// first spawn.
    pub start_fresh: bool,
}

/// Parameters for creating a session.
#[derive(Debug, Clone)]
pub struct CreateSessionParams {
    pub working_directory: PathBuf,
    pub title: String,
    pub target_worker: Option<Uuid>,
    pub start_fresh: bool,
    pub worktree: bool,
}

/// Owns session rows' lifecycle transitions and binds them to managed
/// processes.
pub struct SessionManager {
    store: Arc<SqliteStore>,
    mux: Arc<PtyMultiplexer>,
    tunnel: Arc<TunnelManager>,
    launcher: Arc<dyn AgentLauncher>,
    dispatch_notify: Arc<Notify>,
    /// Absolute path of the injected hooks settings file.
    hooks_settings_path: PathBuf,
    runtime: DashMap<Uuid, RuntimeFlags>,
}

impl SessionManager {
    #[must_use]
    pub fn new(
        store: Arc<SqliteStore>,
        mux: Arc<PtyMultiplexer>,
        tunnel: Arc<TunnelManager>,
        launcher: Arc<dyn AgentLauncher>,
        dispatch_notify: Arc<Notify>,
        hooks_settings_path: PathBuf,
    ) -> Self {
        Self {
            store,
            mux,
            tunnel,
            launcher,
            dispatch_notify,
            hooks_settings_path,
            runtime: DashMap::new(),
        }
    }

    /// Runtime flags for a session (defaults when none are recorded).
    #[must_use]
    pub fn flags(&self, session_id: Uuid) -> RuntimeFlags {
        self.runtime
            .get(&session_id)
            .map(|f| *f)
            .unwrap_or_default()
    }

    pub fn set_flags(&self, session_id: Uuid, update: impl FnOnce(&mut RuntimeFlags)) {
        let mut entry = self.runtime.entry(session_id).or_default();
        update(&mut entry);
    }

    /// Create a session: validate the working directory, prepare it, queue
    /// the row and upsert the project.
    ///
    /// # Errors
    ///
    /// [`HubError::BadInput`] for relative/malformed paths,
    /// [`HubError::Forbidden`] for local paths outside `$HOME`.
    pub async fn create(&self, params: CreateSessionParams) -> Result<Session, HubError> {
        let worker = match params.target_worker {
            Some(id) => self
                .store
                .get_worker(id)
                .await
                .map_err(HubError::Internal)?
                .ok_or(HubError::worker_not_found(id))?,
            None => self
                .store
                .get_local_worker()
                .await
                .map_err(HubError::Internal)?,
        };

        let raw = &params.working_directory;
        if !raw.is_absolute() {
            return Err(HubError::BadInput(format!(
                "working directory must be absolute, got '{}'",
                raw.display()
            )));
        }
        if raw.to_string_lossy().contains('\0') {
            return Err(HubError::BadInput("working directory contains NUL".into()));
        }

        let working_directory = match worker.kind {
            WorkerKind::Local => self.prepare_local_directory(raw, params.worktree).await?,
            WorkerKind::Remote => {
                // Validation happens on the remote side; preparation is
                // best-effort when the tunnel is up.
                self.prepare_remote_directory(&worker, raw, params.worktree)
                    .await;
                raw.clone()
            }
        };

        let now = chrono::Utc::now();
        let position = self
            .store
            .next_queue_position()
            .await
            .map_err(HubError::Internal)?;
        let session = Session {
            id: Uuid::new_v4(),
            worker_id: worker.id,
            claude_session_id: None,
            status: SessionStatus::Queued,
            working_directory: working_directory.clone(),
            title: if params.title.is_empty() {
                working_directory
                    .file_name()
                    .map_or_else(|| "session".to_owned(), |n| n.to_string_lossy().to_string())
            } else {
                params.title
            },
            position: Some(position),
            pid: None,
            needs_input: false,
            locked: false,
            continuation_count: 0,
            worktree: params.worktree,
            created_at: now,
            updated_at: now,
            started_at: None,
            ended_at: None,
        };

        self.store
            .insert_session(&session)
            .await
            .map_err(HubError::Internal)?;
        if let Err(e) = self.store.touch_project(worker.id, &working_directory).await {
            tracing::warn!(error = %e, "Failed to upsert project row");
        }

        self.set_flags(session.id, |flags| flags.start_fresh = params.start_fresh);

        tracing::info!(
            session_id = %session.id,
            worker_id = %worker.id,
            dir = %working_directory.display(),
            "Session created"
        );
        self.dispatch_notify.notify_one();
        Ok(session)
    }

    async fn prepare_local_directory(
        &self,
        raw: &Path,
        worktree: bool,
    ) -> Result<PathBuf, HubError> {
        tokio::fs::create_dir_all(raw)
            .await
            .map_err(|e| HubError::BadInput(format!("cannot create directory: {e}")))?;
        let resolved = tokio::fs::canonicalize(raw)
            .await
            .map_err(|e| HubError::BadInput(format!("cannot resolve directory: {e}")))?;

        let home = dirs::home_dir()
            .ok_or_else(|| HubError::Internal(anyhow::anyhow!("no home directory")))?;
        let home = tokio::fs::canonicalize(&home).await.unwrap_or(home);
        if !resolved.starts_with(&home) {
            return Err(HubError::Forbidden(format!(
                "working directory '{}' is outside the home directory",
                resolved.display()
            )));
        }

        if worktree && !resolved.join(".git").exists() {
            let output = tokio::process::Command::new("git")
                .arg("init")
                .current_dir(&resolved)
                .output()
                .await
                .map_err(|e| HubError::Internal(anyhow::anyhow!("git init failed: {e}")))?;
            if !output.status.success() {
                return Err(HubError::Internal(anyhow::anyhow!(
                    "git init failed: {}",
                    String::from_utf8_lossy(&output.stderr)
                )));
            }
        }

        Ok(resolved)
    }

    async fn prepare_remote_directory(&self, worker: &Worker, raw: &Path, worktree: bool) {
        let quoted = shell_words::quote(&raw.to_string_lossy()).into_owned();
        let command = if worktree {
            format!("mkdir -p {quoted} && cd {quoted} && ([ -d .git ] || git init)")
        } else {
            format!("mkdir -p {quoted}")
        };
        if let Err(e) = self.tunnel.exec(worker.id, &command).await {
            tracing::warn!(
                worker_id = %worker.id,
                error = %e,
                "Remote directory preparation deferred"
            );
        }
    }

    /// Activate a queued session (called by the scheduler's dispatch
    /// pass): pick spawn arguments, attach a managed process, and mark the
    /// row active.
    ///
    /// # Errors
    ///
    /// A spawn failure marks the session `failed` and returns the error.
    pub async fn activate(&self, session: &Session) -> Result<(), HubError> {
        let worker = self
            .store
            .get_worker(session.worker_id)
            .await
            .map_err(HubError::Internal)?
            .ok_or(HubError::worker_not_found(session.worker_id))?;

        let flags = self.flags(session.id);
        let resumable = if session.claude_session_id.is_none() && !flags.start_fresh {
            self.store
                .latest_resumable_in_directory(worker.id, &session.working_directory)
                .await
                .map_err(HubError::Internal)?
        } else {
            None
        };

        let args = build_spawn_args(
            session,
            flags.start_fresh,
            resumable.as_deref(),
            &self.hooks_settings_path,
        );

        match self.launcher.launch(session, &worker, args).await {
            Ok(pid) => {
                self.store
                    .mark_session_active(session.id, pid)
                    .await
                    .map_err(HubError::Internal)?;
                // Fresh activation cycle: reset the suspension guard and
                // consume the one-shot start-fresh flag.
                self.runtime.insert(session.id, RuntimeFlags::default());
                tracing::info!(session_id = %session.id, ?pid, "Session activated");
                Ok(())
            }
            Err(err) => {
                tracing::error!(session_id = %session.id, error = %err, "Spawn failed");
                let _ = self
                    .store
                    .mark_session_exited(session.id, SessionStatus::Failed, None)
                    .await;
                Err(err)
            }
        }
    }

    /// Handle a process exit: record the final status, detach the
    /// multiplexer entry, and requeue when this exit completes a
    /// cooperative suspension.
    pub async fn handle_exit(&self, session_id: Uuid, kind: ExitKind) {
        self.mux.detach(session_id);

        let flags = self.flags(session_id);
        let status = if kind.is_clean() {
            SessionStatus::Completed
        } else {
            SessionStatus::Failed
        };

        if let Err(e) = self
            .store
            .mark_session_exited(session_id, status, None)
            .await
        {
            tracing::error!(session_id = %session_id, error = %e, "Failed to record exit");
            return;
        }

        if flags.suspend_pending {
            // Cooperative suspension: back to the head of the queue with
            // the loop-prevention guard set for this cycle.
            if let Err(e) = self.store.requeue_session(session_id, true).await {
                tracing::error!(session_id = %session_id, error = %e, "Failed to requeue suspended session");
            } else {
                self.set_flags(session_id, |f| {
                    f.suspend_pending = false;
                    f.suspended_this_cycle = true;
                });
                tracing::info!(session_id = %session_id, "Session suspended and requeued");
            }
        } else {
            self.runtime.remove(&session_id);
            tracing::info!(session_id = %session_id, ?kind, status = status.as_str(), "Session exited");
        }

        self.dispatch_notify.notify_one();
    }

    /// Record the conversation id delivered by the hook callback.
    pub async fn record_hook_event(
        &self,
        session_id: Uuid,
        claude_session_id: &str,
    ) -> Result<(), HubError> {
        let session = self
            .store
            .get_session(session_id)
            .await
            .map_err(HubError::Internal)?
            .ok_or(HubError::session_not_found(session_id))?;
        self.store
            .set_claude_session_id(session.id, claude_session_id)
            .await
            .map_err(HubError::Internal)?;
        tracing::debug!(
            session_id = %session_id,
            claude_session_id,
            "Hook reported conversation id"
        );
        Ok(())
    }

    /// Requeue an ended session at the tail (the explicit Continue
    /// action).
    ///
    /// # Errors
    ///
    /// [`HubError::Conflict`] unless the session is completed or failed.
    pub async fn continue_session(&self, session_id: Uuid) -> Result<(), HubError> {
        let session = self
            .store
            .get_session(session_id)
            .await
            .map_err(HubError::Internal)?
            .ok_or(HubError::session_not_found(session_id))?;
        if !matches!(
            session.status,
            SessionStatus::Completed | SessionStatus::Failed
        ) {
            return Err(HubError::Conflict(format!(
                "session is {status}, only ended sessions can be continued",
                status = session.status.as_str()
            )));
        }
        self.store
            .requeue_session(session_id, false)
            .await
            .map_err(HubError::Internal)?;
        self.dispatch_notify.notify_one();
        Ok(())
    }

    /// Kill a session. Active sessions get their process terminated (the
    /// exit event finishes the bookkeeping); queued ones just leave the
    /// queue.
    ///
    /// # Errors
    ///
    /// Fails when the session does not exist.
    pub async fn kill_session(&self, session_id: Uuid) -> Result<(), HubError> {
        let session = self
            .store
            .get_session(session_id)
            .await
            .map_err(HubError::Internal)?
            .ok_or(HubError::session_not_found(session_id))?;

        match session.status {
            SessionStatus::Active => {
                self.mux.kill(session_id).await.map_err(HubError::Internal)?;
            }
            SessionStatus::Queued => {
                self.store
                    .mark_session_exited(session_id, SessionStatus::Completed, None)
                    .await
                    .map_err(HubError::Internal)?;
                self.dispatch_notify.notify_one();
            }
            SessionStatus::Completed | SessionStatus::Failed => {}
        }
        Ok(())
    }

    /// Delete a session row and release every owned resource (process,
    /// scrollback, comments via cascade).
    ///
    /// # Errors
    ///
    /// Fails when the session does not exist.
    pub async fn delete_session(&self, session_id: Uuid) -> Result<(), HubError> {
        let _ = self
            .store
            .get_session(session_id)
            .await
            .map_err(HubError::Internal)?
            .ok_or(HubError::session_not_found(session_id))?;

        self.mux.release(session_id).await;
        self.runtime.remove(&session_id);
        self.store
            .delete_session(session_id)
            .await
            .map_err(HubError::Internal)?;
        self.dispatch_notify.notify_one();
        Ok(())
    }

    /// Clear the needs-input flag after the browser sent user input.
    pub async fn clear_needs_input(&self, session_id: Uuid) {
        if let Err(e) = self.store.set_session_needs_input(session_id, false).await {
            tracing::warn!(session_id = %session_id, error = %e, "Failed to clear needs_input");
        }
    }

    /// Raise the needs-input flag and tell connected clients.
    pub async fn raise_needs_input(&self, session_id: Uuid) {
        if let Err(e) = self.store.set_session_needs_input(session_id, true).await {
            tracing::warn!(session_id = %session_id, error = %e, "Failed to set needs_input");
            return;
        }
        self.mux.send_control(session_id, ControlEvent::NeedsInput);
    }

    /// Reconcile the database against live processes after a hub crash.
    ///
    /// Rows left `active` by a crashed hub are moved to `completed` so the
    /// user can one-click Continue them: the PTY file descriptors died
    /// with the old hub process, so even a still-running PID cannot be
    /// re-attached. Captured conversation ids survive untouched.
    ///
    /// # Errors
    ///
    /// Fails only on store errors.
    pub async fn recover_from_crash(&self) -> anyhow::Result<()> {
        let stale = self
            .store
            .list_sessions_by_status(SessionStatus::Active)
            .await?;
        if stale.is_empty() {
            return Ok(());
        }

        let local = self.store.get_local_worker().await?;
        for session in stale {
            let pid_alive = session.worker_id == local.id
                && session.pid.is_some_and(pid_is_alive);
            if pid_alive {
                tracing::warn!(
                    session_id = %session.id,
                    pid = ?session.pid,
                    "Orphaned agent is still running; its PTY is unreachable, marking completed"
                );
            }
            self.store
                .mark_session_exited(session.id, SessionStatus::Completed, None)
                .await?;
            tracing::info!(session_id = %session.id, "Recovered crashed session");
        }
        Ok(())
    }
}

/// Assemble the agent CLI arguments for an activation.
///
/// Resume precedence: the session's own captured conversation id wins;
/// `start_fresh` suppresses the transparent directory-based auto-continue;
/// a prior completed session in the same directory is resumed
/// transparently; a continuation without any captured id falls back to
/// `-c`. Worktree mode applies only to the initial spawn.
#[must_use]
pub fn build_spawn_args(
    session: &Session,
    start_fresh: bool,
    resumable_in_dir: Option<&str>,
    hooks_settings_path: &Path,
) -> Vec<String> {
    let mut args = vec![
        "--settings".to_owned(),
        hooks_settings_path.to_string_lossy().to_string(),
    ];

    if session.continuation_count > 0 && session.claude_session_id.is_some() {
        args.push("--resume".to_owned());
        args.push(
            session
                .claude_session_id
                .clone()
                .unwrap_or_default(),
        );
    } else if start_fresh {
        // Explicit fresh start: no resume of any kind.
    } else if let Some(prior) = resumable_in_dir {
        args.push("--resume".to_owned());
        args.push(prior.to_owned());
    } else if session.continuation_count > 0 {
        args.push("-c".to_owned());
    }

    if session.worktree && session.continuation_count == 0 {
        let mut with_worktree = vec!["--worktree".to_owned()];
        with_worktree.extend(args);
        args = with_worktree;
    }

    args
}

/// Compose the login-like command line for a remote spawn.
#[must_use]
pub fn remote_command_line(session: &Session, hub_port: u16, args: &[String]) -> String {
    let dir = shell_words::quote(&session.working_directory.to_string_lossy()).into_owned();
    let args = shell_words::join(args.iter().map(String::as_str));
    format!(
        "source ~/.bashrc; cd {dir}; {session_env}={session_id} {port_env}={hub_port} TERM={term} claude {args}",
        session_env = ENV_SESSION_ID,
        session_id = session.id,
        port_env = ENV_HUB_PORT,
        term = TERM,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn session(continuation_count: u32, claude_session_id: Option<&str>, worktree: bool) -> Session {
        let now = Utc::now();
        Session {
            id: Uuid::new_v4(),
            worker_id: Uuid::new_v4(),
            claude_session_id: claude_session_id.map(str::to_owned),
            status: SessionStatus::Queued,
            working_directory: PathBuf::from("/home/dev/proj"),
            title: "t".to_owned(),
            position: Some(1),
            pid: None,
            needs_input: false,
            locked: false,
            continuation_count,
            worktree,
            created_at: now,
            updated_at: now,
            started_at: None,
            ended_at: None,
        }
    }

    fn hooks() -> PathBuf {
        PathBuf::from("/tmp/.c3-hooks/settings.json")
    }

    #[test]
    fn fresh_session_gets_only_settings() {
        let args = build_spawn_args(&session(0, None, false), true, None, &hooks());
        assert_eq!(
            args,
            vec!["--settings".to_owned(), hooks().to_string_lossy().to_string()]
        );
    }

    #[test]
    fn continuation_with_captured_id_resumes_it() {
        let args = build_spawn_args(&session(1, Some("abc123"), false), false, Some("other"), &hooks());
        assert!(args.windows(2).any(|w| w[0] == "--resume" && w[1] == "abc123"));
        assert!(!args.contains(&"-c".to_owned()));
    }

    #[test]
    fn directory_auto_continue_uses_prior_id() {
        let args = build_spawn_args(&session(0, None, false), false, Some("abc123"), &hooks());
        assert!(
            args.windows(2).any(|w| w[0] == "--resume" && w[1] == "abc123"),
            "a completed session in the directory is resumed, not -c: {args:?}"
        );
    }

    #[test]
    fn start_fresh_suppresses_directory_auto_continue() {
        let args = build_spawn_args(&session(0, None, false), true, Some("abc123"), &hooks());
        assert!(!args.contains(&"--resume".to_owned()));
        assert!(!args.contains(&"-c".to_owned()));
    }

    #[test]
    fn continuation_without_id_falls_back_to_dash_c() {
        let args = build_spawn_args(&session(2, None, false), false, None, &hooks());
        assert!(args.contains(&"-c".to_owned()));
    }

    #[test]
    fn worktree_flag_only_on_initial_spawn() {
        let initial = build_spawn_args(&session(0, None, true), true, None, &hooks());
        assert_eq!(initial.first().map(String::as_str), Some("--worktree"));

        let resumed = build_spawn_args(&session(1, Some("abc"), true), false, None, &hooks());
        assert!(
            !resumed.contains(&"--worktree".to_owned()),
            "worktree never applies on resume"
        );
    }

    #[test]
    fn remote_command_line_quotes_the_directory() {
        let mut s = session(0, None, false);
        s.working_directory = PathBuf::from("/opt/my app");
        let line = remote_command_line(&s, 3000, &["--settings".to_owned(), "x".to_owned()]);
        assert!(line.contains("cd '/opt/my app'"), "dir must be quoted: {line}");
        assert!(line.contains("C3_HUB_PORT=3000"));
        assert!(line.contains("source ~/.bashrc"));
        assert!(line.contains("claude --settings x"));
    }
}
