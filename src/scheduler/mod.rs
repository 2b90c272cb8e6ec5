//! Queue dispatch and cooperative auto-suspension.
//!
//! A single dispatch task serializes all activation decisions: it walks
//! the queue in position order, applies per-worker and global admission,
//! and activates what fits. A companion lifecycle task consumes exit and
//! idle events from the multiplexer; idle events feed the auto-suspend
//! policy, exits feed status bookkeeping and wake the dispatcher.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::core::{LifecycleEvent, Session, SessionStatus, WorkerStatus};
use crate::pty::PtyMultiplexer;
use crate::sessions::SessionManager;
use crate::store::SqliteStore;

/// Dispatch cadence between explicit wakeups.
const DISPATCH_INTERVAL: Duration = Duration::from_millis(500);

/// Scheduler for session activation and suspension.
pub struct Scheduler {
    store: Arc<SqliteStore>,
    mux: Arc<PtyMultiplexer>,
    sessions: Arc<SessionManager>,
    notify: Arc<Notify>,
    cancel: CancellationToken,
}

impl Scheduler {
    #[must_use]
    pub fn new(
        store: Arc<SqliteStore>,
        mux: Arc<PtyMultiplexer>,
        sessions: Arc<SessionManager>,
        notify: Arc<Notify>,
    ) -> Self {
        Self {
            store,
            mux,
            sessions,
            notify,
            cancel: CancellationToken::new(),
        }
    }

    /// Stop both loops.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Run the dispatch loop: a short tick plus explicit wakeups whenever
    /// a slot may have freed (exit, capacity change, lock toggle).
    pub fn spawn_dispatch_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = tokio::time::sleep(DISPATCH_INTERVAL) => {}
                    () = scheduler.notify.notified() => {}
                    () = scheduler.cancel.cancelled() => break,
                }
                scheduler.run_dispatch_pass().await;
            }
        })
    }

    /// One admission pass over the queue in position order.
    ///
    /// Per queued session: skip when its worker is not connected, skip
    /// when the worker is at capacity, and stop the whole pass once the
    /// global ceiling is reached.
    ///
    /// A session that was just cooperatively suspended sits at the head
    /// of the queue but is considered last for one pass; otherwise the
    /// slot it freed would go straight back to it instead of the starved
    /// session it yielded for.
    pub async fn run_dispatch_pass(&self) {
        let queued = match self.store.list_queued_sessions().await {
            Ok(queued) if !queued.is_empty() => queued,
            Ok(_) => return,
            Err(e) => {
                tracing::error!(error = %e, "Dispatch pass cannot list queue");
                return;
            }
        };

        let settings = match self.store.get_settings().await {
            Ok(settings) => settings,
            Err(e) => {
                tracing::error!(error = %e, "Dispatch pass cannot load settings");
                return;
            }
        };

        let (fresh, just_suspended): (Vec<_>, Vec<_>) = queued
            .into_iter()
            .partition(|s| !self.sessions.flags(s.id).suspended_this_cycle);

        for session in fresh.into_iter().chain(just_suspended) {
            let worker = match self.store.get_worker(session.worker_id).await {
                Ok(Some(worker)) => worker,
                Ok(None) | Err(_) => continue,
            };
            if worker.status != WorkerStatus::Connected {
                continue;
            }

            let active_on_worker = self
                .store
                .count_active_sessions_on_worker(worker.id)
                .await
                .unwrap_or(u32::MAX);
            if active_on_worker >= worker.max_sessions {
                continue;
            }

            let total_active = self.store.count_active_sessions().await.unwrap_or(u32::MAX);
            if total_active >= settings.max_concurrent_sessions {
                // Global ceiling: nothing further down the queue can be
                // admitted either.
                break;
            }

            if let Err(e) = self.sessions.activate(&session).await {
                tracing::warn!(session_id = %session.id, error = %e, "Activation failed");
            }
        }

        // The deprioritization is one-shot: anything still waiting
        // competes normally from the next pass on (it kept its head
        // position).
        for session in self
            .store
            .list_queued_sessions()
            .await
            .unwrap_or_default()
        {
            if self.sessions.flags(session.id).suspended_this_cycle {
                self.sessions
                    .set_flags(session.id, |flags| flags.suspended_this_cycle = false);
            }
        }
    }

    /// Run the lifecycle loop over multiplexer events.
    pub fn spawn_lifecycle_loop(
        self: &Arc<Self>,
        mut lifecycle_rx: mpsc::Receiver<LifecycleEvent>,
    ) -> JoinHandle<()> {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = lifecycle_rx.recv() => {
                        match event {
                            Some(LifecycleEvent::SessionExited { session_id, kind }) => {
                                scheduler.sessions.handle_exit(session_id, kind).await;
                            }
                            Some(LifecycleEvent::SessionIdle { session_id }) => {
                                scheduler.handle_idle(session_id).await;
                            }
                            None => break,
                        }
                    }
                    () = scheduler.cancel.cancelled() => break,
                }
            }
        })
    }

    /// Apply the auto-suspend policy to an idle session.
    ///
    /// Eligibility requires all of: the agent is not prompting the user
    /// (`needs_input` unset), the user has sent input this cycle
    /// (proof-of-work guard), a queued session is actually starved for
    /// this capacity, the session is not locked, and it has not already
    /// been suspended this cycle.
    async fn handle_idle(&self, session_id: Uuid) {
        let session = match self.store.get_session(session_id).await {
            Ok(Some(session)) if session.status == SessionStatus::Active => session,
            _ => return,
        };

        // (a) The agent is waiting for the human; yielding now would rip
        // the prompt out from under them.
        if session.needs_input {
            return;
        }

        // (b) Proof-of-work guard. A session that went idle without ever
        // receiving input is prompting, not waiting to yield: flag it for
        // the user instead of suspending it.
        if !self.mux.input_seen(session_id) {
            self.sessions.raise_needs_input(session_id).await;
            return;
        }

        // (d) User lock.
        if session.locked {
            return;
        }

        // (e) Loop prevention: one suspension per activation cycle.
        if self.sessions.flags(session_id).suspended_this_cycle {
            return;
        }

        // (c) Somebody must actually be starved.
        if !self.queue_pressure(&session).await {
            return;
        }

        tracing::info!(session_id = %session_id, "Auto-suspending idle session");
        self.sessions
            .set_flags(session_id, |flags| flags.suspend_pending = true);
        if let Err(e) = self.mux.kill(session_id).await {
            tracing::warn!(session_id = %session_id, error = %e, "Suspend kill failed");
            self.sessions
                .set_flags(session_id, |flags| flags.suspend_pending = false);
        }
        // The exit event completes the suspension: status bookkeeping,
        // head-of-queue reinsertion, and an immediate dispatch wakeup.
    }

    /// Whether any queued session is waiting on capacity this session
    /// could free: either it targets the same worker and that worker is
    /// full, or the global ceiling is what's holding the queue back.
    async fn queue_pressure(&self, idle: &Session) -> bool {
        let queued = match self.store.list_queued_sessions().await {
            Ok(queued) if !queued.is_empty() => queued,
            _ => return false,
        };

        let settings = match self.store.get_settings().await {
            Ok(settings) => settings,
            Err(_) => return false,
        };
        let total_active = self.store.count_active_sessions().await.unwrap_or(0);
        if total_active >= settings.max_concurrent_sessions {
            return true;
        }

        for waiting in &queued {
            let worker_id = waiting.worker_id;
            if worker_id != idle.worker_id {
                continue;
            }
            let Ok(Some(worker)) = self.store.get_worker(worker_id).await else {
                continue;
            };
            let active = self
                .store
                .count_active_sessions_on_worker(worker_id)
                .await
                .unwrap_or(0);
            if active >= worker.max_sessions {
                return true;
            }
        }
        false
    }
}
