//! Shared test harness: a full hub wired to the mock launcher.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Notify, mpsc};
use uuid::Uuid;

use c3::core::LifecycleEvent;
use c3::pty::PtyMultiplexer;
use c3::scheduler::Scheduler;
use c3::sessions::{MockLauncher, SessionManager};
use c3::store::SqliteStore;
use c3::tunnel::TunnelManager;

/// Everything a scheduler/lifecycle test needs, backed by a temp database
/// and scripted processes instead of real agents.
pub struct TestHub {
    pub store: Arc<SqliteStore>,
    pub mux: Arc<PtyMultiplexer>,
    pub sessions: Arc<SessionManager>,
    pub scheduler: Arc<Scheduler>,
    pub launcher: Arc<MockLauncher>,
    pub notify: Arc<Notify>,
    /// Clone of the multiplexer's lifecycle sender, for injecting idle
    /// events without waiting out the poller.
    pub lifecycle_tx: mpsc::Sender<LifecycleEvent>,
    _dir: tempfile::TempDir,
}

impl TestHub {
    pub async fn new() -> Self {
        let dir = tempfile::TempDir::new().expect("temp dir");
        let store = Arc::new(
            SqliteStore::new(&dir.path().join("test.db"))
                .await
                .expect("store should open"),
        );

        let (lifecycle_tx, lifecycle_rx) = mpsc::channel(64);
        let notify = Arc::new(Notify::new());
        let tunnel = Arc::new(TunnelManager::new(Arc::clone(&store)));
        let mux = Arc::new(PtyMultiplexer::new(
            dir.path().join("scrollback"),
            lifecycle_tx.clone(),
        ));

        let launcher = Arc::new(MockLauncher::new());
        launcher.set_mux(Arc::clone(&mux));

        let sessions = Arc::new(SessionManager::new(
            Arc::clone(&store),
            Arc::clone(&mux),
            Arc::clone(&tunnel),
            launcher.clone() as Arc<dyn c3::sessions::AgentLauncher>,
            Arc::clone(&notify),
            PathBuf::from("/tmp/.c3-hooks/settings.json"),
        ));

        let scheduler = Arc::new(Scheduler::new(
            Arc::clone(&store),
            Arc::clone(&mux),
            Arc::clone(&sessions),
            Arc::clone(&notify),
        ));
        let _lifecycle_task = scheduler.spawn_lifecycle_loop(lifecycle_rx);

        Self {
            store,
            mux,
            sessions,
            scheduler,
            launcher,
            notify,
            lifecycle_tx,
            _dir: dir,
        }
    }

    /// Create a queued session in a home-relative directory on the local
    /// worker.
    pub async fn create_local_session(&self, subdir: &str) -> c3::core::Session {
        let home = dirs::home_dir().expect("home dir");
        self.sessions
            .create(c3::sessions::CreateSessionParams {
                working_directory: home.join(subdir),
                title: subdir.to_owned(),
                target_worker: None,
                start_fresh: false,
                worktree: false,
            })
            .await
            .expect("session create should succeed")
    }

    /// Inject an idle event for a session, as the poller would.
    pub async fn inject_idle(&self, session_id: Uuid) {
        self.lifecycle_tx
            .send(LifecycleEvent::SessionIdle { session_id })
            .await
            .expect("lifecycle channel open");
    }

    /// Let background tasks settle.
    pub async fn settle(&self) {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

/// Unique home-relative test directory name; removed by `cleanup_dir`.
pub fn unique_subdir(prefix: &str) -> String {
    format!(".c3-test/{prefix}-{}", Uuid::new_v4())
}

/// Remove a test directory created under `$HOME`.
pub fn cleanup_home_subdir(subdir: &str) {
    if let Some(home) = dirs::home_dir() {
        let _ = std::fs::remove_dir_all(home.join(subdir));
    }
}
