use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

/// Kind of machine a worker represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerKind {
    /// The machine the hub itself runs on.
    Local,
    /// A machine reachable over SSH.
    Remote,
}

/// Connectivity status of a worker, tracked by the tunnel keepalive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Connected,
    Disconnected,
    Error,
}

impl WorkerStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Error => "error",
        }
    }
}

impl std::str::FromStr for WorkerStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "connected" => Ok(Self::Connected),
            "disconnected" => Ok(Self::Disconnected),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown worker status '{other}'")),
        }
    }
}

/// A machine that hosts agent subprocesses.
///
/// Exactly one worker has `kind == Local`; it is created at store init and
/// can never be deleted. Remote workers carry the SSH connection parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Worker {
    /// Unique identifier
    pub id: Uuid,

    /// Local or remote
    #[serde(rename = "type")]
    pub kind: WorkerKind,

    /// Display name
    pub name: String,

    /// SSH host (remote only)
    pub host: Option<String>,

    /// SSH port (remote only)
    pub port: Option<u16>,

    /// SSH user (remote only)
    pub user: Option<String>,

    /// Path to the SSH private key on the hub machine (remote only)
    pub private_key_path: Option<PathBuf>,

    /// Connectivity status
    pub status: WorkerStatus,

    /// Admission ceiling for concurrently active sessions on this worker
    pub max_sessions: u32,

    /// When the keepalive last confirmed the connection
    pub last_heartbeat: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
}

impl Worker {
    /// Whether all SSH connection parameters are present.
    #[must_use]
    pub fn has_ssh_params(&self) -> bool {
        self.host.is_some()
            && self.port.is_some()
            && self.user.is_some()
            && self.private_key_path.is_some()
    }
}

/// Partial update for a worker row; `None` fields are left unchanged.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerPatch {
    pub name: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub user: Option<String>,
    pub private_key_path: Option<PathBuf>,
    pub max_sessions: Option<u32>,
}

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Waiting in the dispatch queue (`position` is set).
    Queued,
    /// Agent subprocess or remote shell channel is running.
    Active,
    /// Exited cleanly (including cooperative suspension).
    Completed,
    /// Exited with an error or the spawn itself failed.
    Failed,
}

impl SessionStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "active" => Ok(Self::Active),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown session status '{other}'")),
        }
    }
}

/// A single agent session and its queue/runtime bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    /// Unique identifier
    pub id: Uuid,

    /// Worker this session runs (or will run) on
    pub worker_id: Uuid,

    /// Opaque conversation id reported by the agent at exit via the hook
    /// callback; used for targeted `--resume`
    pub claude_session_id: Option<String>,

    /// Current status
    pub status: SessionStatus,

    /// Absolute working directory on the target worker
    pub working_directory: PathBuf,

    /// Display title
    pub title: String,

    /// Queue order; set iff `status == Queued`
    pub position: Option<i64>,

    /// OS PID of the local subprocess while active
    pub pid: Option<i32>,

    /// Advisory flag: the agent is waiting for the human user
    pub needs_input: bool,

    /// User lock preventing cooperative suspension
    pub locked: bool,

    /// How many times this session has been re-queued after an exit
    pub continuation_count: u32,

    /// Spawn the agent in git-worktree isolation on the first activation
    pub worktree: bool,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    /// When the most recent activation started
    pub started_at: Option<DateTime<Utc>>,

    /// When the most recent activation ended
    pub ended_at: Option<DateTime<Utc>>,
}

/// Partial update for a session row; `None` fields are left unchanged.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionPatch {
    pub title: Option<String>,
    #[serde(alias = "lock")]
    pub locked: Option<bool>,
    pub needs_input: Option<bool>,
}

/// A project directory a session has been started in.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub id: Uuid,
    pub worker_id: Uuid,
    pub directory_path: PathBuf,
    pub display_name: String,
    pub bookmarked: bool,
    /// Sort order among bookmarked projects
    pub position: Option<i64>,
    pub last_used_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Hub-wide settings (singleton row).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    /// Global ceiling on concurrently active sessions across all workers
    pub max_concurrent_sessions: u32,
    /// How many session tiles the UI shows at once
    pub max_visible_sessions: u32,
    pub auto_approve: bool,
    pub grid_layout: String,
    pub theme: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_concurrent_sessions: 4,
            max_visible_sessions: 4,
            auto_approve: false,
            grid_layout: "2x2".to_owned(),
            theme: "dark".to_owned(),
        }
    }
}

/// Partial update for settings; `None` fields are left unchanged.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsPatch {
    pub max_concurrent_sessions: Option<u32>,
    pub max_visible_sessions: Option<u32>,
    pub auto_approve: Option<bool>,
    pub grid_layout: Option<String>,
    pub theme: Option<String>,
}

/// Authentication state (singleton row).
///
/// `jwt_secret` is generated once at store init and is stable across
/// restarts so cookies survive a hub restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthConfig {
    /// 32 random bytes, hex encoded
    pub jwt_secret: String,
    /// SHA-256 of the activated license key
    pub license_key_hash: Option<String>,
    pub email: Option<String>,
    pub plan: Option<String>,
    pub max_sessions: Option<u32>,
    pub expires_at: Option<DateTime<Utc>>,
    pub issued_at: Option<DateTime<Utc>>,
    /// Whether requests must carry a valid cookie; derived from the bind
    /// address at startup
    pub auth_required: bool,
}

/// Which side of a diff a review comment anchors to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommentSide {
    Old,
    New,
}

impl CommentSide {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Old => "old",
            Self::New => "new",
        }
    }
}

impl std::str::FromStr for CommentSide {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "old" => Ok(Self::Old),
            "new" => Ok(Self::New),
            other => Err(format!("unknown comment side '{other}'")),
        }
    }
}

/// Delivery state of a review comment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommentStatus {
    /// Still editable
    Pending,
    /// Delivered to the agent; immutable
    Sent,
}

impl CommentStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sent => "sent",
        }
    }
}

impl std::str::FromStr for CommentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "sent" => Ok(Self::Sent),
            other => Err(format!("unknown comment status '{other}'")),
        }
    }
}

/// An inline review comment attached to a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Comment {
    pub id: Uuid,
    pub session_id: Uuid,
    pub file_path: PathBuf,
    pub start_line: u32,
    pub end_line: u32,
    pub code_snippet: String,
    pub comment_text: String,
    pub status: CommentStatus,
    pub side: CommentSide,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
