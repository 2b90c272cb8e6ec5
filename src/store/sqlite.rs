use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::QueryBuilder;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::instrument;
use uuid::Uuid;

use crate::core::{
    AuthConfig, Comment, CommentSide, CommentStatus, Project, Session, SessionPatch,
    SessionStatus, Settings, SettingsPatch, Worker, WorkerKind, WorkerPatch, WorkerStatus,
};

/// SQLite-backed store owning every persisted row.
///
/// All other components go through the repository methods here; nothing
/// else touches the database file.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if missing) the store at the given path, apply
    /// pragmas and migrations, and seed the singleton rows.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be created or migrations
    /// fail.
    pub async fn new(db_path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let options = SqliteConnectOptions::from_str(&format!(
            "sqlite:{display}",
            display = db_path.display()
        ))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .foreign_keys(true)
        // ~16 MB page cache (negative value = KiB)
        .pragma("cache_size", "-16000");

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        Self::run_migrations(&pool).await?;

        let store = Self { pool };
        store.seed_singletons().await?;
        Ok(store)
    }

    async fn run_migrations(pool: &SqlitePool) -> anyhow::Result<()> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL
            )
            ",
        )
        .execute(pool)
        .await?;

        let current_version: Option<i64> =
            sqlx::query_scalar("SELECT MAX(version) FROM schema_version")
                .fetch_optional(pool)
                .await?
                .flatten();

        let current_version = current_version.unwrap_or(0);

        if current_version < 1 {
            Self::migrate_to_v1(pool).await?;
        }

        if current_version < 2 {
            Self::migrate_to_v2(pool).await?;
        }

        Ok(())
    }

    /// Migration v1: full initial schema.
    async fn migrate_to_v1(pool: &SqlitePool) -> anyhow::Result<()> {
        tracing::info!("Applying migration v1: Initial schema");

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS workers (
                id TEXT PRIMARY KEY,
                kind TEXT NOT NULL CHECK (kind IN ('local', 'remote')),
                name TEXT NOT NULL,
                host TEXT,
                port INTEGER,
                user TEXT,
                private_key_path TEXT,
                status TEXT NOT NULL DEFAULT 'disconnected',
                max_sessions INTEGER NOT NULL DEFAULT 2 CHECK (max_sessions >= 1),
                last_heartbeat TEXT,
                created_at TEXT NOT NULL
            )
            ",
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                worker_id TEXT NOT NULL,
                claude_session_id TEXT,
                status TEXT NOT NULL CHECK (status IN ('queued', 'active', 'completed', 'failed')),
                working_directory TEXT NOT NULL,
                title TEXT NOT NULL,
                position INTEGER,
                pid INTEGER,
                needs_input INTEGER NOT NULL DEFAULT 0,
                locked INTEGER NOT NULL DEFAULT 0,
                continuation_count INTEGER NOT NULL DEFAULT 0 CHECK (continuation_count >= 0),
                worktree INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                started_at TEXT,
                ended_at TEXT,
                FOREIGN KEY (worker_id) REFERENCES workers(id) ON DELETE CASCADE
            )
            ",
        )
        .execute(pool)
        .await?;

        for index in [
            "CREATE INDEX IF NOT EXISTS idx_sessions_status ON sessions(status)",
            "CREATE INDEX IF NOT EXISTS idx_sessions_worker_id ON sessions(worker_id)",
            "CREATE INDEX IF NOT EXISTS idx_sessions_position ON sessions(position)",
            "CREATE INDEX IF NOT EXISTS idx_sessions_needs_input ON sessions(needs_input)",
        ] {
            sqlx::query(index).execute(pool).await?;
        }

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS projects (
                id TEXT PRIMARY KEY,
                worker_id TEXT NOT NULL,
                directory_path TEXT NOT NULL,
                display_name TEXT NOT NULL,
                bookmarked INTEGER NOT NULL DEFAULT 0,
                last_used_at TEXT NOT NULL,
                created_at TEXT NOT NULL,
                FOREIGN KEY (worker_id) REFERENCES workers(id) ON DELETE CASCADE,
                UNIQUE (worker_id, directory_path)
            )
            ",
        )
        .execute(pool)
        .await?;

        for index in [
            "CREATE INDEX IF NOT EXISTS idx_projects_worker_id ON projects(worker_id)",
            "CREATE INDEX IF NOT EXISTS idx_projects_last_used_at ON projects(last_used_at DESC)",
        ] {
            sqlx::query(index).execute(pool).await?;
        }

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS settings (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                max_concurrent_sessions INTEGER NOT NULL CHECK (max_concurrent_sessions >= 1),
                max_visible_sessions INTEGER NOT NULL,
                auto_approve INTEGER NOT NULL DEFAULT 0,
                grid_layout TEXT NOT NULL,
                theme TEXT NOT NULL
            )
            ",
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS auth_config (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                jwt_secret TEXT NOT NULL,
                license_key_hash TEXT,
                email TEXT,
                plan TEXT,
                max_sessions INTEGER,
                expires_at TEXT,
                issued_at TEXT,
                auth_required INTEGER NOT NULL DEFAULT 0
            )
            ",
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS comments (
                id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL,
                file_path TEXT NOT NULL,
                start_line INTEGER NOT NULL,
                end_line INTEGER NOT NULL,
                code_snippet TEXT NOT NULL,
                comment_text TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending' CHECK (status IN ('pending', 'sent')),
                side TEXT NOT NULL DEFAULT 'new' CHECK (side IN ('old', 'new')),
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                FOREIGN KEY (session_id) REFERENCES sessions(id) ON DELETE CASCADE
            )
            ",
        )
        .execute(pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_comments_session_id ON comments(session_id)",
        )
        .execute(pool)
        .await?;

        let now = Utc::now();
        sqlx::query("INSERT OR REPLACE INTO schema_version (version, applied_at) VALUES (?, ?)")
            .bind(1)
            .bind(now.to_rfc3339())
            .execute(pool)
            .await?;

        tracing::info!("Migration v1 complete");
        Ok(())
    }

    /// Migration v2: bookmark ordering for projects.
    async fn migrate_to_v2(pool: &SqlitePool) -> anyhow::Result<()> {
        tracing::info!("Applying migration v2: Project bookmark ordering");

        let position_exists: bool = sqlx::query_scalar(
            "SELECT COUNT(*) > 0 FROM pragma_table_info('projects') WHERE name = 'position'",
        )
        .fetch_one(pool)
        .await?;

        if !position_exists {
            sqlx::query("ALTER TABLE projects ADD COLUMN position INTEGER")
                .execute(pool)
                .await?;
            tracing::debug!("Added position column to projects table");
        }

        let now = Utc::now();
        sqlx::query("INSERT OR REPLACE INTO schema_version (version, applied_at) VALUES (?, ?)")
            .bind(2)
            .bind(now.to_rfc3339())
            .execute(pool)
            .await?;

        tracing::info!("Migration v2 complete");
        Ok(())
    }

    /// Create the local worker and the singleton rows on first boot.
    async fn seed_singletons(&self) -> anyhow::Result<()> {
        let now = Utc::now();

        let local_exists: bool =
            sqlx::query_scalar("SELECT COUNT(*) > 0 FROM workers WHERE kind = 'local'")
                .fetch_one(&self.pool)
                .await?;
        if !local_exists {
            let id = Uuid::new_v4();
            sqlx::query(
                r"
                INSERT INTO workers (id, kind, name, status, max_sessions, created_at)
                VALUES (?, 'local', 'local', 'connected', 2, ?)
                ",
            )
            .bind(id.to_string())
            .bind(now.to_rfc3339())
            .execute(&self.pool)
            .await?;
            tracing::info!(worker_id = %id, "Created local worker");
        }

        let settings_exists: bool =
            sqlx::query_scalar("SELECT COUNT(*) > 0 FROM settings WHERE id = 1")
                .fetch_one(&self.pool)
                .await?;
        if !settings_exists {
            let defaults = Settings::default();
            sqlx::query(
                r"
                INSERT INTO settings (
                    id, max_concurrent_sessions, max_visible_sessions,
                    auto_approve, grid_layout, theme
                ) VALUES (1, ?, ?, ?, ?, ?)
                ",
            )
            .bind(i64::from(defaults.max_concurrent_sessions))
            .bind(i64::from(defaults.max_visible_sessions))
            .bind(defaults.auto_approve)
            .bind(&defaults.grid_layout)
            .bind(&defaults.theme)
            .execute(&self.pool)
            .await?;
        }

        let auth_exists: bool =
            sqlx::query_scalar("SELECT COUNT(*) > 0 FROM auth_config WHERE id = 1")
                .fetch_one(&self.pool)
                .await?;
        if !auth_exists {
            let secret: [u8; 32] = rand::random();
            sqlx::query("INSERT INTO auth_config (id, jwt_secret, auth_required) VALUES (1, ?, 0)")
                .bind(hex::encode(secret))
                .execute(&self.pool)
                .await?;
            tracing::info!("Generated JWT secret");
        }

        Ok(())
    }

    // ===== workers =====

    #[instrument(skip(self, worker), fields(worker_id = %worker.id, name = %worker.name))]
    pub async fn insert_worker(&self, worker: &Worker) -> anyhow::Result<()> {
        sqlx::query(
            r"
            INSERT INTO workers (
                id, kind, name, host, port, user, private_key_path,
                status, max_sessions, last_heartbeat, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ",
        )
        .bind(worker.id.to_string())
        .bind(match worker.kind {
            WorkerKind::Local => "local",
            WorkerKind::Remote => "remote",
        })
        .bind(&worker.name)
        .bind(&worker.host)
        .bind(worker.port.map(i64::from))
        .bind(&worker.user)
        .bind(
            worker
                .private_key_path
                .as_ref()
                .map(|p| p.to_string_lossy().to_string()),
        )
        .bind(worker.status.as_str())
        .bind(i64::from(worker.max_sessions))
        .bind(worker.last_heartbeat.map(|t| t.to_rfc3339()))
        .bind(worker.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_worker(&self, id: Uuid) -> anyhow::Result<Option<Worker>> {
        let row = sqlx::query_as::<_, WorkerRow>("SELECT * FROM workers WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(TryInto::try_into).transpose()
    }

    /// The single `kind = local` worker, created at store init.
    pub async fn get_local_worker(&self) -> anyhow::Result<Worker> {
        let row = sqlx::query_as::<_, WorkerRow>("SELECT * FROM workers WHERE kind = 'local'")
            .fetch_one(&self.pool)
            .await?;
        row.try_into()
    }

    pub async fn list_workers(&self) -> anyhow::Result<Vec<Worker>> {
        let rows =
            sqlx::query_as::<_, WorkerRow>("SELECT * FROM workers ORDER BY created_at ASC")
                .fetch_all(&self.pool)
                .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    #[instrument(skip(self, patch), fields(worker_id = %id))]
    pub async fn update_worker(&self, id: Uuid, patch: &WorkerPatch) -> anyhow::Result<()> {
        let mut builder: QueryBuilder<'_, sqlx::Sqlite> =
            QueryBuilder::new("UPDATE workers SET status = status");
        if let Some(name) = &patch.name {
            builder.push(", name = ").push_bind(name.clone());
        }
        if let Some(host) = &patch.host {
            builder.push(", host = ").push_bind(host.clone());
        }
        if let Some(port) = patch.port {
            builder.push(", port = ").push_bind(i64::from(port));
        }
        if let Some(user) = &patch.user {
            builder.push(", user = ").push_bind(user.clone());
        }
        if let Some(path) = &patch.private_key_path {
            builder
                .push(", private_key_path = ")
                .push_bind(path.to_string_lossy().to_string());
        }
        if let Some(max) = patch.max_sessions {
            builder.push(", max_sessions = ").push_bind(i64::from(max));
        }
        builder.push(" WHERE id = ").push_bind(id.to_string());
        builder.build().execute(&self.pool).await?;
        Ok(())
    }

    #[instrument(skip(self), fields(worker_id = %id, status = status.as_str()))]
    pub async fn set_worker_status(&self, id: Uuid, status: WorkerStatus) -> anyhow::Result<()> {
        sqlx::query("UPDATE workers SET status = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn touch_worker_heartbeat(&self, id: Uuid) -> anyhow::Result<()> {
        sqlx::query("UPDATE workers SET last_heartbeat = ?, status = 'connected' WHERE id = ?")
            .bind(Utc::now().to_rfc3339())
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Delete a worker; sessions and projects on it cascade away.
    ///
    /// The caller is responsible for refusing local-worker deletion and
    /// for the active-session conflict check.
    pub async fn delete_worker(&self, id: Uuid) -> anyhow::Result<()> {
        sqlx::query("DELETE FROM workers WHERE id = ? AND kind != 'local'")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ===== sessions =====

    #[instrument(skip(self, session), fields(session_id = %session.id))]
    pub async fn insert_session(&self, session: &Session) -> anyhow::Result<()> {
        sqlx::query(
            r"
            INSERT INTO sessions (
                id, worker_id, claude_session_id, status, working_directory,
                title, position, pid, needs_input, locked, continuation_count,
                worktree, created_at, updated_at, started_at, ended_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ",
        )
        .bind(session.id.to_string())
        .bind(session.worker_id.to_string())
        .bind(&session.claude_session_id)
        .bind(session.status.as_str())
        .bind(session.working_directory.to_string_lossy().to_string())
        .bind(&session.title)
        .bind(session.position)
        .bind(session.pid.map(i64::from))
        .bind(session.needs_input)
        .bind(session.locked)
        .bind(i64::from(session.continuation_count))
        .bind(session.worktree)
        .bind(session.created_at.to_rfc3339())
        .bind(session.updated_at.to_rfc3339())
        .bind(session.started_at.map(|t| t.to_rfc3339()))
        .bind(session.ended_at.map(|t| t.to_rfc3339()))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_session(&self, id: Uuid) -> anyhow::Result<Option<Session>> {
        let row = sqlx::query_as::<_, SessionRow>("SELECT * FROM sessions WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(TryInto::try_into).transpose()
    }

    pub async fn list_sessions(&self) -> anyhow::Result<Vec<Session>> {
        let rows =
            sqlx::query_as::<_, SessionRow>("SELECT * FROM sessions ORDER BY created_at DESC")
                .fetch_all(&self.pool)
                .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    pub async fn list_sessions_by_status(
        &self,
        status: SessionStatus,
    ) -> anyhow::Result<Vec<Session>> {
        let rows = sqlx::query_as::<_, SessionRow>(
            "SELECT * FROM sessions WHERE status = ? ORDER BY created_at DESC",
        )
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    /// Queued sessions in dispatch order.
    pub async fn list_queued_sessions(&self) -> anyhow::Result<Vec<Session>> {
        let rows = sqlx::query_as::<_, SessionRow>(
            "SELECT * FROM sessions WHERE status = 'queued' ORDER BY position ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    pub async fn count_active_sessions_on_worker(&self, worker_id: Uuid) -> anyhow::Result<u32> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM sessions WHERE worker_id = ? AND status = 'active'",
        )
        .bind(worker_id.to_string())
        .fetch_one(&self.pool)
        .await?;
        Ok(u32::try_from(count).unwrap_or(0))
    }

    pub async fn count_active_sessions(&self) -> anyhow::Result<u32> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM sessions WHERE status = 'active'")
                .fetch_one(&self.pool)
                .await?;
        Ok(u32::try_from(count).unwrap_or(0))
    }

    /// Next free tail position for a newly queued session.
    pub async fn next_queue_position(&self) -> anyhow::Result<i64> {
        let max: Option<i64> = sqlx::query_scalar(
            "SELECT MAX(position) FROM sessions WHERE status = 'queued'",
        )
        .fetch_optional(&self.pool)
        .await?
        .flatten();
        Ok(max.unwrap_or(0) + 1)
    }

    /// Position ahead of every currently queued session.
    pub async fn head_queue_position(&self) -> anyhow::Result<i64> {
        let min: Option<i64> = sqlx::query_scalar(
            "SELECT MIN(position) FROM sessions WHERE status = 'queued'",
        )
        .fetch_optional(&self.pool)
        .await?
        .flatten();
        Ok(min.unwrap_or(1) - 1)
    }

    #[instrument(skip(self, patch), fields(session_id = %id))]
    pub async fn update_session(&self, id: Uuid, patch: &SessionPatch) -> anyhow::Result<()> {
        let mut builder: QueryBuilder<'_, sqlx::Sqlite> =
            QueryBuilder::new("UPDATE sessions SET updated_at = ");
        builder.push_bind(Utc::now().to_rfc3339());
        if let Some(title) = &patch.title {
            builder.push(", title = ").push_bind(title.clone());
        }
        if let Some(locked) = patch.locked {
            builder.push(", locked = ").push_bind(locked);
        }
        if let Some(needs_input) = patch.needs_input {
            builder.push(", needs_input = ").push_bind(needs_input);
        }
        builder.push(" WHERE id = ").push_bind(id.to_string());
        builder.build().execute(&self.pool).await?;
        Ok(())
    }

    /// Transition queued → active: clear the queue position, record the PID
    /// and the activation time.
    #[instrument(skip(self), fields(session_id = %id))]
    pub async fn mark_session_active(&self, id: Uuid, pid: Option<i32>) -> anyhow::Result<()> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            r"
            UPDATE sessions
            SET status = 'active', position = NULL, pid = ?,
                started_at = ?, ended_at = NULL, updated_at = ?
            WHERE id = ?
            ",
        )
        .bind(pid.map(i64::from))
        .bind(&now)
        .bind(&now)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Transition active → completed/failed, keeping any captured
    /// conversation id.
    #[instrument(skip(self), fields(session_id = %id, status = status.as_str()))]
    pub async fn mark_session_exited(
        &self,
        id: Uuid,
        status: SessionStatus,
        claude_session_id: Option<&str>,
    ) -> anyhow::Result<()> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            r"
            UPDATE sessions
            SET status = ?, pid = NULL, needs_input = 0, ended_at = ?, updated_at = ?,
                claude_session_id = COALESCE(?, claude_session_id)
            WHERE id = ?
            ",
        )
        .bind(status.as_str())
        .bind(&now)
        .bind(&now)
        .bind(claude_session_id)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Re-insert an ended session into the queue. Head insertion is used by
    /// cooperative suspension, tail insertion by the explicit Continue
    /// action. Bumps `continuation_count`.
    #[instrument(skip(self), fields(session_id = %id, at_head))]
    pub async fn requeue_session(&self, id: Uuid, at_head: bool) -> anyhow::Result<()> {
        let position = if at_head {
            self.head_queue_position().await?
        } else {
            self.next_queue_position().await?
        };
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            r"
            UPDATE sessions
            SET status = 'queued', position = ?, pid = NULL, needs_input = 0,
                continuation_count = continuation_count + 1, updated_at = ?
            WHERE id = ?
            ",
        )
        .bind(position)
        .bind(&now)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_session_needs_input(&self, id: Uuid, needs_input: bool) -> anyhow::Result<()> {
        sqlx::query("UPDATE sessions SET needs_input = ?, updated_at = ? WHERE id = ?")
            .bind(needs_input)
            .bind(Utc::now().to_rfc3339())
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_claude_session_id(
        &self,
        id: Uuid,
        claude_session_id: &str,
    ) -> anyhow::Result<()> {
        sqlx::query("UPDATE sessions SET claude_session_id = ?, updated_at = ? WHERE id = ?")
            .bind(claude_session_id)
            .bind(Utc::now().to_rfc3339())
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn delete_session(&self, id: Uuid) -> anyhow::Result<()> {
        sqlx::query("DELETE FROM sessions WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Most recently ended completed session in a directory that captured a
    /// conversation id; used for transparent auto-continue.
    pub async fn latest_resumable_in_directory(
        &self,
        worker_id: Uuid,
        directory: &Path,
    ) -> anyhow::Result<Option<String>> {
        let id: Option<String> = sqlx::query_scalar(
            r"
            SELECT claude_session_id FROM sessions
            WHERE worker_id = ? AND working_directory = ?
              AND status = 'completed' AND claude_session_id IS NOT NULL
            ORDER BY ended_at DESC
            LIMIT 1
            ",
        )
        .bind(worker_id.to_string())
        .bind(directory.to_string_lossy().to_string())
        .fetch_optional(&self.pool)
        .await?;
        Ok(id)
    }

    // ===== projects =====

    /// Upsert the project row for a directory and refresh `last_used_at`,
    /// then evict stale non-bookmarked entries.
    #[instrument(skip(self), fields(worker_id = %worker_id, path = %directory.display()))]
    pub async fn touch_project(&self, worker_id: Uuid, directory: &Path) -> anyhow::Result<()> {
        let now = Utc::now().to_rfc3339();
        let display_name = directory
            .file_name()
            .map_or_else(|| directory.to_string_lossy().to_string(), |n| {
                n.to_string_lossy().to_string()
            });

        sqlx::query(
            r"
            INSERT INTO projects (
                id, worker_id, directory_path, display_name,
                bookmarked, last_used_at, created_at
            ) VALUES (?, ?, ?, ?, 0, ?, ?)
            ON CONFLICT (worker_id, directory_path)
            DO UPDATE SET last_used_at = excluded.last_used_at
            ",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(worker_id.to_string())
        .bind(directory.to_string_lossy().to_string())
        .bind(display_name)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        self.evict_old_recent_projects(super::MAX_RECENT_PROJECTS)
            .await?;
        Ok(())
    }

    /// Keep only the `limit` most recently used non-bookmarked projects.
    pub async fn evict_old_recent_projects(&self, limit: usize) -> anyhow::Result<()> {
        sqlx::query(
            r"
            DELETE FROM projects
            WHERE bookmarked = 0 AND id NOT IN (
                SELECT id FROM projects WHERE bookmarked = 0
                ORDER BY last_used_at DESC LIMIT ?
            )
            ",
        )
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_projects(&self) -> anyhow::Result<Vec<Project>> {
        let rows = sqlx::query_as::<_, ProjectRow>(
            r"
            SELECT * FROM projects
            ORDER BY bookmarked DESC, position ASC, last_used_at DESC
            ",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    pub async fn get_project(&self, id: Uuid) -> anyhow::Result<Option<Project>> {
        let row = sqlx::query_as::<_, ProjectRow>("SELECT * FROM projects WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(TryInto::try_into).transpose()
    }

    pub async fn update_project(
        &self,
        id: Uuid,
        display_name: Option<&str>,
        bookmarked: Option<bool>,
        position: Option<i64>,
    ) -> anyhow::Result<()> {
        let mut builder: QueryBuilder<'_, sqlx::Sqlite> =
            QueryBuilder::new("UPDATE projects SET last_used_at = last_used_at");
        if let Some(name) = display_name {
            builder.push(", display_name = ").push_bind(name.to_owned());
        }
        if let Some(bookmarked) = bookmarked {
            builder.push(", bookmarked = ").push_bind(bookmarked);
        }
        if let Some(position) = position {
            builder.push(", position = ").push_bind(position);
        }
        builder.push(" WHERE id = ").push_bind(id.to_string());
        builder.build().execute(&self.pool).await?;
        Ok(())
    }

    pub async fn delete_project(&self, id: Uuid) -> anyhow::Result<()> {
        sqlx::query("DELETE FROM projects WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ===== settings =====

    pub async fn get_settings(&self) -> anyhow::Result<Settings> {
        let row = sqlx::query_as::<_, SettingsRow>("SELECT * FROM settings WHERE id = 1")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.into())
    }

    pub async fn update_settings(&self, patch: &SettingsPatch) -> anyhow::Result<()> {
        let mut builder: QueryBuilder<'_, sqlx::Sqlite> = QueryBuilder::new("UPDATE settings SET id = 1");
        if let Some(v) = patch.max_concurrent_sessions {
            builder
                .push(", max_concurrent_sessions = ")
                .push_bind(i64::from(v));
        }
        if let Some(v) = patch.max_visible_sessions {
            builder
                .push(", max_visible_sessions = ")
                .push_bind(i64::from(v));
        }
        if let Some(v) = patch.auto_approve {
            builder.push(", auto_approve = ").push_bind(v);
        }
        if let Some(v) = &patch.grid_layout {
            builder.push(", grid_layout = ").push_bind(v.clone());
        }
        if let Some(v) = &patch.theme {
            builder.push(", theme = ").push_bind(v.clone());
        }
        builder.push(" WHERE id = 1");
        builder.build().execute(&self.pool).await?;
        Ok(())
    }

    // ===== auth config =====

    pub async fn get_auth_config(&self) -> anyhow::Result<AuthConfig> {
        let row = sqlx::query_as::<_, AuthConfigRow>("SELECT * FROM auth_config WHERE id = 1")
            .fetch_one(&self.pool)
            .await?;
        row.try_into()
    }

    pub async fn set_auth_required(&self, auth_required: bool) -> anyhow::Result<()> {
        sqlx::query("UPDATE auth_config SET auth_required = ? WHERE id = 1")
            .bind(auth_required)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Persist a successful activation: the key hash plus the cached
    /// license fields.
    #[instrument(skip_all)]
    pub async fn store_activation(
        &self,
        license_key_hash: &str,
        email: &str,
        plan: &str,
        max_sessions: u32,
        expires_at: DateTime<Utc>,
        issued_at: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        sqlx::query(
            r"
            UPDATE auth_config
            SET license_key_hash = ?, email = ?, plan = ?, max_sessions = ?,
                expires_at = ?, issued_at = ?
            WHERE id = 1
            ",
        )
        .bind(license_key_hash)
        .bind(email)
        .bind(plan)
        .bind(i64::from(max_sessions))
        .bind(expires_at.to_rfc3339())
        .bind(issued_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ===== comments =====

    #[instrument(skip(self, comment), fields(comment_id = %comment.id, session_id = %comment.session_id))]
    pub async fn insert_comment(&self, comment: &Comment) -> anyhow::Result<()> {
        sqlx::query(
            r"
            INSERT INTO comments (
                id, session_id, file_path, start_line, end_line,
                code_snippet, comment_text, status, side, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ",
        )
        .bind(comment.id.to_string())
        .bind(comment.session_id.to_string())
        .bind(comment.file_path.to_string_lossy().to_string())
        .bind(i64::from(comment.start_line))
        .bind(i64::from(comment.end_line))
        .bind(&comment.code_snippet)
        .bind(&comment.comment_text)
        .bind(comment.status.as_str())
        .bind(comment.side.as_str())
        .bind(comment.created_at.to_rfc3339())
        .bind(comment.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_comments(&self, session_id: Uuid) -> anyhow::Result<Vec<Comment>> {
        let rows = sqlx::query_as::<_, CommentRow>(
            "SELECT * FROM comments WHERE session_id = ? ORDER BY created_at ASC",
        )
        .bind(session_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    /// Update a comment's text; only pending comments are mutable.
    pub async fn update_comment_text(&self, id: Uuid, text: &str) -> anyhow::Result<bool> {
        let result = sqlx::query(
            "UPDATE comments SET comment_text = ?, updated_at = ? WHERE id = ? AND status = 'pending'",
        )
        .bind(text)
        .bind(Utc::now().to_rfc3339())
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn mark_comment_sent(&self, id: Uuid) -> anyhow::Result<()> {
        sqlx::query("UPDATE comments SET status = 'sent', updated_at = ? WHERE id = ?")
            .bind(Utc::now().to_rfc3339())
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn delete_comment(&self, id: Uuid) -> anyhow::Result<()> {
        sqlx::query("DELETE FROM comments WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

// ===== row types =====

#[derive(sqlx::FromRow)]
struct WorkerRow {
    id: String,
    kind: String,
    name: String,
    host: Option<String>,
    port: Option<i64>,
    user: Option<String>,
    private_key_path: Option<String>,
    status: String,
    max_sessions: i64,
    last_heartbeat: Option<String>,
    created_at: String,
}

impl TryFrom<WorkerRow> for Worker {
    type Error = anyhow::Error;

    fn try_from(row: WorkerRow) -> Result<Self, Self::Error> {
        let id = Uuid::parse_str(&row.id)
            .map_err(|e| anyhow::anyhow!("worker '{}': invalid id: {}", row.name, e))?;
        let kind = match row.kind.as_str() {
            "local" => WorkerKind::Local,
            "remote" => WorkerKind::Remote,
            other => anyhow::bail!("worker '{}': unknown kind '{}'", row.name, other),
        };
        let status = row
            .status
            .parse()
            .map_err(|e| anyhow::anyhow!("worker '{}': {e}", row.name))?;

        Ok(Self {
            id,
            kind,
            name: row.name,
            host: row.host,
            port: row.port.map(|p| p as u16),
            user: row.user,
            private_key_path: row.private_key_path.map(PathBuf::from),
            status,
            max_sessions: u32::try_from(row.max_sessions).unwrap_or(1),
            last_heartbeat: row.last_heartbeat.as_deref().map(parse_timestamp).transpose()?,
            created_at: parse_timestamp(&row.created_at)?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct SessionRow {
    id: String,
    worker_id: String,
    claude_session_id: Option<String>,
    status: String,
    working_directory: String,
    title: String,
    position: Option<i64>,
    pid: Option<i64>,
    needs_input: bool,
    locked: bool,
    continuation_count: i64,
    worktree: bool,
    created_at: String,
    updated_at: String,
    started_at: Option<String>,
    ended_at: Option<String>,
}

impl TryFrom<SessionRow> for Session {
    type Error = anyhow::Error;

    fn try_from(row: SessionRow) -> Result<Self, Self::Error> {
        let id = Uuid::parse_str(&row.id)
            .map_err(|e| anyhow::anyhow!("session row: invalid id '{}': {}", row.id, e))?;
        let worker_id = Uuid::parse_str(&row.worker_id)
            .map_err(|e| anyhow::anyhow!("session {}: invalid worker_id: {}", row.id, e))?;
        let status: SessionStatus = row
            .status
            .parse()
            .map_err(|e| anyhow::anyhow!("session {}: {e}", row.id))?;

        Ok(Self {
            id,
            worker_id,
            claude_session_id: row.claude_session_id,
            status,
            working_directory: PathBuf::from(row.working_directory),
            title: row.title,
            position: row.position,
            pid: row.pid.map(|p| p as i32),
            needs_input: row.needs_input,
            locked: row.locked,
            continuation_count: u32::try_from(row.continuation_count).unwrap_or(0),
            worktree: row.worktree,
            created_at: parse_timestamp(&row.created_at)?,
            updated_at: parse_timestamp(&row.updated_at)?,
            started_at: row.started_at.as_deref().map(parse_timestamp).transpose()?,
            ended_at: row.ended_at.as_deref().map(parse_timestamp).transpose()?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ProjectRow {
    id: String,
    worker_id: String,
    directory_path: String,
    display_name: String,
    bookmarked: bool,
    position: Option<i64>,
    last_used_at: String,
    created_at: String,
}

impl TryFrom<ProjectRow> for Project {
    type Error = anyhow::Error;

    fn try_from(row: ProjectRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: Uuid::parse_str(&row.id)?,
            worker_id: Uuid::parse_str(&row.worker_id)?,
            directory_path: PathBuf::from(row.directory_path),
            display_name: row.display_name,
            bookmarked: row.bookmarked,
            position: row.position,
            last_used_at: parse_timestamp(&row.last_used_at)?,
            created_at: parse_timestamp(&row.created_at)?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct SettingsRow {
    #[allow(dead_code)]
    id: i64,
    max_concurrent_sessions: i64,
    max_visible_sessions: i64,
    auto_approve: bool,
    grid_layout: String,
    theme: String,
}

impl From<SettingsRow> for Settings {
    fn from(row: SettingsRow) -> Self {
        Self {
            max_concurrent_sessions: u32::try_from(row.max_concurrent_sessions).unwrap_or(1),
            max_visible_sessions: u32::try_from(row.max_visible_sessions).unwrap_or(1),
            auto_approve: row.auto_approve,
            grid_layout: row.grid_layout,
            theme: row.theme,
        }
    }
}

#[derive(sqlx::FromRow)]
struct AuthConfigRow {
    #[allow(dead_code)]
    id: i64,
    jwt_secret: String,
    license_key_hash: Option<String>,
    email: Option<String>,
    plan: Option<String>,
    max_sessions: Option<i64>,
    expires_at: Option<String>,
    issued_at: Option<String>,
    auth_required: bool,
}

impl TryFrom<AuthConfigRow> for AuthConfig {
    type Error = anyhow::Error;

    fn try_from(row: AuthConfigRow) -> Result<Self, Self::Error> {
        Ok(Self {
            jwt_secret: row.jwt_secret,
            license_key_hash: row.license_key_hash,
            email: row.email,
            plan: row.plan,
            max_sessions: row.max_sessions.map(|m| u32::try_from(m).unwrap_or(0)),
            expires_at: row.expires_at.as_deref().map(parse_timestamp).transpose()?,
            issued_at: row.issued_at.as_deref().map(parse_timestamp).transpose()?,
            auth_required: row.auth_required,
        })
    }
}

#[derive(sqlx::FromRow)]
struct CommentRow {
    id: String,
    session_id: String,
    file_path: String,
    start_line: i64,
    end_line: i64,
    code_snippet: String,
    comment_text: String,
    status: String,
    side: String,
    created_at: String,
    updated_at: String,
}

impl TryFrom<CommentRow> for Comment {
    type Error = anyhow::Error;

    fn try_from(row: CommentRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: Uuid::parse_str(&row.id)?,
            session_id: Uuid::parse_str(&row.session_id)?,
            file_path: PathBuf::from(row.file_path),
            start_line: u32::try_from(row.start_line).unwrap_or(0),
            end_line: u32::try_from(row.end_line).unwrap_or(0),
            code_snippet: row.code_snippet,
            comment_text: row.comment_text,
            status: row
                .status
                .parse::<CommentStatus>()
                .map_err(|e| anyhow::anyhow!(e))?,
            side: row.side.parse::<CommentSide>().map_err(|e| anyhow::anyhow!(e))?,
            created_at: parse_timestamp(&row.created_at)?,
            updated_at: parse_timestamp(&row.updated_at)?,
        })
    }
}

fn parse_timestamp(raw: &str) -> anyhow::Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)
        .map_err(|e| anyhow::anyhow!("invalid timestamp '{raw}': {e}"))?
        .into())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn temp_store() -> (SqliteStore, tempfile::TempDir) {
        let dir = tempfile::TempDir::new().expect("temp dir");
        let store = SqliteStore::new(&dir.path().join("test.db"))
            .await
            .expect("store should open");
        (store, dir)
    }

    fn queued_session(worker_id: Uuid, position: i64) -> Session {
        let now = Utc::now();
        Session {
            id: Uuid::new_v4(),
            worker_id,
            claude_session_id: None,
            status: SessionStatus::Queued,
            working_directory: PathBuf::from("/home/dev/proj"),
            title: "test".to_owned(),
            position: Some(position),
            pid: None,
            needs_input: false,
            locked: false,
            continuation_count: 0,
            worktree: false,
            created_at: now,
            updated_at: now,
            started_at: None,
            ended_at: None,
        }
    }

    #[tokio::test]
    async fn seeds_local_worker_and_singletons() {
        let (store, _dir) = temp_store().await;

        let local = store.get_local_worker().await.expect("local worker");
        assert_eq!(local.kind, WorkerKind::Local);
        assert_eq!(local.status, WorkerStatus::Connected);

        let settings = store.get_settings().await.expect("settings");
        assert!(settings.max_concurrent_sessions >= 1);

        let auth = store.get_auth_config().await.expect("auth config");
        assert_eq!(auth.jwt_secret.len(), 64, "secret should be 32 bytes hex");
        assert!(!auth.auth_required);
    }

    #[tokio::test]
    async fn jwt_secret_is_stable_across_reopens() {
        let dir = tempfile::TempDir::new().expect("temp dir");
        let path = dir.path().join("test.db");

        let first = SqliteStore::new(&path).await.expect("open");
        let secret = first.get_auth_config().await.expect("auth").jwt_secret;
        drop(first);

        let second = SqliteStore::new(&path).await.expect("reopen");
        let again = second.get_auth_config().await.expect("auth").jwt_secret;
        assert_eq!(secret, again, "secret must survive a restart");
    }

    #[tokio::test]
    async fn queued_position_invariant_holds_through_transitions() {
        let (store, _dir) = temp_store().await;
        let local = store.get_local_worker().await.expect("local worker");

        let session = queued_session(local.id, 1);
        store.insert_session(&session).await.expect("insert");

        let loaded = store
            .get_session(session.id)
            .await
            .expect("get")
            .expect("present");
        assert_eq!(loaded.status, SessionStatus::Queued);
        assert_eq!(loaded.position, Some(1));

        store
            .mark_session_active(session.id, Some(1234))
            .await
            .expect("activate");
        let active = store
            .get_session(session.id)
            .await
            .expect("get")
            .expect("present");
        assert_eq!(active.status, SessionStatus::Active);
        assert_eq!(active.position, None, "active sessions leave the queue");
        assert_eq!(active.pid, Some(1234));

        store
            .mark_session_exited(session.id, SessionStatus::Completed, Some("abc123"))
            .await
            .expect("exit");
        let done = store
            .get_session(session.id)
            .await
            .expect("get")
            .expect("present");
        assert_eq!(done.status, SessionStatus::Completed);
        assert_eq!(done.pid, None);
        assert_eq!(done.claude_session_id.as_deref(), Some("abc123"));
    }

    #[tokio::test]
    async fn requeue_at_head_goes_ahead_of_existing_queue() {
        let (store, _dir) = temp_store().await;
        let local = store.get_local_worker().await.expect("local worker");

        let waiting = queued_session(local.id, 1);
        store.insert_session(&waiting).await.expect("insert");

        let suspended = queued_session(local.id, 2);
        store.insert_session(&suspended).await.expect("insert");
        store
            .mark_session_active(suspended.id, Some(99))
            .await
            .expect("activate");
        store
            .mark_session_exited(suspended.id, SessionStatus::Completed, None)
            .await
            .expect("exit");
        store.requeue_session(suspended.id, true).await.expect("requeue");

        let queue = store.list_queued_sessions().await.expect("queue");
        assert_eq!(queue.len(), 2);
        assert_eq!(
            queue[0].id, suspended.id,
            "suspended session should be at the head"
        );
        assert_eq!(queue[0].continuation_count, 1);
    }

    #[tokio::test]
    async fn exit_keeps_existing_claude_session_id_when_none_captured() {
        let (store, _dir) = temp_store().await;
        let local = store.get_local_worker().await.expect("local worker");

        let session = queued_session(local.id, 1);
        store.insert_session(&session).await.expect("insert");
        store
            .set_claude_session_id(session.id, "earlier-id")
            .await
            .expect("set id");
        store
            .mark_session_exited(session.id, SessionStatus::Failed, None)
            .await
            .expect("exit");

        let loaded = store
            .get_session(session.id)
            .await
            .expect("get")
            .expect("present");
        assert_eq!(
            loaded.claude_session_id.as_deref(),
            Some("earlier-id"),
            "a null capture must not clobber a previous id"
        );
    }

    #[tokio::test]
    async fn recent_projects_are_evicted_beyond_limit() {
        let (store, _dir) = temp_store().await;
        let local = store.get_local_worker().await.expect("local worker");

        for i in 0..15 {
            store
                .touch_project(local.id, Path::new(&format!("/home/dev/p{i}")))
                .await
                .expect("touch");
        }

        let projects = store.list_projects().await.expect("list");
        assert!(
            projects.len() <= super::super::MAX_RECENT_PROJECTS,
            "non-bookmarked projects beyond the limit are evicted"
        );
    }

    #[tokio::test]
    async fn auto_continue_picks_most_recent_completed_in_directory() {
        let (store, _dir) = temp_store().await;
        let local = store.get_local_worker().await.expect("local worker");
        let dir = Path::new("/home/dev/proj");

        for (pos, cid) in [(1, "first"), (2, "second")] {
            let session = queued_session(local.id, pos);
            store.insert_session(&session).await.expect("insert");
            store
                .mark_session_active(session.id, Some(1))
                .await
                .expect("activate");
            store
                .mark_session_exited(session.id, SessionStatus::Completed, Some(cid))
                .await
                .expect("exit");
        }

        let resumable = store
            .latest_resumable_in_directory(local.id, dir)
            .await
            .expect("query");
        assert_eq!(resumable.as_deref(), Some("second"));
    }

    #[tokio::test]
    async fn deleting_session_cascades_comments() {
        let (store, _dir) = temp_store().await;
        let local = store.get_local_worker().await.expect("local worker");

        let session = queued_session(local.id, 1);
        store.insert_session(&session).await.expect("insert");

        let now = Utc::now();
        let comment = Comment {
            id: Uuid::new_v4(),
            session_id: session.id,
            file_path: PathBuf::from("src/lib.rs"),
            start_line: 1,
            end_line: 3,
            code_snippet: "fn main() {}".to_owned(),
            comment_text: "rename this".to_owned(),
            status: CommentStatus::Pending,
            side: CommentSide::New,
            created_at: now,
            updated_at: now,
        };
        store.insert_comment(&comment).await.expect("insert comment");

        store.delete_session(session.id).await.expect("delete");
        let comments = store.list_comments(session.id).await.expect("list");
        assert!(comments.is_empty(), "comments cascade with their session");
    }

    #[tokio::test]
    async fn sent_comments_are_immutable() {
        let (store, _dir) = temp_store().await;
        let local = store.get_local_worker().await.expect("local worker");
        let session = queued_session(local.id, 1);
        store.insert_session(&session).await.expect("insert");

        let now = Utc::now();
        let comment = Comment {
            id: Uuid::new_v4(),
            session_id: session.id,
            file_path: PathBuf::from("src/lib.rs"),
            start_line: 1,
            end_line: 1,
            code_snippet: String::new(),
            comment_text: "original".to_owned(),
            status: CommentStatus::Pending,
            side: CommentSide::Old,
            created_at: now,
            updated_at: now,
        };
        store.insert_comment(&comment).await.expect("insert");
        store.mark_comment_sent(comment.id).await.expect("send");

        let changed = store
            .update_comment_text(comment.id, "edited")
            .await
            .expect("update");
        assert!(!changed, "sent comments must reject edits");
    }
}
