//! File locations and environment variable names used by the hub.

use std::path::PathBuf;

/// Environment variable injected into agent subprocesses: the hub session id.
pub const ENV_SESSION_ID: &str = "C3_SESSION_ID";

/// Environment variable injected into agent subprocesses: the hub HTTP port.
pub const ENV_HUB_PORT: &str = "C3_HUB_PORT";

/// Terminal type set for every spawned agent.
pub const TERM: &str = "xterm-256color";

/// Environment variables stripped from spawned agents so a hub-launched
/// agent never detects itself as nested inside another agent session.
pub const STRIPPED_ENV: &[&str] = &["CLAUDECODE", "CLAUDE_CODE_ENTRYPOINT"];

/// Name of the session cookie carrying the hub JWT.
pub const SESSION_COOKIE: &str = "agentide_session";

/// Get the base directory for hub data (license, TLS material)
///
/// # Panics
///
/// Panics if the home directory cannot be determined.
#[must_use]
pub fn base_dir() -> PathBuf {
    #[expect(clippy::expect_used, reason = "home directory is required for operation")]
    dirs::home_dir()
        .expect("Could not find home directory")
        .join(".agentide")
}

/// Get the path to the persisted license key
#[must_use]
pub fn license_path() -> PathBuf {
    base_dir().join("license.key")
}

/// Get the directory holding TLS material for `--tls`
#[must_use]
pub fn tls_dir() -> PathBuf {
    base_dir().join("tls")
}

/// Get the path to the `SQLite` database
#[must_use]
pub fn database_path() -> PathBuf {
    PathBuf::from("c3.db")
}

/// Get the directory for per-session scrollback files
///
/// Honors `SCROLLBACK_DIR` when set.
#[must_use]
pub fn scrollback_dir() -> PathBuf {
    std::env::var("SCROLLBACK_DIR")
        .map_or_else(|_| PathBuf::from("scrollback"), PathBuf::from)
}

/// Get the path of a session's scrollback file
#[must_use]
pub fn scrollback_path(session_id: uuid::Uuid) -> PathBuf {
    scrollback_path_in(&scrollback_dir(), session_id)
}

/// Scrollback file path under an explicit directory (the multiplexer
/// captures the directory once at startup).
#[must_use]
pub fn scrollback_path_in(dir: &std::path::Path, session_id: uuid::Uuid) -> PathBuf {
    dir.join(format!("{session_id}.scrollback"))
}

/// Get the directory for the injected hooks settings file and hook script
#[must_use]
pub fn hooks_dir() -> PathBuf {
    PathBuf::from(".c3-hooks")
}

/// Get the path to the injected hooks settings file
#[must_use]
pub fn hooks_settings_path() -> PathBuf {
    hooks_dir().join("settings.json")
}

/// Get the path to the hook callback script
#[must_use]
pub fn hook_script_path() -> PathBuf {
    hooks_dir().join("c3-hook.sh")
}

/// Get the directory for log files
#[must_use]
pub fn logs_dir() -> PathBuf {
    PathBuf::from("logs")
}
