//! Hook settings injection for spawned agents.
//!
//! The hub writes a settings file plus a small shell script into the
//! working tree (`.c3-hooks/`) and passes the settings file to every agent
//! via `--settings`. The registered `SessionEnd` and `Stop` hooks run the
//! script, which POSTs the agent's conversation id back to
//! `/api/hooks/event` on the hub. Delivery is best-effort: a hook that
//! never fires simply leaves `claude_session_id` unset and continuation
//! falls back to `-c`.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

use crate::config;

/// Payload of `POST /api/hooks/event`, sent by the hook script from inside
/// the agent subprocess.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HookEventRequest {
    pub session_id: Uuid,
    pub claude_session_id: String,
}

/// Settings JSON registering the callback on `SessionEnd` and `Stop`.
fn settings_json(script_path: &str) -> String {
    serde_json::json!({
        "hooks": {
            "SessionEnd": [
                { "hooks": [ { "type": "command", "command": script_path, "timeout": 10 } ] }
            ],
            "Stop": [
                { "hooks": [ { "type": "command", "command": script_path, "timeout": 10 } ] }
            ]
        }
    })
    .to_string()
}

/// The callback script. Claude Code passes hook input as JSON on stdin;
/// the conversation id is its `session_id` field. `C3_SESSION_ID` and
/// `C3_HUB_PORT` are injected by the spawner.
const HOOK_SCRIPT: &str = r#"#!/usr/bin/env bash
# Report the agent's conversation id back to the hub.
set -u

if [ -z "${C3_SESSION_ID:-}" ] || [ -z "${C3_HUB_PORT:-}" ]; then
    exit 0
fi

INPUT=$(cat)
CLAUDE_SESSION_ID=$(printf '%s' "$INPUT" | sed -n 's/.*"session_id"[[:space:]]*:[[:space:]]*"\([^"]*\)".*/\1/p')

if [ -z "$CLAUDE_SESSION_ID" ]; then
    exit 0
fi

curl -s -m 5 -X POST "http://localhost:${C3_HUB_PORT}/api/hooks/event" \
    -H 'Content-Type: application/json' \
    -d "{\"sessionId\":\"${C3_SESSION_ID}\",\"claudeSessionId\":\"${CLAUDE_SESSION_ID}\"}" \
    >/dev/null 2>&1 || true
"#;

/// Write the hooks settings file and callback script, returning the
/// absolute path of the settings file for `--settings`.
///
/// Regenerated on every hub start so the script always matches the
/// running binary.
///
/// # Errors
///
/// Returns an error if the files cannot be written.
pub fn write_hook_files() -> anyhow::Result<PathBuf> {
    let dir = config::hooks_dir();
    std::fs::create_dir_all(&dir)?;

    let script_path = std::path::absolute(config::hook_script_path())?;
    std::fs::write(&script_path, HOOK_SCRIPT)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&script_path, std::fs::Permissions::from_mode(0o755))?;
    }

    let settings_path = std::path::absolute(config::hooks_settings_path())?;
    std::fs::write(
        &settings_path,
        settings_json(&script_path.to_string_lossy()),
    )?;

    tracing::info!(
        settings = %settings_path.display(),
        "Wrote hook settings file"
    );
    Ok(settings_path)
}
