//! Wire DTOs for the REST surface and the per-session WebSocket.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

use crate::core::{BoardCommand, ControlEvent, SessionStatus};

/// Body of `POST /api/sessions`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest {
    pub working_directory: PathBuf,
    #[serde(default)]
    pub title: Option<String>,
    /// Target worker id; defaults to the local worker.
    #[serde(default)]
    pub target_worker: Option<Uuid>,
    /// Skip the transparent directory auto-continue on first spawn.
    #[serde(default)]
    pub start_fresh: Option<bool>,
    #[serde(default)]
    pub worktree: Option<bool>,
}

/// Body of `POST /api/workers`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateWorkerRequest {
    pub name: String,
    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    pub user: String,
    pub ssh_key_path: PathBuf,
    #[serde(default = "default_max_sessions")]
    pub max_sessions: u32,
}

fn default_ssh_port() -> u16 {
    22
}

fn default_max_sessions() -> u32 {
    1
}

/// Body of `POST /api/sessions/:id/input`.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionInputRequest {
    pub data: String,
}

/// Query string of `GET /api/sessions`.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionListQuery {
    pub status: Option<SessionStatus>,
}

/// Query string of `GET /api/directories`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryQuery {
    pub path: Option<String>,
    pub query: Option<String>,
    pub worker_id: Option<Uuid>,
}

/// One directory entry from `GET /api/directories`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryEntry {
    pub name: String,
    pub path: String,
}

/// Body of `PATCH /api/projects/:id`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectPatchRequest {
    pub display_name: Option<String>,
    pub bookmarked: Option<bool>,
    pub position: Option<i64>,
}

/// Server → client WebSocket text frames.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsServerMessage {
    SessionStatus {
        #[serde(rename = "sessionId")]
        session_id: Uuid,
        status: SessionStatus,
    },
    NeedsInput {
        #[serde(rename = "sessionId")]
        session_id: Uuid,
    },
    SessionIdle {
        #[serde(rename = "sessionId")]
        session_id: Uuid,
    },
    PortDetected {
        #[serde(rename = "sessionId")]
        session_id: Uuid,
        port: u16,
        #[serde(rename = "localPort", skip_serializing_if = "Option::is_none")]
        local_port: Option<u16>,
    },
    PortClosed {
        #[serde(rename = "sessionId")]
        session_id: Uuid,
        port: u16,
    },
    BoardCommand {
        #[serde(rename = "sessionId")]
        session_id: Uuid,
        action: String,
        argument: String,
    },
    ConnectionLost {
        #[serde(rename = "sessionId")]
        session_id: Uuid,
    },
    ConnectionRestored {
        #[serde(rename = "sessionId")]
        session_id: Uuid,
    },
    DroppedOutput {
        #[serde(rename = "sessionId")]
        session_id: Uuid,
        frames: u64,
    },
}

impl WsServerMessage {
    /// Build the wire message for a control event.
    #[must_use]
    pub fn from_control(session_id: Uuid, event: ControlEvent) -> Self {
        match event {
            ControlEvent::NeedsInput => Self::NeedsInput { session_id },
            ControlEvent::SessionIdle => Self::SessionIdle { session_id },
            ControlEvent::BoardCommand(BoardCommand { action, argument }) => Self::BoardCommand {
                session_id,
                action,
                argument,
            },
            ControlEvent::ConnectionLost => Self::ConnectionLost { session_id },
            ControlEvent::ConnectionRestored => Self::ConnectionRestored { session_id },
            ControlEvent::PortDetected { port, forwarded_to } => Self::PortDetected {
                session_id,
                port,
                local_port: forwarded_to,
            },
            ControlEvent::PortClosed { port } => Self::PortClosed { session_id, port },
            ControlEvent::DroppedOutput { frames } => Self::DroppedOutput { session_id, frames },
        }
    }
}

/// Client → server WebSocket text frames. Raw input travels as binary
/// frames; the `input` variant is the legacy text path.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsClientMessage {
    Resize { cols: u16, rows: u16 },
    Input { data: String },
    Kill,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_messages_serialize_with_type_tag() {
        let id = Uuid::new_v4();
        let json = serde_json::to_value(WsServerMessage::SessionStatus {
            session_id: id,
            status: SessionStatus::Active,
        })
        .expect("serialize");
        assert_eq!(json["type"], "session_status");
        assert_eq!(json["sessionId"], id.to_string());
        assert_eq!(json["status"], "active");
    }

    #[test]
    fn client_messages_parse_from_type_tag() {
        let resize: WsClientMessage =
            serde_json::from_str(r#"{"type":"resize","cols":120,"rows":40}"#).expect("parse");
        assert!(matches!(resize, WsClientMessage::Resize { cols: 120, rows: 40 }));

        let kill: WsClientMessage = serde_json::from_str(r#"{"type":"kill"}"#).expect("parse");
        assert!(matches!(kill, WsClientMessage::Kill));
    }

    #[test]
    fn port_detected_omits_local_port_for_local_sessions() {
        let json = serde_json::to_value(WsServerMessage::PortDetected {
            session_id: Uuid::new_v4(),
            port: 3000,
            local_port: None,
        })
        .expect("serialize");
        assert!(json.get("localPort").is_none());
    }
}
