//! Per-session WebSocket bridge.
//!
//! Binary frames carry raw PTY bytes in both directions; JSON text frames
//! carry control messages. On connect the client gets the session status,
//! then the persisted scrollback, then the live stream. Closing the socket
//! never kills the session.

use axum::{
    extract::{
        Path, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use futures::stream::{SplitSink, StreamExt};
use futures::sink::SinkExt;
use tokio::sync::broadcast;
use uuid::Uuid;

use super::http_server::AppState;
use super::protocol::{WsClientMessage, WsServerMessage};
use crate::auth::claims_from_cookie_header;

/// Scrollback replay chunk ceiling.
const SCROLLBACK_CHUNK: usize = 64 * 1024;

/// WebSocket handler for `/ws/sessions/{id}`.
///
/// Auth runs here against the raw upgrade headers because middleware does
/// not run on upgrade requests.
pub async fn ws_session_handler(
    ws: WebSocketUpgrade,
    Path(session_id): Path<Uuid>,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Response {
    if state.auth.auth_required
        && claims_from_cookie_header(&headers, &state.auth.keys).is_none()
    {
        tracing::debug!(session_id = %session_id, "Rejected unauthenticated WebSocket upgrade");
        return StatusCode::UNAUTHORIZED.into_response();
    }

    ws.on_upgrade(move |socket| handle_session_socket(socket, session_id, state))
}

async fn handle_session_socket(socket: WebSocket, session_id: Uuid, state: AppState) {
    tracing::info!(session_id = %session_id, "WebSocket connected");

    let session = match state.store.get_session(session_id).await {
        Ok(Some(session)) => session,
        Ok(None) => {
            tracing::debug!(session_id = %session_id, "WebSocket for unknown session");
            return;
        }
        Err(e) => {
            tracing::error!(session_id = %session_id, error = %e, "Session lookup failed");
            return;
        }
    };

    let (mut ws_sender, mut ws_receiver) = socket.split();

    let status = WsServerMessage::SessionStatus {
        session_id,
        status: session.status,
    };
    if send_json(&mut ws_sender, &status).await.is_err() {
        return;
    }

    // Replay persisted scrollback before any live bytes so every client
    // sees the same prefix.
    let scrollback = state.mux.load_scrollback(session_id).await;
    for chunk in scrollback.chunks(SCROLLBACK_CHUNK) {
        if ws_sender
            .send(Message::Binary(chunk.to_vec().into()))
            .await
            .is_err()
        {
            return;
        }
    }

    let live = state.mux.get(session_id);
    let (mut bytes_rx, mut control_rx) = match &live {
        Some(handle) => (handle.subscribe_bytes(), handle.subscribe_control()),
        None => {
            // Ended session: scrollback only, keep the socket open for the
            // client to read; nothing further will arrive.
            while let Some(Ok(message)) = ws_receiver.next().await {
                if matches!(message, Message::Close(_)) {
                    break;
                }
            }
            tracing::info!(session_id = %session_id, "WebSocket closed (inactive session)");
            return;
        }
    };

    let mut drop_warned = false;

    loop {
        tokio::select! {
            output = bytes_rx.recv() => {
                match output {
                    Ok(bytes) => {
                        if ws_sender.send(Message::Binary(bytes.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(dropped)) => {
                        tracing::warn!(
                            session_id = %session_id,
                            dropped_frames = dropped,
                            "Client fell behind, output frames dropped"
                        );
                        if !drop_warned {
                            drop_warned = true;
                            let warning = WsServerMessage::DroppedOutput {
                                session_id,
                                frames: dropped,
                            };
                            if send_json(&mut ws_sender, &warning).await.is_err() {
                                break;
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            control = control_rx.recv() => {
                match control {
                    Ok(event) => {
                        let message = WsServerMessage::from_control(session_id, event);
                        if send_json(&mut ws_sender, &message).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        // Control events are tiny; lagging here means the
                        // client is gone for good.
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            inbound = ws_receiver.next() => {
                match inbound {
                    Some(Ok(Message::Binary(data))) => {
                        state.sessions.clear_needs_input(session_id).await;
                        if let Err(e) = state.mux.write(session_id, data.to_vec()).await {
                            tracing::debug!(session_id = %session_id, error = %e, "Input write failed");
                            break;
                        }
                    }
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<WsClientMessage>(&text) {
                            Ok(WsClientMessage::Input { data }) => {
                                state.sessions.clear_needs_input(session_id).await;
                                if state.mux.write(session_id, data.into_bytes()).await.is_err() {
                                    break;
                                }
                            }
                            Ok(WsClientMessage::Resize { cols, rows }) => {
                                if let Err(e) = state.mux.resize(session_id, cols, rows).await {
                                    tracing::debug!(session_id = %session_id, error = %e, "Resize failed");
                                }
                            }
                            Ok(WsClientMessage::Kill) => {
                                if let Err(e) = state.sessions.kill_session(session_id).await {
                                    tracing::warn!(session_id = %session_id, error = %e, "Kill failed");
                                }
                            }
                            Err(e) => {
                                tracing::debug!(session_id = %session_id, error = %e, "Bad control frame");
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::debug!(session_id = %session_id, error = %e, "WebSocket error");
                        break;
                    }
                }
            }
        }
    }

    // Disconnecting a client leaves the session running; only an explicit
    // kill or an activation-cycle boundary stops it.
    tracing::info!(session_id = %session_id, "WebSocket disconnected");
}

async fn send_json(
    sender: &mut SplitSink<WebSocket, Message>,
    message: &WsServerMessage,
) -> Result<(), axum::Error> {
    let payload = serde_json::to_string(message).unwrap_or_default();
    sender.send(Message::Text(payload.into())).await
}
