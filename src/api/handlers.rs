//! REST handlers for sessions, workers, projects, settings, directories
//! and hook callbacks.

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use chrono::Utc;
use serde_json::json;
use std::path::PathBuf;
use uuid::Uuid;

use super::http_server::{AppState, ApiError};
use super::protocol::{
    CreateSessionRequest, CreateWorkerRequest, DirectoryEntry, DirectoryQuery,
    ProjectPatchRequest, SessionInputRequest, SessionListQuery,
};
use super::ssrf;
use crate::core::{
    HubError, SessionPatch, SessionStatus, SettingsPatch, Worker, WorkerKind, WorkerPatch,
    WorkerStatus,
};
use crate::hooks::HookEventRequest;
use crate::sessions::CreateSessionParams;

// ===== settings =====

pub async fn get_settings(State(state): State<AppState>) -> Result<Response, ApiError> {
    let settings = state.store.get_settings().await.map_err(HubError::Internal)?;
    Ok(Json(settings).into_response())
}

pub async fn patch_settings(
    State(state): State<AppState>,
    Json(patch): Json<SettingsPatch>,
) -> Result<Response, ApiError> {
    if matches!(patch.max_concurrent_sessions, Some(0)) {
        return Err(HubError::BadInput("maxConcurrentSessions must be >= 1".into()).into());
    }
    state
        .store
        .update_settings(&patch)
        .await
        .map_err(HubError::Internal)?;
    // A raised ceiling may unblock the queue immediately.
    state.dispatch_notify.notify_one();
    let settings = state.store.get_settings().await.map_err(HubError::Internal)?;
    Ok(Json(settings).into_response())
}

// ===== workers =====

pub async fn list_workers(State(state): State<AppState>) -> Result<Response, ApiError> {
    let workers = state.store.list_workers().await.map_err(HubError::Internal)?;
    Ok(Json(json!({ "workers": workers })).into_response())
}

pub async fn create_worker(
    State(state): State<AppState>,
    Json(request): Json<CreateWorkerRequest>,
) -> Result<Response, ApiError> {
    if request.name.trim().is_empty() {
        return Err(HubError::BadInput("worker name is required".into()).into());
    }
    if request.max_sessions < 1 {
        return Err(HubError::BadInput("maxSessions must be >= 1".into()).into());
    }

    let worker = Worker {
        id: Uuid::new_v4(),
        kind: WorkerKind::Remote,
        name: request.name,
        host: Some(request.host),
        port: Some(request.port),
        user: Some(request.user),
        private_key_path: Some(request.ssh_key_path),
        status: WorkerStatus::Disconnected,
        max_sessions: request.max_sessions,
        last_heartbeat: None,
        created_at: Utc::now(),
    };
    state
        .store
        .insert_worker(&worker)
        .await
        .map_err(HubError::Internal)?;

    // Connect in the background; the status row tracks the outcome.
    {
        let tunnel = state.tunnel.clone();
        let notify = state.dispatch_notify.clone();
        let worker = worker.clone();
        tokio::spawn(async move {
            if let Err(e) = tunnel.connect(&worker).await {
                tracing::warn!(worker_id = %worker.id, error = %e, "Initial worker connect failed");
            }
            notify.notify_one();
        });
    }

    Ok((StatusCode::CREATED, Json(json!({ "worker": worker }))).into_response())
}

pub async fn update_worker(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(patch): Json<WorkerPatch>,
) -> Result<Response, ApiError> {
    let worker = state
        .store
        .get_worker(id)
        .await
        .map_err(HubError::Internal)?
        .ok_or(HubError::worker_not_found(id))?;
    if matches!(patch.max_sessions, Some(0)) {
        return Err(HubError::BadInput("maxSessions must be >= 1".into()).into());
    }

    state
        .store
        .update_worker(worker.id, &patch)
        .await
        .map_err(HubError::Internal)?;
    // Capacity may have grown.
    state.dispatch_notify.notify_one();

    let updated = state
        .store
        .get_worker(id)
        .await
        .map_err(HubError::Internal)?
        .ok_or(HubError::worker_not_found(id))?;
    Ok(Json(json!({ "worker": updated })).into_response())
}

pub async fn delete_worker(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Response, ApiError> {
    let worker = state
        .store
        .get_worker(id)
        .await
        .map_err(HubError::Internal)?
        .ok_or(HubError::worker_not_found(id))?;
    if worker.kind == WorkerKind::Local {
        return Err(HubError::Forbidden("the local worker cannot be deleted".into()).into());
    }

    let active = state
        .store
        .count_active_sessions_on_worker(id)
        .await
        .map_err(HubError::Internal)?;
    if active > 0 {
        return Err(HubError::Conflict(format!(
            "worker has {active} active session(s); kill them first"
        ))
        .into());
    }

    state.tunnel.disconnect(id).await;
    state
        .store
        .delete_worker(id)
        .await
        .map_err(HubError::Internal)?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

pub async fn test_worker(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Response, ApiError> {
    let worker = state
        .store
        .get_worker(id)
        .await
        .map_err(HubError::Internal)?
        .ok_or(HubError::worker_not_found(id))?;
    if worker.kind == WorkerKind::Local {
        return Ok(Json(json!({ "status": "connected" })).into_response());
    }

    match state.tunnel.connect(&worker).await {
        Ok(()) => {
            state.dispatch_notify.notify_one();
            Ok(Json(json!({ "status": "connected" })).into_response())
        }
        Err(err) => Ok(Json(json!({
            "status": "error",
            "error": err.to_string(),
        }))
        .into_response()),
    }
}

// ===== sessions =====

pub async fn list_sessions(
    State(state): State<AppState>,
    Query(query): Query<SessionListQuery>,
) -> Result<Response, ApiError> {
    let sessions = match query.status {
        Some(status) => state
            .store
            .list_sessions_by_status(status)
            .await
            .map_err(HubError::Internal)?,
        None => state.store.list_sessions().await.map_err(HubError::Internal)?,
    };
    Ok(Json(json!({ "sessions": sessions })).into_response())
}

pub async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Response, ApiError> {
    let session = state
        .store
        .get_session(id)
        .await
        .map_err(HubError::Internal)?
        .ok_or(HubError::session_not_found(id))?;
    Ok(Json(json!({ "session": session })).into_response())
}

pub async fn create_session(
    State(state): State<AppState>,
    Json(request): Json<CreateSessionRequest>,
) -> Result<Response, ApiError> {
    super::middleware::validate::path(&request.working_directory.to_string_lossy())?;

    let session = state
        .sessions
        .create(CreateSessionParams {
            working_directory: request.working_directory,
            title: request.title.unwrap_or_default(),
            target_worker: request.target_worker,
            start_fresh: request.start_fresh.unwrap_or(false),
            worktree: request.worktree.unwrap_or(false),
        })
        .await?;

    Ok((StatusCode::CREATED, Json(json!({ "session": session }))).into_response())
}

pub async fn patch_session(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(patch): Json<SessionPatch>,
) -> Result<Response, ApiError> {
    let _ = state
        .store
        .get_session(id)
        .await
        .map_err(HubError::Internal)?
        .ok_or(HubError::session_not_found(id))?;

    state
        .store
        .update_session(id, &patch)
        .await
        .map_err(HubError::Internal)?;
    if patch.locked.is_some() {
        // Unlocking can make the session suspendable again and a
        // suspension frees a slot.
        state.dispatch_notify.notify_one();
    }

    let session = state
        .store
        .get_session(id)
        .await
        .map_err(HubError::Internal)?
        .ok_or(HubError::session_not_found(id))?;
    Ok(Json(json!({ "session": session })).into_response())
}

pub async fn delete_session(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Response, ApiError> {
    state.sessions.delete_session(id).await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

pub async fn continue_session(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Response, ApiError> {
    state.sessions.continue_session(id).await?;
    let session = state
        .store
        .get_session(id)
        .await
        .map_err(HubError::Internal)?
        .ok_or(HubError::session_not_found(id))?;
    Ok(Json(json!({ "session": session })).into_response())
}

pub async fn kill_session(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Response, ApiError> {
    state.sessions.kill_session(id).await?;
    Ok(Json(json!({ "ok": true })).into_response())
}

pub async fn session_input(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<SessionInputRequest>,
) -> Result<Response, ApiError> {
    let session = state
        .store
        .get_session(id)
        .await
        .map_err(HubError::Internal)?
        .ok_or(HubError::session_not_found(id))?;
    if session.status != SessionStatus::Active {
        return Err(HubError::Conflict(format!(
            "session is {status}, input requires an active session",
            status = session.status.as_str()
        ))
        .into());
    }

    state.sessions.clear_needs_input(id).await;
    state
        .mux
        .write(id, request.data.into_bytes())
        .await
        .map_err(HubError::Internal)?;
    Ok(Json(json!({ "ok": true })).into_response())
}

// ===== URL preview proxy =====

pub async fn proxy_url(
    State(state): State<AppState>,
    Path((id, encoded_url)): Path<(Uuid, String)>,
) -> Result<Response, ApiError> {
    let _ = state
        .store
        .get_session(id)
        .await
        .map_err(HubError::Internal)?
        .ok_or(HubError::session_not_found(id))?;

    let raw_url = percent_decode(&encoded_url)
        .ok_or_else(|| HubError::BadInput("malformed url encoding".to_owned()))?;
    let url = ssrf::check_url(&raw_url).await?;

    let response = state
        .http_client
        .get(url)
        .send()
        .await
        .map_err(|e| HubError::BadInput(format!("upstream fetch failed: {e}")))?;

    let status = StatusCode::from_u16(response.status().as_u16())
        .unwrap_or(StatusCode::BAD_GATEWAY);
    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/octet-stream")
        .to_owned();
    let body = response
        .bytes()
        .await
        .map_err(|e| HubError::BadInput(format!("upstream body failed: {e}")))?;

    Ok((
        status,
        [(axum::http::header::CONTENT_TYPE, content_type)],
        body.to_vec(),
    )
        .into_response())
}

/// Minimal percent-decoding for the encoded-URL path segment.
fn percent_decode(raw: &str) -> Option<String> {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' => {
                let hi = bytes.get(i + 1)?;
                let lo = bytes.get(i + 2)?;
                let value = u8::from_str_radix(
                    std::str::from_utf8(&[*hi, *lo]).ok()?,
                    16,
                )
                .ok()?;
                out.push(value);
                i += 3;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8(out).ok()
}

// ===== directories =====

pub async fn list_directories(
    State(state): State<AppState>,
    Query(query): Query<DirectoryQuery>,
) -> Result<Response, ApiError> {
    let base = query.path.clone().unwrap_or_else(|| {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("/"))
            .to_string_lossy()
            .to_string()
    });
    super::middleware::validate::path(&base)?;
    let filter = query.query.unwrap_or_default().to_lowercase();

    let worker = match query.worker_id {
        Some(id) => state
            .store
            .get_worker(id)
            .await
            .map_err(HubError::Internal)?
            .ok_or(HubError::worker_not_found(id))?,
        None => state
            .store
            .get_local_worker()
            .await
            .map_err(HubError::Internal)?,
    };

    let entries = match worker.kind {
        WorkerKind::Local => list_local_directories(&base, &filter)?,
        WorkerKind::Remote => {
            let quoted = shell_words::quote(&base).into_owned();
            let output = state
                .tunnel
                .exec(worker.id, &format!("ls -1pa {quoted} | grep /$"))
                .await?;
            output
                .lines()
                .map(str::trim)
                .filter(|name| !name.is_empty() && *name != "./" && *name != "../")
                .map(|name| name.trim_end_matches('/'))
                .filter(|name| filter.is_empty() || name.to_lowercase().contains(&filter))
                .map(|name| DirectoryEntry {
                    name: name.to_owned(),
                    path: format!("{}/{name}", base.trim_end_matches('/')),
                })
                .collect()
        }
    };

    Ok(Json(json!({ "path": base, "directories": entries })).into_response())
}

fn list_local_directories(base: &str, filter: &str) -> Result<Vec<DirectoryEntry>, ApiError> {
    let read_dir = std::fs::read_dir(base)
        .map_err(|e| HubError::BadInput(format!("cannot read '{base}': {e}")))?;

    let mut entries: Vec<DirectoryEntry> = read_dir
        .flatten()
        .filter(|entry| entry.path().is_dir())
        .filter_map(|entry| {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') {
                return None;
            }
            if !filter.is_empty() && !name.to_lowercase().contains(filter) {
                return None;
            }
            Some(DirectoryEntry {
                path: entry.path().to_string_lossy().to_string(),
                name,
            })
        })
        .collect();
    entries.sort_by(|a, b| a.name.to_lowercase().cmp(&b.name.to_lowercase()));
    Ok(entries)
}

// ===== projects =====

pub async fn list_projects(State(state): State<AppState>) -> Result<Response, ApiError> {
    let projects = state.store.list_projects().await.map_err(HubError::Internal)?;
    Ok(Json(json!({ "projects": projects })).into_response())
}

pub async fn get_project(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Response, ApiError> {
    let project = state
        .store
        .get_project(id)
        .await
        .map_err(HubError::Internal)?
        .ok_or(HubError::NotFound { kind: "project", id })?;
    Ok(Json(json!({ "project": project })).into_response())
}

pub async fn patch_project(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(patch): Json<ProjectPatchRequest>,
) -> Result<Response, ApiError> {
    let _ = state
        .store
        .get_project(id)
        .await
        .map_err(HubError::Internal)?
        .ok_or(HubError::NotFound { kind: "project", id })?;

    state
        .store
        .update_project(
            id,
            patch.display_name.as_deref(),
            patch.bookmarked,
            patch.position,
        )
        .await
        .map_err(HubError::Internal)?;

    let project = state
        .store
        .get_project(id)
        .await
        .map_err(HubError::Internal)?
        .ok_or(HubError::NotFound { kind: "project", id })?;
    Ok(Json(json!({ "project": project })).into_response())
}

pub async fn delete_project(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Response, ApiError> {
    let _ = state
        .store
        .get_project(id)
        .await
        .map_err(HubError::Internal)?
        .ok_or(HubError::NotFound { kind: "project", id })?;
    state
        .store
        .delete_project(id)
        .await
        .map_err(HubError::Internal)?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

// ===== hooks =====

/// `POST /api/hooks/event` — called by the injected SessionEnd/Stop hook
/// from inside agent subprocesses.
pub async fn hook_event(
    State(state): State<AppState>,
    Json(request): Json<HookEventRequest>,
) -> Result<Response, ApiError> {
    state
        .sessions
        .record_hook_event(request.session_id, &request.claude_session_id)
        .await?;
    Ok(Json(json!({ "ok": true })).into_response())
}
