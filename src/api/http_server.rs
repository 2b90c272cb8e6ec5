//! Router assembly and the HTTP error boundary.

use axum::{
    Json, Router,
    http::StatusCode,
    middleware::{self, from_fn_with_state},
    response::{IntoResponse, Response},
    routing::{delete, get, patch, post},
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;

use super::middleware::{correlation_id_middleware, security_headers_middleware};
use crate::auth::{AuthState, auth_middleware, auth_router, hooks_guard_middleware};
use crate::core::HubError;
use crate::pty::PtyMultiplexer;
use crate::sessions::SessionManager;
use crate::store::SqliteStore;
use crate::tunnel::TunnelManager;

/// Shared state for HTTP and WebSocket handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<SqliteStore>,
    pub sessions: Arc<SessionManager>,
    pub mux: Arc<PtyMultiplexer>,
    pub tunnel: Arc<TunnelManager>,
    pub auth: AuthState,
    pub dispatch_notify: Arc<Notify>,
    pub http_client: reqwest::Client,
}

impl AppState {
    /// Build the outbound HTTP client used by the URL preview proxy.
    #[must_use]
    pub fn proxy_client() -> reqwest::Client {
        reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .unwrap_or_default()
    }
}

/// Assemble the full router.
///
/// Pipeline order: security headers and the correlation logger wrap
/// everything; `/api/auth/*` is always public; `/api/hooks/*` is
/// loopback-guarded while auth is required; every other `/api/*` route
/// sits behind the auth middleware; unmatched paths fall through to the
/// static frontend.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let hooks_routes = Router::new()
        .route("/api/hooks/event", post(super::handlers::hook_event))
        .route_layer(from_fn_with_state(
            state.auth.clone(),
            hooks_guard_middleware,
        ))
        .with_state(state.clone());

    let protected_routes = Router::new()
        .route("/api/settings", get(super::handlers::get_settings))
        .route("/api/settings", patch(super::handlers::patch_settings))
        .route("/api/workers", get(super::handlers::list_workers))
        .route("/api/workers", post(super::handlers::create_worker))
        .route("/api/workers/{id}", axum::routing::put(super::handlers::update_worker))
        .route("/api/workers/{id}", delete(super::handlers::delete_worker))
        .route("/api/workers/{id}/test", post(super::handlers::test_worker))
        .route("/api/sessions", get(super::handlers::list_sessions))
        .route("/api/sessions", post(super::handlers::create_session))
        .route("/api/sessions/{id}", get(super::handlers::get_session))
        .route("/api/sessions/{id}", patch(super::handlers::patch_session))
        .route("/api/sessions/{id}", delete(super::handlers::delete_session))
        .route(
            "/api/sessions/{id}/continue",
            post(super::handlers::continue_session),
        )
        .route("/api/sessions/{id}/kill", post(super::handlers::kill_session))
        .route("/api/sessions/{id}/input", post(super::handlers::session_input))
        .route(
            "/api/sessions/{id}/proxy-url/{encoded_url}",
            get(super::handlers::proxy_url),
        )
        .route("/api/directories", get(super::handlers::list_directories))
        .route("/api/projects", get(super::handlers::list_projects))
        .route("/api/projects/{id}", get(super::handlers::get_project))
        .route("/api/projects/{id}", patch(super::handlers::patch_project))
        .route("/api/projects/{id}", delete(super::handlers::delete_project))
        .route_layer(from_fn_with_state(state.auth.clone(), auth_middleware))
        .with_state(state.clone());

    // WebSocket upgrades authenticate inside the handler (middleware does
    // not run on upgrade requests).
    let ws_routes = Router::new()
        .route("/ws/sessions/{id}", get(super::ws::ws_session_handler))
        .with_state(state.clone());

    Router::new()
        .merge(auth_router(state.auth.clone()))
        .merge(hooks_routes)
        .merge(protected_routes)
        .merge(ws_routes)
        .fallback_service(ServeDir::new("web/dist"))
        .layer(middleware::from_fn(correlation_id_middleware))
        .layer(middleware::from_fn(security_headers_middleware))
        .layer(cors)
}

/// Boundary error: wraps [`HubError`] and translates it into a status
/// code exactly once, keeping full detail in the logs only.
#[derive(Debug)]
pub struct ApiError(pub HubError);

impl From<HubError> for ApiError {
    fn from(err: HubError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self.0 {
            HubError::BadInput(message) => {
                (StatusCode::BAD_REQUEST, json!({ "error": message }))
            }
            HubError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                json!({ "error": "unauthorized" }),
            ),
            HubError::Forbidden(message) => (StatusCode::FORBIDDEN, json!({ "error": message })),
            HubError::NotFound { kind, id } => (
                StatusCode::NOT_FOUND,
                json!({ "error": format!("{kind} {id} not found") }),
            ),
            HubError::RateLimited { retry_after_secs } => (
                StatusCode::TOO_MANY_REQUESTS,
                json!({ "error": "rate limited", "retryAfter": retry_after_secs }),
            ),
            HubError::ConnectionLost { worker_id } => (
                StatusCode::SERVICE_UNAVAILABLE,
                json!({ "error": format!("connection to worker {worker_id} lost") }),
            ),
            HubError::Conflict(message) => (StatusCode::CONFLICT, json!({ "error": message })),
            HubError::Timeout { operation, .. } => (
                StatusCode::GATEWAY_TIMEOUT,
                json!({ "error": format!("{operation} timed out") }),
            ),
            HubError::Internal(err) => {
                tracing::error!(error = %err, "Internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({ "error": "internal error" }),
                )
            }
        };
        (status, Json(body)).into_response()
    }
}
