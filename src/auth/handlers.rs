//! HTTP handlers for the auth surface (`/api/auth/*`).

use axum::{
    Json, Router,
    extract::{ConnectInfo, State},
    http::{StatusCode, header::SET_COOKIE},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use axum_extra::extract::cookie::CookieJar;
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;

use super::jwt::COOKIE_MAX_AGE_SECS;
use super::license::{self, LicenseError};
use super::AuthState;
use crate::config::SESSION_COOKIE;

/// Build the always-public auth router.
pub fn auth_router(state: AuthState) -> Router {
    Router::new()
        .route("/api/auth/activate", post(activate))
        .route("/api/auth/status", get(auth_status))
        .route("/api/auth/logout", post(logout))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ActivateRequest {
    license_key: String,
}

/// `POST /api/auth/activate` — validate a license key offline, persist the
/// activation, and hand back the session cookie.
async fn activate(
    State(state): State<AuthState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Json(request): Json<ActivateRequest>,
) -> Response {
    if let Err(retry_after) = state.limiter.check(peer.ip()) {
        return (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({ "error": "too many activation attempts", "retryAfter": retry_after })),
        )
            .into_response();
    }

    let payload = match license::validate(&request.license_key) {
        Ok(payload) => payload,
        Err(err) => {
            state.limiter.record_failure(peer.ip());
            tracing::warn!(peer = %peer.ip(), error = %err, "License activation rejected");
            let code = match err {
                LicenseError::BadFormat => "BadFormat",
                LicenseError::BadSignature => "BadSignature",
                LicenseError::Expired(_) => "Expired",
            };
            return (
                StatusCode::UNAUTHORIZED,
                Json(json!({ "error": code })),
            )
                .into_response();
        }
    };

    if let Err(e) = state
        .store
        .store_activation(
            &license::key_hash(&request.license_key),
            &payload.email,
            &payload.plan,
            payload.max_sessions,
            payload.expires_at,
            payload.issued_at,
        )
        .await
    {
        tracing::error!(error = %e, "Failed to persist activation");
        return internal_error();
    }

    let token = match state.keys.mint(&payload) {
        Ok(token) => token,
        Err(e) => {
            tracing::error!(error = %e, "Failed to mint session token");
            return internal_error();
        }
    };

    tracing::info!(email = %payload.email, plan = %payload.plan, "License activated");

    let body = Json(json!({
        "email": payload.email,
        "plan": payload.plan,
        "maxSessions": payload.max_sessions,
        "expiresAt": payload.expires_at.to_rfc3339(),
    }));
    (
        StatusCode::OK,
        [(SET_COOKIE, session_cookie(&token, COOKIE_MAX_AGE_SECS, state.tls_active))],
        body,
    )
        .into_response()
}

/// `GET /api/auth/status` — never 401; reports whether auth is required and
/// whether this client currently holds a valid cookie.
async fn auth_status(State(state): State<AuthState>, jar: CookieJar) -> Response {
    let claims = jar
        .get(SESSION_COOKIE)
        .and_then(|cookie| state.keys.verify(cookie.value()).ok());

    let authenticated = !state.auth_required || claims.is_some();
    let mut body = json!({
        "authRequired": state.auth_required,
        "authenticated": authenticated,
    });
    if let Some(claims) = claims {
        body["email"] = json!(claims.email);
        body["plan"] = json!(claims.plan);
        body["licenseExpiresAt"] = json!(claims.license_expires_at);
    }
    Json(body).into_response()
}

/// `POST /api/auth/logout` — expire the cookie.
async fn logout(State(state): State<AuthState>) -> Response {
    (
        StatusCode::OK,
        [(SET_COOKIE, session_cookie("", 0, state.tls_active))],
        Json(json!({ "ok": true })),
    )
        .into_response()
}

fn session_cookie(token: &str, max_age: i64, secure: bool) -> String {
    let mut cookie =
        format!("{SESSION_COOKIE}={token}; Path=/; HttpOnly; SameSite=Strict; Max-Age={max_age}");
    if secure {
        cookie.push_str("; Secure");
    }
    cookie
}

fn internal_error() -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": "internal error" })),
    )
        .into_response()
}
