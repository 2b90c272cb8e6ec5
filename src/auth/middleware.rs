//! Request auth middleware and upgrade-time cookie parsing.

use axum::{
    body::Body,
    extract::{ConnectInfo, Request, State},
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::Response,
};
use axum_extra::extract::cookie::CookieJar;
use std::net::SocketAddr;

use super::{AuthState, Claims, JwtKeys};
use crate::config::SESSION_COOKIE;

/// Middleware guarding the protected API routes.
///
/// Validates the `agentide_session` cookie and inserts the verified claims
/// into request extensions. A no-op while `auth_required` is off.
///
/// # Errors
///
/// Returns 401 when the cookie is missing, invalid, expired, or carries an
/// expired license.
pub async fn auth_middleware(
    State(state): State<AuthState>,
    jar: CookieJar,
    mut request: Request<Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    if !state.auth_required {
        return Ok(next.run(request).await);
    }

    let cookie = jar.get(SESSION_COOKIE).ok_or(StatusCode::UNAUTHORIZED)?;
    let claims = state.keys.verify(cookie.value()).map_err(|e| {
        tracing::debug!(error = %e, "Rejected session cookie");
        StatusCode::UNAUTHORIZED
    })?;

    request.extensions_mut().insert(claims);
    Ok(next.run(request).await)
}

/// Middleware restricting `/api/hooks/*` to loopback peers while auth is
/// required. Hook callbacks come from subprocesses on the hub machine; a
/// remote caller has no business on this surface.
///
/// # Errors
///
/// Returns 403 for non-loopback peers when `auth_required` is on.
pub async fn hooks_guard_middleware(
    State(state): State<AuthState>,
    request: Request<Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    if state.auth_required {
        let peer = request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|info| info.0.ip());
        match peer {
            Some(ip) if ip.is_loopback() => {}
            _ => return Err(StatusCode::FORBIDDEN),
        }
    }
    Ok(next.run(request).await)
}

/// Parse and verify the session cookie straight out of raw request headers.
///
/// WebSocket upgrades bypass the middleware stack, so the upgrade handler
/// calls this against the upgrade request's headers itself.
#[must_use]
pub fn claims_from_cookie_header(headers: &HeaderMap, keys: &JwtKeys) -> Option<Claims> {
    let raw = headers.get(axum::http::header::COOKIE)?.to_str().ok()?;
    let token = raw.split(';').find_map(|pair| {
        let (name, value) = pair.trim().split_once('=')?;
        (name == SESSION_COOKIE).then(|| value.to_owned())
    })?;
    keys.verify(&token).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::license::LicensePayload;
    use axum::http::HeaderValue;
    use chrono::{Duration, Utc};

    fn keys() -> JwtKeys {
        JwtKeys::from_hex_secret(&hex::encode([3u8; 32])).expect("keys")
    }

    fn token(keys: &JwtKeys) -> String {
        let now = Utc::now();
        keys.mint(&LicensePayload {
            email: "dev@example.com".to_owned(),
            plan: "pro".to_owned(),
            max_sessions: 4,
            expires_at: now + Duration::days(30),
            issued_at: now,
        })
        .expect("mint")
    }

    #[test]
    fn parses_cookie_among_others() {
        let keys = keys();
        let token = token(&keys);
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::COOKIE,
            HeaderValue::from_str(&format!("theme=dark; agentide_session={token}; lang=en"))
                .expect("header"),
        );

        let claims = claims_from_cookie_header(&headers, &keys).expect("claims");
        assert_eq!(claims.email, "dev@example.com");
    }

    #[test]
    fn missing_or_garbage_cookie_yields_none() {
        let keys = keys();
        let headers = HeaderMap::new();
        assert!(claims_from_cookie_header(&headers, &keys).is_none());

        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::COOKIE,
            HeaderValue::from_static("agentide_session=not-a-jwt"),
        );
        assert!(claims_from_cookie_header(&headers, &keys).is_none());
    }
}
