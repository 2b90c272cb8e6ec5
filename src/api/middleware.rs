//! HTTP middleware: correlation ids and security headers.

use axum::{extract::Request, http::HeaderValue, middleware::Next, response::Response};
use uuid::Uuid;

/// Header name for correlation ID
pub const CORRELATION_ID_HEADER: &str = "X-Correlation-ID";

/// Middleware that adds a correlation ID to each request.
///
/// If the client sends an X-Correlation-ID header, use it.
/// Otherwise, generate a new correlation ID.
///
/// The correlation ID is:
/// 1. Added to the tracing span for the request
/// 2. Added to the response headers
/// 3. Available for logging throughout the request lifecycle
pub async fn correlation_id_middleware(mut request: Request, next: Next) -> Response {
    let correlation_id = request
        .headers()
        .get(CORRELATION_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| Uuid::parse_str(s).ok())
        .unwrap_or_else(Uuid::new_v4);

    request.extensions_mut().insert(correlation_id);

    let span = tracing::info_span!(
        "http_request",
        correlation_id = %correlation_id,
        method = %request.method(),
        uri = %request.uri()
    );

    let response = {
        let _enter = span.enter();
        next.run(request).await
    };

    let (mut parts, body) = response.into_parts();
    if let Ok(header_value) = HeaderValue::from_str(&correlation_id.to_string()) {
        parts.headers.insert(CORRELATION_ID_HEADER, header_value);
    }

    Response::from_parts(parts, body)
}

/// Middleware stamping conservative security headers on every response.
pub async fn security_headers_middleware(request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert(
        "X-Content-Type-Options",
        HeaderValue::from_static("nosniff"),
    );
    headers.insert("X-Frame-Options", HeaderValue::from_static("DENY"));
    headers.insert(
        "Content-Security-Policy",
        HeaderValue::from_static(
            "default-src 'self'; script-src 'self'; style-src 'self' 'unsafe-inline'; \
             img-src 'self' data:; connect-src 'self' ws: wss:",
        ),
    );
    response
}

/// Validation helpers shared by the handlers.
pub mod validate {
    use crate::core::HubError;
    use uuid::Uuid;

    /// Parse a path parameter as a UUID.
    ///
    /// # Errors
    ///
    /// [`HubError::BadInput`] when the string is not a UUID.
    pub fn uuid(raw: &str) -> Result<Uuid, HubError> {
        Uuid::parse_str(raw).map_err(|_| HubError::BadInput(format!("invalid id '{raw}'")))
    }

    /// Reject paths with traversal components or NUL bytes.
    ///
    /// # Errors
    ///
    /// [`HubError::BadInput`] for `..`, NUL, or empty paths.
    pub fn path(raw: &str) -> Result<(), HubError> {
        if raw.is_empty() {
            return Err(HubError::BadInput("empty path".to_owned()));
        }
        if raw.contains('\0') {
            return Err(HubError::BadInput("path contains NUL".to_owned()));
        }
        let has_traversal = std::path::Path::new(raw)
            .components()
            .any(|c| matches!(c, std::path::Component::ParentDir));
        if has_traversal {
            return Err(HubError::BadInput("path contains '..'".to_owned()));
        }
        Ok(())
    }
}
