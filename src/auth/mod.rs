//! License validation, JWT cookies and the request auth middleware.

pub mod handlers;
pub mod jwt;
pub mod license;
pub mod middleware;
pub mod rate_limit;

use std::sync::Arc;

use crate::store::SqliteStore;

pub use handlers::auth_router;
pub use jwt::{Claims, JwtKeys};
pub use license::{LicenseError, LicensePayload};
pub use middleware::{auth_middleware, claims_from_cookie_header, hooks_guard_middleware};
pub use rate_limit::ActivationRateLimiter;

/// Shared state for the auth surface.
///
/// `auth_required` is derived from the bind address once at startup and is
/// constant for the process lifetime; the JWT secret comes from the store's
/// auth-config singleton.
#[derive(Clone)]
pub struct AuthState {
    pub store: Arc<SqliteStore>,
    pub keys: JwtKeys,
    pub limiter: Arc<ActivationRateLimiter>,
    pub auth_required: bool,
    /// Mark cookies `Secure` when the hub serves TLS.
    pub tls_active: bool,
}
