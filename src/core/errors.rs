//! Error taxonomy shared by the HTTP boundary and the subsystems.

use thiserror::Error;
use uuid::Uuid;

/// Errors surfaced by hub operations.
///
/// Low-level subsystems return these (or wrap their own causes into them);
/// the HTTP layer translates each variant into a status code exactly once.
#[derive(Debug, Error)]
pub enum HubError {
    /// Malformed or unacceptable caller input.
    #[error("{0}")]
    BadInput(String),

    /// Missing or invalid credentials.
    #[error("unauthorized")]
    Unauthorized,

    /// The caller is authenticated but the operation is not allowed,
    /// e.g. a local working directory outside `$HOME`.
    #[error("{0}")]
    Forbidden(String),

    /// The referenced entity does not exist.
    #[error("{kind} {id} not found")]
    NotFound {
        /// Entity kind, e.g. "session" or "worker".
        kind: &'static str,
        id: Uuid,
    },

    /// Too many failed activation attempts from one address.
    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    /// The SSH transport to a worker is down; the tunnel is backing off.
    #[error("connection to worker {worker_id} lost")]
    ConnectionLost { worker_id: Uuid },

    /// The operation conflicts with current state, e.g. deleting a worker
    /// that still has active sessions.
    #[error("{0}")]
    Conflict(String),

    /// A per-call deadline expired.
    #[error("{operation} timed out after {timeout_ms}ms")]
    Timeout {
        operation: &'static str,
        timeout_ms: u64,
    },

    /// Anything else; full detail goes to the logs, clients get a generic
    /// message.
    #[error("internal error")]
    Internal(#[from] anyhow::Error),
}

impl HubError {
    /// Shorthand for a missing session.
    #[must_use]
    pub fn session_not_found(id: Uuid) -> Self {
        Self::NotFound {
            kind: "session",
            id,
        }
    }

    /// Shorthand for a missing worker.
    #[must_use]
    pub fn worker_not_found(id: Uuid) -> Self {
        Self::NotFound { kind: "worker", id }
    }
}

impl From<sqlx::Error> for HubError {
    fn from(err: sqlx::Error) -> Self {
        Self::Internal(err.into())
    }
}
