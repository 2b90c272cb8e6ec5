//! HTTP API, middleware and the per-session WebSocket bridge.

pub mod handlers;
pub mod http_server;
pub mod middleware;
pub mod protocol;
pub mod ssrf;
pub mod ws;

pub use http_server::{ApiError, AppState, build_router};
