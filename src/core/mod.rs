//! Core domain types shared across the hub.

pub mod errors;
pub mod events;
pub mod types;

pub use errors::HubError;
pub use events::{BoardCommand, ControlEvent, ExitKind, LifecycleEvent, ProcessEvent};
pub use types::{
    AuthConfig, Comment, CommentSide, CommentStatus, Project, Session, SessionPatch,
    SessionStatus, Settings, SettingsPatch, Worker, WorkerKind, WorkerPatch, WorkerStatus,
};
