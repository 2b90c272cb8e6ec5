//! Event types flowing between the PTY multiplexer, the scheduler and the
//! WebSocket bridge.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// How a managed process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    /// Process exited on its own with the given code (`None` when the OS
    /// reported no code, e.g. terminated by signal).
    Exited(Option<i32>),
    /// The hub killed it (explicit kill or cooperative suspension).
    Killed,
    /// The transport under a remote session dropped.
    TransportLost,
}

impl ExitKind {
    /// Whether this counts as a clean end for status bookkeeping.
    #[must_use]
    pub fn is_clean(self) -> bool {
        match self {
            Self::Exited(code) => code.unwrap_or(0) == 0,
            Self::Killed => true,
            Self::TransportLost => false,
        }
    }
}

/// An in-band OSC sequence the agent emits to drive hub UI actions.
///
/// The raw payload stays in the byte stream for the terminal emulator; this
/// is the parsed copy delivered out-of-band.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoardCommand {
    /// Verb, e.g. "open" or "focus".
    pub action: String,
    /// Verb-specific argument, passed through verbatim.
    pub argument: String,
}

/// Raw events produced by a [`ManagedProcess`](crate::pty::ManagedProcess)
/// implementation, before the multiplexer wrapper adds scrollback, idle
/// tracking and board-command parsing.
#[derive(Debug, Clone)]
pub enum ProcessEvent {
    /// Output bytes from the PTY or remote channel.
    Data(Vec<u8>),
    /// The process or channel ended.
    Exit(ExitKind),
    /// The SSH transport dropped while the session was running.
    ConnectionLost,
}

/// Control events fanned out to WebSocket clients alongside the byte
/// stream. These are never dropped under backpressure.
#[derive(Debug, Clone)]
pub enum ControlEvent {
    NeedsInput,
    SessionIdle,
    BoardCommand(BoardCommand),
    ConnectionLost,
    ConnectionRestored,
    PortDetected {
        port: u16,
        /// Hub-local forwarded port for remote sessions.
        forwarded_to: Option<u16>,
    },
    PortClosed { port: u16 },
    /// One-time warning that binary frames were dropped for this client.
    DroppedOutput { frames: u64 },
}

/// Events the multiplexer reports to the scheduler's lifecycle loop.
#[derive(Debug, Clone)]
pub enum LifecycleEvent {
    /// A managed process ended.
    SessionExited { session_id: Uuid, kind: ExitKind },
    /// A session crossed the idle threshold with no fresh output.
    SessionIdle { session_id: Uuid },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_exit_is_clean() {
        assert!(ExitKind::Exited(Some(0)).is_clean(), "exit 0 is clean");
        assert!(ExitKind::Exited(None).is_clean(), "no code counts as clean");
        assert!(!ExitKind::Exited(Some(1)).is_clean(), "exit 1 is not clean");
    }

    #[test]
    fn kill_is_clean_transport_loss_is_not() {
        assert!(ExitKind::Killed.is_clean(), "hub-initiated kill is clean");
        assert!(
            !ExitKind::TransportLost.is_clean(),
            "transport loss marks the session failed"
        );
    }
}
