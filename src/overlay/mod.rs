//! Overlay module - Tree topology and the protocols that maintain it
//!
//! Provides:
//! - The routing table (next hop per known peer, mother pointer, sessions)
//! - Join, leave/reparent and work transition functions
//! - `Node`, the single owner of all of the above

pub mod join;
pub mod leave;
mod node;
mod routes;
mod session;
pub mod work;

pub use node::*;
pub use routes::*;
pub use session::*;

use thiserror::Error;

/// Overlay errors
#[derive(Error, Debug)]
pub enum OverlayError {
    /// The peer broke the protocol in a way this node cannot recover from.
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Session {0} is closed")]
    SessionClosed(SessionId),

    #[error("No session towards {0}")]
    Unreachable(crate::protocol::Id),

    #[error("Root node cannot leave the overlay")]
    RootCannotLeave,

    #[error("A disconnection is already in progress")]
    AlreadyLeaving,
}

impl OverlayError {
    /// Whether the local process must stop.
    pub fn is_fatal(&self) -> bool {
        matches!(self, OverlayError::ProtocolViolation(_))
    }
}

pub type OverlayResult<T> = Result<T, OverlayError>;

/// Furthest protocol phase reached on a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolState {
    Connecting,
    Connected,
    /// Join refused by the would-be mother
    Refused,
    Disconnecting,
    DisconnectionDenied,
    Reconnecting,
    Closed,
    RequestAccepted,
    RequestDenied,
    WorkSubmitted,
    Computing,
    ReceivedWorkResponse,
}

impl ProtocolState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProtocolState::Refused | ProtocolState::Closed | ProtocolState::DisconnectionDenied
        )
    }
}
