//! Session roles and lifecycle states

use std::fmt;

use serde::Serialize;

/// Which side of the negotiation a session plays, fixed at creation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Creates the offer
    Initiator,
    /// Answers a remote offer
    Responder,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Initiator => write!(f, "initiator"),
            Self::Responder => write!(f, "responder"),
        }
    }
}

/// Lifecycle state of a call session
///
/// `Idle → Negotiating → Connected → Ended`, and any non-terminal state
/// may move to `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Created, acquiring media and preparing the transport
    #[default]
    Idle,
    /// Local description published, waiting for connectivity
    Negotiating,
    /// Transport reports connected
    Connected,
    /// Torn down on request
    Ended,
    /// Torn down after an unrecoverable error
    Failed,
}

impl SessionState {
    /// Check if no further transitions are possible
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Ended | Self::Failed)
    }

    /// Check if the session still holds resources
    pub fn is_live(&self) -> bool {
        !self.is_terminal()
    }

    /// Check if moving to `next` is a legal transition
    pub fn can_transition_to(&self, next: SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (Idle, Negotiating) | (Negotiating, Connected) => true,
            (Idle | Negotiating | Connected, Ended | Failed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Negotiating => "negotiating",
            Self::Connected => "connected",
            Self::Ended => "ended",
            Self::Failed => "failed",
        };
        write!(f, "{}", name)
    }
}
