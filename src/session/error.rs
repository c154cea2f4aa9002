//! Session error types

use thiserror::Error;

use crate::signaling::{SessionId, SignalingError};
use crate::transport::{MediaError, TransportError};

use super::state::SessionState;

/// Errors that can occur while driving a call session
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Media acquisition failed: {0}")]
    MediaAcquisition(#[from] MediaError),

    #[error("Signaling delivery failed: {0}")]
    SignalingDelivery(#[from] SignalingError),

    #[error("Negotiation error: {0}")]
    Negotiation(String),

    #[error("Stale event for session {received} (current: {current:?})")]
    StaleEvent {
        received: SessionId,
        current: Option<SessionId>,
    },

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("A session is already active ({0})")]
    SessionActive(SessionState),
}
