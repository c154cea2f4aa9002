//! Lifecycle notifications published by the orchestrator

use crate::signaling::SessionId;
use crate::transport::{PeerConnectionState, RemoteTrack};

use super::state::{Role, SessionState};

/// Event delivered to orchestrator subscribers
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// The session moved to a new lifecycle state
    StateChanged { state: SessionState, role: Role },
    /// The authoritative session id became known
    SessionIdAssigned { session_id: SessionId },
    /// A shareable conference link became known
    ConferenceLink { link: String },
    /// Remote media arrived
    RemoteTrack(RemoteTrack),
    /// Transport connectivity changed without a lifecycle transition
    ConnectionState(PeerConnectionState),
    /// Remote party joined or left the conversation
    RemotePresence {
        waiting: bool,
        participants: Option<u32>,
    },
    /// The signaling server reported an error
    RemoteError { message: String },
    /// A message sent from the event loop could not be delivered
    DeliveryFailed { signal: &'static str, error: String },
    /// The session failed; resources were already released
    Failed { reason: String },
}
