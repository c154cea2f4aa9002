//! callsession - Peer call-session orchestration
//!
//! This library negotiates and tears down a live audio/video transport
//! between two parties over an asynchronous signaling channel.

pub mod config;
pub mod session;
pub mod signaling;
pub mod transport;

pub use config::CallConfig;
pub use session::{
    Collaborators, Role, SessionError, SessionEvent, SessionOrchestrator, SessionState,
};
pub use signaling::{ConversationId, SessionId, SignalingChannel};
pub use transport::{MediaSource, PeerTransport, TransportFactory};
