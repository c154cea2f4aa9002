//! Signaling channel for exchanging session descriptions and candidates
//!
//! Provides the channel contract, a WebSocket client and an in-process relay.

mod channel;
mod error;
mod memory;
mod message;
mod websocket;

pub use channel::{SessionDirectory, SignalingChannel, SubscriberSet, Subscription};
pub use error::SignalingError;
pub use memory::MemorySignaling;
pub use message::{
    ConversationId, CreateSessionRequest, CreatedSession, InboundSignal, OutboundSignal,
    SessionId, SessionType,
};
pub use websocket::{
    ClientFrame, ServerFrame, SignalingClient, WsSignalingChannel, DEFAULT_REQUEST_TIMEOUT,
};
