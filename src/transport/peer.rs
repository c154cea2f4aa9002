//! Peer transport contract

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::error::TransportError;
use super::types::{
    IceCandidate, MediaTrack, SessionDescription, TransportConfig, TransportEvent,
};

/// A peer-to-peer media transport bound to one call session
///
/// Local candidates, remote tracks and connection-state changes are not
/// returned from these methods; the transport emits them through the
/// [`TransportEventSender`] it was created with.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError>;

    async fn create_answer(&self) -> Result<SessionDescription, TransportError>;

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError>;

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError>;

    /// Release the transport. Called exactly once per transport.
    fn close(&self);
}

/// Creates one transport per session
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(
        &self,
        config: &TransportConfig,
        tracks: &[MediaTrack],
        events: TransportEventSender,
    ) -> Result<Arc<dyn PeerTransport>, TransportError>;
}

/// Sending half of a session's transport event stream
#[derive(Debug, Clone)]
pub struct TransportEventSender {
    tx: mpsc::UnboundedSender<TransportEvent>,
}

impl TransportEventSender {
    /// Create a connected sender/receiver pair
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Emit an event. Returns false once the owning session is gone.
    pub fn emit(&self, event: TransportEvent) -> bool {
        self.tx.send(event).is_ok()
    }

    /// Whether the owning session stopped listening
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
