//! Guards for the resources a session holds
//!
//! Each guard releases its resource when dropped, so every exit path
//! (teardown, failure, a flow completing after teardown, dropping the
//! orchestrator) releases exactly once.

use std::sync::Arc;

use tracing::debug;

use crate::transport::{LocalMedia, MediaKind, MediaTrack, PeerTransport};

/// Local media owned by one session; stops capturing on drop
pub struct MediaGuard {
    media: Box<dyn LocalMedia>,
}

impl MediaGuard {
    pub fn new(media: Box<dyn LocalMedia>) -> Self {
        Self { media }
    }

    pub fn tracks(&self) -> Vec<MediaTrack> {
        self.media.tracks()
    }

    pub fn set_enabled(&self, kind: MediaKind, enabled: bool) -> bool {
        self.media.set_enabled(kind, enabled)
    }
}

impl Drop for MediaGuard {
    fn drop(&mut self) {
        self.media.stop();
        debug!("Local media stopped");
    }
}

/// Peer transport bound to one session; closed on drop
pub struct TransportGuard {
    transport: Arc<dyn PeerTransport>,
}

impl TransportGuard {
    pub fn new(transport: Arc<dyn PeerTransport>) -> Self {
        Self { transport }
    }

    /// Shared handle for issuing transport calls
    pub fn handle(&self) -> Arc<dyn PeerTransport> {
        self.transport.clone()
    }
}

impl Drop for TransportGuard {
    fn drop(&mut self) {
        self.transport.close();
        debug!("Peer transport closed");
    }
}

/// Everything a session releases when it reaches a terminal state
#[derive(Default)]
pub struct SessionResources {
    pub transport: Option<TransportGuard>,
    pub media: Option<MediaGuard>,
}

impl SessionResources {
    /// Close the transport, then stop local media
    pub fn release(mut self) {
        drop(self.transport.take());
        drop(self.media.take());
    }
}
