//! Peer transport and local media abstractions
//!
//! The session layer only talks to these traits. `loopback` provides an
//! in-process implementation for the demo command and tests.

mod error;
mod loopback;
mod media;
mod peer;
mod types;

pub use error::{MediaError, TransportError};
pub use loopback::{
    LoopbackFactory, LoopbackTransport, MediaGate, StaticMedia, StaticMediaSource,
    DEFAULT_LOOPBACK_CANDIDATES,
};
pub use media::{LocalMedia, MediaConstraints, MediaSource};
pub use peer::{PeerTransport, TransportEventSender, TransportFactory};
pub use types::{
    IceCandidate, MediaKind, MediaTrack, PeerConnectionState, RemoteTrack, SdpType,
    SessionDescription, TransportConfig, TransportEvent,
};
