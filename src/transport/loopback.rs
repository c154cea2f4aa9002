//! In-process transport and media used by the demo command and tests
//!
//! `LoopbackTransport` never moves media. It enforces the offer/answer
//! sequencing a browser transport would, gathers synthetic host candidates
//! after the local description is set, and reports `Connected` once both
//! descriptions are applied and a remote candidate arrived.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::watch;
use tracing::{debug, trace};

use super::error::{MediaError, TransportError};
use super::media::{LocalMedia, MediaConstraints, MediaSource};
use super::peer::{PeerTransport, TransportEventSender, TransportFactory};
use super::types::{
    IceCandidate, MediaKind, MediaTrack, PeerConnectionState, RemoteTrack, SdpType,
    SessionDescription, TransportConfig, TransportEvent,
};

/// Default number of candidates gathered per transport
pub const DEFAULT_LOOPBACK_CANDIDATES: usize = 3;

#[derive(Debug, Default)]
struct LoopbackState {
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    remote_candidates: Vec<IceCandidate>,
    gathered: bool,
    connected: bool,
    closed: bool,
}

/// Deterministic in-process peer transport
pub struct LoopbackTransport {
    origin: u32,
    tracks: Vec<MediaTrack>,
    candidates_per_gather: usize,
    events: TransportEventSender,
    state: Mutex<LoopbackState>,
    close_count: AtomicU32,
}

impl LoopbackTransport {
    pub fn new(
        tracks: &[MediaTrack],
        candidates_per_gather: usize,
        events: TransportEventSender,
    ) -> Self {
        Self {
            origin: rand::thread_rng().gen(),
            tracks: tracks.to_vec(),
            candidates_per_gather,
            events,
            state: Mutex::new(LoopbackState::default()),
            close_count: AtomicU32::new(0),
        }
    }

    /// Number of times `close` was called
    pub fn close_count(&self) -> u32 {
        self.close_count.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    pub fn local_description(&self) -> Option<SessionDescription> {
        self.state.lock().local.clone()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.state.lock().remote.clone()
    }

    /// Remote candidates accepted so far, in application order
    pub fn remote_candidates(&self) -> Vec<IceCandidate> {
        self.state.lock().remote_candidates.clone()
    }

    /// Report a transient loss of connectivity
    pub fn simulate_disconnect(&self) {
        self.events.emit(TransportEvent::ConnectionState(
            PeerConnectionState::Disconnected,
        ));
    }

    /// Report an unrecoverable connection failure
    pub fn simulate_failure(&self) {
        self.events
            .emit(TransportEvent::ConnectionState(PeerConnectionState::Failed));
    }

    fn synth_sdp(&self, sdp_type: SdpType) -> String {
        let setup = match sdp_type {
            SdpType::Offer => "actpass",
            SdpType::Answer => "active",
        };
        let mut sdp = format!(
            "v=0\r\no=- {} 2 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n",
            self.origin
        );
        for (mid, track) in self.tracks.iter().enumerate() {
            let payload = match track.kind {
                MediaKind::Audio => 111,
                MediaKind::Video => 96,
            };
            sdp.push_str(&format!(
                "m={} 9 UDP/TLS/RTP/SAVPF {}\r\na=mid:{}\r\na=setup:{}\r\na=msid:loopback {}\r\n",
                track.kind, payload, mid, setup, track.id
            ));
        }
        sdp
    }

    fn ensure_open(state: &LoopbackState) -> Result<(), TransportError> {
        if state.closed {
            return Err(TransportError::Closed);
        }
        Ok(())
    }

    fn validate(description: &SessionDescription) -> Result<(), TransportError> {
        if !description.sdp.starts_with("v=0") {
            return Err(TransportError::InvalidDescription(format!(
                "{} does not start with a version line",
                description.sdp_type
            )));
        }
        Ok(())
    }

    fn gather(&self) {
        let mut rng = rand::thread_rng();
        for foundation in 1..=self.candidates_per_gather {
            let port: u16 = rng.gen_range(49152..=65535);
            let priority = 2_130_706_431u32 - foundation as u32;
            let candidate = IceCandidate::new(format!(
                "candidate:{} 1 udp {} 127.0.0.1 {} typ host",
                foundation, priority, port
            ));
            trace!("Loopback gathered {}", candidate.candidate);
            if !self.events.emit(TransportEvent::LocalCandidate(candidate)) {
                break;
            }
        }
    }

    fn maybe_connect(&self) {
        let connect = {
            let mut state = self.state.lock();
            let ready = !state.closed
                && !state.connected
                && state.local.is_some()
                && state.remote.is_some()
                && !state.remote_candidates.is_empty();
            if ready {
                state.connected = true;
            }
            ready
        };

        if connect {
            debug!("Loopback transport connected");
            self.events.emit(TransportEvent::ConnectionState(
                PeerConnectionState::Connecting,
            ));
            self.events.emit(TransportEvent::ConnectionState(
                PeerConnectionState::Connected,
            ));
            for track in &self.tracks {
                self.events.emit(TransportEvent::RemoteTrack(RemoteTrack {
                    track_id: format!("remote-{}", track.id),
                    stream_id: "loopback".to_string(),
                    kind: track.kind,
                }));
            }
        }
    }
}

#[async_trait]
impl PeerTransport for LoopbackTransport {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        let state = self.state.lock();
        Self::ensure_open(&state)?;
        if state.remote.is_some() {
            return Err(TransportError::InvalidState(
                "cannot create an offer after a remote description".to_string(),
            ));
        }
        Ok(SessionDescription::offer(self.synth_sdp(SdpType::Offer)))
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        let state = self.state.lock();
        Self::ensure_open(&state)?;
        match &state.remote {
            Some(remote) if remote.sdp_type == SdpType::Offer => {
                Ok(SessionDescription::answer(self.synth_sdp(SdpType::Answer)))
            }
            _ => Err(TransportError::InvalidState(
                "cannot create an answer without a remote offer".to_string(),
            )),
        }
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError> {
        Self::validate(&description)?;
        let gather = {
            let mut state = self.state.lock();
            Self::ensure_open(&state)?;
            let allowed = match description.sdp_type {
                SdpType::Offer => state.local.is_none() && state.remote.is_none(),
                SdpType::Answer => {
                    state.local.is_none()
                        && matches!(&state.remote, Some(r) if r.sdp_type == SdpType::Offer)
                }
            };
            if !allowed {
                return Err(TransportError::InvalidState(format!(
                    "local {} not allowed here",
                    description.sdp_type
                )));
            }
            state.local = Some(description);
            let gather = !state.gathered;
            state.gathered = true;
            gather
        };

        if gather {
            self.gather();
        }
        self.maybe_connect();
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError> {
        Self::validate(&description)?;
        {
            let mut state = self.state.lock();
            Self::ensure_open(&state)?;
            let allowed = match description.sdp_type {
                SdpType::Offer => state.local.is_none() && state.remote.is_none(),
                SdpType::Answer => {
                    state.remote.is_none()
                        && matches!(&state.local, Some(l) if l.sdp_type == SdpType::Offer)
                }
            };
            if !allowed {
                return Err(TransportError::InvalidState(format!(
                    "remote {} not allowed here",
                    description.sdp_type
                )));
            }
            state.remote = Some(description);
        }
        self.maybe_connect();
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        {
            let mut state = self.state.lock();
            Self::ensure_open(&state)?;
            if state.remote.is_none() {
                return Err(TransportError::InvalidState(
                    "no remote description".to_string(),
                ));
            }
            if !candidate.candidate.starts_with("candidate:") {
                return Err(TransportError::CandidateRejected(candidate.candidate));
            }
            state.remote_candidates.push(candidate);
        }
        self.maybe_connect();
        Ok(())
    }

    fn close(&self) {
        self.state.lock().closed = true;
        self.close_count.fetch_add(1, Ordering::SeqCst);
        debug!("Loopback transport closed");
    }
}

/// Factory producing [`LoopbackTransport`]s and remembering each one
pub struct LoopbackFactory {
    candidates_per_gather: usize,
    created: Mutex<Vec<Arc<LoopbackTransport>>>,
    fail_with: Mutex<Option<TransportError>>,
}

impl LoopbackFactory {
    pub fn new(candidates_per_gather: usize) -> Self {
        Self {
            candidates_per_gather,
            created: Mutex::new(Vec::new()),
            fail_with: Mutex::new(None),
        }
    }

    /// Make the next `create` call fail with `error`
    pub fn fail_next(&self, error: TransportError) {
        *self.fail_with.lock() = Some(error);
    }

    /// Transports created so far, oldest first
    pub fn transports(&self) -> Vec<Arc<LoopbackTransport>> {
        self.created.lock().clone()
    }

    pub fn created_count(&self) -> usize {
        self.created.lock().len()
    }

    /// Most recently created transport
    pub fn last(&self) -> Option<Arc<LoopbackTransport>> {
        self.created.lock().last().cloned()
    }
}

impl Default for LoopbackFactory {
    fn default() -> Self {
        Self::new(DEFAULT_LOOPBACK_CANDIDATES)
    }
}

#[async_trait]
impl TransportFactory for LoopbackFactory {
    async fn create(
        &self,
        config: &TransportConfig,
        tracks: &[MediaTrack],
        events: TransportEventSender,
    ) -> Result<Arc<dyn PeerTransport>, TransportError> {
        if let Some(error) = self.fail_with.lock().take() {
            return Err(error);
        }

        debug!(
            "Creating loopback transport ({} tracks, ice servers: {:?})",
            tracks.len(),
            config.ice_servers
        );
        let transport = Arc::new(LoopbackTransport::new(
            tracks,
            self.candidates_per_gather,
            events,
        ));
        self.created.lock().push(transport.clone());
        Ok(transport)
    }
}

struct StaticMediaState {
    tracks: Vec<MediaTrack>,
    enabled: Mutex<HashMap<MediaKind, bool>>,
}

/// Media handle produced by [`StaticMediaSource`]
pub struct StaticMedia {
    state: Arc<StaticMediaState>,
    source_stops: Arc<AtomicU32>,
}

impl LocalMedia for StaticMedia {
    fn tracks(&self) -> Vec<MediaTrack> {
        self.state.tracks.clone()
    }

    fn set_enabled(&self, kind: MediaKind, enabled: bool) -> bool {
        let mut tracks = self.state.enabled.lock();
        match tracks.get_mut(&kind) {
            Some(flag) => {
                *flag = enabled;
                true
            }
            None => false,
        }
    }

    fn stop(&self) {
        self.source_stops.fetch_add(1, Ordering::SeqCst);
    }
}

/// Opens a gated [`StaticMediaSource`]
pub struct MediaGate {
    tx: watch::Sender<bool>,
}

impl MediaGate {
    /// Let pending and future acquisitions complete
    pub fn open(&self) {
        self.tx.send_replace(true);
    }
}

/// Media source with synthetic tracks, optionally held until a gate opens
pub struct StaticMediaSource {
    gate: Option<watch::Receiver<bool>>,
    failure: Option<MediaError>,
    acquired: AtomicU32,
    stopped: Arc<AtomicU32>,
    last: Mutex<Option<Arc<StaticMediaState>>>,
}

impl StaticMediaSource {
    pub fn new() -> Self {
        Self {
            gate: None,
            failure: None,
            acquired: AtomicU32::new(0),
            stopped: Arc::new(AtomicU32::new(0)),
            last: Mutex::new(None),
        }
    }

    /// Source whose acquisitions wait for [`MediaGate::open`]
    pub fn gated() -> (Self, MediaGate) {
        let (tx, rx) = watch::channel(false);
        let source = Self {
            gate: Some(rx),
            ..Self::new()
        };
        (source, MediaGate { tx })
    }

    /// Source whose acquisitions always fail
    pub fn failing(error: MediaError) -> Self {
        Self {
            failure: Some(error),
            ..Self::new()
        }
    }

    /// Successful acquisitions so far
    pub fn acquired_count(&self) -> u32 {
        self.acquired.load(Ordering::SeqCst)
    }

    /// Stop calls across all acquired media
    pub fn stopped_count(&self) -> u32 {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Enabled flag of `kind` on the most recent acquisition
    pub fn is_enabled(&self, kind: MediaKind) -> Option<bool> {
        let last = self.last.lock();
        let state = last.as_ref()?;
        let enabled = state.enabled.lock();
        enabled.get(&kind).copied()
    }
}

impl Default for StaticMediaSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MediaSource for StaticMediaSource {
    async fn acquire(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<Box<dyn LocalMedia>, MediaError> {
        if let Some(gate) = &self.gate {
            let mut gate = gate.clone();
            gate.wait_for(|open| *open)
                .await
                .map_err(|_| MediaError::Unavailable("media gate dropped".to_string()))?;
        }
        if let Some(error) = &self.failure {
            return Err(error.clone());
        }

        let n = self.acquired.fetch_add(1, Ordering::SeqCst) + 1;
        let tracks: Vec<MediaTrack> = constraints
            .kinds()
            .into_iter()
            .map(|kind| MediaTrack {
                id: format!("{}-{}", kind, n),
                kind,
            })
            .collect();
        let enabled = tracks.iter().map(|t| (t.kind, true)).collect();

        let state = Arc::new(StaticMediaState {
            tracks,
            enabled: Mutex::new(enabled),
        });
        *self.last.lock() = Some(state.clone());

        Ok(Box::new(StaticMedia {
            state,
            source_stops: self.stopped.clone(),
        }))
    }
}
