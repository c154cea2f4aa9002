//! Call session orchestrator
//!
//! Owns one call session at a time for a conversation. Owner calls
//! (`start`, `end_session`, ...) run in the caller's task; signaling
//! messages, transport events and the companion `create_session` reply are
//! merged into a per-session driver task and applied in arrival order.
//!
//! Every flow re-checks the session epoch after each await. A flow whose
//! session was torn down in the meantime stops quietly, and anything it
//! acquired is released right away.

use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::config::CallConfig;
use crate::signaling::{
    ConversationId, CreateSessionRequest, CreatedSession, InboundSignal, OutboundSignal,
    SessionDirectory, SessionId, SignalingChannel, SignalingError, Subscription,
};
use crate::transport::{
    IceCandidate, MediaError, MediaKind, MediaSource, MediaTrack, PeerConnectionState,
    PeerTransport, SessionDescription, TransportError, TransportEvent, TransportEventSender,
    TransportFactory,
};

use super::candidate_buffer::CandidateBuffer;
use super::conference_link::ConferenceLinkResolver;
use super::error::SessionError;
use super::events::SessionEvent;
use super::reconcile::{AssignmentSource, FirstWriterWins, Reconciliation};
use super::resources::{MediaGuard, SessionResources, TransportGuard};
use super::state::{Role, SessionState};

/// External collaborators the orchestrator drives
#[derive(Clone)]
pub struct Collaborators {
    pub signaling: Arc<dyn SignalingChannel>,
    /// Companion request/response API; optional
    pub directory: Option<Arc<dyn SessionDirectory>>,
    pub transports: Arc<dyn TransportFactory>,
    pub media: Arc<dyn MediaSource>,
}

/// Why a flow stopped early
enum Halt {
    /// The session was torn down or replaced while the flow was waiting
    Cancelled,
    /// The flow hit an error that ends the session
    Failed(SessionError),
}

impl From<SessionError> for Halt {
    fn from(e: SessionError) -> Self {
        Halt::Failed(e)
    }
}

impl From<TransportError> for Halt {
    fn from(e: TransportError) -> Self {
        Halt::Failed(e.into())
    }
}

impl From<MediaError> for Halt {
    fn from(e: MediaError) -> Self {
        Halt::Failed(e.into())
    }
}

impl From<SignalingError> for Halt {
    fn from(e: SignalingError) -> Self {
        Halt::Failed(e.into())
    }
}

type FlowResult<T = ()> = Result<T, Halt>;

/// Progress of the remote description on the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RemoteDescription {
    Pending,
    /// Applied or being applied; remote candidates are still queued
    Applying,
    /// Remote candidates go straight to the transport
    Applied,
}

struct Session {
    epoch: u64,
    role: Role,
    state: SessionState,
    id: FirstWriterWins<SessionId>,
    link: ConferenceLinkResolver,
    candidates: CandidateBuffer,
    pending_remote: Vec<IceCandidate>,
    remote: RemoteDescription,
    /// Joined by link; the stored offer has not been answered yet
    awaiting_offer: bool,
    /// Offer that arrived before the transport existed
    early_offer: Option<String>,
    transport_connected: bool,
    resources: SessionResources,
    transport_events: TransportEventSender,
    directory_tx: mpsc::UnboundedSender<Result<CreatedSession, SignalingError>>,
    shutdown: Option<oneshot::Sender<()>>,
}

impl Session {
    fn transport(&self) -> Option<Arc<dyn PeerTransport>> {
        self.resources.transport.as_ref().map(TransportGuard::handle)
    }
}

/// Ended session ids remembered to recognise replayed offers
const FINISHED_IDS_KEPT: usize = 32;

#[derive(Default)]
struct Core {
    epoch: u64,
    session: Option<Session>,
    finished: VecDeque<SessionId>,
}

impl Core {
    fn remember_finished(&mut self, session_id: SessionId) {
        if self.finished.contains(&session_id) {
            return;
        }
        if self.finished.len() == FINISHED_IDS_KEPT {
            self.finished.pop_front();
        }
        self.finished.push_back(session_id);
    }
}

/// A session claimed for teardown
struct Claimed {
    epoch: u64,
    role: Role,
    id: Option<SessionId>,
    resources: SessionResources,
}

enum AnswerAction {
    Apply(Arc<dyn PeerTransport>),
    Duplicate,
    Stale(SessionError),
}

enum Input {
    Signal(InboundSignal),
    Transport(TransportEvent),
    Directory(Result<CreatedSession, SignalingError>),
}

struct Inner {
    conversation_id: ConversationId,
    config: CallConfig,
    deps: Collaborators,
    core: Mutex<Core>,
    events: broadcast::Sender<SessionEvent>,
    state_tx: watch::Sender<SessionState>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

/// Drives the lifecycle of call sessions within one conversation
///
/// Cheap to clone; clones share the same session.
#[derive(Clone)]
pub struct SessionOrchestrator {
    inner: Arc<Inner>,
}

impl SessionOrchestrator {
    pub fn new(conversation_id: ConversationId, config: CallConfig, deps: Collaborators) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let (state_tx, _) = watch::channel(SessionState::Idle);
        Self {
            inner: Arc::new(Inner {
                conversation_id,
                config,
                deps,
                core: Mutex::new(Core::default()),
                events,
                state_tx,
                listener: Mutex::new(None),
            }),
        }
    }

    pub fn conversation_id(&self) -> &ConversationId {
        &self.inner.conversation_id
    }

    /// Receive lifecycle events from now on
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    /// Watch the state of the current session
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.inner.state_tx.subscribe()
    }

    /// State of the current (or most recent) session
    pub fn state(&self) -> SessionState {
        *self.inner.state_tx.borrow()
    }

    pub fn role(&self) -> Option<Role> {
        self.inner.core.lock().session.as_ref().map(|s| s.role)
    }

    pub fn session_id(&self) -> Option<SessionId> {
        let core = self.inner.core.lock();
        core.session.as_ref().and_then(|s| s.id.get().cloned())
    }

    pub fn conference_link(&self) -> Option<String> {
        let core = self.inner.core.lock();
        core.session
            .as_ref()
            .and_then(|s| s.link.link().map(str::to_string))
    }

    /// Local candidates waiting for the session id
    pub fn pending_candidates(&self) -> usize {
        let core = self.inner.core.lock();
        core.session.as_ref().map_or(0, |s| s.candidates.len())
    }

    /// Start a call as initiator
    ///
    /// Fails with [`SessionError::SessionActive`] while another session is
    /// live and with [`SessionError::MediaAcquisition`] before any transport
    /// or signaling side effect when local media is unavailable.
    pub async fn start(&self) -> Result<(), SessionError> {
        let subscription = self.inner.subscribe_conversation();
        let epoch = self.inner.open_session(Role::Initiator, None, subscription)?;
        let result = self.inner.run_initiator(epoch).await;
        self.inner.settle(epoch, result)
    }

    /// Answer a remote offer as responder
    pub async fn on_remote_offer(
        &self,
        sdp: String,
        remote_session_id: SessionId,
    ) -> Result<(), SessionError> {
        let subscription = self.inner.subscribe_conversation();
        self.inner
            .answer_offer(subscription, sdp, remote_session_id)
            .await
    }

    /// Join a call through its shared conference link as responder
    ///
    /// Announces the guest with `join_conference`, then asks for the stored
    /// offer with `request_offer`. The offer is answered when it arrives.
    /// A link for a session that already ended here is ignored.
    pub async fn join_by_link(
        &self,
        session_id: SessionId,
        code: String,
    ) -> Result<(), SessionError> {
        self.inner.join_link(session_id, code).await
    }

    /// Apply the remote answer to the live initiator session
    pub async fn on_remote_answer(&self, sdp: String) -> Result<(), SessionError> {
        let Some(epoch) = self.inner.live_epoch() else {
            debug!("Answer without a live session ignored");
            return Ok(());
        };
        let result = self.inner.apply_answer(epoch, sdp, None).await;
        self.inner.settle(epoch, result)
    }

    /// Apply remote candidates in arrival order
    pub async fn on_remote_candidates(
        &self,
        candidates: Vec<IceCandidate>,
    ) -> Result<(), SessionError> {
        let Some(epoch) = self.inner.live_epoch() else {
            return Ok(());
        };
        let result = self
            .inner
            .apply_remote_candidates(epoch, candidates, None)
            .await;
        self.inner.settle(epoch, result)
    }

    /// Forward or buffer a locally gathered candidate
    pub async fn on_local_candidate(&self, candidate: IceCandidate) -> Result<(), SessionError> {
        let Some(epoch) = self.inner.live_epoch() else {
            trace!("Local candidate after teardown ignored");
            return Ok(());
        };
        let result = self.inner.forward_local_candidate(epoch, candidate).await;
        self.inner.settle(epoch, result)
    }

    /// Reconcile a session id (and optional conference link) reported by signaling
    pub async fn on_session_id_assigned(
        &self,
        session_id: SessionId,
        conference_link: Option<String>,
    ) -> Result<(), SessionError> {
        let Some(epoch) = self.inner.live_epoch() else {
            return Ok(());
        };
        let result = self
            .inner
            .assign_session_id(
                epoch,
                session_id,
                conference_link,
                AssignmentSource::Signaling,
            )
            .await;
        self.inner.settle(epoch, result)
    }

    /// Tear down the live session after the remote side ended it
    pub fn on_remote_session_ended(&self, session_id: &SessionId) {
        self.inner.remote_ended(session_id);
    }

    /// End the live session, notifying the remote side. Idempotent.
    ///
    /// Local teardown always completes; a failed notification is returned
    /// afterwards.
    pub async fn end_session(&self) -> Result<(), SessionError> {
        self.inner.end_session().await
    }

    /// Enable or disable local audio. Returns false without live audio.
    pub fn set_audio_enabled(&self, enabled: bool) -> bool {
        self.inner.set_track_enabled(MediaKind::Audio, enabled)
    }

    /// Enable or disable local video. Returns false without live video.
    pub fn set_video_enabled(&self, enabled: bool) -> bool {
        self.inner.set_track_enabled(MediaKind::Video, enabled)
    }

    /// Answer incoming offers automatically while no session is live
    ///
    /// The idle subscription that received the offer becomes the new
    /// session's subscription, so nothing sent right after the offer is lost.
    pub fn listen(&self) {
        let subscription = self.inner.subscribe_conversation();
        let handle = tokio::spawn(listen_loop(Arc::downgrade(&self.inner), subscription));
        if let Some(previous) = self.inner.listener.lock().replace(handle) {
            previous.abort();
        }
        info!("Listening for offers in conversation {}", self.inner.conversation_id);
    }

    /// Stop answering incoming offers
    pub fn stop_listening(&self) {
        if let Some(handle) = self.inner.listener.lock().take() {
            handle.abort();
        }
    }
}

impl Inner {
    fn subscribe_conversation(&self) -> Subscription {
        self.deps.signaling.subscribe(&self.conversation_id)
    }

    fn publish(&self, event: SessionEvent) {
        // No receivers is fine
        let _ = self.events.send(event);
    }

    fn live_epoch(&self) -> Option<u64> {
        let core = self.core.lock();
        core.session
            .as_ref()
            .filter(|s| s.state.is_live())
            .map(|s| s.epoch)
    }

    fn is_live(&self, epoch: u64) -> bool {
        let core = self.core.lock();
        core.session
            .as_ref()
            .is_some_and(|s| s.epoch == epoch && s.state.is_live())
    }

    fn ensure_live(&self, epoch: u64) -> FlowResult {
        if self.is_live(epoch) {
            Ok(())
        } else {
            Err(Halt::Cancelled)
        }
    }

    /// Run `f` on the session if it is still the live session of `epoch`
    fn with_session<R>(&self, epoch: u64, f: impl FnOnce(&mut Session) -> R) -> FlowResult<R> {
        let mut core = self.core.lock();
        match core.session.as_mut() {
            Some(session) if session.epoch == epoch && session.state.is_live() => Ok(f(session)),
            _ => Err(Halt::Cancelled),
        }
    }

    fn is_finished(&self, session_id: &SessionId) -> bool {
        self.core.lock().finished.contains(session_id)
    }

    fn open_session(
        self: &Arc<Self>,
        role: Role,
        assigned: Option<(SessionId, AssignmentSource)>,
        subscription: Subscription,
    ) -> Result<u64, SessionError> {
        let mut core = self.core.lock();
        if let Some(current) = core.session.as_ref().filter(|s| s.state.is_live()) {
            warn!("Session already active ({}), not opening another", current.state);
            return Err(SessionError::SessionActive(current.state));
        }
        if let Some((id, _)) = assigned.as_ref().filter(|(id, _)| core.finished.contains(id)) {
            return Err(SessionError::StaleEvent {
                received: id.clone(),
                current: None,
            });
        }

        core.epoch += 1;
        let epoch = core.epoch;
        let (transport_events, transport_rx) = TransportEventSender::channel();
        let (directory_tx, directory_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let awaiting_offer = matches!(assigned, Some((_, AssignmentSource::Link)));
        let id = match &assigned {
            Some((id, source)) => {
                debug!("Session id {} taken from {}", id, source);
                FirstWriterWins::assigned(id.clone())
            }
            None => FirstWriterWins::new(),
        };
        core.session = Some(Session {
            epoch,
            role,
            state: SessionState::Idle,
            id,
            link: ConferenceLinkResolver::new(),
            candidates: CandidateBuffer::new(),
            pending_remote: Vec::new(),
            remote: RemoteDescription::Pending,
            awaiting_offer,
            early_offer: None,
            transport_connected: false,
            resources: SessionResources::default(),
            transport_events,
            directory_tx,
            shutdown: Some(shutdown_tx),
        });

        tokio::spawn(drive(
            Arc::downgrade(self),
            epoch,
            subscription,
            transport_rx,
            directory_rx,
            shutdown_rx,
        ));

        info!("Opened {} session (epoch {})", role, epoch);
        self.state_tx.send_replace(SessionState::Idle);
        self.publish(SessionEvent::StateChanged {
            state: SessionState::Idle,
            role,
        });
        if let Some((session_id, _)) = assigned {
            self.publish(SessionEvent::SessionIdAssigned { session_id });
        }
        Ok(epoch)
    }

    /// Move a live session forward. Returns the session id known at that point.
    fn advance(&self, epoch: u64, next: SessionState) -> FlowResult<Option<SessionId>> {
        let mut core = self.core.lock();
        let session = match core.session.as_mut() {
            Some(s) if s.epoch == epoch && s.state.is_live() => s,
            _ => return Err(Halt::Cancelled),
        };

        if !session.state.can_transition_to(next) {
            return Err(Halt::Failed(SessionError::Negotiation(format!(
                "cannot move from {} to {}",
                session.state, next
            ))));
        }

        let mut reached = vec![next];
        session.state = next;
        if next == SessionState::Negotiating && session.transport_connected {
            session.state = SessionState::Connected;
            reached.push(SessionState::Connected);
        }

        let role = session.role;
        let id = session.id.get().cloned();
        for state in reached {
            info!("Session {} -> {}", epoch, state);
            self.state_tx.send_replace(state);
            self.publish(SessionEvent::StateChanged { state, role });
        }
        Ok(id)
    }

    fn on_transport_connected(&self, epoch: u64) -> FlowResult {
        let negotiating = self.with_session(epoch, |s| {
            s.transport_connected = true;
            s.state == SessionState::Negotiating
        })?;
        if negotiating {
            self.advance(epoch, SessionState::Connected)?;
        }
        Ok(())
    }

    /// Mark a live session terminal and take what it holds
    fn claim(&self, epoch: Option<u64>, terminal: SessionState) -> Option<Claimed> {
        let mut core = self.core.lock();
        let session = core.session.as_mut()?;
        if !session.state.is_live() || epoch.is_some_and(|e| e != session.epoch) {
            return None;
        }

        session.state = terminal;
        if let Some(shutdown) = session.shutdown.take() {
            let _ = shutdown.send(());
        }
        session.pending_remote.clear();
        let claimed = Claimed {
            epoch: session.epoch,
            role: session.role,
            id: session.id.get().cloned(),
            resources: std::mem::take(&mut session.resources),
        };
        if let Some(id) = claimed.id.clone() {
            core.remember_finished(id);
        }
        Some(claimed)
    }

    /// Release a claimed session and announce its terminal state
    fn finish(&self, claimed: Claimed, terminal: SessionState, reason: Option<String>) {
        claimed.resources.release();

        let core = self.core.lock();
        if core.epoch == claimed.epoch {
            self.state_tx.send_replace(terminal);
        }
        info!("Session {} -> {}", claimed.epoch, terminal);
        self.publish(SessionEvent::StateChanged {
            state: terminal,
            role: claimed.role,
        });
        if let Some(reason) = reason {
            self.publish(SessionEvent::Failed { reason });
        }
    }

    /// Fail the session of `epoch`. Returns false if it was no longer live.
    fn fail(&self, epoch: u64, error: &SessionError) -> bool {
        let Some(claimed) = self.claim(Some(epoch), SessionState::Failed) else {
            return false;
        };
        error!("Session {} failed: {}", epoch, error);
        self.finish(claimed, SessionState::Failed, Some(error.to_string()));
        true
    }

    fn settle(&self, epoch: u64, result: FlowResult) -> Result<(), SessionError> {
        match result {
            Ok(()) => Ok(()),
            Err(Halt::Cancelled) => {
                debug!("Session {} flow stopped after teardown", epoch);
                Ok(())
            }
            Err(Halt::Failed(error)) => {
                if self.fail(epoch, &error) {
                    Err(error)
                } else {
                    debug!("Session {} already over, dropping error: {}", epoch, error);
                    Ok(())
                }
            }
        }
    }

    async fn end_session(&self) -> Result<(), SessionError> {
        let Some(claimed) = self.claim(None, SessionState::Ended) else {
            debug!("end_session without a live session");
            return Ok(());
        };

        let notified = match &claimed.id {
            Some(session_id) => {
                self.send(OutboundSignal::EndSession {
                    session_id: session_id.clone(),
                })
                .await
            }
            None => Ok(()),
        };
        if let Err(e) = &notified {
            warn!("Failed to notify end of session: {}", e);
        }

        self.finish(claimed, SessionState::Ended, None);
        notified.map_err(SessionError::from)
    }

    fn remote_ended(&self, session_id: &SessionId) {
        let epoch = {
            let core = self.core.lock();
            core.session
                .as_ref()
                .filter(|s| s.state.is_live() && s.id.get() == Some(session_id))
                .map(|s| s.epoch)
        };
        let Some(epoch) = epoch else {
            debug!("session_ended for {} does not match, ignored", session_id);
            return;
        };

        if let Some(claimed) = self.claim(Some(epoch), SessionState::Ended) {
            info!("Remote ended session {}", session_id);
            self.finish(claimed, SessionState::Ended, None);
        }
    }

    fn set_track_enabled(&self, kind: MediaKind, enabled: bool) -> bool {
        let core = self.core.lock();
        let Some(media) = core
            .session
            .as_ref()
            .filter(|s| s.state.is_live())
            .and_then(|s| s.resources.media.as_ref())
        else {
            return false;
        };
        let applied = media.set_enabled(kind, enabled);
        debug!("{} enabled={} (applied: {})", kind, enabled, applied);
        applied
    }

    async fn send(&self, signal: OutboundSignal) -> Result<(), SignalingError> {
        let name = signal.name();
        trace!("Publishing {}", name);
        let sending = self.deps.signaling.send(signal);
        match tokio::time::timeout(self.config.signaling_timeout(), sending).await {
            Ok(result) => result,
            Err(_) => {
                warn!("Sending {} timed out", name);
                Err(SignalingError::Timeout)
            }
        }
    }

    /// Send from the event loop; failures are reported as events, never retried
    async fn send_reported(&self, signal: OutboundSignal) {
        let name = signal.name();
        if let Err(e) = self.send(signal).await {
            warn!("Failed to deliver {}: {}", name, e);
            self.publish(SessionEvent::DeliveryFailed {
                signal: name,
                error: e.to_string(),
            });
        }
    }

    async fn acquire_media(&self, epoch: u64) -> FlowResult<Vec<MediaTrack>> {
        let media = self.deps.media.acquire(&self.config.media).await?;
        let guard = MediaGuard::new(media);
        let tracks = guard.tracks();

        let leftover = {
            let mut core = self.core.lock();
            match core.session.as_mut() {
                Some(s) if s.epoch == epoch && s.state.is_live() => {
                    s.resources.media = Some(guard);
                    None
                }
                _ => Some(guard),
            }
        };
        if leftover.is_some() {
            debug!("Media arrived after teardown, releasing");
            return Err(Halt::Cancelled);
        }
        debug!("Acquired {} local tracks", tracks.len());
        Ok(tracks)
    }

    async fn create_transport(
        &self,
        epoch: u64,
        tracks: &[MediaTrack],
    ) -> FlowResult<Arc<dyn PeerTransport>> {
        let events = self.with_session(epoch, |s| s.transport_events.clone())?;
        let transport = self
            .deps
            .transports
            .create(&self.config.transport_config(), tracks, events)
            .await?;
        let guard = TransportGuard::new(transport.clone());

        let leftover = {
            let mut core = self.core.lock();
            match core.session.as_mut() {
                Some(s) if s.epoch == epoch && s.state.is_live() => {
                    s.resources.transport = Some(guard);
                    None
                }
                _ => Some(guard),
            }
        };
        if leftover.is_some() {
            debug!("Transport created after teardown, closing");
            return Err(Halt::Cancelled);
        }
        Ok(transport)
    }

    async fn join_conversation(&self, epoch: u64) -> FlowResult {
        if !self.config.join_conversation {
            return Ok(());
        }
        self.send_reported(OutboundSignal::JoinConversation {
            conversation_id: self.conversation_id.clone(),
        })
        .await;
        self.ensure_live(epoch)
    }

    fn request_session(&self, epoch: u64) -> FlowResult {
        let Some(directory) = self.deps.directory.clone() else {
            return Ok(());
        };
        let tx = self.with_session(epoch, |s| s.directory_tx.clone())?;
        let request = CreateSessionRequest {
            conversation_id: self.conversation_id.clone(),
            session_type: self.config.session_type,
            generate_link: self.config.request_conference_link,
        };

        tokio::spawn(async move {
            let reply = directory.create_session(request).await;
            // Driver gone means the session is over
            let _ = tx.send(reply);
        });
        Ok(())
    }

    async fn run_initiator(&self, epoch: u64) -> FlowResult {
        let tracks = self.acquire_media(epoch).await?;
        self.request_session(epoch)?;
        self.join_conversation(epoch).await?;

        let transport = self.create_transport(epoch, &tracks).await?;
        let offer = transport.create_offer().await?;
        self.ensure_live(epoch)?;
        transport.set_local_description(offer.clone()).await?;

        // Negotiating before the offer leaves, so a fast answer finds the right state
        let session_id = self.advance(epoch, SessionState::Negotiating)?;
        self.send(OutboundSignal::Offer {
            conversation_id: self.conversation_id.clone(),
            session_id,
            sdp: offer.sdp,
            session_type: self.config.session_type,
        })
        .await?;
        debug!("Offer published for session {}", epoch);
        Ok(())
    }

    async fn answer_offer(
        self: &Arc<Self>,
        subscription: Subscription,
        sdp: String,
        session_id: SessionId,
    ) -> Result<(), SessionError> {
        let assigned = Some((session_id, AssignmentSource::Offer));
        let epoch = match self.open_session(Role::Responder, assigned, subscription) {
            Ok(epoch) => epoch,
            Err(stale @ SessionError::StaleEvent { .. }) => {
                debug!("Offer ignored: {}", stale);
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        let result = self.run_responder(epoch, sdp).await;
        self.settle(epoch, result)
    }

    async fn run_responder(&self, epoch: u64, offer_sdp: String) -> FlowResult {
        let tracks = self.acquire_media(epoch).await?;
        self.join_conversation(epoch).await?;

        let transport = self.create_transport(epoch, &tracks).await?;
        self.answer_with(epoch, &transport, offer_sdp).await
    }

    /// Set the remote offer, then create, set and publish the answer
    async fn answer_with(
        &self,
        epoch: u64,
        transport: &Arc<dyn PeerTransport>,
        offer_sdp: String,
    ) -> FlowResult {
        self.with_session(epoch, |s| s.remote = RemoteDescription::Applying)?;
        transport
            .set_remote_description(SessionDescription::offer(offer_sdp))
            .await
            .map_err(|e| SessionError::Negotiation(format!("remote offer rejected: {}", e)))?;
        self.ensure_live(epoch)?;
        self.drain_remote_candidates(epoch, transport).await?;

        let answer = transport.create_answer().await?;
        self.ensure_live(epoch)?;
        transport.set_local_description(answer.clone()).await?;

        let session_id = self.advance(epoch, SessionState::Negotiating)?.ok_or_else(|| {
            SessionError::Negotiation("responder session has no id".to_string())
        })?;
        self.send(OutboundSignal::Answer {
            session_id,
            sdp: answer.sdp,
        })
        .await?;
        debug!("Answer published for session {}", epoch);
        Ok(())
    }

    async fn join_link(
        self: &Arc<Self>,
        session_id: SessionId,
        code: String,
    ) -> Result<(), SessionError> {
        let subscription = self.subscribe_conversation();
        let assigned = Some((session_id.clone(), AssignmentSource::Link));
        let epoch = match self.open_session(Role::Responder, assigned, subscription) {
            Ok(epoch) => epoch,
            Err(stale @ SessionError::StaleEvent { .. }) => {
                debug!("Conference link ignored: {}", stale);
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        let result = self.run_link_guest(epoch, session_id, code).await;
        self.settle(epoch, result)
    }

    async fn run_link_guest(&self, epoch: u64, session_id: SessionId, code: String) -> FlowResult {
        let tracks = self.acquire_media(epoch).await?;
        self.join_conversation(epoch).await?;
        let transport = self.create_transport(epoch, &tracks).await?;

        self.send(OutboundSignal::JoinConference {
            session_id: session_id.clone(),
            code,
        })
        .await?;

        let next = self.with_session(epoch, |s| match s.early_offer.take() {
            Some(sdp) => {
                s.awaiting_offer = false;
                Some(Some(sdp))
            }
            None if s.awaiting_offer => Some(None),
            None => None,
        })?;
        match next {
            Some(Some(sdp)) => {
                debug!("Answering offer received while joining");
                self.answer_with(epoch, &transport, sdp).await
            }
            Some(None) => {
                self.send(OutboundSignal::RequestOffer { session_id }).await?;
                debug!("Requested stored offer for session {}", epoch);
                Ok(())
            }
            // Answered from the event loop already
            None => Ok(()),
        }
    }

    /// Answer the offer of a session joined by link
    async fn on_offer(&self, epoch: u64, session_id: SessionId, sdp: String) -> FlowResult {
        let ready = self.with_session(epoch, |s| {
            if !s.awaiting_offer {
                warn!("Ignoring offer for {} during an active session", session_id);
                return None;
            }
            if let Some(stale) = Self::check_stale(s, Some(&session_id)) {
                debug!("{}", stale);
                return None;
            }
            match s.transport() {
                Some(transport) => {
                    s.awaiting_offer = false;
                    Some(transport)
                }
                None => {
                    trace!("Offer arrived before the transport, holding it");
                    s.early_offer = Some(sdp.clone());
                    None
                }
            }
        })?;

        match ready {
            Some(transport) => self.answer_with(epoch, &transport, sdp).await,
            None => Ok(()),
        }
    }

    /// Apply queued remote candidates until the queue stays empty
    async fn drain_remote_candidates(
        &self,
        epoch: u64,
        transport: &Arc<dyn PeerTransport>,
    ) -> FlowResult {
        loop {
            let batch = self.with_session(epoch, |s| {
                let batch = std::mem::take(&mut s.pending_remote);
                if batch.is_empty() {
                    s.remote = RemoteDescription::Applied;
                }
                batch
            })?;
            if batch.is_empty() {
                return Ok(());
            }
            debug!("Applying {} queued remote candidates", batch.len());
            self.add_candidates(epoch, transport, batch).await?;
        }
    }

    async fn add_candidates(
        &self,
        epoch: u64,
        transport: &Arc<dyn PeerTransport>,
        candidates: Vec<IceCandidate>,
    ) -> FlowResult {
        for candidate in candidates {
            self.ensure_live(epoch)?;
            if let Err(e) = transport.add_ice_candidate(candidate).await {
                warn!("Remote candidate rejected: {}", e);
            }
        }
        Ok(())
    }

    /// Check a remote message's session id against the live session
    fn check_stale(session: &Session, received: Option<&SessionId>) -> Option<SessionError> {
        let received = received?;
        match session.id.get() {
            Some(current) if current != received => Some(SessionError::StaleEvent {
                received: received.clone(),
                current: Some(current.clone()),
            }),
            _ => None,
        }
    }

    async fn apply_answer(
        &self,
        epoch: u64,
        sdp: String,
        session_id: Option<SessionId>,
    ) -> FlowResult {
        let action = self.with_session(epoch, |s| {
            if let Some(stale) = Self::check_stale(s, session_id.as_ref()) {
                return Ok(AnswerAction::Stale(stale));
            }
            if s.role != Role::Initiator {
                return Err(SessionError::Negotiation(
                    "answer received by responder".to_string(),
                ));
            }
            if s.remote != RemoteDescription::Pending || s.state == SessionState::Connected {
                return Ok(AnswerAction::Duplicate);
            }
            if s.state != SessionState::Negotiating {
                return Err(SessionError::Negotiation(format!(
                    "answer received by {} in state {}",
                    s.role, s.state
                )));
            }
            match s.transport() {
                Some(transport) => {
                    s.remote = RemoteDescription::Applying;
                    Ok(AnswerAction::Apply(transport))
                }
                None => Err(SessionError::Negotiation(
                    "answer received before transport exists".to_string(),
                )),
            }
        })??;

        let transport = match action {
            AnswerAction::Apply(transport) => transport,
            AnswerAction::Duplicate => {
                debug!("Duplicate answer ignored");
                return Ok(());
            }
            AnswerAction::Stale(stale) => {
                debug!("{}", stale);
                return Ok(());
            }
        };

        if let Some(session_id) = session_id {
            self.assign_session_id(epoch, session_id, None, AssignmentSource::Signaling)
                .await?;
        }

        transport
            .set_remote_description(SessionDescription::answer(sdp))
            .await
            .map_err(|e| SessionError::Negotiation(format!("remote answer rejected: {}", e)))?;
        self.ensure_live(epoch)?;
        debug!("Remote answer applied");
        self.drain_remote_candidates(epoch, &transport).await
    }

    async fn apply_remote_candidates(
        &self,
        epoch: u64,
        candidates: Vec<IceCandidate>,
        session_id: Option<SessionId>,
    ) -> FlowResult {
        let ready = self.with_session(epoch, |s| {
            if let Some(stale) = Self::check_stale(s, session_id.as_ref()) {
                debug!("{}", stale);
                return None;
            }
            if s.remote != RemoteDescription::Applied {
                trace!("Queueing {} remote candidates", candidates.len());
                s.pending_remote.extend(candidates.iter().cloned());
                return None;
            }
            s.transport()
        })?;

        match ready {
            Some(transport) => self.add_candidates(epoch, &transport, candidates).await,
            None => Ok(()),
        }
    }

    async fn forward_local_candidate(&self, epoch: u64, candidate: IceCandidate) -> FlowResult {
        let session_id = self.with_session(epoch, |s| match s.id.get() {
            Some(id) => Some(id.clone()),
            None => {
                s.candidates.append(candidate.clone());
                trace!("Buffered local candidate ({} pending)", s.candidates.len());
                None
            }
        })?;

        if let Some(session_id) = session_id {
            self.send_reported(OutboundSignal::IceCandidates {
                session_id,
                candidates: vec![candidate],
            })
            .await;
        }
        Ok(())
    }

    async fn assign_session_id(
        &self,
        epoch: u64,
        session_id: SessionId,
        conference_link: Option<String>,
        source: AssignmentSource,
    ) -> FlowResult {
        let flush = self.with_session(epoch, |s| {
            let flush = match s.id.offer(session_id.clone()) {
                Reconciliation::Accepted => {
                    info!("Session id {} assigned from {}", session_id, source);
                    self.publish(SessionEvent::SessionIdAssigned {
                        session_id: session_id.clone(),
                    });
                    Some(s.candidates.drain())
                }
                Reconciliation::Unchanged => {
                    debug!("Session id {} confirmed by {}", session_id, source);
                    None
                }
                Reconciliation::Conflict { kept } => {
                    warn!(
                        "Conflicting session id {} from {}, keeping {}",
                        session_id, source, kept
                    );
                    None
                }
            };

            if let Some(link) = conference_link {
                if let Some(link) = s.link.resolve(link, source) {
                    self.publish(SessionEvent::ConferenceLink { link });
                }
            }
            flush
        })?;

        match flush {
            Some(candidates) if !candidates.is_empty() => {
                debug!("Flushing {} buffered candidates", candidates.len());
                self.send_reported(OutboundSignal::IceCandidates {
                    session_id,
                    candidates,
                })
                .await;
                Ok(())
            }
            _ => Ok(()),
        }
    }

    async fn on_transport_event(&self, epoch: u64, event: TransportEvent) -> FlowResult {
        match event {
            TransportEvent::LocalCandidate(candidate) => {
                self.forward_local_candidate(epoch, candidate).await
            }
            TransportEvent::RemoteTrack(track) => {
                debug!("Remote {} track {}", track.kind, track.track_id);
                self.publish(SessionEvent::RemoteTrack(track));
                Ok(())
            }
            TransportEvent::ConnectionState(PeerConnectionState::Failed) => {
                Err(TransportError::ConnectionFailed.into())
            }
            TransportEvent::ConnectionState(state) => {
                debug!("Transport state: {}", state);
                self.publish(SessionEvent::ConnectionState(state));
                if state == PeerConnectionState::Connected {
                    self.on_transport_connected(epoch)?;
                }
                Ok(())
            }
        }
    }

    async fn on_directory_reply(
        &self,
        epoch: u64,
        reply: Result<CreatedSession, SignalingError>,
    ) -> FlowResult {
        match reply {
            Ok(created) => {
                self.assign_session_id(
                    epoch,
                    created.session_id,
                    created.conference_link,
                    AssignmentSource::Directory,
                )
                .await
            }
            Err(e) => {
                warn!("create_session failed: {}", e);
                self.publish(SessionEvent::DeliveryFailed {
                    signal: "create_session",
                    error: e.to_string(),
                });
                Ok(())
            }
        }
    }

    async fn on_signal(&self, epoch: u64, signal: InboundSignal) -> FlowResult {
        trace!("Received {}", signal.name());
        match signal {
            InboundSignal::Offer {
                session_id, sdp, ..
            } => self.on_offer(epoch, session_id, sdp).await,
            InboundSignal::Answer { sdp, session_id } => {
                self.apply_answer(epoch, sdp, session_id).await
            }
            InboundSignal::IceCandidates {
                candidates,
                session_id,
            } => {
                self.apply_remote_candidates(epoch, candidates, session_id)
                    .await
            }
            InboundSignal::SessionCreated {
                session_id,
                conference_link,
                ..
            } => {
                self.assign_session_id(
                    epoch,
                    session_id,
                    conference_link,
                    AssignmentSource::Signaling,
                )
                .await
            }
            InboundSignal::SessionEnded { session_id } => {
                self.remote_ended(&session_id);
                Ok(())
            }
            InboundSignal::ParticipantJoined { participants_count } => {
                self.publish(SessionEvent::RemotePresence {
                    waiting: participants_count.is_some_and(|n| n < 2),
                    participants: participants_count,
                });
                Ok(())
            }
            InboundSignal::ParticipantLeft { participants_count } => {
                self.publish(SessionEvent::RemotePresence {
                    waiting: participants_count.map_or(true, |n| n <= 1),
                    participants: participants_count,
                });
                Ok(())
            }
            InboundSignal::Error { message } => {
                warn!("Signaling error: {}", message);
                self.publish(SessionEvent::RemoteError { message });
                Ok(())
            }
        }
    }

    async fn apply(&self, epoch: u64, input: Input) {
        let result = match input {
            Input::Signal(signal) => self.on_signal(epoch, signal).await,
            Input::Transport(event) => self.on_transport_event(epoch, event).await,
            Input::Directory(reply) => self.on_directory_reply(epoch, reply).await,
        };
        // Errors from the event loop are reported through events
        let _ = self.settle(epoch, result);
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(handle) = self.listener.lock().take() {
            handle.abort();
        }
    }
}

/// Per-session event loop
async fn drive(
    inner: Weak<Inner>,
    epoch: u64,
    mut subscription: Subscription,
    mut transport_rx: mpsc::UnboundedReceiver<TransportEvent>,
    mut directory_rx: mpsc::UnboundedReceiver<Result<CreatedSession, SignalingError>>,
    mut shutdown: oneshot::Receiver<()>,
) {
    trace!("Session {} driver started", epoch);
    loop {
        let input = tokio::select! {
            biased;
            _ = &mut shutdown => break,
            Some(event) = transport_rx.recv() => Input::Transport(event),
            Some(reply) = directory_rx.recv() => Input::Directory(reply),
            signal = subscription.recv() => match signal {
                Some(signal) => Input::Signal(signal),
                None => {
                    debug!("Signaling subscription closed");
                    break;
                }
            },
        };

        let Some(inner) = inner.upgrade() else {
            break;
        };
        if !inner.is_live(epoch) {
            break;
        }
        inner.apply(epoch, input).await;
    }
    trace!("Session {} driver stopped", epoch);
}

/// How long the listener waits before re-subscribing after a refused offer
const LISTEN_RETRY_DELAY: Duration = Duration::from_millis(50);

async fn listen_loop(inner: Weak<Inner>, first: Subscription) {
    let mut next = Some(first);
    loop {
        let mut subscription = match next.take() {
            Some(subscription) => subscription,
            None => match inner.upgrade() {
                Some(inner) => inner.subscribe_conversation(),
                None => return,
            },
        };

        let (strong, session_id, sdp) = loop {
            let (session_id, sdp) = match subscription.recv().await {
                Some(InboundSignal::Offer {
                    session_id, sdp, ..
                }) => (session_id, sdp),
                Some(other) => {
                    trace!("Idle, ignoring {}", other.name());
                    continue;
                }
                None => {
                    debug!("Listener subscription closed");
                    return;
                }
            };
            let Some(strong) = inner.upgrade() else {
                return;
            };
            if strong.is_finished(&session_id) {
                debug!("Replayed offer for finished session {} ignored", session_id);
                continue;
            }
            break (strong, session_id, sdp);
        };

        info!("Incoming offer for session {}", session_id);
        match strong.answer_offer(subscription, sdp, session_id).await {
            Ok(()) => {}
            Err(SessionError::SessionActive(state)) => {
                warn!("Offer refused, session already {}", state);
                drop(strong);
                tokio::time::sleep(LISTEN_RETRY_DELAY).await;
                continue;
            }
            Err(e) => warn!("Answering offer failed: {}", e),
        }

        let mut state_rx = strong.state_tx.subscribe();
        drop(strong);
        if state_rx.wait_for(|s| s.is_terminal()).await.is_err() {
            return;
        }
    }
}
