//! Scripted collaborators shared by the integration tests

#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, Notify};

use async_trait::async_trait;
use callsession::config::CallConfig;
use callsession::session::{Collaborators, SessionEvent, SessionOrchestrator, SessionState};
use callsession::signaling::{
    ConversationId, CreateSessionRequest, CreatedSession, InboundSignal, OutboundSignal,
    SessionDirectory, SessionId, SignalingChannel, SignalingError, SubscriberSet, Subscription,
};
use callsession::transport::{IceCandidate, LoopbackFactory, StaticMediaSource};

pub const CONVERSATION: &str = "conv-1";

/// Signaling channel that records everything sent and lets the test push inbound signals
#[derive(Default)]
pub struct RecordingSignaling {
    subscribers: SubscriberSet,
    sent: Mutex<Vec<OutboundSignal>>,
}

impl RecordingSignaling {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn sent(&self) -> Vec<OutboundSignal> {
        self.sent.lock().clone()
    }

    /// Sent messages of one kind, by wire name
    pub fn sent_named(&self, name: &str) -> Vec<OutboundSignal> {
        self.sent().into_iter().filter(|s| s.name() == name).collect()
    }

    pub fn push(&self, signal: InboundSignal) -> usize {
        self.subscribers.publish(&signal)
    }

    pub fn subscription_count(&self) -> usize {
        self.subscribers.len()
    }
}

#[async_trait]
impl SignalingChannel for RecordingSignaling {
    async fn send(&self, signal: OutboundSignal) -> Result<(), SignalingError> {
        self.sent.lock().push(signal);
        Ok(())
    }

    fn subscribe(&self, conversation_id: &ConversationId) -> Subscription {
        self.subscribers.subscribe(conversation_id)
    }
}

/// `create_session` that answers only when the test releases a reply
#[derive(Default)]
pub struct GatedDirectory {
    requests: Mutex<Vec<CreateSessionRequest>>,
    reply: Mutex<Option<CreatedSession>>,
    released: Notify,
}

impl GatedDirectory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn requests(&self) -> Vec<CreateSessionRequest> {
        self.requests.lock().clone()
    }

    /// Let the pending (or next) request complete with `id` and `link`
    pub fn release(&self, id: &str, link: Option<&str>) {
        *self.reply.lock() = Some(CreatedSession {
            session_id: SessionId::new(id),
            conference_link: link.map(str::to_string),
        });
        self.released.notify_one();
    }
}

#[async_trait]
impl SessionDirectory for GatedDirectory {
    async fn create_session(
        &self,
        request: CreateSessionRequest,
    ) -> Result<CreatedSession, SignalingError> {
        self.requests.lock().push(request);
        loop {
            self.released.notified().await;
            if let Some(reply) = self.reply.lock().take() {
                return Ok(reply);
            }
        }
    }
}

/// An orchestrator wired to scripted collaborators
pub struct Harness {
    pub orchestrator: SessionOrchestrator,
    pub signaling: Arc<RecordingSignaling>,
    pub transports: Arc<LoopbackFactory>,
    pub media: Arc<StaticMediaSource>,
    pub events: broadcast::Receiver<SessionEvent>,
}

/// Config without the conversation join so the sent log only holds SDP traffic
pub fn quiet_config() -> CallConfig {
    CallConfig {
        join_conversation: false,
        ..Default::default()
    }
}

impl Harness {
    pub fn new(candidates: usize) -> Self {
        Self::with_media(candidates, StaticMediaSource::new(), quiet_config())
    }

    pub fn with_media(candidates: usize, media: StaticMediaSource, config: CallConfig) -> Self {
        Self::build(candidates, media, config, None)
    }

    /// Harness whose initiator also asks `directory` for the session
    pub fn with_directory(candidates: usize, directory: Arc<GatedDirectory>) -> Self {
        Self::build(
            candidates,
            StaticMediaSource::new(),
            quiet_config(),
            Some(directory),
        )
    }

    fn build(
        candidates: usize,
        media: StaticMediaSource,
        config: CallConfig,
        directory: Option<Arc<GatedDirectory>>,
    ) -> Self {
        let signaling = RecordingSignaling::new();
        let transports = Arc::new(LoopbackFactory::new(candidates));
        let media = Arc::new(media);
        let orchestrator = SessionOrchestrator::new(
            ConversationId::new(CONVERSATION),
            config,
            Collaborators {
                signaling: signaling.clone(),
                directory: directory.map(|d| d as Arc<dyn SessionDirectory>),
                transports: transports.clone(),
                media: media.clone(),
            },
        );
        let events = orchestrator.subscribe();
        Self {
            orchestrator,
            signaling,
            transports,
            media,
            events,
        }
    }

    /// Wait until the orchestrator reports `state`
    pub async fn wait_state(&self, state: SessionState) {
        let mut rx = self.orchestrator.watch_state();
        tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|s| *s == state))
            .await
            .expect("Timed out waiting for state")
            .expect("State channel closed");
    }

    /// Drain events received so far
    pub fn drain_events(&mut self) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }
}

/// Poll `condition` until it holds or two seconds pass
pub async fn eventually<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !condition().await {
        assert!(
            tokio::time::Instant::now() < deadline,
            "Condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Let spawned tasks run for a moment
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

pub fn remote_candidate(n: u32) -> IceCandidate {
    IceCandidate::new(format!(
        "candidate:{} 1 udp 2122260223 192.168.1.{} 5{:04} typ host",
        n, n, n
    ))
}

/// A remote description the loopback transport accepts
pub fn remote_sdp() -> String {
    "v=0\r\no=- 1 2 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n".to_string()
}
