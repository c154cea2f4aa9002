//! Signaling channel contract and scoped subscriptions

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::trace;

use super::error::SignalingError;
use super::message::{
    ConversationId, CreateSessionRequest, CreatedSession, InboundSignal, OutboundSignal,
};

/// Bidirectional, asynchronous signaling transport
///
/// Delivery is at-least-once with no ordering guarantee across unrelated
/// messages.
#[async_trait]
pub trait SignalingChannel: Send + Sync {
    /// Publish a message. Errors are reported, never retried.
    async fn send(&self, signal: OutboundSignal) -> Result<(), SignalingError>;

    /// Start receiving inbound signals for a conversation. The subscription
    /// unregisters itself when dropped.
    fn subscribe(&self, conversation_id: &ConversationId) -> Subscription;
}

/// Request/response companion to the signaling channel
#[async_trait]
pub trait SessionDirectory: Send + Sync {
    async fn create_session(
        &self,
        request: CreateSessionRequest,
    ) -> Result<CreatedSession, SignalingError>;
}

struct Subscriber {
    conversation_id: ConversationId,
    tx: mpsc::UnboundedSender<InboundSignal>,
}

#[derive(Default)]
struct SubscriberMap {
    next_id: u64,
    entries: HashMap<u64, Subscriber>,
}

/// Live subscriptions of one channel implementation
#[derive(Clone, Default)]
pub struct SubscriberSet {
    inner: Arc<Mutex<SubscriberMap>>,
}

impl SubscriberSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, conversation_id: &ConversationId) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut map = self.inner.lock();
        let id = map.next_id;
        map.next_id += 1;
        map.entries.insert(
            id,
            Subscriber {
                conversation_id: conversation_id.clone(),
                tx,
            },
        );
        trace!("Subscription {} opened for conversation {}", id, conversation_id);

        Subscription {
            id,
            conversation_id: conversation_id.clone(),
            rx,
            owner: Arc::downgrade(&self.inner),
        }
    }

    /// Deliver a signal to every matching subscription
    ///
    /// Signals naming a conversation only reach subscriptions for that
    /// conversation; the rest reach everyone. Returns the delivery count.
    pub fn publish(&self, signal: &InboundSignal) -> usize {
        let mut map = self.inner.lock();
        map.entries.retain(|_, s| !s.tx.is_closed());

        let target = signal.conversation_id();
        let mut delivered = 0;
        for subscriber in map.entries.values() {
            if target.is_some_and(|c| *c != subscriber.conversation_id) {
                continue;
            }
            if subscriber.tx.send(signal.clone()).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    /// Drop every subscription's sender so pending `recv` calls return `None`
    pub fn close_all(&self) {
        self.inner.lock().entries.clear();
    }

    /// Number of live subscriptions
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Inbound signals for one conversation, scoped to the holder's lifetime
pub struct Subscription {
    id: u64,
    conversation_id: ConversationId,
    rx: mpsc::UnboundedReceiver<InboundSignal>,
    owner: Weak<Mutex<SubscriberMap>>,
}

impl Subscription {
    /// Next inbound signal, or `None` once the channel is gone
    pub async fn recv(&mut self) -> Option<InboundSignal> {
        self.rx.recv().await
    }

    pub fn conversation_id(&self) -> &ConversationId {
        &self.conversation_id
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(owner) = self.owner.upgrade() {
            owner.lock().entries.remove(&self.id);
            trace!("Subscription {} closed", self.id);
        }
    }
}
