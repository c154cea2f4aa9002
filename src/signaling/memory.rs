//! In-process signaling relay pairing two endpoints
//!
//! Each outbound signal from one endpoint is turned into the inbound
//! signal the other endpoint expects. Session ids are allocated per
//! conversation, shared between `create_session` replies and the
//! `session_created` push that follows an offer. Guests admitted with a
//! conference code can ask for the stored offer and the candidates sent
//! with it.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use tracing::{debug, trace};
use uuid::Uuid;

use super::channel::{SessionDirectory, SignalingChannel, SubscriberSet, Subscription};
use super::error::SignalingError;
use super::message::{
    ConversationId, CreateSessionRequest, CreatedSession, InboundSignal, OutboundSignal,
    SessionId,
};
use crate::transport::IceCandidate;

#[derive(Debug, Clone)]
struct Allocation {
    session_id: SessionId,
    conference_link: String,
    code: String,
    /// Latest offer, replayed to guests joining by link
    offer: Option<String>,
    /// Candidates sent by each side, replayed with the offer
    candidates: [Vec<IceCandidate>; 2],
    /// Sides admitted with the join code
    admitted: HashSet<usize>,
}

#[derive(Default)]
struct Relay {
    sessions: HashMap<ConversationId, Allocation>,
    joined: HashMap<ConversationId, HashSet<usize>>,
}

impl Relay {
    fn allocate(&mut self, conversation_id: &ConversationId) -> &mut Allocation {
        self.sessions
            .entry(conversation_id.clone())
            .or_insert_with(|| {
                let session_id = SessionId::new(Uuid::new_v4().to_string());
                let code = format!("{:06}", rand::thread_rng().gen_range(0..1_000_000));
                let conference_link =
                    format!("https://conference.local/join/{}?code={}", session_id, code);
                debug!(
                    "Relay allocated session {} for conversation {}",
                    session_id, conversation_id
                );
                Allocation {
                    session_id,
                    conference_link,
                    code,
                    offer: None,
                    candidates: Default::default(),
                    admitted: HashSet::new(),
                }
            })
    }

    fn find(&mut self, session_id: &SessionId) -> Option<(&ConversationId, &mut Allocation)> {
        self.sessions
            .iter_mut()
            .find(|(_, a)| a.session_id == *session_id)
    }

    fn release(&mut self, session_id: &SessionId) {
        self.sessions.retain(|_, a| a.session_id != *session_id);
    }

    /// Count a side as present in a conversation
    fn join(&mut self, conversation_id: ConversationId, side: usize) -> u32 {
        let joined = self.joined.entry(conversation_id).or_default();
        joined.insert(side);
        joined.len() as u32
    }
}

struct Shared {
    relay: Mutex<Relay>,
    endpoints: [SubscriberSet; 2],
    sent: [Mutex<Vec<OutboundSignal>>; 2],
    offline: [AtomicBool; 2],
}

/// One side of an in-process signaling pair
#[derive(Clone)]
pub struct MemorySignaling {
    shared: Arc<Shared>,
    side: usize,
}

impl MemorySignaling {
    /// Create two connected endpoints
    pub fn pair() -> (Self, Self) {
        let shared = Arc::new(Shared {
            relay: Mutex::new(Relay::default()),
            endpoints: [SubscriberSet::new(), SubscriberSet::new()],
            sent: [Mutex::new(Vec::new()), Mutex::new(Vec::new())],
            offline: [AtomicBool::new(false), AtomicBool::new(false)],
        });
        (
            Self {
                shared: shared.clone(),
                side: 0,
            },
            Self { shared, side: 1 },
        )
    }

    /// Everything this endpoint published, in order
    pub fn sent(&self) -> Vec<OutboundSignal> {
        self.shared.sent[self.side].lock().clone()
    }

    /// Deliver a signal directly to this endpoint's subscribers
    pub fn inject(&self, signal: InboundSignal) -> usize {
        self.shared.endpoints[self.side].publish(&signal)
    }

    /// Make this endpoint's sends fail until set back
    pub fn set_offline(&self, offline: bool) {
        self.shared.offline[self.side].store(offline, Ordering::SeqCst);
    }

    /// Live subscriptions on this endpoint
    pub fn subscription_count(&self) -> usize {
        self.shared.endpoints[self.side].len()
    }

    fn peer(&self) -> &SubscriberSet {
        &self.shared.endpoints[1 - self.side]
    }

    fn local(&self) -> &SubscriberSet {
        &self.shared.endpoints[self.side]
    }

    fn relay(&self, signal: &OutboundSignal) {
        match signal.clone() {
            OutboundSignal::Offer {
                conversation_id,
                sdp,
                ..
            } => {
                let (session_id, conference_link) = {
                    let mut relay = self.shared.relay.lock();
                    let allocation = relay.allocate(&conversation_id);
                    allocation.offer = Some(sdp.clone());
                    (
                        allocation.session_id.clone(),
                        allocation.conference_link.clone(),
                    )
                };
                self.local().publish(&InboundSignal::SessionCreated {
                    session_id: session_id.clone(),
                    conference_link: Some(conference_link),
                    conversation_id: Some(conversation_id.clone()),
                });
                self.peer().publish(&InboundSignal::Offer {
                    session_id,
                    sdp,
                    conversation_id: Some(conversation_id),
                });
            }
            OutboundSignal::Answer { session_id, sdp } => {
                self.peer().publish(&InboundSignal::Answer {
                    sdp,
                    session_id: Some(session_id),
                });
            }
            OutboundSignal::IceCandidates {
                session_id,
                candidates,
            } => {
                if let Some((_, allocation)) = self.shared.relay.lock().find(&session_id) {
                    allocation.candidates[self.side].extend(candidates.iter().cloned());
                }
                self.peer().publish(&InboundSignal::IceCandidates {
                    candidates,
                    session_id: Some(session_id),
                });
            }
            OutboundSignal::EndSession { session_id } => {
                self.shared.relay.lock().release(&session_id);
                self.peer()
                    .publish(&InboundSignal::SessionEnded { session_id });
            }
            OutboundSignal::JoinConversation { conversation_id } => {
                let count = self.shared.relay.lock().join(conversation_id, self.side);
                self.peer().publish(&InboundSignal::ParticipantJoined {
                    participants_count: Some(count),
                });
            }
            OutboundSignal::JoinConference { session_id, code } => {
                let admitted = {
                    let mut relay = self.shared.relay.lock();
                    let conversation_id = match relay.find(&session_id) {
                        Some((conversation_id, allocation)) if allocation.code == code => {
                            allocation.admitted.insert(self.side);
                            Some(conversation_id.clone())
                        }
                        _ => None,
                    };
                    conversation_id.map(|c| relay.join(c, self.side))
                };
                match admitted {
                    Some(count) => {
                        debug!("Relay admitted side {} to session {}", self.side, session_id);
                        self.peer().publish(&InboundSignal::ParticipantJoined {
                            participants_count: Some(count),
                        });
                    }
                    None => self.reject(format!("invalid conference code for {}", session_id)),
                }
            }
            OutboundSignal::RequestOffer { session_id } => {
                let stored = {
                    let mut relay = self.shared.relay.lock();
                    relay
                        .find(&session_id)
                        .filter(|(_, a)| a.admitted.contains(&self.side))
                        .and_then(|(_, a)| {
                            let offer = a.offer.clone()?;
                            Some((offer, a.candidates[1 - self.side].clone()))
                        })
                };
                let Some((sdp, candidates)) = stored else {
                    self.reject(format!("no offer available for {}", session_id));
                    return;
                };
                // Guests may not know the conversation, so replay unaddressed
                self.local().publish(&InboundSignal::Offer {
                    session_id: session_id.clone(),
                    sdp,
                    conversation_id: None,
                });
                if !candidates.is_empty() {
                    self.local().publish(&InboundSignal::IceCandidates {
                        candidates,
                        session_id: Some(session_id),
                    });
                }
            }
        }
    }

    fn reject(&self, message: String) {
        debug!("Relay rejected side {}: {}", self.side, message);
        self.local().publish(&InboundSignal::Error { message });
    }
}

#[async_trait]
impl SignalingChannel for MemorySignaling {
    async fn send(&self, signal: OutboundSignal) -> Result<(), SignalingError> {
        if self.shared.offline[self.side].load(Ordering::SeqCst) {
            return Err(SignalingError::SendFailed("relay offline".to_string()));
        }

        trace!("Relay side {} sent {}", self.side, signal.name());
        self.shared.sent[self.side].lock().push(signal.clone());
        self.relay(&signal);
        Ok(())
    }

    fn subscribe(&self, conversation_id: &ConversationId) -> Subscription {
        self.local().subscribe(conversation_id)
    }
}

#[async_trait]
impl SessionDirectory for MemorySignaling {
    async fn create_session(
        &self,
        request: CreateSessionRequest,
    ) -> Result<CreatedSession, SignalingError> {
        if self.shared.offline[self.side].load(Ordering::SeqCst) {
            return Err(SignalingError::SendFailed("relay offline".to_string()));
        }

        let allocation = self
            .shared
            .relay
            .lock()
            .allocate(&request.conversation_id)
            .clone();
        Ok(CreatedSession {
            session_id: allocation.session_id,
            conference_link: request.generate_link.then_some(allocation.conference_link),
        })
    }
}
