//! Signaling message types

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::transport::IceCandidate;

/// Opaque identifier of one call attempt, authoritative once assigned
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for SessionId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Identifier of the conversation a call belongs to
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(String);

impl ConversationId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConversationId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Media carried by a call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionType {
    #[default]
    AudioVideo,
    Audio,
}

impl fmt::Display for SessionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AudioVideo => write!(f, "audio_video"),
            Self::Audio => write!(f, "audio"),
        }
    }
}

/// Messages the client publishes on the signaling channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum OutboundSignal {
    Offer {
        conversation_id: ConversationId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<SessionId>,
        sdp: String,
        session_type: SessionType,
    },
    Answer {
        session_id: SessionId,
        sdp: String,
    },
    IceCandidates {
        session_id: SessionId,
        candidates: Vec<IceCandidate>,
    },
    EndSession {
        session_id: SessionId,
    },
    JoinConversation {
        conversation_id: ConversationId,
    },
    /// Guest admission through a shared conference link
    JoinConference {
        session_id: SessionId,
        code: String,
    },
    /// Ask for the stored offer of a session joined by link
    RequestOffer {
        session_id: SessionId,
    },
}

impl OutboundSignal {
    /// Wire name of the message
    pub fn name(&self) -> &'static str {
        match self {
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::IceCandidates { .. } => "ice_candidates",
            Self::EndSession { .. } => "end_session",
            Self::JoinConversation { .. } => "join_conversation",
            Self::JoinConference { .. } => "join_conference",
            Self::RequestOffer { .. } => "request_offer",
        }
    }
}

/// Events pushed to the client by the signaling channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum InboundSignal {
    Offer {
        session_id: SessionId,
        sdp: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        conversation_id: Option<ConversationId>,
    },
    Answer {
        sdp: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<SessionId>,
    },
    IceCandidates {
        candidates: Vec<IceCandidate>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<SessionId>,
    },
    SessionCreated {
        session_id: SessionId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        conference_link: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        conversation_id: Option<ConversationId>,
    },
    SessionEnded {
        session_id: SessionId,
    },
    ParticipantJoined {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        participants_count: Option<u32>,
    },
    ParticipantLeft {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        participants_count: Option<u32>,
    },
    Error {
        message: String,
    },
}

impl InboundSignal {
    /// Wire name of the message
    pub fn name(&self) -> &'static str {
        match self {
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::IceCandidates { .. } => "ice_candidates",
            Self::SessionCreated { .. } => "session_created",
            Self::SessionEnded { .. } => "session_ended",
            Self::ParticipantJoined { .. } => "participant_joined",
            Self::ParticipantLeft { .. } => "participant_left",
            Self::Error { .. } => "error",
        }
    }

    /// Conversation the message is addressed to, when the sender named one
    pub fn conversation_id(&self) -> Option<&ConversationId> {
        match self {
            Self::Offer {
                conversation_id, ..
            }
            | Self::SessionCreated {
                conversation_id, ..
            } => conversation_id.as_ref(),
            _ => None,
        }
    }
}

/// Companion request creating a session on the server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateSessionRequest {
    pub conversation_id: ConversationId,
    pub session_type: SessionType,
    /// Ask the server for a shareable conference link
    #[serde(default)]
    pub generate_link: bool,
}

/// Reply to [`CreateSessionRequest`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatedSession {
    pub session_id: SessionId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conference_link: Option<String>,
}
