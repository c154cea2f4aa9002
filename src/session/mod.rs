//! Call session lifecycle
//!
//! Establishes, negotiates and tears down a peer transport between two
//! parties over an unordered signaling channel.

mod candidate_buffer;
mod conference_link;
mod error;
mod events;
mod orchestrator;
mod reconcile;
mod resources;
mod state;

pub use candidate_buffer::CandidateBuffer;
pub use conference_link::{parse_conference_link, ConferenceLinkResolver};
pub use error::SessionError;
pub use events::SessionEvent;
pub use orchestrator::{Collaborators, SessionOrchestrator};
pub use reconcile::{AssignmentSource, FirstWriterWins, Reconciliation};
pub use resources::{MediaGuard, SessionResources, TransportGuard};
pub use state::{Role, SessionState};
