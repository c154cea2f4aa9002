//! Holding area for local candidates produced before the session id is known

use crate::transport::IceCandidate;

/// FIFO of local candidates owned by one session
#[derive(Debug, Default)]
pub struct CandidateBuffer {
    candidates: Vec<IceCandidate>,
}

impl CandidateBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a candidate behind those already buffered
    pub fn append(&mut self, candidate: IceCandidate) {
        self.candidates.push(candidate);
    }

    /// Take every buffered candidate in generation order, leaving the buffer empty
    pub fn drain(&mut self) -> Vec<IceCandidate> {
        std::mem::take(&mut self.candidates)
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }
}
