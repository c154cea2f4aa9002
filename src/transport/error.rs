//! Transport and media error types

use thiserror::Error;

/// Errors reported by a peer transport
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Transport creation failed: {0}")]
    CreateFailed(String),

    #[error("Invalid session description: {0}")]
    InvalidDescription(String),

    #[error("Operation out of sequence: {0}")]
    InvalidState(String),

    #[error("Candidate rejected: {0}")]
    CandidateRejected(String),

    #[error("Connection failed")]
    ConnectionFailed,

    #[error("Transport closed")]
    Closed,
}

/// Errors that can occur while acquiring local media
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    #[error("Permission denied")]
    PermissionDenied,

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Device unavailable: {0}")]
    Unavailable(String),
}
