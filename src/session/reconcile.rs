//! First-writer-wins reconciliation for values reported by several sources

use std::fmt;

/// Where an assigned value came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignmentSource {
    /// Companion `create_session` reply
    Directory,
    /// `session_created` push on the signaling channel
    Signaling,
    /// Carried by the remote offer
    Offer,
    /// Taken from a shared conference link
    Link,
}

impl fmt::Display for AssignmentSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Directory => write!(f, "directory"),
            Self::Signaling => write!(f, "signaling"),
            Self::Offer => write!(f, "offer"),
            Self::Link => write!(f, "conference link"),
        }
    }
}

/// Outcome of offering a value to a [`FirstWriterWins`] slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reconciliation<T> {
    /// First assignment; the slot now holds the offered value
    Accepted,
    /// Same value as already held
    Unchanged,
    /// A different value was offered; the first one is kept
    Conflict { kept: T },
}

/// A slot that goes from unset to one stable value exactly once
#[derive(Debug, Clone)]
pub struct FirstWriterWins<T> {
    value: Option<T>,
}

impl<T> Default for FirstWriterWins<T> {
    fn default() -> Self {
        Self { value: None }
    }
}

impl<T: Clone + PartialEq> FirstWriterWins<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Slot that starts out assigned
    pub fn assigned(value: T) -> Self {
        Self { value: Some(value) }
    }

    pub fn get(&self) -> Option<&T> {
        self.value.as_ref()
    }

    /// Offer a value; only the first offer is ever applied
    pub fn offer(&mut self, value: T) -> Reconciliation<T> {
        match &self.value {
            None => {
                self.value = Some(value);
                Reconciliation::Accepted
            }
            Some(held) if *held == value => Reconciliation::Unchanged,
            Some(held) => Reconciliation::Conflict { kept: held.clone() },
        }
    }
}
