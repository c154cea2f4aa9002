//! Local media acquisition contract

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::error::MediaError;
use super::types::{MediaKind, MediaTrack};

/// Which local devices a call needs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaConstraints {
    #[serde(default = "default_true")]
    pub audio: bool,
    #[serde(default = "default_true")]
    pub video: bool,
}

fn default_true() -> bool {
    true
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }
}

impl MediaConstraints {
    /// Track kinds requested by these constraints
    pub fn kinds(&self) -> Vec<MediaKind> {
        let mut kinds = Vec::with_capacity(2);
        if self.audio {
            kinds.push(MediaKind::Audio);
        }
        if self.video {
            kinds.push(MediaKind::Video);
        }
        kinds
    }
}

/// Captured local media owned by one session
pub trait LocalMedia: Send + Sync {
    fn tracks(&self) -> Vec<MediaTrack>;

    /// Enable or disable every track of `kind`. Returns false if there is none.
    fn set_enabled(&self, kind: MediaKind, enabled: bool) -> bool;

    /// Stop capturing. Called exactly once.
    fn stop(&self);
}

/// Acquires local media (camera, microphone)
#[async_trait]
pub trait MediaSource: Send + Sync {
    async fn acquire(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<Box<dyn LocalMedia>, MediaError>;
}
