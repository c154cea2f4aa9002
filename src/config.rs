//! Call configuration
//!
//! TOML-based settings for the orchestrator and the CLI. When no explicit
//! path is given, the file is read from the platform config directory:
//! - Linux: ~/.config/callsession/config.toml
//! - Windows: %APPDATA%\callsession\config.toml
//! - macOS: ~/Library/Application Support/callsession/config.toml

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::signaling::SessionType;
use crate::transport::{MediaConstraints, TransportConfig};

/// Application name used for configuration directory
const APP_NAME: &str = "callsession";

/// Default signaling server
pub const DEFAULT_SIGNALING_URL: &str = "ws://127.0.0.1:8080/signaling";

/// Default STUN server
pub const DEFAULT_ICE_SERVER: &str = "stun:stun.l.google.com:19302";

const DEFAULT_SIGNALING_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_EVENT_CAPACITY: usize = 64;

/// Settings for one call orchestrator
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CallConfig {
    /// WebSocket URL of the signaling server
    #[serde(default = "default_signaling_url")]
    pub signaling_url: String,

    /// Media carried by calls this client starts
    #[serde(default)]
    pub session_type: SessionType,

    /// Local devices to capture
    #[serde(default)]
    pub media: MediaConstraints,

    /// STUN/TURN servers handed to the transport
    #[serde(default = "default_ice_servers")]
    pub ice_servers: Vec<String>,

    /// Ask the server for a shareable conference link when starting a call
    #[serde(default = "default_true")]
    pub request_conference_link: bool,

    /// Announce presence in the conversation before publishing SDP
    #[serde(default = "default_true")]
    pub join_conversation: bool,

    /// Upper bound for a single signaling send or request
    #[serde(default = "default_signaling_timeout_ms")]
    pub signaling_timeout_ms: u64,

    /// Capacity of the session event broadcast channel
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

fn default_signaling_url() -> String {
    DEFAULT_SIGNALING_URL.to_string()
}

fn default_ice_servers() -> Vec<String> {
    vec![DEFAULT_ICE_SERVER.to_string()]
}

fn default_true() -> bool {
    true
}

fn default_signaling_timeout_ms() -> u64 {
    DEFAULT_SIGNALING_TIMEOUT_MS
}

fn default_event_capacity() -> usize {
    DEFAULT_EVENT_CAPACITY
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            signaling_url: default_signaling_url(),
            session_type: SessionType::default(),
            media: MediaConstraints::default(),
            ice_servers: default_ice_servers(),
            request_conference_link: true,
            join_conversation: true,
            signaling_timeout_ms: DEFAULT_SIGNALING_TIMEOUT_MS,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl CallConfig {
    /// Validate the configuration values
    ///
    /// Returns an error message if any value is invalid.
    pub fn validate(&self) -> Result<(), String> {
        if !self.signaling_url.starts_with("ws://") && !self.signaling_url.starts_with("wss://") {
            return Err(format!(
                "Invalid signaling server URL: {}. Must start with ws:// or wss://",
                self.signaling_url
            ));
        }

        if self.ice_servers.is_empty() {
            return Err("At least one ICE server is required".to_string());
        }
        for server in &self.ice_servers {
            if !server.starts_with("stun:") && !server.starts_with("turn:") {
                return Err(format!(
                    "Invalid ICE server: {}. Must start with stun: or turn:",
                    server
                ));
            }
        }

        if self.signaling_timeout_ms == 0 {
            return Err("signaling_timeout_ms must be greater than zero".to_string());
        }
        if self.event_capacity == 0 {
            return Err("event_capacity must be greater than zero".to_string());
        }

        Ok(())
    }

    /// Timeout applied to each signaling send
    pub fn signaling_timeout(&self) -> Duration {
        Duration::from_millis(self.signaling_timeout_ms)
    }

    /// Parameters for creating a session's transport
    pub fn transport_config(&self) -> TransportConfig {
        TransportConfig {
            ice_servers: self.ice_servers.clone(),
        }
    }

    /// Parse and validate a TOML document
    pub fn from_toml(content: &str) -> Result<Self, String> {
        let config: CallConfig =
            toml::from_str(content).map_err(|e| format!("Failed to parse config file: {}", e))?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize to TOML
    pub fn to_toml(&self) -> Result<String, String> {
        toml::to_string_pretty(self).map_err(|e| format!("Failed to serialize config: {}", e))
    }

    /// Load configuration from an explicit file
    pub fn load(path: &Path) -> Result<Self, String> {
        let content = fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config file at {:?}: {}", path, e))?;
        Self::from_toml(&content)
    }

    /// Load from the platform config file, falling back to defaults if it is missing
    ///
    /// A file that exists but does not parse or validate is still an error.
    pub fn load_or_default() -> Result<Self, String> {
        match get_config_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }
}

/// Get the configuration file path
///
/// Returns None if the configuration directory cannot be determined.
pub fn get_config_path() -> Option<PathBuf> {
    ProjectDirs::from("", "", APP_NAME).map(|dirs| dirs.config_dir().join("config.toml"))
}
