//! Configuration resolution for peerlink.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (`$XDG_CONFIG_HOME/peerlink/settings.json`)
//! 3. Explicit config file (e.g. `--config`)
//! 4. Environment variables (highest priority)
//!
//! Files are merged key by key, so a file only needs to mention the
//! settings it changes.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

/// Complete peerlink configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct Config {
    #[serde(default)]
    pub signaling: SignalingConfig,
    #[serde(default)]
    pub negotiation: NegotiationConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub pairing: PairingConfig,
}

/// Relay connection settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SignalingConfig {
    /// Relay base URL; the link id is appended as a path segment.
    pub base_url: String,
    /// How long to wait for the relay to acknowledge a sent primitive.
    pub ack_timeout_secs: u64,
    /// Interval between websocket pings.
    pub keepalive_interval_secs: u64,
    /// Number of events each feed keeps for late subscribers.
    pub feed_history: usize,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            base_url: "wss://signaling-server.radixdlt.com".to_string(),
            ack_timeout_secs: 10,
            keepalive_interval_secs: 30,
            feed_history: 64,
        }
    }
}

impl SignalingConfig {
    pub const fn ack_timeout(&self) -> Duration {
        Duration::from_secs(self.ack_timeout_secs)
    }

    pub const fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs)
    }
}

/// Peer negotiation settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct NegotiationConfig {
    /// Upper bound for one negotiation, from trigger to open channel.
    pub connect_timeout_secs: u64,
    pub ice_servers: Vec<String>,
    /// Capacity of the engine notification queue per peer connection.
    pub event_buffer: usize,
}

impl Default for NegotiationConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 30,
            ice_servers: vec![
                "stun:stun.l.google.com:19302".to_string(),
                "stun:stun1.l.google.com:19302".to_string(),
                "stun:stun2.l.google.com:19302".to_string(),
                "stun:stun3.l.google.com:19302".to_string(),
                "stun:stun4.l.google.com:19302".to_string(),
            ],
            event_buffer: 64,
        }
    }
}

impl NegotiationConfig {
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// Data channel framing settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TransportConfig {
    /// Maximum number of message bytes carried by one chunk.
    pub chunk_size: usize,
    pub receipt_timeout_secs: u64,
    /// Capacity of each connection's reassembled-message queue.
    pub inbound_buffer: usize,
    /// Largest message a peer may announce; bigger metadata is rejected.
    pub max_message_bytes: usize,
    /// Partially received messages kept per connection at once.
    pub max_pending_messages: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            chunk_size: 15_441,
            receipt_timeout_secs: 10,
            inbound_buffer: 256,
            max_message_bytes: 16 * 1024 * 1024,
            max_pending_messages: 32,
        }
    }
}

impl TransportConfig {
    pub const fn receipt_timeout(&self) -> Duration {
        Duration::from_secs(self.receipt_timeout_secs)
    }
}

/// Where the agent finds its pairing records.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(default)]
pub struct PairingConfig {
    pub links_path: Option<PathBuf>,
}

impl Config {
    /// Reject settings that cannot work at runtime.
    pub fn validate(&self) -> Result<()> {
        if self.transport.chunk_size == 0 {
            return Err(Error::Config("transport.chunk_size must be positive".into()));
        }
        if self.transport.max_message_bytes == 0 || self.transport.max_pending_messages == 0 {
            return Err(Error::Config(
                "transport message and pending limits must be positive".into(),
            ));
        }
        if self.transport.inbound_buffer == 0 || self.negotiation.event_buffer == 0 {
            return Err(Error::Config("channel buffers must be positive".into()));
        }
        if self.signaling.feed_history == 0 {
            return Err(Error::Config("signaling.feed_history must be positive".into()));
        }
        if !(self.signaling.base_url.starts_with("ws://")
            || self.signaling.base_url.starts_with("wss://"))
        {
            return Err(Error::Config(format!(
                "signaling.base_url must be a ws:// or wss:// URL, got {}",
                self.signaling.base_url
            )));
        }
        Ok(())
    }
}

/// Load configuration with hierarchical resolution.
pub fn load_config(explicit: Option<&Path>) -> Result<Config> {
    let mut layers = Vec::new();
    if let Some(global) = global_config_path()
        && global.exists()
    {
        layers.push(global);
    }
    if let Some(path) = explicit {
        layers.push(path.to_path_buf());
    }

    let mut config = load_layers(&layers)?;
    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    config.validate()?;
    Ok(config)
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("peerlink").join("settings.json"))
}

fn load_layers(paths: &[PathBuf]) -> Result<Config> {
    let mut merged = serde_json::to_value(Config::default())?;
    for path in paths {
        merge_values(&mut merged, load_config_file(path)?);
    }
    serde_json::from_value(merged)
        .map_err(|e| Error::Config(format!("Invalid configuration: {e}")))
}

fn load_config_file(path: &Path) -> Result<Value> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

fn merge_values(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => merge_values(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

fn apply_env_overrides(config: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(val) = lookup("PEERLINK_SIGNALING_URL") {
        config.signaling.base_url = val;
    }
    if let Some(n) = lookup("PEERLINK_ACK_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
        config.signaling.ack_timeout_secs = n;
    }
    if let Some(n) = lookup("PEERLINK_CONNECT_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
        config.negotiation.connect_timeout_secs = n;
    }
    if let Some(n) = lookup("PEERLINK_CHUNK_SIZE").and_then(|v| v.parse().ok()) {
        config.transport.chunk_size = n;
    }
}
