//! Identifiers and negotiation primitives shared across the crate.

use std::fmt;
use std::sync::Arc;

use peerlink_crypto::LinkSecret;
use serde::{Deserialize, Serialize};

/// Opaque identifier of one remote counterpart, as assigned by the relay.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(Arc<str>);

impl PeerId {
    pub fn new(id: impl Into<Arc<str>>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for PeerId {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

/// Identifier of one registered pairing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LinkId(Arc<str>);

impl LinkId {
    pub fn new(id: impl Into<Arc<str>>) -> Self {
        Self(id.into())
    }

    /// The id the relay derives for a secret: hex SHA-256 of its bytes.
    pub fn from_secret(secret: &LinkSecret) -> Self {
        Self::new(secret.channel_id())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for LinkId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Identifier of one outbound signaling request awaiting its acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Whether a session description is an offer or an answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpKind {
    Offer,
    Answer,
}

impl fmt::Display for SdpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Offer => f.write_str("offer"),
            Self::Answer => f.write_str("answer"),
        }
    }
}

/// Session description payload, `{"sdp": ...}` on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionDescription {
    pub sdp: String,
}

impl SessionDescription {
    pub fn new(sdp: impl Into<String>) -> Self {
        Self { sdp: sdp.into() }
    }
}

/// ICE candidate payload.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex")]
    pub sdp_m_line_index: Option<u16>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>, sdp_mid: Option<&str>, index: Option<u16>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: sdp_mid.map(str::to_string),
            sdp_m_line_index: index,
        }
    }
}

/// Unit exchanged with a remote peer during negotiation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Primitive {
    Offer(SessionDescription),
    Answer(SessionDescription),
    Candidate(IceCandidate),
}

impl Primitive {
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Offer(_) => "offer",
            Self::Answer(_) => "answer",
            Self::Candidate(_) => "candidate",
        }
    }
}

/// Relay-reported presence change for a remote peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerConnectivity {
    /// The peer joined the channel after us.
    JustConnected,
    /// The peer was already on the channel when we joined.
    AlreadyConnected,
    Disconnected,
}

impl PeerConnectivity {
    pub const fn is_connected(self) -> bool {
        !matches!(self, Self::Disconnected)
    }
}

/// Which side starts negotiation on this link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkRole {
    /// Wait for the remote peer's offer.
    #[default]
    Responder,
    /// Send an offer as soon as the relay reports the peer present.
    Initiator,
}

/// Pairing record describing one link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkDescriptor {
    /// Defaults to the hex SHA-256 of the secret when omitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<LinkId>,
    pub secret: LinkSecret,
    #[serde(default)]
    pub role: LinkRole,
}

impl LinkDescriptor {
    pub const fn new(secret: LinkSecret) -> Self {
        Self {
            id: None,
            secret,
            role: LinkRole::Responder,
        }
    }

    #[must_use]
    pub fn with_role(mut self, role: LinkRole) -> Self {
        self.role = role;
        self
    }

    #[must_use]
    pub fn with_id(mut self, id: impl Into<LinkId>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn link_id(&self) -> LinkId {
        self.id
            .clone()
            .unwrap_or_else(|| LinkId::from_secret(&self.secret))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn candidate_uses_browser_field_names() {
        let c = IceCandidate::new("candidate:1 1 udp 1 10.0.0.1 5000 typ host", Some("0"), Some(0));
        let json = serde_json::to_value(&c).unwrap();
        assert_eq!(json["sdpMid"], "0");
        assert_eq!(json["sdpMLineIndex"], 0);
        assert!(json["candidate"].as_str().unwrap().starts_with("candidate:"));
    }

    #[test]
    fn descriptor_id_defaults_to_secret_hash() {
        let secret = LinkSecret::from_bytes([0u8; 32]);
        let descriptor = LinkDescriptor::new(secret.clone());
        assert_eq!(descriptor.link_id().as_str(), secret.channel_id());
        assert_eq!(descriptor.with_id("custom").link_id().as_str(), "custom");
    }

    #[test]
    fn descriptor_parses_with_defaults() {
        let json = format!(r#"{{"secret":"{}"}}"#, "11".repeat(32));
        let descriptor: LinkDescriptor = serde_json::from_str(&json).unwrap();
        assert_eq!(descriptor.role, LinkRole::Responder);
        assert!(descriptor.id.is_none());
    }

    #[test]
    fn ids_serialize_as_plain_strings() {
        let json = serde_json::to_string(&(PeerId::from("p1"), LinkId::from("l1"))).unwrap();
        assert_eq!(json, r#"["p1","l1"]"#);
        let (peer, link): (PeerId, LinkId) = serde_json::from_str(&json).unwrap();
        assert_eq!(peer.as_str(), "p1");
        assert_eq!(link, LinkId::from("l1"));
    }

    #[test]
    fn request_ids_are_unique() {
        assert_ne!(RequestId::generate(), RequestId::generate());
    }
}
