//! Error types for link signaling, negotiation and transport.

use std::time::Duration;

use peerlink_crypto::CryptoError;

use crate::engine::PeerConnectionState;
use crate::negotiator::NegotiationState;
use crate::types::{LinkId, PeerId, RequestId};

/// Typed error codes returned by the signaling relay.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RelayErrorCode {
    #[error("remote peer unreachable")]
    RemotePeerUnreachable,

    #[error("validation error: {0}")]
    Validation(String),

    #[error("invalid message: {0}")]
    InvalidMessage(String),
}

/// Failures of an established data channel.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("data channel closed")]
    ChannelClosed,

    #[error("incomplete transfer for message {message_id}: {received}/{expected} chunks")]
    IncompleteTransfer {
        message_id: String,
        received: usize,
        expected: usize,
    },

    #[error("send failed: {0}")]
    SendFailed(String),

    #[error("reassembly of message {message_id} failed: {reason}")]
    Reassembly { message_id: String, reason: String },

    #[error("peer connection lost ({0})")]
    ConnectionLost(PeerConnectionState),
}

/// Errors surfaced by links, their signaling clients and connections.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LinkError {
    #[error("encoding error: {0}")]
    Encoding(String),

    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("relay rejected request {request_id}: {code}")]
    Relay {
        request_id: RequestId,
        code: RelayErrorCode,
    },

    #[error("negotiation error: {0}")]
    Negotiation(String),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    #[error("signaling relay unavailable: {0}")]
    RelayUnavailable(String),

    #[error("signaling connection closed")]
    SignalingClosed,

    #[error("operation cancelled")]
    Cancelled,

    #[error("unknown link {0}")]
    UnknownLink(LinkId),

    #[error("no connection to peer {0}")]
    UnknownPeer(PeerId),

    #[error("no peer is connected on any link")]
    NoConnectedPeers,
}

impl From<serde_json::Error> for LinkError {
    fn from(e: serde_json::Error) -> Self {
        Self::Encoding(e.to_string())
    }
}

/// Outcome of a failed negotiation, tagged with its peer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("negotiation with {peer_id} failed in state {state}: {error}")]
pub struct NegotiationFailure {
    pub peer_id: PeerId,
    /// State the session was in when the failure occurred.
    pub state: NegotiationState,
    pub error: LinkError,
}

pub type Result<T> = std::result::Result<T, LinkError>;
