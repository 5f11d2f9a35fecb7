//! `peerlink` Connect Library
//!
//! Establishes direct peer links through an untrusted signaling relay:
//! - Encrypted signaling client with acknowledged, timed requests
//! - Per-peer negotiation state machine over a pluggable connectivity engine
//! - Chunked, integrity-checked message transport over data channels
//! - Links and a registry that keeps every link isolated from the others

pub mod chunking;
pub mod connection;
pub mod engine;
pub mod error;
pub mod feed;
pub mod link;
pub mod negotiator;
pub mod pairing;
pub mod registry;
pub mod signaling;
#[cfg(any(test, feature = "test-utils"))]
pub mod testing;
pub mod types;

pub use connection::{ConnectionClient, MessageResult, TransportSettings};
pub use error::{LinkError, NegotiationFailure, RelayErrorCode, TransportError};
pub use link::{Link, LinkSettings, PeerMessage};
pub use negotiator::{NegotiationSettings, NegotiationState, NegotiationTrigger, Negotiator};
pub use pairing::{JsonFilePairingStore, MemoryPairingStore, PairingStore, PairingUpdate};
pub use registry::{ConnectedPeers, InboundMessage, LinkRegistry};
pub use signaling::{SignalingClient, SignalingSettings, WebSocketConnector};
pub use types::{LinkDescriptor, LinkId, LinkRole, PeerId};
