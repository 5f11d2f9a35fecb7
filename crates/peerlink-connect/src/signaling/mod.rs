//! Encrypted signaling over the relay.

pub mod client;
pub mod pending;
pub mod transport;
pub mod wire;

pub use client::{PeerEvent, SignalingClient, SignalingFault, SignalingSettings};
pub use transport::{RelayConnector, RelayTransport, WebSocketConnector, WebSocketRelay};
pub use wire::{IncomingFrame, Method, OutgoingEnvelope};
