//! Connectivity engine abstraction.
//!
//! The negotiator drives a peer connection through [`PeerConnection`] and
//! observes it only through the ordered [`EngineEvent`] queue that the
//! engine adapter fills from its callbacks.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::{LinkError, TransportError};
use crate::types::{IceCandidate, LinkId, PeerId, SdpKind, SessionDescription};

mod adapter;
#[cfg(feature = "webrtc")]
pub mod webrtc;

pub use adapter::{EventSink, event_channel};

/// Aggregate connectivity state reported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl PeerConnectionState {
    /// Whether a connection in this state is considered gone.
    pub const fn is_lost(self) -> bool {
        matches!(self, Self::Disconnected | Self::Failed | Self::Closed)
    }
}

impl fmt::Display for PeerConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::New => "new",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Failed => "failed",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Offer/answer state of the engine's signaling machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    HaveLocalPranswer,
    HaveRemotePranswer,
    Closed,
}

/// Notification emitted by the engine adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    NegotiationNeeded,
    LocalCandidate(IceCandidate),
    ConnectionState(PeerConnectionState),
    SignalingState(SignalingState),
    /// The data channel finished opening.
    ChannelOpen,
}

/// Ordered, reliable message channel over an established connection.
#[async_trait]
pub trait DataChannel: Send + Sync {
    async fn send(&self, data: Vec<u8>) -> Result<(), TransportError>;

    /// Next message; `None` once the channel is closed.
    async fn recv(&self) -> Option<Vec<u8>>;

    fn is_open(&self) -> bool;

    async fn close(&self);
}

#[async_trait]
impl<T: DataChannel + ?Sized> DataChannel for Arc<T> {
    async fn send(&self, data: Vec<u8>) -> Result<(), TransportError> {
        (**self).send(data).await
    }

    async fn recv(&self) -> Option<Vec<u8>> {
        (**self).recv().await
    }

    fn is_open(&self) -> bool {
        (**self).is_open()
    }

    async fn close(&self) {
        (**self).close().await;
    }
}

/// Capability surface of one peer connection.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn create_channel(&self) -> Result<Arc<dyn DataChannel>, LinkError>;

    async fn create_local_offer(&self) -> Result<SessionDescription, LinkError>;

    async fn create_local_answer(&self) -> Result<SessionDescription, LinkError>;

    async fn set_local_description(
        &self,
        kind: SdpKind,
        description: &SessionDescription,
    ) -> Result<(), LinkError>;

    async fn set_remote_description(
        &self,
        kind: SdpKind,
        description: &SessionDescription,
    ) -> Result<(), LinkError>;

    /// Applying a candidate that was already applied must be harmless.
    async fn add_remote_candidate(&self, candidate: &IceCandidate) -> Result<(), LinkError>;

    async fn close(&self);
}

/// A fresh peer connection and its notification queue.
pub struct EngineSession {
    pub connection: Arc<dyn PeerConnection>,
    pub events: mpsc::Receiver<EngineEvent>,
}

/// Creates one peer connection per negotiation.
#[async_trait]
pub trait EngineFactory: Send + Sync {
    async fn create(&self, link_id: &LinkId, peer: &PeerId) -> Result<EngineSession, LinkError>;
}

#[async_trait]
impl<T: EngineFactory + ?Sized> EngineFactory for Arc<T> {
    async fn create(&self, link_id: &LinkId, peer: &PeerId) -> Result<EngineSession, LinkError> {
        (**self).create(link_id, peer).await
    }
}
