//! Connection client for one established peer connection.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use peerlink_core::config::TransportConfig;
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::chunking::{Assembled, AssemblyLimits, ChunkAssembler, ChunkTransport, Package};
use crate::engine::{DataChannel, PeerConnection, PeerConnectionState};
use crate::error::TransportError;
use crate::types::{LinkId, PeerId};

/// Framing and buffering settings for connection clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportSettings {
    pub chunk_size: usize,
    pub receipt_timeout: Duration,
    pub inbound_buffer: usize,
    pub limits: AssemblyLimits,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self::from(&TransportConfig::default())
    }
}

impl From<&TransportConfig> for TransportSettings {
    fn from(config: &TransportConfig) -> Self {
        Self {
            chunk_size: config.chunk_size,
            receipt_timeout: config.receipt_timeout(),
            inbound_buffer: config.inbound_buffer,
            limits: AssemblyLimits {
                max_message_bytes: config.max_message_bytes,
                max_pending_messages: config.max_pending_messages,
            },
        }
    }
}

/// Item of a connection's inbound message sequence.
pub type MessageResult = Result<Vec<u8>, TransportError>;

/// Whole-message send/receive over one connected peer.
pub struct ConnectionClient {
    link_id: LinkId,
    peer: PeerId,
    transport: Arc<ChunkTransport>,
    connection: Arc<dyn PeerConnection>,
    state: watch::Receiver<PeerConnectionState>,
    messages: Mutex<Option<mpsc::Receiver<MessageResult>>>,
    receipt_timeout: Duration,
    closed: CancellationToken,
}

impl fmt::Debug for ConnectionClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionClient")
            .field("link_id", &self.link_id)
            .field("peer", &self.peer)
            .field("state", &self.state())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl ConnectionClient {
    /// Wrap a connected peer connection and start reading its channel.
    ///
    /// `closed` is cancelled when the client stops, which also stops
    /// anything else tied to the connection's lifetime.
    pub fn start(
        link_id: LinkId,
        peer: PeerId,
        connection: Arc<dyn PeerConnection>,
        channel: Arc<dyn DataChannel>,
        state: watch::Receiver<PeerConnectionState>,
        closed: CancellationToken,
        settings: TransportSettings,
    ) -> Self {
        let transport = Arc::new(ChunkTransport::new(channel, settings.chunk_size));
        let (tx, rx) = mpsc::channel(settings.inbound_buffer.max(1));

        tokio::spawn(read_loop(
            link_id.clone(),
            peer.clone(),
            Arc::clone(&transport),
            ChunkAssembler::with_limits(settings.limits),
            state.clone(),
            tx,
            closed.clone(),
        ));
        info!(%link_id, peer_id = %peer, "Connection client started");

        Self {
            link_id,
            peer,
            transport,
            connection,
            state,
            messages: Mutex::new(Some(rx)),
            receipt_timeout: settings.receipt_timeout,
            closed,
        }
    }

    pub const fn peer(&self) -> &PeerId {
        &self.peer
    }

    pub const fn link_id(&self) -> &LinkId {
        &self.link_id
    }

    pub fn state(&self) -> PeerConnectionState {
        *self.state.borrow()
    }

    /// Send one logical message without waiting for a receipt.
    pub async fn send_data(&self, data: &[u8]) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::ChannelClosed);
        }
        self.transport.send_message(data).await.map(drop)
    }

    /// Send one logical message and wait for the peer's confirmation receipt.
    pub async fn send_data_confirmed(&self, data: &[u8]) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::ChannelClosed);
        }
        self.transport
            .send_message_confirmed(data, self.receipt_timeout)
            .await
            .map(drop)
    }

    /// The inbound message sequence. Can be taken once.
    ///
    /// Ends after a terminal error when the channel closes or the
    /// connection is lost.
    pub fn received_messages(&self) -> Option<ReceiverStream<MessageResult>> {
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .map(ReceiverStream::new)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the client has stopped.
    pub async fn closed(&self) {
        self.closed.cancelled().await;
    }

    /// Close the channel and the peer connection. Best effort.
    pub async fn close(&self) {
        if !self.closed.is_cancelled() {
            debug!(link_id = %self.link_id, peer_id = %self.peer, "Closing connection client");
        }
        self.closed.cancel();
        self.transport.channel().close().await;
        self.connection.close().await;
    }
}

async fn read_loop(
    link_id: LinkId,
    peer: PeerId,
    transport: Arc<ChunkTransport>,
    mut assembler: ChunkAssembler,
    mut state: watch::Receiver<PeerConnectionState>,
    inbound: mpsc::Sender<MessageResult>,
    closed: CancellationToken,
) {
    let channel = Arc::clone(transport.channel());
    let mut watching_state = true;

    let terminal = loop {
        tokio::select! {
            biased;
            () = closed.cancelled() => break TransportError::ChannelClosed,
            changed = state.changed(), if watching_state => {
                if changed.is_err() {
                    watching_state = false;
                    continue;
                }
                let current = *state.borrow_and_update();
                if current.is_lost() {
                    break TransportError::ConnectionLost(current);
                }
            }
            data = channel.recv() => match data {
                Some(bytes) => {
                    on_package(&link_id, &peer, &transport, &mut assembler, &inbound, &bytes).await;
                }
                None => break TransportError::ChannelClosed,
            },
        }
    };

    warn!(%link_id, peer_id = %peer, error = %terminal, "Connection client stopped");
    // Mark the client closed before delivering, so owners see the closure
    // even while the consumer is still draining the queue.
    transport.fail_pending_receipts();
    closed.cancel();

    // Awaited sends: the queue may be full, and these must not be lost.
    // Each fails fast once the consumer has gone away.
    for incomplete in assembler.drain_incomplete() {
        warn!(%link_id, peer_id = %peer, error = %incomplete, "Discarding incomplete message");
        if inbound.send(Err(incomplete)).await.is_err() {
            debug!(%link_id, peer_id = %peer, "Inbound queue closed");
            return;
        }
    }
    if inbound.send(Err(terminal)).await.is_err() {
        debug!(%link_id, peer_id = %peer, "Terminal error not delivered, no consumer");
    }
}

async fn on_package(
    link_id: &LinkId,
    peer: &PeerId,
    transport: &ChunkTransport,
    assembler: &mut ChunkAssembler,
    inbound: &mpsc::Sender<MessageResult>,
    bytes: &[u8],
) {
    let package = match Package::decode(bytes) {
        Ok(package) => package,
        Err(e) => {
            warn!(%link_id, peer_id = %peer, error = %e, "Undecodable package dropped");
            return;
        }
    };
    let (receipt, delivery) = match assembler.on_package(package) {
        None => return,
        Some(Assembled::Receipt(receipt)) => {
            transport.complete_receipt(receipt);
            return;
        }
        Some(Assembled::Message { message_id, bytes }) => {
            debug!(%link_id, peer_id = %peer, %message_id, bytes = bytes.len(), "Message reassembled");
            (Package::ReceiveMessageConfirmation { message_id }, Ok(bytes))
        }
        Some(Assembled::Failed { message_id, error }) => {
            warn!(%link_id, peer_id = %peer, %message_id, %error, "Message reassembly failed");
            let reason = match &error {
                TransportError::Reassembly { reason, .. } => reason.clone(),
                other => other.to_string(),
            };
            (
                Package::ReceiveMessageError {
                    message_id,
                    error: reason,
                },
                Err(error),
            )
        }
    };
    if let Err(e) = transport.send_receipt(&receipt).await {
        warn!(%link_id, peer_id = %peer, error = %e, "Failed to send receipt");
    }
    if inbound.send(delivery).await.is_err() {
        debug!(%link_id, peer_id = %peer, "Inbound message dropped, no consumer");
    }
}
