//! Signaling client for one link.
//!
//! Owns the relay connection: seals outbound primitives, correlates relay
//! acknowledgements by request id and demultiplexes inbound frames into
//! replayable per-kind feeds.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use peerlink_core::config::SignalingConfig;
use peerlink_crypto::LinkKey;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::pending::PendingAcks;
use super::transport::RelayTransport;
use super::wire::{Inbound, IncomingFrame, OutgoingEnvelope, decode_remote};
use crate::error::LinkError;
use crate::feed::{EventFeed, FeedSubscription};
use crate::types::{IceCandidate, LinkId, PeerConnectivity, PeerId, Primitive, SessionDescription};

/// Timing knobs for a signaling client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignalingSettings {
    pub ack_timeout: Duration,
    pub keepalive_interval: Duration,
    pub feed_history: usize,
}

impl Default for SignalingSettings {
    fn default() -> Self {
        Self::from(&SignalingConfig::default())
    }
}

impl From<&SignalingConfig> for SignalingSettings {
    fn from(config: &SignalingConfig) -> Self {
        Self {
            ack_timeout: config.ack_timeout(),
            keepalive_interval: config.keepalive_interval(),
            feed_history: config.feed_history,
        }
    }
}

/// A feed event attributed to a remote peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerEvent<T> {
    pub peer: PeerId,
    pub value: T,
}

/// A per-message failure that did not stop the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalingFault {
    pub peer: Option<PeerId>,
    pub error: LinkError,
}

struct Feeds {
    offers: EventFeed<PeerEvent<SessionDescription>>,
    answers: EventFeed<PeerEvent<SessionDescription>>,
    candidates: EventFeed<PeerEvent<IceCandidate>>,
    connectivity: EventFeed<PeerEvent<PeerConnectivity>>,
    faults: EventFeed<SignalingFault>,
}

impl Feeds {
    fn new(history: usize) -> Self {
        Self {
            offers: EventFeed::new(history),
            answers: EventFeed::new(history),
            candidates: EventFeed::new(history),
            connectivity: EventFeed::new(history),
            faults: EventFeed::new(history),
        }
    }

    fn close(&self) {
        self.offers.close();
        self.answers.close();
        self.candidates.close();
        self.connectivity.close();
        self.faults.close();
    }
}

/// State shared between the client handle and its reader task.
struct Shared {
    link_id: LinkId,
    key: LinkKey,
    pending: PendingAcks,
    feeds: Feeds,
    seq: AtomicU64,
    /// Cancelled once the reader has stopped.
    closed: CancellationToken,
}

impl Shared {
    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn fault(&self, peer: Option<PeerId>, error: LinkError) {
        warn!(link_id = %self.link_id, peer_id = ?peer, error = %error, "Signaling message rejected");
        let seq = self.next_seq();
        self.feeds.faults.publish(seq, SignalingFault { peer, error });
    }

    fn dispatch(&self, text: &str) {
        let frame = match IncomingFrame::parse(text) {
            Ok(frame) => frame,
            Err(e) => return self.fault(None, e),
        };
        match frame.classify() {
            Inbound::Ack { request_id, result } => {
                if !self.pending.complete(&request_id, result) {
                    debug!(link_id = %self.link_id, %request_id, "Acknowledgement for unknown request");
                }
            }
            Inbound::Uncorrelated(code) => {
                self.fault(
                    None,
                    LinkError::Relay {
                        request_id: "unknown".into(),
                        code,
                    },
                );
            }
            Inbound::Remote { source, data } => match decode_remote(&self.key, &data) {
                Ok(primitive) => self.publish_primitive(source, primitive),
                Err(e) => self.fault(Some(source), e),
            },
            Inbound::Connectivity { peer, status } => {
                debug!(link_id = %self.link_id, peer_id = %peer, ?status, "Remote peer presence changed");
                let seq = self.next_seq();
                self.feeds
                    .connectivity
                    .publish(seq, PeerEvent { peer, value: status });
            }
        }
    }

    fn publish_primitive(&self, peer: PeerId, primitive: Primitive) {
        debug!(link_id = %self.link_id, peer_id = %peer, kind = primitive.kind(), "Received primitive");
        let seq = self.next_seq();
        match primitive {
            Primitive::Offer(value) => self.feeds.offers.publish(seq, PeerEvent { peer, value }),
            Primitive::Answer(value) => self.feeds.answers.publish(seq, PeerEvent { peer, value }),
            Primitive::Candidate(value) => {
                self.feeds.candidates.publish(seq, PeerEvent { peer, value });
            }
        }
    }
}

/// Handle to a running signaling client.
pub struct SignalingClient {
    shared: Arc<Shared>,
    transport: Arc<dyn RelayTransport>,
    settings: SignalingSettings,
    cancel: CancellationToken,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl SignalingClient {
    /// Start reading from `transport` and return the client handle.
    pub fn start(
        link_id: LinkId,
        key: LinkKey,
        transport: Arc<dyn RelayTransport>,
        settings: SignalingSettings,
    ) -> Arc<Self> {
        let shared = Arc::new(Shared {
            link_id,
            key,
            pending: PendingAcks::new(),
            feeds: Feeds::new(settings.feed_history),
            seq: AtomicU64::new(0),
            closed: CancellationToken::new(),
        });
        let cancel = CancellationToken::new();
        let reader = tokio::spawn(read_loop(
            Arc::clone(&shared),
            Arc::clone(&transport),
            settings.keepalive_interval,
            cancel.clone(),
        ));
        Arc::new(Self {
            shared,
            transport,
            settings,
            cancel,
            reader: Mutex::new(Some(reader)),
        })
    }

    pub fn link_id(&self) -> &LinkId {
        &self.shared.link_id
    }

    /// Seal `primitive` for `target` and wait for the relay's acknowledgement.
    pub async fn send(&self, primitive: &Primitive, target: &PeerId) -> Result<(), LinkError> {
        if self.is_closed() {
            return Err(LinkError::SignalingClosed);
        }
        let envelope = OutgoingEnvelope::seal(&self.shared.key, primitive, target.clone())?;
        let request_id = envelope.request_id.clone();
        let text = serde_json::to_string(&envelope)?;

        let mut pending = self.shared.pending.register(request_id.clone());
        if self.is_closed() {
            return Err(LinkError::SignalingClosed);
        }
        debug!(
            link_id = %self.shared.link_id,
            peer_id = %target,
            %request_id,
            kind = primitive.kind(),
            "Sending primitive"
        );
        self.transport.send_text(text).await?;

        match tokio::time::timeout(self.settings.ack_timeout, pending.wait()).await {
            Err(_) => Err(LinkError::Timeout {
                operation: "relay acknowledgement",
                after: self.settings.ack_timeout,
            }),
            Ok(None) => Err(LinkError::SignalingClosed),
            Ok(Some(Ok(()))) => Ok(()),
            Ok(Some(Err(code))) => Err(LinkError::Relay { request_id, code }),
        }
    }

    /// Sequence number of the most recent inbound event.
    pub fn current_seq(&self) -> u64 {
        self.shared.seq.load(Ordering::SeqCst)
    }

    pub fn subscribe_offers(&self, after: u64) -> FeedSubscription<PeerEvent<SessionDescription>> {
        self.shared.feeds.offers.subscribe_after(after)
    }

    pub fn subscribe_answers(&self, after: u64) -> FeedSubscription<PeerEvent<SessionDescription>> {
        self.shared.feeds.answers.subscribe_after(after)
    }

    pub fn subscribe_candidates(&self, after: u64) -> FeedSubscription<PeerEvent<IceCandidate>> {
        self.shared.feeds.candidates.subscribe_after(after)
    }

    /// Candidates from `peer` only, queued per subscriber so other peers'
    /// traffic cannot crowd them out.
    pub fn subscribe_peer_candidates(
        &self,
        after: u64,
        peer: &PeerId,
    ) -> FeedSubscription<PeerEvent<IceCandidate>> {
        let peer = peer.clone();
        self.shared
            .feeds
            .candidates
            .subscribe_matching(after, move |event| event.peer == peer)
    }

    pub fn subscribe_connectivity(
        &self,
        after: u64,
    ) -> FeedSubscription<PeerEvent<PeerConnectivity>> {
        self.shared.feeds.connectivity.subscribe_after(after)
    }

    pub fn subscribe_faults(&self, after: u64) -> FeedSubscription<SignalingFault> {
        self.shared.feeds.faults.subscribe_after(after)
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.is_cancelled()
    }

    /// Resolves once the relay connection has stopped.
    pub async fn closed(&self) {
        self.shared.closed.cancelled().await;
    }

    /// Stop reading, fail outstanding requests and close the relay connection.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        if let Some(reader) = self.reader.lock().await.take() {
            let _ = reader.await;
        }
        self.transport.close().await;
    }
}

async fn read_loop(
    shared: Arc<Shared>,
    transport: Arc<dyn RelayTransport>,
    keepalive: Duration,
    cancel: CancellationToken,
) {
    let period = keepalive.max(Duration::from_secs(1));
    let mut keepalive = interval_at(Instant::now() + period, period);
    info!(link_id = %shared.link_id, "Signaling client started");

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            frame = transport.next_text() => match frame {
                Some(Ok(text)) => shared.dispatch(&text),
                Some(Err(e)) => {
                    warn!(link_id = %shared.link_id, error = %e, "Relay connection failed");
                    break;
                }
                None => {
                    info!(link_id = %shared.link_id, "Relay closed the connection");
                    break;
                }
            },
            _ = keepalive.tick() => {
                if let Err(e) = transport.ping().await {
                    warn!(link_id = %shared.link_id, error = %e, "Relay keepalive failed");
                }
            }
        }
    }

    shared.closed.cancel();
    shared.pending.cancel_all();
    shared.feeds.close();
    info!(link_id = %shared.link_id, "Signaling client stopped");
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::error::RelayErrorCode;
    use crate::testing::ScriptedRelay;
    use crate::signaling::wire::Method;
    use crate::signaling::RelayConnector;
    use crate::types::LinkDescriptor;
    use peerlink_crypto::LinkSecret;

    const WAIT: Duration = Duration::from_secs(5);

    async fn started(relay: &ScriptedRelay, settings: SignalingSettings) -> (Arc<SignalingClient>, crate::testing::RelayHandle) {
        let descriptor = LinkDescriptor::new(LinkSecret::from_bytes([3u8; 32]));
        let handle = relay.handle(&descriptor);
        let link_id = descriptor.link_id();
        let transport = relay.connect(&link_id).await.unwrap();
        let key = LinkKey::derive(&descriptor.secret).unwrap();
        (SignalingClient::start(link_id, key, transport, settings), handle)
    }

    #[tokio::test]
    async fn send_resolves_on_confirmation() {
        let relay = ScriptedRelay::new();
        let (client, handle) = started(&relay, SignalingSettings::default()).await;
        let peer = PeerId::from("p1");

        let sending = {
            let client = Arc::clone(&client);
            let peer = peer.clone();
            tokio::spawn(async move {
                client
                    .send(&Primitive::Answer(SessionDescription::new("v=0")), &peer)
                    .await
            })
        };

        let (envelope, primitive) = handle.next_sent(WAIT).await.unwrap();
        assert_eq!(envelope.method, Method::SendAnswer);
        assert_eq!(envelope.target_peer_id, peer);
        assert_eq!(primitive, Primitive::Answer(SessionDescription::new("v=0")));
        handle.confirm(&envelope.request_id);

        assert!(sending.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn relay_error_is_typed() {
        let relay = ScriptedRelay::new();
        let (client, handle) = started(&relay, SignalingSettings::default()).await;

        let sending = {
            let client = Arc::clone(&client);
            tokio::spawn(async move {
                client
                    .send(&Primitive::Offer(SessionDescription::new("v=0")), &PeerId::from("p1"))
                    .await
            })
        };
        let (envelope, _) = handle.next_sent(WAIT).await.unwrap();
        handle.reject_unreachable(&envelope.request_id);

        let err = sending.await.unwrap().unwrap_err();
        assert_eq!(
            err,
            LinkError::Relay {
                request_id: envelope.request_id,
                code: RelayErrorCode::RemotePeerUnreachable
            }
        );
    }

    #[tokio::test]
    async fn missing_ack_times_out() {
        let relay = ScriptedRelay::new();
        let settings = SignalingSettings {
            ack_timeout: Duration::from_millis(50),
            ..SignalingSettings::default()
        };
        let (client, _handle) = started(&relay, settings).await;

        let err = client
            .send(&Primitive::Offer(SessionDescription::new("v=0")), &PeerId::from("p1"))
            .await
            .unwrap_err();
        assert!(matches!(err, LinkError::Timeout { .. }));
    }

    #[tokio::test]
    async fn inbound_primitives_are_demultiplexed() {
        let relay = ScriptedRelay::new();
        let (client, handle) = started(&relay, SignalingSettings::default()).await;
        let mut offers = client.subscribe_offers(0);
        let mut candidates = client.subscribe_candidates(0);

        let candidate = IceCandidate::new("candidate:1", Some("0"), Some(0));
        handle.deliver(&PeerId::from("p1"), &Primitive::Candidate(candidate.clone()));
        handle.deliver(&PeerId::from("p2"), &Primitive::Offer(SessionDescription::new("o2")));

        let offer = tokio::time::timeout(WAIT, offers.recv()).await.unwrap().unwrap();
        assert_eq!(offer.value.peer, PeerId::from("p2"));
        let got = tokio::time::timeout(WAIT, candidates.recv()).await.unwrap().unwrap();
        assert_eq!(got.value, PeerEvent { peer: PeerId::from("p1"), value: candidate });
        assert!(got.seq < offer.seq);
    }

    #[tokio::test]
    async fn peer_candidates_are_not_crowded_out_by_other_peers() {
        let relay = ScriptedRelay::new();
        let settings = SignalingSettings {
            feed_history: 2,
            ..SignalingSettings::default()
        };
        let (client, handle) = started(&relay, settings).await;
        let p1 = PeerId::from("p1");
        let mut mine = client.subscribe_peer_candidates(0, &p1);

        let first = IceCandidate::new("candidate:first", Some("0"), Some(0));
        handle.deliver(&p1, &Primitive::Candidate(first.clone()));
        for i in 0..64 {
            let noise = IceCandidate::new(format!("candidate:noise-{i}"), Some("0"), Some(0));
            handle.deliver(&PeerId::from("p2"), &Primitive::Candidate(noise));
        }
        let last = IceCandidate::new("candidate:last", Some("0"), Some(0));
        handle.deliver(&p1, &Primitive::Candidate(last.clone()));

        let got = tokio::time::timeout(WAIT, mine.recv()).await.unwrap().unwrap();
        assert_eq!(got.value.value, first);
        let got = tokio::time::timeout(WAIT, mine.recv()).await.unwrap().unwrap();
        assert_eq!(got.value.value, last);
    }

    #[tokio::test]
    async fn bad_frames_are_reported_and_reading_continues() {
        let relay = ScriptedRelay::new();
        let (client, handle) = started(&relay, SignalingSettings::default()).await;
        let mut faults = client.subscribe_faults(0);
        let mut offers = client.subscribe_offers(0);

        handle.push_raw("not json");
        handle.push_raw(
            r#"{"info":"remoteData","requestId":"r","sourcePeerId":"p1","data":{"method":"sendOffer","encryptedPayload":"00ff"}}"#,
        );
        handle.deliver(&PeerId::from("p1"), &Primitive::Offer(SessionDescription::new("ok")));

        let first = tokio::time::timeout(WAIT, faults.recv()).await.unwrap().unwrap();
        assert!(matches!(first.value.error, LinkError::Encoding(_)));
        let second = tokio::time::timeout(WAIT, faults.recv()).await.unwrap().unwrap();
        assert_eq!(second.value.peer, Some(PeerId::from("p1")));
        assert!(matches!(second.value.error, LinkError::Crypto(_)));

        let offer = tokio::time::timeout(WAIT, offers.recv()).await.unwrap().unwrap();
        assert_eq!(offer.value.value.sdp, "ok");
        assert!(!client.is_closed());
    }

    #[tokio::test]
    async fn relay_close_fails_pending_sends() {
        let relay = ScriptedRelay::new();
        let (client, handle) = started(&relay, SignalingSettings::default()).await;

        let sending = {
            let client = Arc::clone(&client);
            tokio::spawn(async move {
                client
                    .send(&Primitive::Offer(SessionDescription::new("v=0")), &PeerId::from("p1"))
                    .await
            })
        };
        handle.next_sent(WAIT).await.unwrap();
        handle.close();

        assert_eq!(sending.await.unwrap(), Err(LinkError::SignalingClosed));
        tokio::time::timeout(WAIT, client.closed()).await.unwrap();
        assert_eq!(
            client
                .send(&Primitive::Offer(SessionDescription::new("v=0")), &PeerId::from("p1"))
                .await,
            Err(LinkError::SignalingClosed)
        );
    }

    #[tokio::test]
    async fn connectivity_events_are_published() {
        let relay = ScriptedRelay::new();
        let (client, handle) = started(&relay, SignalingSettings::default()).await;
        let mut connectivity = client.subscribe_connectivity(0);

        handle.peer_connected(&PeerId::from("ext"));
        let event = tokio::time::timeout(WAIT, connectivity.recv()).await.unwrap().unwrap();
        assert_eq!(event.value.value, PeerConnectivity::JustConnected);
    }

    #[tokio::test(start_paused = true)]
    async fn keepalive_pings_the_relay() {
        let relay = ScriptedRelay::new();
        let settings = SignalingSettings {
            keepalive_interval: Duration::from_secs(30),
            ..SignalingSettings::default()
        };
        let (_client, handle) = started(&relay, settings).await;
        tokio::time::sleep(Duration::from_secs(95)).await;
        assert_eq!(handle.pings(), 3);
    }
}
