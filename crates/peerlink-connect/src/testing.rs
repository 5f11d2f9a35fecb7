//! In-memory relay and connectivity engine for tests.
//!
//! [`ScriptedRelay`] stands in for the signaling relay: the test reads the
//! frames a client sends and decides which acknowledgements and remote
//! frames come back. [`MockEngineFactory`] creates peer connections that
//! record every call and only report progress when the test emits events.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use peerlink_crypto::LinkKey;
use serde_json::json;
use tokio::sync::{Notify, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::engine::{
    DataChannel, EngineEvent, EngineFactory, EngineSession, EventSink, PeerConnection,
    PeerConnectionState, event_channel,
};
use crate::error::{LinkError, TransportError};
use crate::signaling::wire::{Method, OutgoingEnvelope, RemoteData, decode_remote};
use crate::signaling::{RelayConnector, RelayTransport};
use crate::types::{
    IceCandidate, LinkDescriptor, LinkId, PeerId, Primitive, RequestId, SdpKind,
    SessionDescription,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Wait on `notify` until `ready` holds or `wait` elapses.
async fn wait_until(notify: &Notify, wait: Duration, ready: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + wait;
    loop {
        let notified = notify.notified();
        if ready() {
            return true;
        }
        if tokio::time::timeout_at(deadline, notified).await.is_err() {
            return ready();
        }
    }
}

// =========================================================================
// Relay
// =========================================================================

/// One relay connection: what the relay pushes and whether it is closed.
struct Wire {
    inbound_tx: mpsc::UnboundedSender<String>,
    inbound_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<String>>,
    closed: CancellationToken,
    pings: AtomicUsize,
}

impl Wire {
    fn new() -> Arc<Self> {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            inbound_tx,
            inbound_rx: tokio::sync::Mutex::new(inbound_rx),
            closed: CancellationToken::new(),
            pings: AtomicUsize::new(0),
        })
    }

    fn push(&self, frame: String) {
        let _ = self.inbound_tx.send(frame);
    }
}

/// Relay-side state of one link id. Survives reconnects.
struct Slot {
    current: Mutex<Arc<Wire>>,
    sent_tx: mpsc::UnboundedSender<String>,
    sent_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<String>>,
    auto_confirm: AtomicBool,
    connects: AtomicUsize,
}

impl Slot {
    fn new(auto_confirm: bool) -> Arc<Self> {
        let (sent_tx, sent_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            current: Mutex::new(Wire::new()),
            sent_tx,
            sent_rx: tokio::sync::Mutex::new(sent_rx),
            auto_confirm: AtomicBool::new(auto_confirm),
            connects: AtomicUsize::new(0),
        })
    }

    fn wire(&self) -> Arc<Wire> {
        Arc::clone(&lock(&self.current))
    }
}

/// In-memory signaling relay.
#[derive(Clone, Default)]
pub struct ScriptedRelay {
    slots: Arc<Mutex<HashMap<LinkId, Arc<Slot>>>>,
    refused: Arc<Mutex<HashSet<LinkId>>>,
    auto_confirm: bool,
}

impl ScriptedRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// A relay that acknowledges every frame it receives.
    pub fn auto_confirming() -> Self {
        Self {
            auto_confirm: true,
            ..Self::default()
        }
    }

    fn slot(&self, link_id: &LinkId) -> Arc<Slot> {
        Arc::clone(
            lock(&self.slots)
                .entry(link_id.clone())
                .or_insert_with(|| Slot::new(self.auto_confirm)),
        )
    }

    /// Test-side handle for the link described by `descriptor`.
    #[allow(clippy::expect_used)]
    pub fn handle(&self, descriptor: &LinkDescriptor) -> RelayHandle {
        let key = LinkKey::derive(&descriptor.secret).expect("link key derivation");
        RelayHandle {
            slot: self.slot(&descriptor.link_id()),
            key: Arc::new(key),
        }
    }

    /// Make connections for `link_id` fail as if the relay were down.
    pub fn refuse(&self, link_id: &LinkId) {
        lock(&self.refused).insert(link_id.clone());
    }
}

#[async_trait]
impl RelayConnector for ScriptedRelay {
    async fn connect(&self, link_id: &LinkId) -> Result<Arc<dyn RelayTransport>, LinkError> {
        if lock(&self.refused).contains(link_id) {
            return Err(LinkError::RelayUnavailable(format!(
                "relay refused link {link_id}"
            )));
        }
        let slot = self.slot(link_id);
        let wire = {
            let mut current = lock(&slot.current);
            if current.closed.is_cancelled() {
                *current = Wire::new();
            }
            Arc::clone(&current)
        };
        slot.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(ScriptedTransport { slot, wire }))
    }
}

struct ScriptedTransport {
    slot: Arc<Slot>,
    wire: Arc<Wire>,
}

#[async_trait]
impl RelayTransport for ScriptedTransport {
    async fn send_text(&self, text: String) -> Result<(), LinkError> {
        if self.wire.closed.is_cancelled() {
            return Err(LinkError::SignalingClosed);
        }
        if self.slot.auto_confirm.load(Ordering::SeqCst) {
            if let Ok(envelope) = serde_json::from_str::<OutgoingEnvelope>(&text) {
                self.wire.push(confirmation_frame(&envelope.request_id));
            }
        }
        let _ = self.slot.sent_tx.send(text);
        Ok(())
    }

    async fn next_text(&self) -> Option<Result<String, LinkError>> {
        let mut inbound = self.wire.inbound_rx.lock().await;
        tokio::select! {
            biased;
            () = self.wire.closed.cancelled() => None,
            frame = inbound.recv() => frame.map(Ok),
        }
    }

    async fn ping(&self) -> Result<(), LinkError> {
        if self.wire.closed.is_cancelled() {
            return Err(LinkError::SignalingClosed);
        }
        self.wire.pings.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) {
        self.wire.closed.cancel();
    }
}

fn confirmation_frame(request_id: &RequestId) -> String {
    json!({ "info": "confirmation", "requestId": request_id }).to_string()
}

/// Test side of one link's relay channel.
#[derive(Clone)]
pub struct RelayHandle {
    slot: Arc<Slot>,
    key: Arc<LinkKey>,
}

impl RelayHandle {
    /// Next frame the client sent, with its payload opened.
    pub async fn next_sent(&self, wait: Duration) -> Option<(OutgoingEnvelope, Primitive)> {
        let mut sent = self.slot.sent_rx.lock().await;
        let text = tokio::time::timeout(wait, sent.recv()).await.ok()??;
        let envelope: OutgoingEnvelope = serde_json::from_str(&text).ok()?;
        let data = RemoteData {
            method: envelope.method,
            encrypted_payload: envelope.encrypted_payload.clone(),
        };
        let primitive = decode_remote(&self.key, &data).ok()?;
        Some((envelope, primitive))
    }

    /// Next sent frame with `method`. Frames with other methods are
    /// confirmed and skipped.
    pub async fn expect_method(
        &self,
        method: Method,
        wait: Duration,
    ) -> Option<(OutgoingEnvelope, Primitive)> {
        let deadline = Instant::now() + wait;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let (envelope, primitive) = self.next_sent(remaining).await?;
            if envelope.method == method {
                return Some((envelope, primitive));
            }
            if !self.slot.auto_confirm.load(Ordering::SeqCst) {
                self.confirm(&envelope.request_id);
            }
        }
    }

    /// Switch automatic acknowledgement of sent frames on or off.
    pub fn set_auto_confirm(&self, enabled: bool) {
        self.slot.auto_confirm.store(enabled, Ordering::SeqCst);
    }

    pub fn confirm(&self, request_id: &RequestId) {
        self.slot.wire().push(confirmation_frame(request_id));
    }

    pub fn reject_unreachable(&self, request_id: &RequestId) {
        self.slot.wire().push(
            json!({ "info": "missingRemoteClientError", "requestId": request_id }).to_string(),
        );
    }

    /// Forward `primitive` as if `from` had sent it through the relay.
    #[allow(clippy::expect_used)]
    pub fn deliver(&self, from: &PeerId, primitive: &Primitive) {
        let envelope =
            OutgoingEnvelope::seal(&self.key, primitive, from.clone()).expect("seal primitive");
        let frame = json!({
            "info": "remoteData",
            "requestId": envelope.request_id,
            "sourcePeerId": from,
            "data": {
                "method": envelope.method,
                "encryptedPayload": envelope.encrypted_payload,
            },
        });
        self.slot.wire().push(frame.to_string());
    }

    pub fn push_raw(&self, frame: &str) {
        self.slot.wire().push(frame.to_owned());
    }

    pub fn peer_connected(&self, peer: &PeerId) {
        self.push_connectivity("remoteClientJustConnected", peer);
    }

    pub fn peer_disconnected(&self, peer: &PeerId) {
        self.push_connectivity("remoteClientDisconnected", peer);
    }

    fn push_connectivity(&self, info: &str, peer: &PeerId) {
        self.slot
            .wire()
            .push(json!({ "info": info, "sourcePeerId": peer }).to_string());
    }

    /// Drop the current relay connection.
    pub fn close(&self) {
        self.slot.wire().closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.slot.wire().closed.is_cancelled()
    }

    pub fn pings(&self) -> usize {
        self.slot.wire().pings.load(Ordering::SeqCst)
    }

    /// How many times a client connected for this link.
    pub fn connections(&self) -> usize {
        self.slot.connects.load(Ordering::SeqCst)
    }
}

// =========================================================================
// Data channel
// =========================================================================

type DropFilter = Box<dyn Fn(&[u8]) -> bool + Send + Sync>;

/// One end of an in-memory data channel pair.
pub struct MockDataChannel {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    closed: CancellationToken,
    drop_outgoing: Mutex<Option<DropFilter>>,
}

impl MockDataChannel {
    /// Two connected ends. Closing either end closes both.
    pub fn pair() -> (Arc<Self>, Arc<Self>) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        let closed = CancellationToken::new();
        let end = |tx: mpsc::UnboundedSender<Vec<u8>>, rx: mpsc::UnboundedReceiver<Vec<u8>>| {
            Arc::new(Self {
                tx,
                rx: tokio::sync::Mutex::new(rx),
                closed: closed.clone(),
                drop_outgoing: Mutex::new(None),
            })
        };
        (end(b_tx, a_rx), end(a_tx, b_rx))
    }

    /// Silently discard outgoing messages matching `filter`.
    pub fn drop_outgoing_if(&self, filter: impl Fn(&[u8]) -> bool + Send + Sync + 'static) {
        *lock(&self.drop_outgoing) = Some(Box::new(filter));
    }
}

#[async_trait]
impl DataChannel for MockDataChannel {
    async fn send(&self, data: Vec<u8>) -> Result<(), TransportError> {
        if self.closed.is_cancelled() {
            return Err(TransportError::ChannelClosed);
        }
        if lock(&self.drop_outgoing)
            .as_ref()
            .is_some_and(|filter| filter(&data))
        {
            return Ok(());
        }
        self.tx
            .send(data)
            .map_err(|_| TransportError::ChannelClosed)
    }

    async fn recv(&self) -> Option<Vec<u8>> {
        let mut rx = self.rx.lock().await;
        tokio::select! {
            biased;
            message = rx.recv() => message,
            () = self.closed.cancelled() => rx.try_recv().ok(),
        }
    }

    fn is_open(&self) -> bool {
        !self.closed.is_cancelled()
    }

    async fn close(&self) {
        self.closed.cancel();
    }
}

// =========================================================================
// Engine
// =========================================================================

/// Engine operations a test can make fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockStep {
    CreateChannel,
    CreateOffer,
    CreateAnswer,
    SetLocalDescription,
    SetRemoteDescription,
    AddCandidate,
}

type FailingSteps = Arc<Mutex<HashMap<PeerId, HashSet<MockStep>>>>;

struct EngineState {
    peer: PeerId,
    sink: Option<EventSink>,
    failing: FailingSteps,
    auto_connect: bool,
    local: Mutex<Vec<SessionDescription>>,
    remote: Mutex<Vec<SessionDescription>>,
    candidates: Mutex<Vec<IceCandidate>>,
    changed: Notify,
    closed: AtomicBool,
    descriptions_made: AtomicUsize,
    channel: Arc<MockDataChannel>,
    remote_channel: Arc<MockDataChannel>,
}

impl EngineState {
    fn new(peer: PeerId, sink: Option<EventSink>, failing: FailingSteps, auto_connect: bool) -> Self {
        let (channel, remote_channel) = MockDataChannel::pair();
        Self {
            peer,
            sink,
            failing,
            auto_connect,
            local: Mutex::new(Vec::new()),
            remote: Mutex::new(Vec::new()),
            candidates: Mutex::new(Vec::new()),
            changed: Notify::new(),
            closed: AtomicBool::new(false),
            descriptions_made: AtomicUsize::new(0),
            channel,
            remote_channel,
        }
    }

    fn check(&self, step: MockStep) -> Result<(), LinkError> {
        let failing = lock(&self.failing)
            .get(&self.peer)
            .is_some_and(|steps| steps.contains(&step));
        if failing {
            return Err(LinkError::Negotiation(format!("mock {step:?} failed")));
        }
        Ok(())
    }

    fn emit_now(&self, event: EngineEvent) {
        if let Some(sink) = &self.sink {
            sink.try_emit(event);
        }
    }

    fn connect_now(&self) {
        self.emit_now(EngineEvent::ConnectionState(PeerConnectionState::Connected));
        self.emit_now(EngineEvent::ChannelOpen);
    }

    fn describe(&self, kind: &str) -> SessionDescription {
        let n = self.descriptions_made.fetch_add(1, Ordering::SeqCst);
        SessionDescription::new(format!("mock-{kind}-{}-{n}", self.peer))
    }
}

/// Peer connection that records what the negotiator asks of it.
pub struct MockPeerConnection {
    state: Arc<EngineState>,
}

impl MockPeerConnection {
    /// A connection with no event queue behind it.
    pub fn detached() -> Self {
        Self {
            state: Arc::new(EngineState::new(
                PeerId::from("detached"),
                None,
                FailingSteps::default(),
                false,
            )),
        }
    }
}

#[async_trait]
impl PeerConnection for MockPeerConnection {
    async fn create_channel(&self) -> Result<Arc<dyn DataChannel>, LinkError> {
        self.state.check(MockStep::CreateChannel)?;
        self.state.emit_now(EngineEvent::NegotiationNeeded);
        Ok(Arc::clone(&self.state.channel) as Arc<dyn DataChannel>)
    }

    async fn create_local_offer(&self) -> Result<SessionDescription, LinkError> {
        self.state.check(MockStep::CreateOffer)?;
        Ok(self.state.describe("offer"))
    }

    async fn create_local_answer(&self) -> Result<SessionDescription, LinkError> {
        self.state.check(MockStep::CreateAnswer)?;
        Ok(self.state.describe("answer"))
    }

    async fn set_local_description(
        &self,
        kind: SdpKind,
        description: &SessionDescription,
    ) -> Result<(), LinkError> {
        self.state.check(MockStep::SetLocalDescription)?;
        lock(&self.state.local).push(description.clone());
        self.state.changed.notify_waiters();
        if self.state.auto_connect && kind == SdpKind::Answer {
            self.state.connect_now();
        }
        Ok(())
    }

    async fn set_remote_description(
        &self,
        kind: SdpKind,
        description: &SessionDescription,
    ) -> Result<(), LinkError> {
        self.state.check(MockStep::SetRemoteDescription)?;
        lock(&self.state.remote).push(description.clone());
        self.state.changed.notify_waiters();
        if self.state.auto_connect && kind == SdpKind::Answer {
            self.state.connect_now();
        }
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: &IceCandidate) -> Result<(), LinkError> {
        self.state.check(MockStep::AddCandidate)?;
        lock(&self.state.candidates).push(candidate.clone());
        self.state.changed.notify_waiters();
        Ok(())
    }

    async fn close(&self) {
        self.state.closed.store(true, Ordering::SeqCst);
        self.state.channel.close().await;
        self.state.changed.notify_waiters();
    }
}

/// Test view of one engine created by [`MockEngineFactory`].
#[derive(Clone)]
pub struct MockEngineHandle {
    state: Arc<EngineState>,
}

impl MockEngineHandle {
    pub fn peer(&self) -> &PeerId {
        &self.state.peer
    }

    pub fn local_descriptions(&self) -> Vec<SessionDescription> {
        lock(&self.state.local).clone()
    }

    pub fn remote_descriptions(&self) -> Vec<SessionDescription> {
        lock(&self.state.remote).clone()
    }

    pub fn remote_candidates(&self) -> Vec<IceCandidate> {
        lock(&self.state.candidates).clone()
    }

    pub async fn wait_for_remote_candidates(&self, count: usize, wait: Duration) -> bool {
        wait_until(&self.state.changed, wait, || {
            lock(&self.state.candidates).len() >= count
        })
        .await
    }

    pub async fn wait_for_remote_descriptions(&self, count: usize, wait: Duration) -> bool {
        wait_until(&self.state.changed, wait, || {
            lock(&self.state.remote).len() >= count
        })
        .await
    }

    /// Push a notification as the engine would from a callback.
    pub async fn emit(&self, event: EngineEvent) -> bool {
        match &self.state.sink {
            Some(sink) => sink.emit(event).await,
            None => false,
        }
    }

    /// Report the connection as connected with its channel open.
    pub async fn connect(&self) {
        self.emit(EngineEvent::ConnectionState(PeerConnectionState::Connected))
            .await;
        self.emit(EngineEvent::ChannelOpen).await;
    }

    pub fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::SeqCst)
    }

    /// The far end of this engine's data channel, played by the test.
    pub fn remote_channel(&self) -> Arc<MockDataChannel> {
        Arc::clone(&self.state.remote_channel)
    }
}

#[derive(Default)]
struct FactoryState {
    engines: Mutex<HashMap<PeerId, Vec<MockEngineHandle>>>,
    created: Notify,
    failing: FailingSteps,
    auto_connect: AtomicBool,
}

/// Creates [`MockPeerConnection`]s and keeps a handle to each.
#[derive(Clone, Default)]
pub struct MockEngineFactory {
    inner: Arc<FactoryState>,
}

impl MockEngineFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Engines created from now on connect as soon as an answer is applied.
    #[must_use]
    pub fn auto_connect(self) -> Self {
        self.inner.auto_connect.store(true, Ordering::SeqCst);
        self
    }

    /// Make `step` fail for every engine of `peer`, including live ones.
    pub fn fail_step(&self, peer: &PeerId, step: MockStep) {
        lock(&self.inner.failing)
            .entry(peer.clone())
            .or_default()
            .insert(step);
    }

    pub fn engines_created(&self, peer: &PeerId) -> usize {
        lock(&self.inner.engines).get(peer).map_or(0, Vec::len)
    }

    fn latest(&self, peer: &PeerId) -> Option<MockEngineHandle> {
        lock(&self.inner.engines)
            .get(peer)
            .and_then(|engines| engines.last().cloned())
    }

    /// The most recent engine for `peer`, waiting for one to be created.
    pub async fn wait_for(&self, peer: &PeerId, wait: Duration) -> Option<MockEngineHandle> {
        wait_until(&self.inner.created, wait, || self.latest(peer).is_some()).await;
        self.latest(peer)
    }

    /// Wait until `count` engines exist for `peer` and return the newest.
    pub async fn wait_for_nth(
        &self,
        peer: &PeerId,
        count: usize,
        wait: Duration,
    ) -> Option<MockEngineHandle> {
        wait_until(&self.inner.created, wait, || self.engines_created(peer) >= count).await;
        lock(&self.inner.engines)
            .get(peer)
            .and_then(|engines| engines.get(count.checked_sub(1)?).cloned())
    }
}

#[async_trait]
impl EngineFactory for MockEngineFactory {
    async fn create(&self, _link_id: &LinkId, peer: &PeerId) -> Result<EngineSession, LinkError> {
        let (sink, events) = event_channel(64);
        let state = Arc::new(EngineState::new(
            peer.clone(),
            Some(sink),
            Arc::clone(&self.inner.failing),
            self.inner.auto_connect.load(Ordering::SeqCst),
        ));
        lock(&self.inner.engines)
            .entry(peer.clone())
            .or_default()
            .push(MockEngineHandle {
                state: Arc::clone(&state),
            });
        self.inner.created.notify_waiters();
        Ok(EngineSession {
            connection: Arc::new(MockPeerConnection { state }),
            events,
        })
    }
}
