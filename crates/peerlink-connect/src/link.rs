//! One paired link: its signaling client, negotiations and live connections.
//!
//! A supervisor task owns all mutable link state. It starts one negotiation
//! per inbound offer (or per initiate request), promotes successful ones to
//! connection clients and merges their messages into the link's feed.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use peerlink_core::Config;
use peerlink_crypto::LinkKey;
use tokio::sync::{RwLock, broadcast, mpsc, oneshot, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::connection::{ConnectionClient, MessageResult};
use crate::engine::EngineFactory;
use crate::error::{LinkError, NegotiationFailure};
use crate::negotiator::{NegotiationSettings, NegotiationState, NegotiationTrigger, Negotiator};
use crate::signaling::{RelayConnector, SignalingClient, SignalingSettings};
use crate::types::{LinkDescriptor, LinkId, LinkRole, PeerId};

/// Settings for every component of a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LinkSettings {
    pub signaling: SignalingSettings,
    pub negotiation: NegotiationSettings,
}

impl From<&Config> for LinkSettings {
    fn from(config: &Config) -> Self {
        Self {
            signaling: SignalingSettings::from(&config.signaling),
            negotiation: NegotiationSettings::from(config),
        }
    }
}

/// A message received on a link, tagged with its sender.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerMessage {
    pub peer: PeerId,
    pub result: MessageResult,
}

type Clients = Arc<RwLock<HashMap<PeerId, Arc<ConnectionClient>>>>;
type ConnectReply = oneshot::Sender<Result<(), NegotiationFailure>>;

enum LinkCommand {
    Connect { peer: PeerId, reply: ConnectReply },
}

/// Handle to a running link.
pub struct Link {
    id: LinkId,
    role: LinkRole,
    signaling: Arc<SignalingClient>,
    clients: Clients,
    connected: watch::Receiver<BTreeSet<PeerId>>,
    failures: broadcast::Sender<NegotiationFailure>,
    commands: mpsc::Sender<LinkCommand>,
    messages: Mutex<Option<mpsc::Receiver<PeerMessage>>>,
    cancel: CancellationToken,
    supervisor: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Link {
    /// Derive the link key, connect to the relay and start supervising.
    pub async fn open(
        descriptor: &LinkDescriptor,
        connector: &dyn RelayConnector,
        engine: Arc<dyn EngineFactory>,
        settings: LinkSettings,
    ) -> Result<Arc<Self>, LinkError> {
        let id = descriptor.link_id();
        let key = LinkKey::derive(&descriptor.secret)?;
        let transport = connector.connect(&id).await?;
        let signaling = SignalingClient::start(id.clone(), key, transport, settings.signaling);

        let clients: Clients = Arc::new(RwLock::new(HashMap::new()));
        let (connected_tx, connected) = watch::channel(BTreeSet::new());
        let (failures, _) = broadcast::channel(64);
        let (commands, commands_rx) = mpsc::channel(16);
        let (messages_tx, messages) =
            mpsc::channel(settings.negotiation.transport.inbound_buffer.max(1));
        let (closed_tx, closed_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let supervisor = Supervisor {
            link_id: id.clone(),
            role: descriptor.role,
            signaling: Arc::clone(&signaling),
            engine,
            settings: settings.negotiation,
            clients: Arc::clone(&clients),
            connected: connected_tx,
            failures: failures.clone(),
            messages: messages_tx,
            closed_tx,
            active: HashMap::new(),
            client_generations: HashMap::new(),
            negotiations: JoinSet::new(),
            next_generation: 0,
            cancel: cancel.clone(),
        };
        let handle = tokio::spawn(supervisor.run(commands_rx, closed_rx));
        info!(link_id = %id, role = ?descriptor.role, "Link opened");

        Ok(Arc::new(Self {
            id,
            role: descriptor.role,
            signaling,
            clients,
            connected,
            failures,
            commands,
            messages: Mutex::new(Some(messages)),
            cancel,
            supervisor: tokio::sync::Mutex::new(Some(handle)),
        }))
    }

    pub const fn id(&self) -> &LinkId {
        &self.id
    }

    pub const fn role(&self) -> LinkRole {
        self.role
    }

    pub fn signaling(&self) -> &Arc<SignalingClient> {
        &self.signaling
    }

    /// Negotiate with `peer` as the initiator. Resolves immediately if a
    /// connection already exists, or joins a negotiation in progress.
    pub async fn connect(&self, peer: &PeerId) -> Result<(), NegotiationFailure> {
        let cancelled = || NegotiationFailure {
            peer_id: peer.clone(),
            state: NegotiationState::Idle,
            error: LinkError::Cancelled,
        };
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(LinkCommand::Connect {
                peer: peer.clone(),
                reply,
            })
            .await
            .map_err(|_| cancelled())?;
        rx.await.unwrap_or_else(|_| Err(cancelled()))
    }

    /// Send one message to a connected peer.
    pub async fn send(&self, peer: &PeerId, data: &[u8]) -> Result<(), LinkError> {
        let client = self.client(peer).await.ok_or_else(|| LinkError::UnknownPeer(peer.clone()))?;
        client.send_data(data).await.map_err(LinkError::Transport)
    }

    /// Send one message and wait for the peer's receipt.
    pub async fn send_confirmed(&self, peer: &PeerId, data: &[u8]) -> Result<(), LinkError> {
        let client = self.client(peer).await.ok_or_else(|| LinkError::UnknownPeer(peer.clone()))?;
        client
            .send_data_confirmed(data)
            .await
            .map_err(LinkError::Transport)
    }

    pub async fn client(&self, peer: &PeerId) -> Option<Arc<ConnectionClient>> {
        self.clients.read().await.get(peer).cloned()
    }

    /// Peers with a live connection client.
    pub fn connected_peers(&self) -> BTreeSet<PeerId> {
        self.connected.borrow().clone()
    }

    pub fn watch_connected(&self) -> watch::Receiver<BTreeSet<PeerId>> {
        self.connected.clone()
    }

    /// Wait until at least one peer is connected and return one of them.
    pub async fn wait_for_connection(&self, timeout: Duration) -> Result<PeerId, LinkError> {
        let mut connected = self.connected.clone();
        let wait = connected.wait_for(|peers| !peers.is_empty());
        match tokio::time::timeout(timeout, wait).await {
            Ok(Ok(peers)) => peers.first().cloned().ok_or(LinkError::Cancelled),
            Ok(Err(_)) => Err(LinkError::Cancelled),
            Err(_) => Err(LinkError::Timeout {
                operation: "peer connection",
                after: timeout,
            }),
        }
    }

    /// Failed negotiations, as they happen.
    pub fn failures(&self) -> broadcast::Receiver<NegotiationFailure> {
        self.failures.subscribe()
    }

    /// The link's merged inbound messages. Can be taken once.
    pub fn take_messages(&self) -> Option<mpsc::Receiver<PeerMessage>> {
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    pub fn is_shut_down(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Cancel every negotiation, close every connection and the relay.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        if let Some(handle) = self.supervisor.lock().await.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct ActiveSession {
    generation: u64,
    cancel: CancellationToken,
    waiters: Vec<ConnectReply>,
}

type NegotiationOutcome = (PeerId, u64, Result<ConnectionClient, NegotiationFailure>);

struct Supervisor {
    link_id: LinkId,
    role: LinkRole,
    signaling: Arc<SignalingClient>,
    engine: Arc<dyn EngineFactory>,
    settings: NegotiationSettings,
    clients: Clients,
    connected: watch::Sender<BTreeSet<PeerId>>,
    failures: broadcast::Sender<NegotiationFailure>,
    messages: mpsc::Sender<PeerMessage>,
    closed_tx: mpsc::UnboundedSender<(PeerId, u64)>,
    active: HashMap<PeerId, ActiveSession>,
    /// Generation of the negotiation that produced each live client.
    client_generations: HashMap<PeerId, u64>,
    negotiations: JoinSet<NegotiationOutcome>,
    next_generation: u64,
    cancel: CancellationToken,
}

impl Supervisor {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<LinkCommand>,
        mut closed: mpsc::UnboundedReceiver<(PeerId, u64)>,
    ) {
        let mut offers = self.signaling.subscribe_offers(0);
        let mut connectivity = self.signaling.subscribe_connectivity(0);
        let mut signaling_open = true;

        loop {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                Some(command) = commands.recv() => match command {
                    LinkCommand::Connect { peer, reply } => self.connect(peer, reply).await,
                },
                Some(outcome) = self.negotiations.join_next(), if !self.negotiations.is_empty() => {
                    match outcome {
                        Ok((peer, generation, result)) => self.settle(peer, generation, result).await,
                        Err(e) => warn!(link_id = %self.link_id, error = %e, "Negotiation task aborted"),
                    }
                }
                Some((peer, generation)) = closed.recv() => self.on_client_closed(&peer, generation).await,
                event = offers.recv(), if signaling_open => match event {
                    Some(event) => {
                        let trigger = NegotiationTrigger::Offer {
                            offer: event.value.value,
                            seq: event.seq,
                        };
                        self.start(event.value.peer, trigger, Vec::new());
                    }
                    None => {
                        info!(link_id = %self.link_id, "Signaling closed, no further negotiations");
                        signaling_open = false;
                    }
                },
                Some(event) = connectivity.recv(), if signaling_open => {
                    let peer = event.value.peer;
                    if !event.value.value.is_connected() {
                        debug!(link_id = %self.link_id, peer_id = %peer, "Remote peer left the relay");
                    } else if self.role == LinkRole::Initiator
                        && !self.active.contains_key(&peer)
                        && !self.clients.read().await.contains_key(&peer)
                    {
                        self.start(peer, NegotiationTrigger::Initiate { seq: event.seq }, Vec::new());
                    }
                }
            }
        }

        self.teardown().await;
    }

    async fn connect(&mut self, peer: PeerId, reply: ConnectReply) {
        if self.clients.read().await.contains_key(&peer) {
            let _ = reply.send(Ok(()));
            return;
        }
        if let Some(active) = self.active.get_mut(&peer) {
            active.waiters.push(reply);
            return;
        }
        let seq = self.signaling.current_seq();
        self.start(peer, NegotiationTrigger::Initiate { seq }, vec![reply]);
    }

    /// Start a negotiation, superseding any session already active for `peer`.
    fn start(&mut self, peer: PeerId, trigger: NegotiationTrigger, mut waiters: Vec<ConnectReply>) {
        if let Some(previous) = self.active.remove(&peer) {
            info!(link_id = %self.link_id, peer_id = %peer, "New offer supersedes active negotiation");
            previous.cancel.cancel();
            waiters.extend(previous.waiters);
        }

        self.next_generation += 1;
        let generation = self.next_generation;
        let cancel = self.cancel.child_token();
        self.active.insert(
            peer.clone(),
            ActiveSession {
                generation,
                cancel: cancel.clone(),
                waiters,
            },
        );

        debug!(link_id = %self.link_id, peer_id = %peer, generation, "Starting negotiation");
        let negotiator = Negotiator::new(
            peer.clone(),
            Arc::clone(&self.signaling),
            Arc::clone(&self.engine),
            self.settings,
        );
        self.negotiations.spawn(async move {
            let result = negotiator.run(trigger, cancel).await;
            (peer, generation, result)
        });
    }

    async fn settle(
        &mut self,
        peer: PeerId,
        generation: u64,
        result: Result<ConnectionClient, NegotiationFailure>,
    ) {
        let current = self
            .active
            .get(&peer)
            .is_some_and(|a| a.generation == generation);
        if !current {
            // Superseded by a newer session for the same peer.
            if let Ok(client) = result {
                client.close().await;
            }
            return;
        }
        let waiters = self
            .active
            .remove(&peer)
            .map(|a| a.waiters)
            .unwrap_or_default();

        match result {
            Ok(client) => {
                self.promote(peer, generation, client).await;
                for waiter in waiters {
                    let _ = waiter.send(Ok(()));
                }
            }
            Err(failure) => {
                let _ = self.failures.send(failure.clone());
                for waiter in waiters {
                    let _ = waiter.send(Err(failure.clone()));
                }
            }
        }
    }

    async fn promote(&mut self, peer: PeerId, generation: u64, client: ConnectionClient) {
        let client = Arc::new(client);
        if let Some(mut stream) = client.received_messages() {
            let messages = self.messages.clone();
            let from = peer.clone();
            tokio::spawn(async move {
                while let Some(result) = stream.next().await {
                    let message = PeerMessage {
                        peer: from.clone(),
                        result,
                    };
                    if messages.send(message).await.is_err() {
                        break;
                    }
                }
            });
        }
        let watched = Arc::clone(&client);
        let closed = self.closed_tx.clone();
        tokio::spawn(async move {
            watched.closed().await;
            let _ = closed.send((watched.peer().clone(), generation));
        });

        let replaced = self
            .clients
            .write()
            .await
            .insert(peer.clone(), Arc::clone(&client));
        if let Some(old) = replaced {
            info!(link_id = %self.link_id, peer_id = %peer, "Replacing existing connection");
            old.close().await;
        }
        self.client_generations.insert(peer.clone(), generation);
        self.connected.send_modify(|peers| {
            peers.insert(peer.clone());
        });
        info!(link_id = %self.link_id, peer_id = %peer, "Peer connected");
    }

    async fn on_client_closed(&mut self, peer: &PeerId, generation: u64) {
        if self.client_generations.get(peer) != Some(&generation) {
            return;
        }
        let removed = self.clients.write().await.remove(peer);
        if let Some(client) = removed {
            client.close().await;
        }
        self.client_generations.remove(peer);
        self.connected.send_modify(|peers| {
            peers.remove(peer);
        });
        info!(link_id = %self.link_id, peer_id = %peer, "Peer connection closed");
    }

    async fn teardown(&mut self) {
        for (_, active) in self.active.drain() {
            active.cancel.cancel();
        }
        self.negotiations.shutdown().await;

        let clients: Vec<_> = self.clients.write().await.drain().map(|(_, c)| c).collect();
        for client in clients {
            client.close().await;
        }
        self.client_generations.clear();
        self.connected.send_replace(BTreeSet::new());
        self.signaling.shutdown().await;
        info!(link_id = %self.link_id, "Link shut down");
    }
}
