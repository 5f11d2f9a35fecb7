//! Registry of active links.
//!
//! Each link is independent: adding, failing or removing one never touches
//! another. Messages from every link are merged into one inbound feed
//! tagged with their link and peer, and every link's connected peers are
//! merged into one watched snapshot.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, PoisonError};

use futures::StreamExt;
use peerlink_core::Config;
use tokio::sync::{RwLock, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

use crate::connection::MessageResult;
use crate::engine::EngineFactory;
use crate::error::LinkError;
use crate::link::{Link, LinkSettings};
use crate::pairing::{PairingStore, PairingUpdate};
use crate::signaling::RelayConnector;
use crate::types::{LinkDescriptor, LinkId, PeerId};

/// A message received on any link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub link_id: LinkId,
    pub peer_id: PeerId,
    pub result: MessageResult,
}

/// Connected peers of every link that has at least one.
pub type ConnectedPeers = BTreeMap<LinkId, BTreeSet<PeerId>>;

struct Entry {
    link: Arc<Link>,
    forwarder: JoinHandle<()>,
    presence: JoinHandle<()>,
}

impl Entry {
    async fn shutdown(self, id: &LinkId, connected: &watch::Sender<ConnectedPeers>) {
        self.link.shutdown().await;
        self.forwarder.abort();
        self.presence.abort();
        connected.send_if_modified(|peers| peers.remove(id).is_some());
        info!(link_id = %id, "Link removed");
    }
}

/// Owns every link and routes traffic by `(link, peer)`.
pub struct LinkRegistry {
    connector: Arc<dyn RelayConnector>,
    engine: Arc<dyn EngineFactory>,
    settings: LinkSettings,
    links: RwLock<HashMap<LinkId, Entry>>,
    inbound_tx: mpsc::Sender<InboundMessage>,
    inbound_rx: Mutex<Option<mpsc::Receiver<InboundMessage>>>,
    connected: watch::Sender<ConnectedPeers>,
}

impl LinkRegistry {
    pub fn new(
        connector: Arc<dyn RelayConnector>,
        engine: Arc<dyn EngineFactory>,
        settings: LinkSettings,
    ) -> Self {
        let (inbound_tx, inbound_rx) =
            mpsc::channel(settings.negotiation.transport.inbound_buffer.max(1));
        Self {
            connector,
            engine,
            settings,
            links: RwLock::new(HashMap::new()),
            inbound_tx,
            inbound_rx: Mutex::new(Some(inbound_rx)),
            connected: watch::Sender::new(ConnectedPeers::new()),
        }
    }

    pub fn from_config(
        connector: Arc<dyn RelayConnector>,
        engine: Arc<dyn EngineFactory>,
        config: &Config,
    ) -> Self {
        Self::new(connector, engine, LinkSettings::from(config))
    }

    /// Open a link. Adding an id that is already registered does nothing.
    pub async fn add(&self, descriptor: &LinkDescriptor) -> Result<LinkId, LinkError> {
        let id = descriptor.link_id();
        if self.links.read().await.contains_key(&id) {
            info!(link_id = %id, "Link already registered");
            return Ok(id);
        }

        let link = Link::open(
            descriptor,
            self.connector.as_ref(),
            Arc::clone(&self.engine),
            self.settings,
        )
        .await?;

        let mut links = self.links.write().await;
        if links.contains_key(&id) {
            // Lost a race with a concurrent add of the same link.
            drop(links);
            link.shutdown().await;
            info!(link_id = %id, "Link already registered");
            return Ok(id);
        }
        let forwarder = spawn_forwarder(&link, self.inbound_tx.clone());
        let presence = spawn_presence(&link, self.connected.clone());
        links.insert(
            id.clone(),
            Entry {
                link,
                forwarder,
                presence,
            },
        );
        info!(link_id = %id, "Link registered");
        Ok(id)
    }

    /// Shut a link down. Returns `false` if it was not registered.
    pub async fn remove(&self, id: &LinkId) -> bool {
        let entry = self.links.write().await.remove(id);
        if let Some(entry) = entry {
            entry.shutdown(id, &self.connected).await;
            true
        } else {
            warn!(link_id = %id, "Tried to remove unknown link");
            false
        }
    }

    pub async fn link(&self, id: &LinkId) -> Option<Arc<Link>> {
        self.links
            .read()
            .await
            .get(id)
            .map(|entry| Arc::clone(&entry.link))
    }

    async fn require(&self, id: &LinkId) -> Result<Arc<Link>, LinkError> {
        self.link(id)
            .await
            .ok_or_else(|| LinkError::UnknownLink(id.clone()))
    }

    /// Send one message to `peer` over link `id`.
    pub async fn send(&self, id: &LinkId, peer: &PeerId, data: &[u8]) -> Result<(), LinkError> {
        self.require(id).await?.send(peer, data).await
    }

    /// Send one message and wait for the peer's receipt.
    pub async fn send_confirmed(
        &self,
        id: &LinkId,
        peer: &PeerId,
        data: &[u8],
    ) -> Result<(), LinkError> {
        self.require(id).await?.send_confirmed(peer, data).await
    }

    /// Send one message to every connected peer on every link.
    ///
    /// Returns how many peers it was sent to. Fails with
    /// [`LinkError::NoConnectedPeers`] when there is nobody to send to, or
    /// with the first error when every send failed.
    pub async fn broadcast(&self, data: &[u8]) -> Result<usize, LinkError> {
        let targets: Vec<(Arc<Link>, PeerId)> = {
            let links = self.links.read().await;
            links
                .values()
                .flat_map(|entry| {
                    entry
                        .link
                        .connected_peers()
                        .into_iter()
                        .map(|peer| (Arc::clone(&entry.link), peer))
                })
                .collect()
        };
        if targets.is_empty() {
            return Err(LinkError::NoConnectedPeers);
        }

        let results = futures::future::join_all(targets.iter().map(|(link, peer)| async move {
            let result = link.send(peer, data).await;
            if let Err(e) = &result {
                warn!(link_id = %link.id(), peer_id = %peer, error = %e, "Broadcast send failed");
            }
            result
        }))
        .await;

        let mut sent = 0;
        let mut first_error = None;
        for result in results {
            match result {
                Ok(()) => sent += 1,
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) if sent == 0 => Err(e),
            _ => {
                debug!(sent, targets = targets.len(), "Broadcast sent");
                Ok(sent)
            }
        }
    }

    /// Initiate a connection to `peer` on link `id`.
    pub async fn connect(&self, id: &LinkId, peer: &PeerId) -> Result<(), LinkError> {
        self.require(id)
            .await?
            .connect(peer)
            .await
            .map_err(|failure| failure.error)
    }

    /// Merged inbound messages of every link. Can be taken once.
    pub fn inbound_messages(&self) -> Option<ReceiverStream<InboundMessage>> {
        self.inbound_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .map(ReceiverStream::new)
    }

    pub async fn connected_peers(&self, id: &LinkId) -> Option<BTreeSet<PeerId>> {
        self.link(id).await.map(|link| link.connected_peers())
    }

    /// Snapshot of the connected peers of every link.
    pub fn all_connected_peers(&self) -> ConnectedPeers {
        self.connected.borrow().clone()
    }

    /// Follow the connected peers of every link as they change.
    pub fn watch_connected(&self) -> watch::Receiver<ConnectedPeers> {
        self.connected.subscribe()
    }

    pub async fn link_ids(&self) -> Vec<LinkId> {
        self.links.read().await.keys().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.links.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.links.read().await.is_empty()
    }

    /// Load the store's links, then apply its updates until its feed ends.
    ///
    /// A link that fails to open is logged and skipped.
    pub async fn follow(&self, store: &dyn PairingStore) -> peerlink_core::Result<()> {
        let mut updates = store.updates();
        for descriptor in store.load().await? {
            self.add_logged(&descriptor).await;
        }
        while let Some(update) = updates.next().await {
            match update {
                PairingUpdate::Added(descriptor) => self.add_logged(&descriptor).await,
                PairingUpdate::Removed(id) => {
                    self.remove(&id).await;
                }
            }
        }
        Ok(())
    }

    async fn add_logged(&self, descriptor: &LinkDescriptor) {
        if let Err(e) = self.add(descriptor).await {
            warn!(link_id = %descriptor.link_id(), error = %e, "Failed to open link");
        }
    }

    /// Remove every link.
    pub async fn shutdown(&self) {
        let entries: Vec<_> = self.links.write().await.drain().collect();
        for (id, entry) in entries {
            entry.shutdown(&id, &self.connected).await;
        }
    }
}

fn spawn_forwarder(link: &Link, inbound: mpsc::Sender<InboundMessage>) -> JoinHandle<()> {
    let link_id = link.id().clone();
    let messages = link.take_messages();
    tokio::spawn(async move {
        let Some(mut messages) = messages else {
            return;
        };
        while let Some(message) = messages.recv().await {
            let tagged = InboundMessage {
                link_id: link_id.clone(),
                peer_id: message.peer,
                result: message.result,
            };
            if inbound.send(tagged).await.is_err() {
                break;
            }
        }
    })
}

/// Mirror one link's connected peers into the registry-wide snapshot.
fn spawn_presence(link: &Link, all: watch::Sender<ConnectedPeers>) -> JoinHandle<()> {
    let link_id = link.id().clone();
    let mut connected = link.watch_connected();
    tokio::spawn(async move {
        loop {
            let peers = connected.borrow_and_update().clone();
            all.send_if_modified(|snapshot| {
                if peers.is_empty() {
                    snapshot.remove(&link_id).is_some()
                } else if snapshot.get(&link_id) == Some(&peers) {
                    false
                } else {
                    snapshot.insert(link_id.clone(), peers);
                    true
                }
            });
            if connected.changed().await.is_err() {
                all.send_if_modified(|snapshot| snapshot.remove(&link_id).is_some());
                break;
            }
        }
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::testing::{MockEngineFactory, ScriptedRelay};
    use peerlink_crypto::LinkSecret;

    fn registry(relay: &ScriptedRelay) -> LinkRegistry {
        LinkRegistry::new(
            Arc::new(relay.clone()),
            Arc::new(MockEngineFactory::new()),
            LinkSettings::default(),
        )
    }

    #[tokio::test]
    async fn duplicate_add_is_a_no_op() {
        let relay = ScriptedRelay::new();
        let descriptor = LinkDescriptor::new(LinkSecret::from_bytes([1u8; 32]));
        let handle = relay.handle(&descriptor);
        let registry = registry(&relay);

        let first = registry.add(&descriptor).await.unwrap();
        let second = registry.add(&descriptor).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(registry.len().await, 1);
        assert_eq!(handle.connections(), 1);
    }

    #[tokio::test]
    async fn unreachable_relay_fails_the_add() {
        let relay = ScriptedRelay::new();
        let descriptor = LinkDescriptor::new(LinkSecret::from_bytes([2u8; 32]));
        relay.refuse(&descriptor.link_id());
        let registry = registry(&relay);

        let err = registry.add(&descriptor).await.unwrap_err();
        assert!(matches!(err, LinkError::RelayUnavailable(_)));
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn send_to_unknown_targets_is_typed() {
        let relay = ScriptedRelay::new();
        let descriptor = LinkDescriptor::new(LinkSecret::from_bytes([3u8; 32]));
        let registry = registry(&relay);
        let id = registry.add(&descriptor).await.unwrap();

        let missing_link = LinkId::from("missing");
        assert_eq!(
            registry.send(&missing_link, &PeerId::from("p"), b"x").await,
            Err(LinkError::UnknownLink(missing_link))
        );
        assert_eq!(
            registry.send(&id, &PeerId::from("p"), b"x").await,
            Err(LinkError::UnknownPeer(PeerId::from("p")))
        );
    }

    #[tokio::test]
    async fn remove_closes_the_relay_connection() {
        let relay = ScriptedRelay::new();
        let descriptor = LinkDescriptor::new(LinkSecret::from_bytes([4u8; 32]));
        let handle = relay.handle(&descriptor);
        let registry = registry(&relay);
        let id = registry.add(&descriptor).await.unwrap();

        assert!(registry.remove(&id).await);
        assert!(handle.is_closed());
        assert!(!registry.remove(&id).await);
        assert!(registry.link(&id).await.is_none());
    }

    #[tokio::test]
    async fn broadcast_without_peers_is_rejected() {
        let relay = ScriptedRelay::new();
        let registry = registry(&relay);
        assert_eq!(registry.broadcast(b"x").await, Err(LinkError::NoConnectedPeers));

        let descriptor = LinkDescriptor::new(LinkSecret::from_bytes([5u8; 32]));
        registry.add(&descriptor).await.unwrap();
        assert_eq!(registry.broadcast(b"x").await, Err(LinkError::NoConnectedPeers));
        assert!(registry.all_connected_peers().is_empty());
    }

    #[tokio::test]
    async fn inbound_feed_can_be_taken_once() {
        let registry = registry(&ScriptedRelay::new());
        assert!(registry.inbound_messages().is_some());
        assert!(registry.inbound_messages().is_none());
    }
}
