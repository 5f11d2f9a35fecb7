//! Source of link descriptors.
//!
//! The core never persists pairings. A [`PairingStore`] supplies the known
//! links up front and then reports additions and removals.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use peerlink_core::{Error, Result};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::debug;

use crate::types::{LinkDescriptor, LinkId};

/// A change to the set of paired links.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairingUpdate {
    Added(LinkDescriptor),
    Removed(LinkId),
}

#[async_trait]
pub trait PairingStore: Send + Sync {
    /// Links known at startup.
    async fn load(&self) -> Result<Vec<LinkDescriptor>>;

    /// Changes after [`PairingStore::load`]. Ends when the store stops
    /// reporting.
    fn updates(&self) -> BoxStream<'static, PairingUpdate>;
}

/// Read-only JSON file holding an array of link descriptors.
#[derive(Debug, Clone)]
pub struct JsonFilePairingStore {
    path: PathBuf,
}

impl JsonFilePairingStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl PairingStore for JsonFilePairingStore {
    async fn load(&self) -> Result<Vec<LinkDescriptor>> {
        let content = tokio::fs::read_to_string(&self.path).await?;
        let links: Vec<LinkDescriptor> = serde_json::from_str(&content).map_err(|e| {
            Error::Config(format!("invalid pairing file {}: {e}", self.path.display()))
        })?;
        debug!(path = %self.path.display(), count = links.len(), "Loaded pairing file");
        Ok(links)
    }

    fn updates(&self) -> BoxStream<'static, PairingUpdate> {
        stream::empty().boxed()
    }
}

/// In-process store whose updates are pushed through a channel.
pub struct MemoryPairingStore {
    initial: Vec<LinkDescriptor>,
    updates: Mutex<Option<mpsc::UnboundedReceiver<PairingUpdate>>>,
}

impl MemoryPairingStore {
    /// Returns the store and the sender that feeds its update stream.
    /// Dropping the sender ends the stream.
    pub fn new(initial: Vec<LinkDescriptor>) -> (Self, mpsc::UnboundedSender<PairingUpdate>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let store = Self {
            initial,
            updates: Mutex::new(Some(rx)),
        };
        (store, tx)
    }
}

#[async_trait]
impl PairingStore for MemoryPairingStore {
    async fn load(&self) -> Result<Vec<LinkDescriptor>> {
        Ok(self.initial.clone())
    }

    /// The first call takes the update feed; later calls get an empty one.
    fn updates(&self) -> BoxStream<'static, PairingUpdate> {
        let taken = self
            .updates
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        match taken {
            Some(rx) => UnboundedReceiverStream::new(rx).boxed(),
            None => stream::empty().boxed(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::types::LinkRole;
    use peerlink_crypto::LinkSecret;

    #[tokio::test]
    async fn json_file_store_reads_descriptors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("links.json");
        let secret = "11".repeat(32);
        std::fs::write(
            &path,
            format!(
                r#"[{{"secret":"{secret}"}},{{"id":"named","secret":"{secret}","role":"initiator"}}]"#
            ),
        )
        .unwrap();

        let links = JsonFilePairingStore::new(&path).load().await.unwrap();
        assert_eq!(links.len(), 2);
        assert_eq!(links[0].id, None);
        assert_eq!(links[0].role, LinkRole::Responder);
        assert_eq!(
            links[0].link_id(),
            LinkId::from_secret(&LinkSecret::from_bytes([0x11; 32]))
        );
        assert_eq!(links[1].link_id(), LinkId::from("named"));
        assert_eq!(links[1].role, LinkRole::Initiator);
    }

    #[tokio::test]
    async fn json_file_store_rejects_bad_secret() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("links.json");
        std::fs::write(&path, r#"[{"secret":"abcd"}]"#).unwrap();

        let err = JsonFilePairingStore::new(&path).load().await.unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn missing_file_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = JsonFilePairingStore::new(dir.path().join("absent.json"))
            .load()
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }

    #[tokio::test]
    async fn memory_store_streams_updates_once() {
        let link = LinkDescriptor::new(LinkSecret::from_bytes([2u8; 32]));
        let (store, tx) = MemoryPairingStore::new(vec![link.clone()]);
        assert_eq!(store.load().await.unwrap(), vec![link.clone()]);

        let mut updates = store.updates();
        tx.send(PairingUpdate::Removed(link.link_id())).unwrap();
        drop(tx);
        assert_eq!(
            updates.next().await,
            Some(PairingUpdate::Removed(link.link_id()))
        );
        assert_eq!(updates.next().await, None);
        assert_eq!(store.updates().next().await, None);
    }
}
