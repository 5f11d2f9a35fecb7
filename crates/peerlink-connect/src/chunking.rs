//! Chunked message framing over a data channel.
//!
//! A logical message travels as a metadata package followed by its chunks,
//! each a JSON package on the channel. The receiver buffers chunks per
//! message id, checks length and SHA-256 once complete, and answers with a
//! confirmation or error receipt.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::engine::DataChannel;
use crate::error::TransportError;

/// One package on the data channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    tag = "packageType",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum Package {
    MetaData {
        message_id: String,
        chunk_count: usize,
        message_byte_count: usize,
        hash_of_message: String,
    },
    Chunk {
        message_id: String,
        chunk_index: usize,
        chunk_data: String,
    },
    ReceiveMessageConfirmation {
        message_id: String,
    },
    ReceiveMessageError {
        message_id: String,
        error: String,
    },
}

impl Package {
    pub fn message_id(&self) -> &str {
        match self {
            Self::MetaData { message_id, .. }
            | Self::Chunk { message_id, .. }
            | Self::ReceiveMessageConfirmation { message_id }
            | Self::ReceiveMessageError { message_id, .. } => message_id,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, TransportError> {
        serde_json::to_vec(self).map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// Split `message` into its metadata package followed by ordered chunks of
/// at most `chunk_size` bytes. An empty message still yields one chunk.
pub fn split_message(message_id: &str, message: &[u8], chunk_size: usize) -> Vec<Package> {
    let chunk_size = chunk_size.max(1);
    let pieces: Vec<&[u8]> = if message.is_empty() {
        vec![message]
    } else {
        message.chunks(chunk_size).collect()
    };

    let mut packages = Vec::with_capacity(pieces.len() + 1);
    packages.push(Package::MetaData {
        message_id: message_id.to_string(),
        chunk_count: pieces.len(),
        message_byte_count: message.len(),
        hash_of_message: hex::encode(Sha256::digest(message)),
    });
    packages.extend(pieces.into_iter().enumerate().map(|(index, piece)| Package::Chunk {
        message_id: message_id.to_string(),
        chunk_index: index,
        chunk_data: BASE64.encode(piece),
    }));
    packages
}

/// Receipt returned by the remote side for a message we sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Receipt {
    Confirmed { message_id: String },
    Rejected { message_id: String, reason: String },
}

/// Result of feeding one package into a [`ChunkAssembler`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Assembled {
    Message { message_id: String, bytes: Vec<u8> },
    /// The message was discarded; a `Reassembly` error.
    Failed { message_id: String, error: TransportError },
    Receipt(Receipt),
}

struct PartialMessage {
    byte_count: usize,
    hash: String,
    chunk_count: usize,
    /// Filled as chunks arrive, keyed by index.
    chunks: BTreeMap<usize, Vec<u8>>,
    received_bytes: usize,
}

/// Bounds on what a remote peer may make the assembler hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AssemblyLimits {
    pub max_message_bytes: usize,
    pub max_pending_messages: usize,
}

impl Default for AssemblyLimits {
    fn default() -> Self {
        let config = peerlink_core::config::TransportConfig::default();
        Self {
            max_message_bytes: config.max_message_bytes,
            max_pending_messages: config.max_pending_messages,
        }
    }
}

/// Reassembles inbound packages into whole messages.
#[derive(Default)]
pub struct ChunkAssembler {
    partial: HashMap<String, PartialMessage>,
    limits: AssemblyLimits,
}

impl ChunkAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limits(limits: AssemblyLimits) -> Self {
        Self {
            partial: HashMap::new(),
            limits,
        }
    }

    /// Feed one package. Returns an outcome once a message completes, fails,
    /// or a receipt arrives.
    pub fn on_package(&mut self, package: Package) -> Option<Assembled> {
        match package {
            Package::MetaData {
                message_id,
                chunk_count,
                message_byte_count,
                hash_of_message,
            } => {
                if self.partial.contains_key(&message_id) {
                    self.partial.remove(&message_id);
                    return Some(reassembly_failed(message_id, "duplicate metadata package"));
                }
                if let Err(reason) = self.check_metadata(chunk_count, message_byte_count) {
                    return Some(reassembly_failed(message_id, &reason));
                }
                self.partial.insert(
                    message_id,
                    PartialMessage {
                        byte_count: message_byte_count,
                        hash: hash_of_message.to_ascii_lowercase(),
                        chunk_count,
                        chunks: BTreeMap::new(),
                        received_bytes: 0,
                    },
                );
                None
            }
            Package::Chunk {
                message_id,
                chunk_index,
                chunk_data,
            } => self.on_chunk(message_id, chunk_index, &chunk_data),
            Package::ReceiveMessageConfirmation { message_id } => {
                Some(Assembled::Receipt(Receipt::Confirmed { message_id }))
            }
            Package::ReceiveMessageError { message_id, error } => {
                Some(Assembled::Receipt(Receipt::Rejected {
                    message_id,
                    reason: error,
                }))
            }
        }
    }

    /// Metadata comes from the remote peer; nothing is allocated for it
    /// until it passes these bounds.
    fn check_metadata(&self, chunk_count: usize, byte_count: usize) -> Result<(), String> {
        if chunk_count == 0 {
            return Err("metadata announces zero chunks".into());
        }
        if chunk_count > byte_count.max(1) {
            return Err(format!(
                "metadata announces {chunk_count} chunks for {byte_count} bytes"
            ));
        }
        if byte_count > self.limits.max_message_bytes {
            return Err(format!(
                "message of {byte_count} bytes exceeds the {} byte limit",
                self.limits.max_message_bytes
            ));
        }
        if self.partial.len() >= self.limits.max_pending_messages {
            return Err(format!(
                "{} messages already pending",
                self.partial.len()
            ));
        }
        Ok(())
    }

    fn on_chunk(&mut self, message_id: String, index: usize, data: &str) -> Option<Assembled> {
        let Some(partial) = self.partial.get_mut(&message_id) else {
            return Some(reassembly_failed(message_id, "chunk without metadata"));
        };
        if index >= partial.chunk_count {
            let expected = partial.chunk_count;
            self.partial.remove(&message_id);
            return Some(reassembly_failed(
                message_id,
                &format!("chunk index {index} out of range for {expected} chunks"),
            ));
        }
        let bytes = match BASE64.decode(data) {
            Ok(bytes) => bytes,
            Err(e) => {
                self.partial.remove(&message_id);
                return Some(reassembly_failed(message_id, &format!("bad chunk data: {e}")));
            }
        };
        if partial.chunks.contains_key(&index) {
            debug!(%message_id, index, "Duplicate chunk ignored");
            return None;
        }
        partial.received_bytes += bytes.len();
        if partial.received_bytes > partial.byte_count {
            let stated = partial.byte_count;
            self.partial.remove(&message_id);
            return Some(reassembly_failed(
                message_id,
                &format!("chunks exceed the stated {stated} bytes"),
            ));
        }
        partial.chunks.insert(index, bytes);
        if partial.chunks.len() < partial.chunk_count {
            return None;
        }

        let partial = self.partial.remove(&message_id)?;
        let message: Vec<u8> = partial.chunks.into_values().flatten().collect();
        if message.len() != partial.byte_count {
            return Some(reassembly_failed(
                message_id,
                &format!(
                    "assembled {} bytes but metadata stated {}",
                    message.len(),
                    partial.byte_count
                ),
            ));
        }
        let hash = hex::encode(Sha256::digest(&message));
        if hash != partial.hash {
            return Some(reassembly_failed(message_id, "message hash mismatch"));
        }
        Some(Assembled::Message {
            message_id,
            bytes: message,
        })
    }

    /// Discard every partially received message, reporting each one.
    pub fn drain_incomplete(&mut self) -> Vec<TransportError> {
        self.partial
            .drain()
            .map(|(message_id, partial)| TransportError::IncompleteTransfer {
                message_id,
                received: partial.chunks.len(),
                expected: partial.chunk_count,
            })
            .collect()
    }

    pub fn pending_messages(&self) -> usize {
        self.partial.len()
    }
}

fn reassembly_failed(message_id: String, reason: &str) -> Assembled {
    Assembled::Failed {
        error: TransportError::Reassembly {
            message_id: message_id.clone(),
            reason: reason.to_string(),
        },
        message_id,
    }
}

type ReceiptWaiters = HashMap<String, oneshot::Sender<Result<(), TransportError>>>;

/// Sending half of the chunk protocol over one data channel.
pub struct ChunkTransport {
    channel: Arc<dyn DataChannel>,
    chunk_size: usize,
    send_lock: tokio::sync::Mutex<()>,
    receipts: Mutex<ReceiptWaiters>,
}

impl ChunkTransport {
    pub fn new(channel: Arc<dyn DataChannel>, chunk_size: usize) -> Self {
        Self {
            channel,
            chunk_size: chunk_size.max(1),
            send_lock: tokio::sync::Mutex::new(()),
            receipts: Mutex::new(HashMap::new()),
        }
    }

    pub fn channel(&self) -> &Arc<dyn DataChannel> {
        &self.channel
    }

    /// Send a message without waiting for its receipt. Returns its id.
    pub async fn send_message(&self, message: &[u8]) -> Result<String, TransportError> {
        let message_id = uuid::Uuid::new_v4().to_string();
        self.send_packages(&message_id, message).await?;
        Ok(message_id)
    }

    /// Send a message and wait for the receiver's confirmation.
    pub async fn send_message_confirmed(
        &self,
        message: &[u8],
        timeout: Duration,
    ) -> Result<String, TransportError> {
        let message_id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.lock_receipts().insert(message_id.clone(), tx);

        if let Err(e) = self.send_packages(&message_id, message).await {
            self.lock_receipts().remove(&message_id);
            return Err(e);
        }
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result.map(|()| message_id),
            Ok(Err(_)) => Err(TransportError::ChannelClosed),
            Err(_) => {
                self.lock_receipts().remove(&message_id);
                Err(TransportError::SendFailed(format!(
                    "no receipt for message {message_id} within {timeout:?}"
                )))
            }
        }
    }

    async fn send_packages(&self, message_id: &str, message: &[u8]) -> Result<(), TransportError> {
        let packages = split_message(message_id, message, self.chunk_size);
        let _guard = self.send_lock.lock().await;
        debug!(%message_id, chunks = packages.len() - 1, bytes = message.len(), "Sending message");
        for package in &packages {
            self.channel.send(package.encode()?).await?;
        }
        Ok(())
    }

    /// Send a receipt package for a message we received.
    pub async fn send_receipt(&self, package: &Package) -> Result<(), TransportError> {
        self.channel.send(package.encode()?).await
    }

    /// Resolve the waiter for a receipt. Unknown ids are ignored.
    pub fn complete_receipt(&self, receipt: Receipt) {
        let (message_id, result) = match receipt {
            Receipt::Confirmed { message_id } => (message_id, Ok(())),
            Receipt::Rejected { message_id, reason } => {
                let error = TransportError::SendFailed(format!("receiver rejected message: {reason}"));
                (message_id, Err(error))
            }
        };
        match self.lock_receipts().remove(&message_id) {
            Some(tx) => {
                let _ = tx.send(result);
            }
            None if result.is_err() => {
                warn!(%message_id, "Receiver rejected a message");
            }
            None => {}
        }
    }

    /// Fail every outstanding receipt wait.
    pub fn fail_pending_receipts(&self) {
        for (_, tx) in self.lock_receipts().drain() {
            let _ = tx.send(Err(TransportError::ChannelClosed));
        }
    }

    fn lock_receipts(&self) -> MutexGuard<'_, ReceiptWaiters> {
        self.receipts.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn assemble_all(packages: Vec<Package>) -> (ChunkAssembler, Vec<Assembled>) {
        let mut assembler = ChunkAssembler::new();
        let outcomes = packages
            .into_iter()
            .filter_map(|p| assembler.on_package(p))
            .collect();
        (assembler, outcomes)
    }

    fn chunk_indices(packages: &[Package]) -> Vec<usize> {
        packages
            .iter()
            .filter_map(|p| match p {
                Package::Chunk { chunk_index, .. } => Some(*chunk_index),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn five_thousand_bytes_in_five_chunks() {
        let message: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
        let packages = split_message("m1", &message, 1000);
        assert_eq!(chunk_indices(&packages), vec![0, 1, 2, 3, 4]);
        assert!(matches!(
            packages[0],
            Package::MetaData { chunk_count: 5, message_byte_count: 5000, .. }
        ));

        let (_, outcomes) = assemble_all(packages);
        assert_eq!(
            outcomes,
            vec![Assembled::Message {
                message_id: "m1".into(),
                bytes: message
            }]
        );
    }

    #[test]
    fn missing_chunk_never_emits() {
        let message = vec![7u8; 5000];
        let packages: Vec<Package> = split_message("m1", &message, 1000)
            .into_iter()
            .filter(|p| !matches!(p, Package::Chunk { chunk_index: 3, .. }))
            .collect();
        let (mut assembler, outcomes) = assemble_all(packages);
        assert!(outcomes.is_empty());
        assert_eq!(
            assembler.drain_incomplete(),
            vec![TransportError::IncompleteTransfer {
                message_id: "m1".into(),
                received: 4,
                expected: 5
            }]
        );
        assert_eq!(assembler.pending_messages(), 0);
    }

    #[test]
    fn out_of_order_chunks_reassemble_in_index_order() {
        let message = b"abcdefghij".to_vec();
        let mut packages = split_message("m", &message, 3);
        packages[1..].reverse();
        let (_, outcomes) = assemble_all(packages);
        assert_eq!(
            outcomes,
            vec![Assembled::Message {
                message_id: "m".into(),
                bytes: message
            }]
        );
    }

    #[test]
    fn interleaved_messages_are_kept_apart() {
        let a = split_message("a", b"first message", 4);
        let b = split_message("b", b"second one", 4);
        let mut mixed = Vec::new();
        let mut a = a.into_iter();
        let mut b = b.into_iter();
        loop {
            let (x, y) = (a.next(), b.next());
            if x.is_none() && y.is_none() {
                break;
            }
            mixed.extend(x);
            mixed.extend(y);
        }
        let (_, outcomes) = assemble_all(mixed);
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes.contains(&Assembled::Message {
            message_id: "a".into(),
            bytes: b"first message".to_vec()
        }));
    }

    #[test]
    fn zero_chunk_metadata_is_rejected() {
        let mut assembler = ChunkAssembler::new();
        let outcome = assembler.on_package(Package::MetaData {
            message_id: "z".into(),
            chunk_count: 0,
            message_byte_count: 0,
            hash_of_message: String::new(),
        });
        assert!(matches!(
            outcome,
            Some(Assembled::Failed { error: TransportError::Reassembly { .. }, .. })
        ));
    }

    fn metadata(message_id: &str, chunk_count: usize, message_byte_count: usize) -> Package {
        Package::MetaData {
            message_id: message_id.into(),
            chunk_count,
            message_byte_count,
            hash_of_message: "00".repeat(32),
        }
    }

    fn assert_rejected(outcome: Option<Assembled>, needle: &str) {
        match outcome {
            Some(Assembled::Failed { error: TransportError::Reassembly { reason, .. }, .. }) => {
                assert!(reason.contains(needle), "reason {reason:?} lacks {needle:?}");
            }
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[test]
    fn more_chunks_than_bytes_is_rejected_without_allocating() {
        let mut assembler = ChunkAssembler::new();
        assert_rejected(assembler.on_package(metadata("a", usize::MAX / 16, 10)), "chunks for");
        assert_rejected(assembler.on_package(metadata("b", 1 << 40, 1 << 20)), "chunks for");
        assert_eq!(assembler.pending_messages(), 0);
    }

    #[test]
    fn oversized_message_is_rejected() {
        let mut assembler = ChunkAssembler::with_limits(AssemblyLimits {
            max_message_bytes: 1024,
            max_pending_messages: 4,
        });
        assert_rejected(assembler.on_package(metadata("big", 2, 1025)), "limit");
        assert_rejected(assembler.on_package(metadata("huge", 1, usize::MAX)), "limit");
        assert!(assembler.on_package(metadata("ok", 2, 1024)).is_none());
        assert_eq!(assembler.pending_messages(), 1);
    }

    #[test]
    fn pending_messages_are_capped() {
        let mut assembler = ChunkAssembler::with_limits(AssemblyLimits {
            max_message_bytes: 1024,
            max_pending_messages: 2,
        });
        assert!(assembler.on_package(metadata("m1", 1, 10)).is_none());
        assert!(assembler.on_package(metadata("m2", 1, 10)).is_none());
        assert_rejected(assembler.on_package(metadata("m3", 1, 10)), "pending");
        assert_eq!(assembler.pending_messages(), 2);

        assert_eq!(assembler.drain_incomplete().len(), 2);
        let packages = split_message("done", b"0123456789", 10);
        let outcomes: Vec<_> = packages
            .into_iter()
            .filter_map(|p| assembler.on_package(p))
            .collect();
        assert!(matches!(outcomes[..], [Assembled::Message { .. }]));
        assert_eq!(assembler.pending_messages(), 0);
    }

    #[test]
    fn chunks_beyond_the_stated_size_fail_the_message() {
        let mut packages = split_message("m", b"abcdef", 3);
        if let Package::MetaData { message_byte_count, .. } = &mut packages[0] {
            *message_byte_count = 4;
        }
        let (mut assembler, outcomes) = assemble_all(packages);
        assert!(matches!(outcomes[..], [Assembled::Failed { .. }]));
        assert_eq!(assembler.pending_messages(), 0);
        assert!(assembler.drain_incomplete().is_empty());
    }

    #[test]
    fn out_of_range_index_fails_the_message() {
        let mut packages = split_message("m", b"abc", 3);
        packages[1] = Package::Chunk {
            message_id: "m".into(),
            chunk_index: 5,
            chunk_data: String::new(),
        };
        let (mut assembler, outcomes) = assemble_all(packages);
        assert!(matches!(outcomes[..], [Assembled::Failed { .. }]));
        assert!(assembler.drain_incomplete().is_empty());
    }

    #[test]
    fn byte_count_mismatch_is_detected() {
        let mut packages = split_message("m", b"abc", 10);
        if let Package::MetaData { message_byte_count, .. } = &mut packages[0] {
            *message_byte_count = 10;
        }
        let (_, outcomes) = assemble_all(packages);
        assert!(matches!(outcomes[..], [Assembled::Failed { .. }]));
    }

    #[test]
    fn hash_mismatch_is_detected() {
        let mut packages = split_message("m", b"abc", 10);
        if let Package::MetaData { hash_of_message, .. } = &mut packages[0] {
            *hash_of_message = "deadbeef".repeat(8);
        }
        let (_, outcomes) = assemble_all(packages);
        match &outcomes[..] {
            [Assembled::Failed { error: TransportError::Reassembly { reason, .. }, .. }] => {
                assert!(reason.contains("hash"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn duplicate_chunk_is_ignored() {
        let packages = split_message("m", b"hello world", 4);
        let mut with_dup = packages.clone();
        with_dup.insert(2, packages[1].clone());
        let (_, outcomes) = assemble_all(with_dup);
        assert_eq!(
            outcomes,
            vec![Assembled::Message {
                message_id: "m".into(),
                bytes: b"hello world".to_vec()
            }]
        );
    }

    #[test]
    fn package_wire_names() {
        let json = serde_json::to_value(Package::ReceiveMessageConfirmation {
            message_id: "x".into(),
        })
        .unwrap();
        assert_eq!(json["packageType"], "receiveMessageConfirmation");
        assert_eq!(json["messageId"], "x");

        let meta = serde_json::to_value(&split_message("y", b"", 5)[0]).unwrap();
        assert_eq!(meta["packageType"], "metaData");
        assert_eq!(meta["chunkCount"], 1);
        assert!(meta["hashOfMessage"].is_string());
    }

    #[test]
    fn receipts_pass_through() {
        let mut assembler = ChunkAssembler::new();
        assert_eq!(
            assembler.on_package(Package::ReceiveMessageError {
                message_id: "m".into(),
                error: "messageHashesMismatch".into()
            }),
            Some(Assembled::Receipt(Receipt::Rejected {
                message_id: "m".into(),
                reason: "messageHashesMismatch".into()
            }))
        );
    }

    proptest! {
        #[test]
        fn chunking_round_trip(
            message in proptest::collection::vec(any::<u8>(), 0..2048),
            chunk_size in prop_oneof![Just(4096usize), 1usize..64, Just(1usize)],
        ) {
            let packages = split_message("p", &message, chunk_size);
            let (_, outcomes) = assemble_all(packages);
            prop_assert_eq!(
                outcomes,
                vec![Assembled::Message { message_id: "p".into(), bytes: message }]
            );
        }
    }

    #[test]
    fn more_than_256_chunks_round_trip() {
        let message: Vec<u8> = (0..1000u32).map(|i| (i * 7 % 256) as u8).collect();
        let packages = split_message("big", &message, 3);
        assert_eq!(packages.len() - 1, 334);
        let (_, outcomes) = assemble_all(packages);
        assert_eq!(
            outcomes,
            vec![Assembled::Message {
                message_id: "big".into(),
                bytes: message
            }]
        );
    }
}
