//! Outstanding relay requests awaiting acknowledgement.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::oneshot;

use crate::error::RelayErrorCode;
use crate::types::RequestId;

pub type AckResult = Result<(), RelayErrorCode>;

/// Map of request id to the waiter for its acknowledgement.
#[derive(Clone, Default)]
pub struct PendingAcks {
    inner: Arc<Mutex<HashMap<RequestId, oneshot::Sender<AckResult>>>>,
}

impl PendingAcks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pending request. The id is released when the returned
    /// guard is dropped, whether or not an acknowledgement arrived.
    pub fn register(&self, request_id: RequestId) -> PendingGuard {
        let (tx, rx) = oneshot::channel();
        self.lock().insert(request_id.clone(), tx);
        PendingGuard {
            acks: self.clone(),
            request_id,
            rx: Some(rx),
        }
    }

    /// Complete a pending request. Returns `false` for unknown ids.
    pub fn complete(&self, request_id: &RequestId, result: AckResult) -> bool {
        self.lock()
            .remove(request_id)
            .is_some_and(|tx| tx.send(result).is_ok())
    }

    /// Drop every waiter; their guards observe a closed channel.
    pub fn cancel_all(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<RequestId, oneshot::Sender<AckResult>>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Ownership of one pending request id.
pub struct PendingGuard {
    acks: PendingAcks,
    request_id: RequestId,
    rx: Option<oneshot::Receiver<AckResult>>,
}

impl PendingGuard {
    pub const fn request_id(&self) -> &RequestId {
        &self.request_id
    }

    /// Wait for the acknowledgement. `None` if the waiter was cancelled.
    pub async fn wait(&mut self) -> Option<AckResult> {
        let rx = self.rx.as_mut()?;
        let result = rx.await.ok();
        self.rx = None;
        result
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.acks.lock().remove(&self.request_id);
    }
}
