//! Bounded queue between engine callbacks and the negotiator.
//!
//! Engine callbacks never call into negotiation logic; they only push
//! [`EngineEvent`]s here and return.

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

use super::EngineEvent;

/// Create an engine event queue holding at most `capacity` events.
pub fn event_channel(capacity: usize) -> (EventSink, mpsc::Receiver<EngineEvent>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (EventSink { tx }, rx)
}

/// Producer half handed to engine callbacks.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::Sender<EngineEvent>,
}

impl EventSink {
    /// Queue an event, waiting for room. Returns `false` once nobody listens.
    pub async fn emit(&self, event: EngineEvent) -> bool {
        match self.tx.send(event).await {
            Ok(()) => true,
            Err(e) => {
                debug!(event = ?e.0, "Engine event dropped, receiver gone");
                false
            }
        }
    }

    /// Queue an event from a synchronous callback.
    pub fn try_emit(&self, event: EngineEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(event)) => {
                warn!(?event, "Engine event queue full, event dropped");
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
