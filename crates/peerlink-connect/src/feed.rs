//! Replayable event feeds.
//!
//! Each feed keeps a bounded history of sequenced events next to a broadcast
//! channel. A subscriber asks for everything after a sequence number and gets
//! the retained backlog followed by live events, with no gap in between.
//! This lets a negotiation that starts slightly after its trigger still see
//! candidates that arrived in the meantime.
//!
//! Broadcast subscribers can lag and lose events when a feed is busy. A
//! subscriber that only cares about some events (one peer's candidates)
//! uses [`EventFeed::subscribe_matching`] instead: matching events are
//! queued for it at publish time, so traffic it filters out can never
//! push its own events out.

use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};
use tracing::warn;

/// An event stamped with its position in the signaling stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sequenced<T> {
    pub seq: u64,
    pub value: T,
}

type Matcher<T> = Box<dyn Fn(&T) -> bool + Send + Sync>;

struct Tap<T> {
    matches: Matcher<T>,
    tx: mpsc::UnboundedSender<Sequenced<T>>,
}

struct FeedState<T> {
    history: VecDeque<Sequenced<T>>,
    live: Option<broadcast::Sender<Sequenced<T>>>,
    taps: Vec<Tap<T>>,
}

/// Multi-consumer feed with a bounded replay buffer.
pub struct EventFeed<T> {
    state: Mutex<FeedState<T>>,
    capacity: usize,
}

impl<T: Clone> EventFeed<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (live, _) = broadcast::channel(capacity * 4);
        Self {
            state: Mutex::new(FeedState {
                history: VecDeque::with_capacity(capacity),
                live: Some(live),
                taps: Vec::new(),
            }),
            capacity,
        }
    }

    /// Append an event. Ignored once the feed is closed.
    pub fn publish(&self, seq: u64, value: T) {
        let mut state = self.lock();
        let Some(live) = state.live.clone() else {
            return;
        };
        let event = Sequenced { seq, value };
        if state.history.len() == self.capacity {
            state.history.pop_front();
        }
        state.history.push_back(event.clone());
        state.taps.retain(|tap| !tap.tx.is_closed());
        for tap in &state.taps {
            if (tap.matches)(&event.value) {
                let _ = tap.tx.send(event.clone());
            }
        }
        // No receivers is fine; the history still holds the event.
        let _ = live.send(event);
    }

    /// Subscribe to every retained event with `seq > after`, then live ones.
    pub fn subscribe_after(&self, after: u64) -> FeedSubscription<T> {
        let state = self.lock();
        let backlog = state
            .history
            .iter()
            .filter(|e| e.seq > after)
            .cloned()
            .collect();
        let live = state
            .live
            .as_ref()
            .map(|sender| Live::Broadcast(sender.subscribe()));
        FeedSubscription {
            backlog,
            live,
            last_seq: after,
        }
    }

    /// Like [`EventFeed::subscribe_after`], restricted to events accepted by
    /// `matches`. Live events are queued per subscriber and never lag.
    pub fn subscribe_matching(
        &self,
        after: u64,
        matches: impl Fn(&T) -> bool + Send + Sync + 'static,
    ) -> FeedSubscription<T> {
        let mut state = self.lock();
        let backlog = state
            .history
            .iter()
            .filter(|e| e.seq > after && matches(&e.value))
            .cloned()
            .collect();
        let live = if state.live.is_some() {
            let (tx, rx) = mpsc::unbounded_channel();
            state.taps.push(Tap {
                matches: Box::new(matches),
                tx,
            });
            Some(Live::Tap(rx))
        } else {
            None
        };
        FeedSubscription {
            backlog,
            live,
            last_seq: after,
        }
    }

    /// Stop the feed; subscribers drain their backlog and then end.
    pub fn close(&self) {
        let mut state = self.lock();
        state.live = None;
        state.taps.clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FeedState<T>> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

enum Live<T> {
    Broadcast(broadcast::Receiver<Sequenced<T>>),
    Tap(mpsc::UnboundedReceiver<Sequenced<T>>),
}

/// One consumer's view of an [`EventFeed`].
pub struct FeedSubscription<T> {
    backlog: VecDeque<Sequenced<T>>,
    live: Option<Live<T>>,
    last_seq: u64,
}

impl<T: Clone> FeedSubscription<T> {
    /// Next event, or `None` once the feed has closed.
    pub async fn recv(&mut self) -> Option<Sequenced<T>> {
        if let Some(event) = self.backlog.pop_front() {
            self.last_seq = event.seq;
            return Some(event);
        }
        loop {
            let event = match self.live.as_mut()? {
                Live::Broadcast(live) => match live.recv().await {
                    Ok(event) => event,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Feed subscriber lagged, events dropped");
                        continue;
                    }
                    Err(RecvError::Closed) => return None,
                },
                Live::Tap(live) => live.recv().await?,
            };
            if event.seq > self.last_seq {
                self.last_seq = event.seq;
                return Some(event);
            }
        }
    }
}
