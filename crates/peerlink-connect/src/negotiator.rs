//! Per-peer negotiation state machine.
//!
//! A negotiator drives one peer connection from its trigger (an inbound
//! offer, or a decision to initiate) to an open data channel. Candidate
//! exchange runs next to the offer/answer exchange from the moment the
//! engine exists and is cancelled as soon as the session settles.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use peerlink_core::Config;
use tokio::sync::{Notify, mpsc, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::connection::{ConnectionClient, TransportSettings};
use crate::engine::{EngineEvent, EngineFactory, EngineSession, PeerConnection, PeerConnectionState};
use crate::error::{LinkError, NegotiationFailure};
use crate::feed::FeedSubscription;
use crate::signaling::{PeerEvent, SignalingClient};
use crate::types::{IceCandidate, LinkId, PeerId, Primitive, SdpKind, SessionDescription};

/// Negotiation session states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NegotiationState {
    Idle,
    OfferReceived,
    AwaitingRemoteConnect,
    OfferCreated,
    RemoteDescriptionSet,
    AnswerCreated,
    LocalDescriptionSet,
    AnswerSent,
    OfferSent,
    AwaitingAnswer,
    IceExchanging,
    Connected,
    Failed,
}

impl NegotiationState {
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Connected | Self::Failed)
    }
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// What starts a negotiation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NegotiationTrigger {
    /// The remote peer sent an offer; we answer.
    Offer { offer: SessionDescription, seq: u64 },
    /// We send the offer.
    Initiate { seq: u64 },
}

impl NegotiationTrigger {
    /// Signaling sequence number at which the trigger was observed.
    pub const fn seq(&self) -> u64 {
        match self {
            Self::Offer { seq, .. } | Self::Initiate { seq } => *seq,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NegotiationSettings {
    /// Bound on the whole negotiation, including the wait for connectivity.
    pub connect_timeout: Duration,
    pub transport: TransportSettings,
}

impl Default for NegotiationSettings {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for NegotiationSettings {
    fn from(config: &Config) -> Self {
        Self {
            connect_timeout: config.negotiation.connect_timeout(),
            transport: TransportSettings::from(&config.transport),
        }
    }
}

/// Drives one (link, peer) negotiation.
pub struct Negotiator {
    link_id: LinkId,
    peer: PeerId,
    signaling: Arc<SignalingClient>,
    engine: Arc<dyn EngineFactory>,
    settings: NegotiationSettings,
    state: watch::Sender<NegotiationState>,
}

impl Negotiator {
    pub fn new(
        peer: PeerId,
        signaling: Arc<SignalingClient>,
        engine: Arc<dyn EngineFactory>,
        settings: NegotiationSettings,
    ) -> Self {
        let (state, _) = watch::channel(NegotiationState::Idle);
        Self {
            link_id: signaling.link_id().clone(),
            peer,
            signaling,
            engine,
            settings,
            state,
        }
    }

    pub fn state(&self) -> NegotiationState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<NegotiationState> {
        self.state.subscribe()
    }

    /// Run the negotiation to a connection client or a typed failure.
    pub async fn run(
        self,
        trigger: NegotiationTrigger,
        cancel: CancellationToken,
    ) -> Result<ConnectionClient, NegotiationFailure> {
        let engine_life = CancellationToken::new();
        let mut connection = None;
        let timeout = self.settings.connect_timeout;

        let outcome = tokio::select! {
            biased;
            () = cancel.cancelled() => Err(LinkError::Cancelled),
            result = tokio::time::timeout(timeout, self.drive(trigger, &engine_life, &mut connection)) => {
                result.unwrap_or(Err(LinkError::Timeout {
                    operation: "negotiation",
                    after: timeout,
                }))
            }
        };

        match outcome {
            Ok(client) => {
                info!(link_id = %self.link_id, peer_id = %self.peer, "Negotiation succeeded");
                Ok(client)
            }
            Err(error) => {
                let failed_in = self.state();
                self.transition(NegotiationState::Failed);
                warn!(
                    link_id = %self.link_id,
                    peer_id = %self.peer,
                    state = %failed_in,
                    %error,
                    "Negotiation failed"
                );
                engine_life.cancel();
                if let Some(connection) = connection {
                    connection.close().await;
                }
                Err(NegotiationFailure {
                    peer_id: self.peer.clone(),
                    state: failed_in,
                    error,
                })
            }
        }
    }

    fn transition(&self, next: NegotiationState) {
        let previous = self.state.send_replace(next);
        debug!(
            link_id = %self.link_id,
            peer_id = %self.peer,
            from = %previous,
            to = %next,
            "Negotiation state changed"
        );
    }

    async fn drive(
        &self,
        trigger: NegotiationTrigger,
        engine_life: &CancellationToken,
        slot: &mut Option<Arc<dyn PeerConnection>>,
    ) -> Result<ConnectionClient, LinkError> {
        let after = trigger.seq();
        self.transition(match trigger {
            NegotiationTrigger::Offer { .. } => NegotiationState::OfferReceived,
            NegotiationTrigger::Initiate { .. } => NegotiationState::AwaitingRemoteConnect,
        });

        let EngineSession { connection, events } =
            self.engine.create(&self.link_id, &self.peer).await?;
        *slot = Some(Arc::clone(&connection));

        let (local_tx, local_rx) = mpsc::unbounded_channel();
        let mut watch = spawn_engine_pump(events, local_tx, engine_life.clone(), self.peer.clone());

        // Dropping the set aborts the candidate exchange on every exit path.
        let mut exchange = JoinSet::new();
        exchange.spawn(forward_local_candidates(
            Arc::clone(&self.signaling),
            self.peer.clone(),
            local_rx,
        ));
        exchange.spawn(apply_remote_candidates(
            self.signaling.subscribe_peer_candidates(after, &self.peer),
            self.peer.clone(),
            Arc::clone(&connection),
        ));

        let channel = connection.create_channel().await?;
        match trigger {
            NegotiationTrigger::Offer { offer, .. } => self.respond(connection.as_ref(), offer).await?,
            NegotiationTrigger::Initiate { .. } => {
                self.initiate(connection.as_ref(), &watch.negotiation_needed, after)
                    .await?;
            }
        }

        self.transition(NegotiationState::IceExchanging);
        wait_connected(&mut watch).await?;
        exchange.abort_all();
        self.transition(NegotiationState::Connected);

        Ok(ConnectionClient::start(
            self.link_id.clone(),
            self.peer.clone(),
            connection,
            channel,
            watch.state,
            engine_life.clone(),
            self.settings.transport,
        ))
    }

    async fn respond(
        &self,
        connection: &dyn PeerConnection,
        offer: SessionDescription,
    ) -> Result<(), LinkError> {
        connection
            .set_remote_description(SdpKind::Offer, &offer)
            .await?;
        self.transition(NegotiationState::RemoteDescriptionSet);

        let answer = connection.create_local_answer().await?;
        self.transition(NegotiationState::AnswerCreated);

        connection
            .set_local_description(SdpKind::Answer, &answer)
            .await?;
        self.transition(NegotiationState::LocalDescriptionSet);

        self.signaling
            .send(&Primitive::Answer(answer), &self.peer)
            .await?;
        self.transition(NegotiationState::AnswerSent);
        Ok(())
    }

    async fn initiate(
        &self,
        connection: &dyn PeerConnection,
        negotiation_needed: &Notify,
        after: u64,
    ) -> Result<(), LinkError> {
        negotiation_needed.notified().await;

        let offer = connection.create_local_offer().await?;
        self.transition(NegotiationState::OfferCreated);

        connection
            .set_local_description(SdpKind::Offer, &offer)
            .await?;
        self.transition(NegotiationState::LocalDescriptionSet);

        let mut answers = self.signaling.subscribe_answers(after);
        self.signaling
            .send(&Primitive::Offer(offer), &self.peer)
            .await?;
        self.transition(NegotiationState::OfferSent);

        self.transition(NegotiationState::AwaitingAnswer);
        let answer = next_for_peer(&mut answers, &self.peer)
            .await
            .ok_or(LinkError::SignalingClosed)?;

        connection
            .set_remote_description(SdpKind::Answer, &answer)
            .await?;
        self.transition(NegotiationState::RemoteDescriptionSet);
        Ok(())
    }
}

/// Engine observations the negotiator and connection client react to.
struct EngineWatch {
    state: watch::Receiver<PeerConnectionState>,
    channel_open: watch::Receiver<bool>,
    negotiation_needed: Arc<Notify>,
}

/// Route engine events until `life` is cancelled or the engine goes away.
fn spawn_engine_pump(
    mut events: mpsc::Receiver<EngineEvent>,
    local_candidates: mpsc::UnboundedSender<IceCandidate>,
    life: CancellationToken,
    peer: PeerId,
) -> EngineWatch {
    let (state_tx, state) = watch::channel(PeerConnectionState::New);
    let (open_tx, channel_open) = watch::channel(false);
    let negotiation_needed = Arc::new(Notify::new());
    let needed = Arc::clone(&negotiation_needed);

    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                biased;
                () = life.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            match event {
                EngineEvent::NegotiationNeeded => needed.notify_one(),
                EngineEvent::LocalCandidate(candidate) => {
                    if local_candidates.send(candidate).is_err() {
                        debug!(peer_id = %peer, "Local candidate after exchange ended");
                    }
                }
                EngineEvent::ConnectionState(s) => {
                    debug!(peer_id = %peer, state = %s, "Peer connection state changed");
                    state_tx.send_replace(s);
                }
                EngineEvent::SignalingState(s) => {
                    debug!(peer_id = %peer, state = ?s, "Engine signaling state changed");
                }
                EngineEvent::ChannelOpen => {
                    open_tx.send_replace(true);
                }
            }
        }
    });

    EngineWatch {
        state,
        channel_open,
        negotiation_needed,
    }
}

async fn wait_connected(watch: &mut EngineWatch) -> Result<(), LinkError> {
    loop {
        let state = *watch.state.borrow_and_update();
        let open = *watch.channel_open.borrow_and_update();
        if state == PeerConnectionState::Connected && open {
            return Ok(());
        }
        if matches!(state, PeerConnectionState::Failed | PeerConnectionState::Closed) {
            return Err(LinkError::Negotiation(format!(
                "peer connection {state} before connecting"
            )));
        }
        let changed = tokio::select! {
            r = watch.state.changed() => r,
            r = watch.channel_open.changed() => r,
        };
        if changed.is_err() {
            return Err(LinkError::Negotiation("engine event stream ended".into()));
        }
    }
}

async fn next_for_peer<T: Clone>(
    feed: &mut FeedSubscription<PeerEvent<T>>,
    peer: &PeerId,
) -> Option<T> {
    loop {
        let event = feed.recv().await?;
        if &event.value.peer == peer {
            return Some(event.value.value);
        }
    }
}

async fn forward_local_candidates(
    signaling: Arc<SignalingClient>,
    peer: PeerId,
    mut candidates: mpsc::UnboundedReceiver<IceCandidate>,
) {
    while let Some(candidate) = candidates.recv().await {
        if let Err(e) = signaling.send(&Primitive::Candidate(candidate), &peer).await {
            warn!(peer_id = %peer, error = %e, "Failed to forward local candidate");
        }
    }
}

async fn apply_remote_candidates(
    mut feed: FeedSubscription<PeerEvent<IceCandidate>>,
    peer: PeerId,
    connection: Arc<dyn PeerConnection>,
) {
    let mut applied = HashSet::new();
    while let Some(candidate) = next_for_peer(&mut feed, &peer).await {
        if !applied.insert(candidate.clone()) {
            debug!(peer_id = %peer, "Duplicate remote candidate ignored");
            continue;
        }
        if let Err(e) = connection.add_remote_candidate(&candidate).await {
            warn!(peer_id = %peer, error = %e, "Remote candidate rejected");
        }
    }
}
