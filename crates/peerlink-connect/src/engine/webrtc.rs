//! Connectivity engine backed by `webrtc` (webrtc-rs).
//!
//! Callbacks registered on the peer connection and data channel only push
//! [`EngineEvent`]s into the bounded queue; everything else happens in the
//! negotiator's tasks.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use webrtc::api::APIBuilder;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;

use super::{
    DataChannel, EngineEvent, EngineFactory, EngineSession, EventSink, PeerConnection,
    PeerConnectionState, SignalingState, event_channel,
};
use crate::error::{LinkError, TransportError};
use crate::types::{IceCandidate, LinkId, PeerId, SdpKind, SessionDescription};

/// Label of the pre-negotiated data channel.
const CHANNEL_LABEL: &str = "data";

/// Stream id both ends agree on for the data channel.
const CHANNEL_ID: u16 = 0;

/// Inbound data channel messages buffered before the reader catches up.
const CHANNEL_BUFFER: usize = 256;

fn engine_error(context: &str, e: impl std::fmt::Display) -> LinkError {
    LinkError::Negotiation(format!("{context}: {e}"))
}

/// Creates webrtc-rs peer connections with the configured ICE servers.
#[derive(Debug, Clone)]
pub struct WebRtcEngineFactory {
    ice_servers: Vec<String>,
    event_buffer: usize,
}

impl WebRtcEngineFactory {
    pub fn new(ice_servers: Vec<String>, event_buffer: usize) -> Self {
        Self {
            ice_servers,
            event_buffer,
        }
    }

    pub fn from_config(config: &peerlink_core::config::NegotiationConfig) -> Self {
        Self::new(config.ice_servers.clone(), config.event_buffer)
    }

    async fn new_peer_connection(&self) -> Result<Arc<RTCPeerConnection>, LinkError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| engine_error("media engine", e))?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(|e| engine_error("interceptors", e))?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }],
            ..Default::default()
        };
        api.new_peer_connection(config)
            .await
            .map(Arc::new)
            .map_err(|e| engine_error("peer connection", e))
    }
}

#[async_trait]
impl EngineFactory for WebRtcEngineFactory {
    async fn create(&self, link_id: &LinkId, peer: &PeerId) -> Result<EngineSession, LinkError> {
        let pc = self.new_peer_connection().await?;
        let (sink, events) = event_channel(self.event_buffer);
        register_callbacks(&pc, &sink);
        debug!(%link_id, peer_id = %peer, "Created webrtc peer connection");

        Ok(EngineSession {
            connection: Arc::new(WebRtcPeerConnection {
                pc,
                sink,
                pending_candidates: Mutex::new(Some(Vec::new())),
            }),
            events,
        })
    }
}

fn register_callbacks(pc: &RTCPeerConnection, sink: &EventSink) {
    let candidates = sink.clone();
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let sink = candidates.clone();
        Box::pin(async move {
            let Some(candidate) = candidate else { return };
            match candidate.to_json() {
                Ok(init) => {
                    let candidate = IceCandidate::new(
                        init.candidate,
                        init.sdp_mid.as_deref(),
                        init.sdp_mline_index,
                    );
                    sink.emit(EngineEvent::LocalCandidate(candidate)).await;
                }
                Err(e) => warn!(error = %e, "Failed to serialize local candidate"),
            }
        })
    }));

    let states = sink.clone();
    pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        let sink = states.clone();
        Box::pin(async move {
            if let Some(state) = map_connection_state(state) {
                sink.emit(EngineEvent::ConnectionState(state)).await;
            }
        })
    }));

    let signaling = sink.clone();
    pc.on_signaling_state_change(Box::new(move |state: RTCSignalingState| {
        let sink = signaling.clone();
        Box::pin(async move {
            if let Some(state) = map_signaling_state(state) {
                sink.emit(EngineEvent::SignalingState(state)).await;
            }
        })
    }));

    let needed = sink.clone();
    pc.on_negotiation_needed(Box::new(move || {
        let sink = needed.clone();
        Box::pin(async move {
            sink.emit(EngineEvent::NegotiationNeeded).await;
        })
    }));
}

const fn map_connection_state(state: RTCPeerConnectionState) -> Option<PeerConnectionState> {
    match state {
        RTCPeerConnectionState::New => Some(PeerConnectionState::New),
        RTCPeerConnectionState::Connecting => Some(PeerConnectionState::Connecting),
        RTCPeerConnectionState::Connected => Some(PeerConnectionState::Connected),
        RTCPeerConnectionState::Disconnected => Some(PeerConnectionState::Disconnected),
        RTCPeerConnectionState::Failed => Some(PeerConnectionState::Failed),
        RTCPeerConnectionState::Closed => Some(PeerConnectionState::Closed),
        RTCPeerConnectionState::Unspecified => None,
    }
}

const fn map_signaling_state(state: RTCSignalingState) -> Option<SignalingState> {
    match state {
        RTCSignalingState::Stable => Some(SignalingState::Stable),
        RTCSignalingState::HaveLocalOffer => Some(SignalingState::HaveLocalOffer),
        RTCSignalingState::HaveRemoteOffer => Some(SignalingState::HaveRemoteOffer),
        RTCSignalingState::HaveLocalPranswer => Some(SignalingState::HaveLocalPranswer),
        RTCSignalingState::HaveRemotePranswer => Some(SignalingState::HaveRemotePranswer),
        RTCSignalingState::Closed => Some(SignalingState::Closed),
        RTCSignalingState::Unspecified => None,
    }
}

fn rtc_description(
    kind: SdpKind,
    description: &SessionDescription,
) -> Result<RTCSessionDescription, LinkError> {
    let sdp = description.sdp.clone();
    match kind {
        SdpKind::Offer => RTCSessionDescription::offer(sdp),
        SdpKind::Answer => RTCSessionDescription::answer(sdp),
    }
    .map_err(|e| engine_error("session description", e))
}

struct WebRtcPeerConnection {
    pc: Arc<RTCPeerConnection>,
    sink: EventSink,
    /// Remote candidates received before the remote description; `None`
    /// once it is set.
    pending_candidates: Mutex<Option<Vec<IceCandidate>>>,
}

impl WebRtcPeerConnection {
    async fn apply_candidate(&self, candidate: &IceCandidate) -> Result<(), LinkError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate.clone(),
            sdp_mid: candidate.sdp_mid.clone(),
            sdp_mline_index: candidate.sdp_m_line_index,
            ..Default::default()
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| engine_error("remote candidate", e))
    }
}

#[async_trait]
impl PeerConnection for WebRtcPeerConnection {
    async fn create_channel(&self) -> Result<Arc<dyn DataChannel>, LinkError> {
        let init = RTCDataChannelInit {
            ordered: Some(true),
            negotiated: Some(CHANNEL_ID),
            ..Default::default()
        };
        let dc = self
            .pc
            .create_data_channel(CHANNEL_LABEL, Some(init))
            .await
            .map_err(|e| engine_error("data channel", e))?;
        let channel = WebRtcDataChannel::wrap(dc, self.sink.clone());
        self.sink.emit(EngineEvent::NegotiationNeeded).await;
        Ok(channel)
    }

    async fn create_local_offer(&self) -> Result<SessionDescription, LinkError> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| engine_error("create offer", e))?;
        Ok(SessionDescription::new(offer.sdp))
    }

    async fn create_local_answer(&self) -> Result<SessionDescription, LinkError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| engine_error("create answer", e))?;
        Ok(SessionDescription::new(answer.sdp))
    }

    async fn set_local_description(
        &self,
        kind: SdpKind,
        description: &SessionDescription,
    ) -> Result<(), LinkError> {
        self.pc
            .set_local_description(rtc_description(kind, description)?)
            .await
            .map_err(|e| engine_error("set local description", e))
    }

    async fn set_remote_description(
        &self,
        kind: SdpKind,
        description: &SessionDescription,
    ) -> Result<(), LinkError> {
        self.pc
            .set_remote_description(rtc_description(kind, description)?)
            .await
            .map_err(|e| engine_error("set remote description", e))?;

        let buffered = self.pending_candidates.lock().await.take().unwrap_or_default();
        for candidate in &buffered {
            if let Err(e) = self.apply_candidate(candidate).await {
                warn!(error = %e, "Buffered remote candidate rejected");
            }
        }
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: &IceCandidate) -> Result<(), LinkError> {
        {
            let mut pending = self.pending_candidates.lock().await;
            if let Some(pending) = pending.as_mut() {
                pending.push(candidate.clone());
                return Ok(());
            }
        }
        self.apply_candidate(candidate).await
    }

    async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            debug!(error = %e, "Peer connection close failed");
        }
    }
}

struct WebRtcDataChannel {
    dc: Arc<RTCDataChannel>,
    inbound: Mutex<mpsc::Receiver<Vec<u8>>>,
    closed: CancellationToken,
}

impl WebRtcDataChannel {
    fn wrap(dc: Arc<RTCDataChannel>, sink: EventSink) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(CHANNEL_BUFFER);
        let closed = CancellationToken::new();

        dc.on_open(Box::new(move || {
            let sink = sink.clone();
            Box::pin(async move {
                sink.emit(EngineEvent::ChannelOpen).await;
            })
        }));
        dc.on_message(Box::new(move |message: DataChannelMessage| {
            let tx = tx.clone();
            Box::pin(async move {
                if tx.send(message.data.to_vec()).await.is_err() {
                    debug!("Data channel message after reader stopped");
                }
            })
        }));
        let on_close = closed.clone();
        dc.on_close(Box::new(move || {
            let closed = on_close.clone();
            Box::pin(async move {
                closed.cancel();
            })
        }));

        Arc::new(Self {
            dc,
            inbound: Mutex::new(rx),
            closed,
        })
    }
}

#[async_trait]
impl DataChannel for WebRtcDataChannel {
    async fn send(&self, data: Vec<u8>) -> Result<(), TransportError> {
        if self.closed.is_cancelled() {
            return Err(TransportError::ChannelClosed);
        }
        self.dc
            .send(&Bytes::from(data))
            .await
            .map(drop)
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn recv(&self) -> Option<Vec<u8>> {
        let mut inbound = self.inbound.lock().await;
        tokio::select! {
            biased;
            message = inbound.recv() => message,
            () = self.closed.cancelled() => inbound.try_recv().ok(),
        }
    }

    fn is_open(&self) -> bool {
        !self.closed.is_cancelled() && self.dc.ready_state() == RTCDataChannelState::Open
    }

    async fn close(&self) {
        self.closed.cancel();
        if let Err(e) = self.dc.close().await {
            debug!(error = %e, "Data channel close failed");
        }
    }
}
