#![allow(clippy::unwrap_used)] // Integration tests use unwrap for brevity

//! Integration tests for links.
//!
//! Drives a link end to end through the scripted relay and the mock
//! engine: inbound offers, initiated connections, replacement of stale
//! sessions and teardown of lost connections.

use std::sync::Arc;
use std::time::Duration;

use peerlink_connect::chunking::{Assembled, ChunkAssembler, ChunkTransport, Package};
use peerlink_connect::engine::{DataChannel, EngineEvent, PeerConnectionState};
use peerlink_connect::signaling::Method;
use peerlink_connect::testing::{MockDataChannel, MockEngineFactory, MockStep, ScriptedRelay};
use peerlink_connect::types::{Primitive, SessionDescription};
use peerlink_connect::{
    Link, LinkDescriptor, LinkError, LinkRole, LinkSettings, NegotiationState, PeerId,
};
use peerlink_crypto::LinkSecret;

const WAIT: Duration = Duration::from_secs(5);

fn descriptor(byte: u8) -> LinkDescriptor {
    LinkDescriptor::new(LinkSecret::from_bytes([byte; 32]))
}

fn offer(sdp: &str) -> Primitive {
    Primitive::Offer(SessionDescription::new(sdp))
}

async fn open(relay: &ScriptedRelay, engines: &MockEngineFactory, link: &LinkDescriptor) -> Arc<Link> {
    Link::open(link, relay, Arc::new(engines.clone()), LinkSettings::default())
        .await
        .unwrap()
}

async fn wait_until_connected(link: &Link, peer: &PeerId) {
    let mut connected = link.watch_connected();
    tokio::time::timeout(WAIT, connected.wait_for(|peers| peers.contains(peer)))
        .await
        .unwrap()
        .unwrap();
}

async fn wait_until_gone(link: &Link, peer: &PeerId) {
    let mut connected = link.watch_connected();
    tokio::time::timeout(WAIT, connected.wait_for(|peers| !peers.contains(peer)))
        .await
        .unwrap()
        .unwrap();
}

async fn eventually(check: impl Fn() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
}

/// Read packages from the far end until one whole message is assembled.
async fn receive_message(channel: &MockDataChannel) -> Vec<u8> {
    let mut assembler = ChunkAssembler::new();
    loop {
        let bytes = tokio::time::timeout(WAIT, channel.recv()).await.unwrap().unwrap();
        if let Some(Assembled::Message { bytes, .. }) =
            assembler.on_package(Package::decode(&bytes).unwrap())
        {
            return bytes;
        }
    }
}

// =========================================================================
// Responder
// =========================================================================

#[tokio::test]
async fn inbound_offer_yields_a_live_connection() {
    let relay = ScriptedRelay::auto_confirming();
    let engines = MockEngineFactory::new().auto_connect();
    let link_descriptor = descriptor(1);
    let handle = relay.handle(&link_descriptor);
    let link = open(&relay, &engines, &link_descriptor).await;
    let mut messages = link.take_messages().unwrap();
    let p1 = PeerId::from("p1");

    handle.deliver(&p1, &offer("o1"));
    let (_, answer) = handle.expect_method(Method::SendAnswer, WAIT).await.unwrap();
    assert!(matches!(answer, Primitive::Answer(_)));
    wait_until_connected(&link, &p1).await;
    assert_eq!(link.wait_for_connection(WAIT).await.unwrap(), p1);

    // Outbound: the far end reassembles what the link sends.
    let engine = engines.wait_for(&p1, WAIT).await.unwrap();
    let far_end = engine.remote_channel();
    link.send(&p1, b"hello wallet").await.unwrap();
    assert_eq!(receive_message(&far_end).await, b"hello wallet");

    // Inbound: messages from the peer arrive tagged with it.
    ChunkTransport::new(far_end.clone(), 4)
        .send_message(b"hello extension")
        .await
        .unwrap();
    let message = tokio::time::timeout(WAIT, messages.recv()).await.unwrap().unwrap();
    assert_eq!(message.peer, p1);
    assert_eq!(message.result.unwrap(), b"hello extension");
}

#[tokio::test]
async fn concurrent_offers_connect_independently() {
    let relay = ScriptedRelay::auto_confirming();
    let engines = MockEngineFactory::new().auto_connect();
    let link_descriptor = descriptor(2);
    let handle = relay.handle(&link_descriptor);
    let link = open(&relay, &engines, &link_descriptor).await;
    let mut failures = link.failures();
    let (p1, p2) = (PeerId::from("p1"), PeerId::from("p2"));

    handle.deliver(&p1, &offer("o1"));
    handle.deliver(&p2, &offer("o2"));
    wait_until_connected(&link, &p1).await;
    wait_until_connected(&link, &p2).await;

    // A later negotiation with p1 fails at its local description.
    engines.fail_step(&p1, MockStep::SetLocalDescription);
    handle.deliver(&p1, &offer("o1-again"));
    let failure = tokio::time::timeout(WAIT, failures.recv()).await.unwrap().unwrap();
    assert_eq!(failure.peer_id, p1);
    assert_eq!(failure.state, NegotiationState::AnswerCreated);
    assert!(matches!(failure.error, LinkError::Negotiation(_)));

    // p2's connection is untouched.
    assert!(link.connected_peers().contains(&p2));
    let far_end = engines.wait_for(&p2, WAIT).await.unwrap().remote_channel();
    link.send(&p2, b"still here").await.unwrap();
    assert_eq!(receive_message(&far_end).await, b"still here");
}

#[tokio::test]
async fn unreachable_peer_is_reported_and_not_connected() {
    let relay = ScriptedRelay::new();
    let engines = MockEngineFactory::new();
    let link_descriptor = descriptor(3);
    let handle = relay.handle(&link_descriptor);
    let link = open(&relay, &engines, &link_descriptor).await;
    let mut failures = link.failures();
    let p1 = PeerId::from("p1");

    handle.deliver(&p1, &offer("o1"));
    let (envelope, _) = handle.expect_method(Method::SendAnswer, WAIT).await.unwrap();
    handle.reject_unreachable(&envelope.request_id);

    let failure = tokio::time::timeout(WAIT, failures.recv()).await.unwrap().unwrap();
    assert_eq!(failure.peer_id, p1);
    assert!(matches!(failure.error, LinkError::Relay { .. }));
    assert!(link.connected_peers().is_empty());
    assert_eq!(
        link.send(&p1, b"nope").await,
        Err(LinkError::UnknownPeer(p1))
    );
}

#[tokio::test]
async fn second_offer_replaces_the_active_negotiation() {
    let relay = ScriptedRelay::new();
    let engines = MockEngineFactory::new();
    let link_descriptor = descriptor(4);
    let handle = relay.handle(&link_descriptor);
    let link = open(&relay, &engines, &link_descriptor).await;
    let p1 = PeerId::from("p1");

    handle.deliver(&p1, &offer("o1"));
    let first = engines.wait_for_nth(&p1, 1, WAIT).await.unwrap();
    // Leave the first answer unacknowledged so the session stays open.
    handle.expect_method(Method::SendAnswer, WAIT).await.unwrap();

    handle.deliver(&p1, &offer("o2"));
    let second = engines.wait_for_nth(&p1, 2, WAIT).await.unwrap();
    let (envelope, _) = handle.expect_method(Method::SendAnswer, WAIT).await.unwrap();
    handle.confirm(&envelope.request_id);
    second.connect().await;
    wait_until_connected(&link, &p1).await;

    eventually(|| first.is_closed()).await;
    assert!(!second.is_closed());
    assert_eq!(second.remote_descriptions(), vec![SessionDescription::new("o2")]);
    assert_eq!(link.connected_peers().len(), 1);
    assert_eq!(engines.engines_created(&p1), 2);
}

#[tokio::test]
async fn duplicate_candidates_do_not_change_the_outcome() {
    let relay = ScriptedRelay::auto_confirming();
    let engines = MockEngineFactory::new();
    let link_descriptor = descriptor(5);
    let handle = relay.handle(&link_descriptor);
    let link = open(&relay, &engines, &link_descriptor).await;
    let p1 = PeerId::from("p1");

    handle.deliver(&p1, &offer("o1"));
    let engine = engines.wait_for(&p1, WAIT).await.unwrap();
    let candidate = peerlink_connect::types::IceCandidate::new("candidate:1", Some("0"), Some(0));
    handle.deliver(&p1, &Primitive::Candidate(candidate.clone()));
    handle.deliver(&p1, &Primitive::Candidate(candidate.clone()));
    assert!(engine.wait_for_remote_candidates(1, WAIT).await);
    engine.connect().await;

    wait_until_connected(&link, &p1).await;
    assert_eq!(engine.remote_candidates(), vec![candidate]);
}

// =========================================================================
// Initiator
// =========================================================================

#[tokio::test]
async fn initiator_link_offers_when_peer_appears() {
    let relay = ScriptedRelay::auto_confirming();
    let engines = MockEngineFactory::new().auto_connect();
    let link_descriptor = descriptor(6).with_role(LinkRole::Initiator);
    let handle = relay.handle(&link_descriptor);
    let link = open(&relay, &engines, &link_descriptor).await;
    let ext = PeerId::from("ext");

    handle.peer_connected(&ext);
    let (envelope, sent) = handle.expect_method(Method::SendOffer, WAIT).await.unwrap();
    assert_eq!(envelope.target_peer_id, ext);
    assert!(matches!(sent, Primitive::Offer(_)));

    handle.deliver(&ext, &Primitive::Answer(SessionDescription::new("a1")));
    wait_until_connected(&link, &ext).await;
    let engine = engines.wait_for(&ext, WAIT).await.unwrap();
    assert_eq!(engine.remote_descriptions(), vec![SessionDescription::new("a1")]);
}

#[tokio::test]
async fn responder_link_ignores_peer_presence() {
    let relay = ScriptedRelay::auto_confirming();
    let engines = MockEngineFactory::new();
    let link_descriptor = descriptor(7);
    let handle = relay.handle(&link_descriptor);
    let _link = open(&relay, &engines, &link_descriptor).await;
    let ext = PeerId::from("ext");

    handle.peer_connected(&ext);
    assert!(engines.wait_for(&ext, Duration::from_millis(200)).await.is_none());
}

#[tokio::test]
async fn explicit_connect_runs_the_initiator_path() {
    let relay = ScriptedRelay::auto_confirming();
    let engines = MockEngineFactory::new().auto_connect();
    let link_descriptor = descriptor(8);
    let handle = relay.handle(&link_descriptor);
    let link = open(&relay, &engines, &link_descriptor).await;
    let ext = PeerId::from("ext");

    let connecting = {
        let link = Arc::clone(&link);
        let ext = ext.clone();
        tokio::spawn(async move { link.connect(&ext).await })
    };
    handle.expect_method(Method::SendOffer, WAIT).await.unwrap();
    handle.deliver(&ext, &Primitive::Answer(SessionDescription::new("a1")));

    tokio::time::timeout(WAIT, connecting).await.unwrap().unwrap().unwrap();
    assert!(link.connected_peers().contains(&ext));

    // Already connected: resolves without a new negotiation.
    link.connect(&ext).await.unwrap();
    assert_eq!(engines.engines_created(&ext), 1);
}

// =========================================================================
// Teardown
// =========================================================================

#[tokio::test]
async fn lost_connection_leaves_the_live_set() {
    let relay = ScriptedRelay::auto_confirming();
    let engines = MockEngineFactory::new().auto_connect();
    let link_descriptor = descriptor(9);
    let handle = relay.handle(&link_descriptor);
    let link = open(&relay, &engines, &link_descriptor).await;
    let mut messages = link.take_messages().unwrap();
    let p1 = PeerId::from("p1");

    handle.deliver(&p1, &offer("o1"));
    wait_until_connected(&link, &p1).await;

    let engine = engines.wait_for(&p1, WAIT).await.unwrap();
    engine
        .emit(EngineEvent::ConnectionState(PeerConnectionState::Disconnected))
        .await;
    wait_until_gone(&link, &p1).await;

    let terminal = tokio::time::timeout(WAIT, messages.recv()).await.unwrap().unwrap();
    assert_eq!(terminal.peer, p1);
    assert!(terminal.result.is_err());
    assert!(link.client(&p1).await.is_none());
}

#[tokio::test]
async fn closed_channel_leaves_the_live_set() {
    let relay = ScriptedRelay::auto_confirming();
    let engines = MockEngineFactory::new().auto_connect();
    let link_descriptor = descriptor(10);
    let handle = relay.handle(&link_descriptor);
    let link = open(&relay, &engines, &link_descriptor).await;
    let p1 = PeerId::from("p1");

    handle.deliver(&p1, &offer("o1"));
    wait_until_connected(&link, &p1).await;
    engines
        .wait_for(&p1, WAIT)
        .await
        .unwrap()
        .remote_channel()
        .close()
        .await;
    wait_until_gone(&link, &p1).await;
}

#[tokio::test]
async fn shutdown_closes_connections_and_relay() {
    let relay = ScriptedRelay::auto_confirming();
    let engines = MockEngineFactory::new().auto_connect();
    let link_descriptor = descriptor(11);
    let handle = relay.handle(&link_descriptor);
    let link = open(&relay, &engines, &link_descriptor).await;
    let p1 = PeerId::from("p1");

    handle.deliver(&p1, &offer("o1"));
    wait_until_connected(&link, &p1).await;
    link.shutdown().await;

    assert!(link.is_shut_down());
    assert!(link.connected_peers().is_empty());
    assert!(engines.wait_for(&p1, WAIT).await.unwrap().is_closed());
    assert!(handle.is_closed());
    assert!(link.signaling().is_closed());
}
