//! Offer/answer exchange over the in-process loopback transport.
//!
//! Each test plays both users: one session offers, the other answers, and
//! the blobs travel between them as plain strings the way a copy/paste or
//! QR scan would carry them.

use std::time::Duration;

use capsule_core::config::SignalingConfig;
use capsule_core::CapsuleError;
use capsule_crypto::{RoomKey, SecretManager};
use capsule_signal::loopback::{LoopbackConnector, LoopbackNetwork};
use capsule_signal::{
    ChannelMessage, ConnectionState, DataChannel, ReadyState, Role, SdpType, SignalingBlob,
    SignalingSession,
};
use secrecy::SecretString;

fn keyed_secrets() -> SecretManager {
    let secrets = SecretManager::default();
    secrets.set_key(RoomKey::from_bytes([7u8; 32]));
    secrets
}

fn fast_config() -> SignalingConfig {
    SignalingConfig {
        gather_timeout_ms: 100,
        ..Default::default()
    }
}

fn session_on(network: &LoopbackNetwork) -> SignalingSession<LoopbackConnector> {
    SignalingSession::new(
        LoopbackConnector::new(network.clone()),
        keyed_secrets(),
        fast_config(),
    )
}

#[tokio::test]
async fn offer_requires_room_key() {
    let network = LoopbackNetwork::new();
    let mut session = SignalingSession::new(
        LoopbackConnector::new(network),
        SecretManager::default(),
        fast_config(),
    );

    let err = session.create_offer().await.unwrap_err();
    assert!(matches!(err, CapsuleError::SecretRequired));
    assert_eq!(session.state(), ConnectionState::New);
}

#[tokio::test]
async fn answer_requires_room_key() {
    let network = LoopbackNetwork::new();
    let offer = session_on(&network).create_offer().await.unwrap();

    let mut answerer = SignalingSession::new(
        LoopbackConnector::new(network),
        SecretManager::default(),
        fast_config(),
    );
    let err = answerer
        .create_answer(&offer.encode().unwrap())
        .await
        .unwrap_err();
    assert!(matches!(err, CapsuleError::SecretRequired));
}

#[tokio::test]
async fn offer_after_derive_is_non_empty_and_distinct() {
    let network = LoopbackNetwork::new();
    let secrets = SecretManager::default();
    secrets.derive(&SecretString::from("x")).await.unwrap();

    let mut session = SignalingSession::new(
        LoopbackConnector::new(network),
        secrets,
        fast_config(),
    );
    let first = session.create_offer().await.unwrap().encode().unwrap();
    assert!(!first.is_empty());
    assert_eq!(session.state(), ConnectionState::HaveLocalDescription);
    assert_eq!(session.role(), Some(Role::Offerer));

    // A new attempt replaces the old one with a fresh description
    let second = session.create_offer().await.unwrap().encode().unwrap();
    assert_ne!(first, second);
}

#[tokio::test]
async fn full_exchange_opens_shared_channel() {
    let network = LoopbackNetwork::new();
    let mut alice = session_on(&network);
    let mut bob = session_on(&network);

    let offer = alice.create_offer().await.unwrap();
    assert_eq!(offer.description().sdp_type, SdpType::Offer);
    assert!(offer.description().sdp.contains("a=end-of-candidates"));

    let answer = bob.create_answer(&offer.encode().unwrap()).await.unwrap();
    assert_eq!(answer.role(), Role::Answerer);
    assert_eq!(bob.state(), ConnectionState::HaveLocalDescription);

    // Line breaks from the paste are tolerated
    let pasted = answer.encode().unwrap();
    let (head, tail) = pasted.split_at(pasted.len() / 2);
    alice.accept_answer(&format!("{head}\n{tail}")).await.unwrap();

    assert_eq!(alice.state(), ConnectionState::Connected);
    assert_eq!(bob.state(), ConnectionState::Connected);

    let a = alice.channel().await.unwrap();
    let b = bob.channel().await.unwrap();
    assert_eq!(a.label(), "data");
    assert_eq!(b.label(), "data");
    assert_eq!(a.ready_state(), ReadyState::Open);

    a.send(ChannelMessage::Text("hello bob".into())).await.unwrap();
    b.send(ChannelMessage::Text("hello alice".into())).await.unwrap();
    assert_eq!(b.recv().await, Some(ChannelMessage::Text("hello bob".into())));
    assert_eq!(a.recv().await, Some(ChannelMessage::Text("hello alice".into())));
}

#[tokio::test]
async fn gathering_timeout_still_produces_offer() {
    let network = LoopbackNetwork::new();
    let connector = LoopbackConnector::new(network).with_gather_delay(None);
    let mut session = SignalingSession::new(connector, keyed_secrets(), fast_config());

    let started = tokio::time::Instant::now();
    let offer = session.create_offer().await.unwrap();

    assert!(started.elapsed() >= Duration::from_millis(100));
    assert_eq!(session.state(), ConnectionState::HaveLocalDescription);
    // No candidates were gathered before the deadline
    assert!(!offer.description().sdp.contains("a=candidate"));
}

#[tokio::test]
async fn slow_gathering_within_timeout_includes_candidates() {
    let network = LoopbackNetwork::new();
    let connector =
        LoopbackConnector::new(network).with_gather_delay(Some(Duration::from_millis(10)));
    let mut session = SignalingSession::new(connector, keyed_secrets(), fast_config());

    let offer = session.create_offer().await.unwrap();
    assert!(offer.description().sdp.contains("a=candidate"));
}

#[tokio::test]
async fn accept_answer_without_offer_is_invalid_state() {
    let network = LoopbackNetwork::new();
    let mut session = session_on(&network);

    let err = session.accept_answer("anything").await.unwrap_err();
    assert!(matches!(err, CapsuleError::InvalidState(_)));
}

#[tokio::test]
async fn accept_answer_rejects_garbage_and_keeps_attempt() {
    let network = LoopbackNetwork::new();
    let mut alice = session_on(&network);
    let mut bob = session_on(&network);
    let offer = alice.create_offer().await.unwrap().encode().unwrap();

    let err = alice.accept_answer("%%% not a blob %%%").await.unwrap_err();
    assert!(matches!(err, CapsuleError::MalformedBlob(_)));
    assert_eq!(alice.state(), ConnectionState::HaveLocalDescription);

    // The same attempt still accepts the real answer
    let answer = bob.create_answer(&offer).await.unwrap().encode().unwrap();
    alice.accept_answer(&answer).await.unwrap();
    assert_eq!(alice.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn accept_answer_rejects_an_offer_blob() {
    let network = LoopbackNetwork::new();
    let mut alice = session_on(&network);
    let mut carol = session_on(&network);
    alice.create_offer().await.unwrap();
    let other_offer = carol.create_offer().await.unwrap().encode().unwrap();

    let err = alice.accept_answer(&other_offer).await.unwrap_err();
    assert!(matches!(err, CapsuleError::InvalidState(_)));
}

#[tokio::test]
async fn accept_answer_twice_is_invalid_state() {
    let network = LoopbackNetwork::new();
    let mut alice = session_on(&network);
    let mut bob = session_on(&network);
    let offer = alice.create_offer().await.unwrap().encode().unwrap();
    let answer = bob.create_answer(&offer).await.unwrap().encode().unwrap();

    alice.accept_answer(&answer).await.unwrap();
    let err = alice.accept_answer(&answer).await.unwrap_err();
    assert!(matches!(err, CapsuleError::InvalidState(_)));
}

#[tokio::test]
async fn answerer_cannot_accept_answer() {
    let network = LoopbackNetwork::new();
    let mut alice = session_on(&network);
    let mut bob = session_on(&network);
    let offer = alice.create_offer().await.unwrap().encode().unwrap();
    let answer = bob.create_answer(&offer).await.unwrap().encode().unwrap();

    let err = bob.accept_answer(&answer).await.unwrap_err();
    assert!(matches!(err, CapsuleError::InvalidState(_)));
}

#[tokio::test]
async fn create_answer_rejects_answer_blob_and_keeps_previous_attempt() {
    let network = LoopbackNetwork::new();
    let mut alice = session_on(&network);
    let mut bob = session_on(&network);
    let offer = alice.create_offer().await.unwrap().encode().unwrap();
    let answer = bob.create_answer(&offer).await.unwrap().encode().unwrap();

    let err = bob.create_answer(&answer).await.unwrap_err();
    assert!(matches!(err, CapsuleError::InvalidState(_)));
    assert_eq!(bob.state(), ConnectionState::HaveLocalDescription);

    let err = bob.create_answer("").await.unwrap_err();
    assert!(matches!(err, CapsuleError::MalformedBlob(_)));
}

#[tokio::test]
async fn close_makes_channel_unavailable() {
    let network = LoopbackNetwork::new();
    let mut alice = session_on(&network);
    let mut bob = session_on(&network);
    let offer = alice.create_offer().await.unwrap().encode().unwrap();
    let answer = bob.create_answer(&offer).await.unwrap().encode().unwrap();
    alice.accept_answer(&answer).await.unwrap();
    let bob_channel = bob.channel().await.unwrap();

    alice.close();

    assert_eq!(alice.state(), ConnectionState::Closed);
    assert!(matches!(
        alice.channel().await,
        Err(CapsuleError::NotConnected)
    ));
    // The remote end observes the closure too
    assert_eq!(bob_channel.recv().await, None);
    assert!(matches!(
        bob_channel.send(ChannelMessage::Text("late".into())).await,
        Err(CapsuleError::NotConnected)
    ));
}

#[tokio::test]
async fn network_loss_fails_the_connection() {
    let network = LoopbackNetwork::new();
    let mut alice = session_on(&network);
    let mut bob = session_on(&network);
    let offer = alice.create_offer().await.unwrap().encode().unwrap();
    let answer = bob.create_answer(&offer).await.unwrap().encode().unwrap();
    alice.accept_answer(&answer).await.unwrap();

    network.sever();

    assert_eq!(alice.state(), ConnectionState::Failed);
    assert_eq!(bob.state(), ConnectionState::Failed);
    assert!(matches!(
        bob.channel().await,
        Err(CapsuleError::NotConnected)
    ));
}

#[tokio::test]
async fn pending_channel_fails_when_attempt_fails() {
    let network = LoopbackNetwork::new();
    let mut alice = session_on(&network);
    let mut bob = session_on(&network);
    let offer = alice.create_offer().await.unwrap().encode().unwrap();
    bob.create_answer(&offer).await.unwrap();

    // The answer never reaches alice; the link drops while bob waits
    let severing = network.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        severing.sever();
    });

    let result = tokio::time::timeout(Duration::from_secs(1), bob.channel())
        .await
        .expect("channel() must not hang after the attempt fails");
    assert!(matches!(result, Err(CapsuleError::NotConnected)));
    assert_eq!(bob.state(), ConnectionState::Failed);
}

#[test]
fn blob_roles_follow_sdp_type() {
    let answer = capsule_signal::SessionDescription::new(SdpType::Answer, "v=0\r\n");
    assert_eq!(SignalingBlob::new(answer).role(), Role::Answerer);
}
