//! Transport Lifecycle Integration Tests
//!
//! Tests the connection state machine against an in-process peer:
//! outbound queuing, heartbeat timeout, bounded reconnection and state
//! notifications on the bus.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_test::assert_ok;
use tokio_util::sync::CancellationToken;

use market_sync::ConnectionState;
use market_sync::domain::event::CONNECTION_STATE_TOPIC;
use market_sync::infrastructure::bus::{BusConfig, EventBus};
use market_sync::infrastructure::transport::{
    Connection, ConnectionConfig, Frame, FrameCodec, HeartbeatConfig, MemoryDialer, MemoryPeer,
    ReconnectConfig, SendStatus, WireFormat,
};

fn config() -> ConnectionConfig {
    ConnectionConfig {
        connect_timeout: Duration::from_secs(1),
        heartbeat: HeartbeatConfig::new(Duration::from_secs(30), Duration::from_secs(10)),
        reconnect: ReconnectConfig::new(
            Duration::from_millis(10),
            Duration::from_millis(40),
            2.0,
            0.0,
            3,
        ),
        outbound_capacity: 100,
        wire_format: WireFormat::Json,
    }
}

async fn next_peer(peers: &mut mpsc::UnboundedReceiver<MemoryPeer>) -> MemoryPeer {
    timeout(Duration::from_secs(5), peers.recv())
        .await
        .unwrap()
        .unwrap()
}

async fn next_frame(peer: &mut MemoryPeer) -> Frame {
    let raw = timeout(Duration::from_secs(5), peer.recv())
        .await
        .unwrap()
        .unwrap();
    FrameCodec::default().decode(&raw).unwrap()
}

#[tokio::test]
async fn overflow_keeps_newest_hundred_in_order() {
    let (dialer, mut peers) = MemoryDialer::new();
    let (connection, _inbound) = Connection::new(Arc::new(dialer), config(), None);

    let mut dropped = 0;
    for i in 0..150 {
        if connection.send(Frame::new("quote", json!(i))) == SendStatus::QueuedWithDrop {
            dropped += 1;
        }
    }
    assert_eq!(dropped, 50);
    assert_eq!(connection.stats().pending, 100);
    assert_eq!(connection.stats().frames_dropped, 50);

    assert_ok!(connection.connect().await);
    let mut peer = next_peer(&mut peers).await;

    for i in 50..150 {
        let frame = next_frame(&mut peer).await;
        assert_eq!(frame.payload, json!(i));
        assert!(frame.id.is_some());
        assert!(frame.timestamp.is_some());
    }
    connection.disconnect().await;
}

#[tokio::test]
async fn connect_twice_dials_once() {
    let (dialer, mut peers) = MemoryDialer::new();
    let dialer = Arc::new(dialer);
    let (connection, _inbound) = Connection::new(dialer.clone(), config(), None);

    assert_ok!(connection.connect().await);
    let _peer = next_peer(&mut peers).await;
    assert_ok!(connection.connect().await);

    assert_eq!(dialer.dial_count(), 1);
    assert_eq!(connection.state(), ConnectionState::Connected);
    connection.disconnect().await;
}

#[tokio::test(start_paused = true)]
async fn silent_peer_triggers_reconnect() {
    let (dialer, mut peers) = MemoryDialer::new();
    let (connection, _inbound) = Connection::new(Arc::new(dialer), config(), None);
    assert_ok!(connection.connect().await);
    let mut peer = next_peer(&mut peers).await;
    let mut state = connection.watch_state();

    // The ping goes unanswered.
    let ping = next_frame(&mut peer).await;
    assert_eq!(ping.frame_type, "ping");

    state
        .wait_for(|s| *s == ConnectionState::Reconnecting)
        .await
        .unwrap();
    let _second = next_peer(&mut peers).await;
    connection.disconnect().await;
}

#[tokio::test]
async fn reconnection_gives_up_after_bounded_attempts() {
    let (dialer, mut peers) = MemoryDialer::new();
    let dialer = Arc::new(dialer);
    let (connection, _inbound) = Connection::new(dialer.clone(), config(), None);
    assert_ok!(connection.connect().await);
    let peer = next_peer(&mut peers).await;

    dialer.set_accepting(false);
    let mut state = connection.watch_state();
    drop(peer);

    timeout(
        Duration::from_secs(5),
        state.wait_for(|s| *s == ConnectionState::Disconnected),
    )
    .await
    .unwrap()
    .unwrap();

    let dials = dialer.dial_count();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(dialer.dial_count(), dials);
    assert_eq!(connection.state(), ConnectionState::Disconnected);

    // A caller-initiated connect starts over.
    dialer.set_accepting(true);
    assert_ok!(connection.connect().await);
    let _peer = next_peer(&mut peers).await;
    connection.disconnect().await;
}

#[tokio::test]
async fn state_changes_are_published() {
    let cancel = CancellationToken::new();
    let bus = EventBus::spawn(BusConfig::default(), cancel.clone());
    let (dialer, mut peers) = MemoryDialer::new();
    let (connection, _inbound) =
        Connection::new(Arc::new(dialer), config(), Some(Arc::clone(&bus)));

    assert_ok!(connection.connect().await);
    let _peer = next_peer(&mut peers).await;
    connection.disconnect().await;

    let states: Vec<String> = bus
        .history()
        .into_iter()
        .filter(|e| e.topic == CONNECTION_STATE_TOPIC)
        .filter_map(|e| e.payload["state"].as_str().map(str::to_string))
        .collect();
    assert_eq!(states, vec!["connecting", "connected", "disconnected"]);
    cancel.cancel();
}
