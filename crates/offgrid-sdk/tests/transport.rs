//! Reconnect, queueing and dispatch behavior of the WebSocket client.
//!
//! Timing tests run on a paused clock, so backoff delays are exact.

use offgrid_sdk::transport::{
    AppState, ConnectionState, MemoryConnector, TransportConfig, TransportConfigBuilder,
    WebSocketClient,
};
use parking_lot::Mutex;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::sleep;

fn client_with(
    config: TransportConfig,
) -> (Arc<MemoryConnector>, WebSocketClient<MemoryConnector>) {
    let connector = Arc::new(MemoryConnector::new());
    let client = WebSocketClient::new(connector.clone(), config);
    (connector, client)
}

fn gaps_ms(connector: &MemoryConnector) -> Vec<u64> {
    connector
        .attempts()
        .windows(2)
        .map(|w| (w[1] - w[0]).as_millis() as u64)
        .collect()
}

async fn settle() {
    sleep(Duration::from_millis(5)).await;
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_delays_double_cap_and_give_up() {
    let (connector, client) = client_with(TransportConfig::default());
    connector.set_online(false);

    assert!(client.connect("ws://test", "token").await.is_err());
    assert_eq!(client.state(), ConnectionState::Reconnecting);

    sleep(Duration::from_secs(600)).await;

    // The initial attempt plus ten reconnects.
    assert_eq!(connector.attempt_count(), 11);
    assert_eq!(
        gaps_ms(&connector),
        vec![1000, 2000, 4000, 8000, 16000, 30000, 30000, 30000, 30000, 30000]
    );
    assert_eq!(client.state(), ConnectionState::Disconnected);

    // No timer is left running.
    sleep(Duration::from_secs(600)).await;
    assert_eq!(connector.attempt_count(), 11);
}

#[tokio::test(start_paused = true)]
async fn test_unexpected_close_reconnects_and_resets_backoff() {
    let (connector, client) = client_with(TransportConfig::default());
    let mut peers = connector.take_peers().unwrap();

    let states = Arc::new(Mutex::new(Vec::new()));
    let seen = states.clone();
    let _sub = client.on_state_change(move |state| seen.lock().push(state));

    client.connect("ws://test", "token").await.unwrap();
    let first = peers.recv().await.unwrap();
    assert_eq!(first.token(), "token");

    first.close();
    let second = peers.recv().await.unwrap();
    assert_eq!(client.state(), ConnectionState::Connected);

    // Backoff starts from the initial delay again after a successful open.
    second.close();
    let _third = peers.recv().await.unwrap();

    assert_eq!(gaps_ms(&connector), vec![1000, 1000]);
    assert_eq!(
        states.lock()[..5],
        [
            ConnectionState::Connecting,
            ConnectionState::Connected,
            ConnectionState::Reconnecting,
            ConnectionState::Connecting,
            ConnectionState::Connected,
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_dropped_peer_counts_as_close() {
    let (connector, client) = client_with(TransportConfig::default());
    let mut peers = connector.take_peers().unwrap();

    client.connect("ws://test", "").await.unwrap();
    drop(peers.recv().await.unwrap());
    settle().await;

    assert_eq!(client.state(), ConnectionState::Reconnecting);
    assert!(peers.recv().await.is_some());
    assert_eq!(client.state(), ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_frames_queued_offline_flush_in_order() {
    let (connector, client) = client_with(TransportConfig::default());
    let mut peers = connector.take_peers().unwrap();

    client.send("a", json!(1)).unwrap();
    client.send("b", json!(2)).unwrap();
    client.send("c", json!(3)).unwrap();
    assert_eq!(client.queued_len(), 3);

    client.connect("ws://test", "").await.unwrap();
    let mut peer = peers.recv().await.unwrap();

    let mut kinds = Vec::new();
    for _ in 0..3 {
        kinds.push(peer.recv_frame().await.unwrap().kind);
    }
    assert_eq!(kinds, vec!["a", "b", "c"]);
    assert_eq!(client.queued_len(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_send_during_reconnect_is_delivered_after_reopen() {
    let (connector, client) = client_with(TransportConfig::default());
    let mut peers = connector.take_peers().unwrap();

    client.connect("ws://test", "").await.unwrap();
    let first = peers.recv().await.unwrap();
    first.close();
    settle().await;
    assert_eq!(client.state(), ConnectionState::Reconnecting);

    client.send("late", json!({"n": 1})).unwrap();
    assert_eq!(client.queued_len(), 1);

    let mut second = peers.recv().await.unwrap();
    let frame = second.recv_frame().await.unwrap();
    assert_eq!(frame.kind, "late");
    assert_eq!(frame.payload, json!({"n": 1}));
}

#[tokio::test(start_paused = true)]
async fn test_malformed_frames_and_panicking_handlers_are_contained() {
    let (connector, client) = client_with(TransportConfig::default());
    let mut peers = connector.take_peers().unwrap();
    client.connect("ws://test", "").await.unwrap();
    let peer = peers.recv().await.unwrap();

    let order = Arc::new(Mutex::new(Vec::new()));
    let _boom = client.on("event", |_| panic!("faulty subscriber"));
    let first = order.clone();
    let _a = client.on("event", move |payload| first.lock().push(("first", payload.clone())));
    let second = order.clone();
    let _b = client.on("event", move |payload| second.lock().push(("second", payload.clone())));

    peer.push("{not json");
    peer.push(r#"{"payload": 1}"#);
    peer.push_frame("event", json!(1));
    peer.push_frame("event", json!(2));
    settle().await;

    assert_eq!(
        *order.lock(),
        vec![
            ("first", json!(1)),
            ("second", json!(1)),
            ("first", json!(2)),
            ("second", json!(2)),
        ]
    );
    assert_eq!(client.state(), ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_unsubscribed_handler_stops_receiving() {
    let (connector, client) = client_with(TransportConfig::default());
    let mut peers = connector.take_peers().unwrap();
    client.connect("ws://test", "").await.unwrap();
    let peer = peers.recv().await.unwrap();

    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();
    let sub = client.on("tick", move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    peer.push_frame("tick", json!(null));
    settle().await;
    sub.unsubscribe();
    peer.push_frame("tick", json!(null));
    settle().await;

    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_keepalive_ping_every_interval() {
    let config = TransportConfigBuilder::new().ping_interval(30000).build();
    let (connector, client) = client_with(config);
    let mut peers = connector.take_peers().unwrap();
    client.connect("ws://test", "").await.unwrap();
    let mut peer = peers.recv().await.unwrap();

    sleep(Duration::from_millis(29000)).await;
    assert!(peer.try_recv().is_none());

    sleep(Duration::from_millis(2000)).await;
    let ping = peer.try_recv().unwrap();
    assert_eq!(ping, r#"{"type":"ping","payload":null}"#);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_is_terminal() {
    let (connector, client) = client_with(TransportConfig::default());
    let mut peers = connector.take_peers().unwrap();
    client.connect("ws://test", "").await.unwrap();
    let mut peer = peers.recv().await.unwrap();

    client.disconnect();
    assert_eq!(client.state(), ConnectionState::Disconnected);

    // The link is gone from the client side.
    assert!(peer.recv().await.is_none());

    sleep(Duration::from_secs(120)).await;
    assert_eq!(connector.attempt_count(), 1);
    assert_eq!(client.state(), ConnectionState::Disconnected);

    // Foregrounding does not undo an intentional close.
    client.app_state_changed(AppState::Foreground);
    settle().await;
    assert_eq!(connector.attempt_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_connect_is_idempotent() {
    let (connector, client) = client_with(TransportConfig::default());
    let _peers = connector.take_peers().unwrap();

    client.connect("ws://test", "").await.unwrap();
    client.connect("ws://test", "").await.unwrap();
    assert_eq!(connector.attempt_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_foreground_revives_a_client_that_gave_up() {
    let config = TransportConfigBuilder::new().max_reconnect_attempts(2).build();
    let (connector, client) = client_with(config);
    let mut peers = connector.take_peers().unwrap();
    connector.set_online(false);

    assert!(client.connect("ws://test", "").await.is_err());
    sleep(Duration::from_secs(60)).await;
    assert_eq!(connector.attempt_count(), 3);
    assert_eq!(client.state(), ConnectionState::Disconnected);

    connector.set_online(true);
    let (lifecycle, rx) = watch::channel(AppState::Background);
    client.attach_lifecycle(rx);
    lifecycle.send(AppState::Foreground).unwrap();

    let _peer = peers.recv().await.unwrap();
    settle().await;
    assert_eq!(client.state(), ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_explicit_connect_resets_attempt_budget() {
    let config = TransportConfigBuilder::new().max_reconnect_attempts(1).build();
    let (connector, client) = client_with(config);
    connector.set_online(false);

    assert!(client.connect("ws://test", "").await.is_err());
    sleep(Duration::from_secs(10)).await;
    assert_eq!(connector.attempt_count(), 2);

    assert!(client.connect("ws://test", "").await.is_err());
    sleep(Duration::from_secs(10)).await;
    assert_eq!(connector.attempt_count(), 4);
    assert_eq!(gaps_ms(&connector)[2], 1000);
}
