//! Integration tests for the WebSocket service
//!
//! Real clients against a relay backed by the in-memory source: handshake,
//! authentication, catch-up, live deltas and session teardown.


use crate::fixtures::recent_signal;
use serde_json::json;
use std::time::Duration;
use test_utils::{ids, next_json, read_until_closed, send_json, test_config, TestRelay, TOKEN};

#[tokio::test]
async fn authenticated_client_receives_snapshot_then_deltas() {
    let source = std::sync::Arc::new(signal_relay::services::MemorySignalSource::new());
    source.upsert_silently(recent_signal(1, 120));
    source.upsert_silently(recent_signal(2, 60));
    let relay = TestRelay::start_with(test_config(), source).await;

    let (mut client, welcome, snapshot) = relay.connect_authenticated(None).await;
    assert_eq!(welcome["window_minutes"], 32);
    assert_eq!(snapshot["count"], 2);
    assert_eq!(ids(&snapshot), vec![1, 2]);
    assert_eq!(snapshot["cursor"]["id"], 2);

    relay.source.upsert(recent_signal(3, 1));
    let delta = next_json(&mut client).await;
    assert_eq!(delta["type"], "delta");
    assert_eq!(ids(&delta), vec![3]);
    assert_eq!(delta["data"][0]["event"], "insert");

    relay.runtime.shutdown().await;
}

#[tokio::test]
async fn wrong_token_is_rejected_and_closed() {
    let relay = TestRelay::start().await;
    let mut client = relay.connect().await;
    assert_eq!(next_json(&mut client).await["type"], "auth_required");

    send_json(&mut client, json!({ "type": "auth", "token": "wrong" })).await;

    let error = read_until_closed(&mut client).await.expect("error before close");
    assert_eq!(error["code"], "auth_failed");
    relay.runtime.shutdown().await;
}

#[tokio::test]
async fn silent_client_times_out_before_authenticating() {
    let mut config = test_config();
    config.session.auth_timeout = Duration::from_millis(300);
    let relay = TestRelay::start_with(config, Default::default()).await;

    let mut client = relay.connect().await;
    assert_eq!(next_json(&mut client).await["type"], "auth_required");

    let error = read_until_closed(&mut client).await.expect("error before close");
    assert_eq!(error["code"], "auth_timeout");
    relay.runtime.shutdown().await;
}

#[tokio::test]
async fn ping_is_answered_before_authentication() {
    let relay = TestRelay::start().await;
    let mut client = relay.connect().await;
    next_json(&mut client).await;

    send_json(&mut client, json!({ "type": "ping" })).await;
    assert_eq!(next_json(&mut client).await["type"], "pong");

    send_json(&mut client, json!({ "type": "auth", "token": TOKEN })).await;
    assert_eq!(next_json(&mut client).await["type"], "auth_success");
    relay.runtime.shutdown().await;
}

#[tokio::test]
async fn resuming_client_only_gets_newer_signals() {
    let source = std::sync::Arc::new(signal_relay::services::MemorySignalSource::new());
    for (id, ago) in [(1, 300), (2, 200), (3, 100)] {
        source.upsert_silently(recent_signal(id, ago));
    }
    let relay = TestRelay::start_with(test_config(), source).await;

    let (_first, _, snapshot) = relay.connect_authenticated(None).await;
    let second_cursor = snapshot["data"][1].clone();
    let cursor = json!({ "timestamp": second_cursor["timestamp"], "id": second_cursor["id"] });

    let (_resumed, welcome, catch_up) = relay.connect_authenticated(Some(cursor)).await;
    assert_eq!(ids(&catch_up), vec![3]);
    assert_eq!(welcome["cursor"]["id"], 3);
    relay.runtime.shutdown().await;
}

#[tokio::test]
async fn get_stats_reports_session_and_engine_state() {
    let source = std::sync::Arc::new(signal_relay::services::MemorySignalSource::new());
    source.upsert_silently(recent_signal(7, 30));
    let relay = TestRelay::start_with(test_config(), source).await;
    let (mut client, welcome, _) = relay.connect_authenticated(None).await;

    send_json(&mut client, json!({ "type": "get_stats" })).await;
    let stats = next_json(&mut client).await;

    assert_eq!(stats["type"], "stats");
    assert_eq!(stats["connection_id"], welcome["connection_id"]);
    assert_eq!(stats["window_size"], 1);
    assert_eq!(stats["active_sessions"], 1);
    assert_eq!(stats["cursor"]["id"], 7);
    assert_eq!(stats["source"]["state"], "healthy");
    relay.runtime.shutdown().await;
}

#[tokio::test]
async fn invalid_message_on_active_session_is_a_protocol_violation() {
    let relay = TestRelay::start().await;
    let (mut client, _, _) = relay.connect_authenticated(None).await;

    send_json(&mut client, json!({ "type": "subscribe", "channel": "all" })).await;

    let error = read_until_closed(&mut client).await.expect("error before close");
    assert_eq!(error["code"], "protocol_violation");
    relay.runtime.shutdown().await;
}

#[tokio::test]
async fn shutdown_notifies_connected_clients() {
    let relay = TestRelay::start().await;
    let (mut client, _, _) = relay.connect_authenticated(None).await;
    let status = relay.runtime.status();

    let shutdown = tokio::spawn(relay.runtime.shutdown());
    let error = read_until_closed(&mut client).await.expect("error before close");
    assert_eq!(error["code"], "shutting_down");

    shutdown.await.unwrap();
    assert_eq!(status.sessions(), 0);
}
