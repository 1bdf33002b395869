//! Unit tests for the change listener

use crate::fixtures::{engine_config, metrics, recent_signal};
use signal_relay::engine::{refresh_channel, ChangeListener, ListenerState};
use signal_relay::models::RefreshReason;
use signal_relay::services::MemorySignalSource;
use std::sync::Arc;
use std::time::Duration;

async fn wait_for_state(listener: &ChangeListener, state: ListenerState) {
    let mut rx = listener.subscribe_state();
    tokio::time::timeout(Duration::from_secs(120), rx.wait_for(|s| *s == state))
        .await
        .expect("listener state reached in time")
        .expect("state channel open");
}

#[tokio::test(start_paused = true)]
async fn test_notification_becomes_notify_request() {
    let source = Arc::new(MemorySignalSource::new());
    let (sender, mut receiver) = refresh_channel(metrics());
    let listener = ChangeListener::new(source.clone(), &engine_config(), sender, metrics());

    listener.start().await.unwrap();
    wait_for_state(&listener, ListenerState::Active).await;

    source.upsert(recent_signal(1, 5));
    let batch = receiver.recv().await.expect("refresh requested");
    assert_eq!(batch.count(RefreshReason::Notify), 1);
    assert_eq!(batch.count(RefreshReason::Resync), 0, "first subscribe is not a resync");

    listener.stop().await;
    assert_eq!(listener.state(), ListenerState::Stopped);
}

#[tokio::test(start_paused = true)]
async fn test_lost_subscription_degrades_then_resyncs() {
    let source = Arc::new(MemorySignalSource::new());
    let (sender, mut receiver) = refresh_channel(metrics());
    let listener = ChangeListener::new(source.clone(), &engine_config(), sender, metrics());

    listener.start().await.unwrap();
    wait_for_state(&listener, ListenerState::Active).await;

    source.set_fail_subscribe(true);
    source.drop_subscriptions();
    wait_for_state(&listener, ListenerState::Degraded).await;

    // Several backoff rounds while the store refuses subscriptions.
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(listener.state(), ListenerState::Degraded);
    assert!(source.subscribe_count() >= 3);

    source.set_fail_subscribe(false);
    wait_for_state(&listener, ListenerState::Active).await;

    let batch = receiver.recv().await.expect("resync requested");
    assert_eq!(batch.count(RefreshReason::Resync), 1);

    listener.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_malformed_payload_degrades_listener() {
    let source = Arc::new(MemorySignalSource::new());
    let (sender, _receiver) = refresh_channel(metrics());
    let listener = ChangeListener::new(source.clone(), &engine_config(), sender, metrics());

    listener.start().await.unwrap();
    wait_for_state(&listener, ListenerState::Active).await;

    source.notify_raw("{not json");
    wait_for_state(&listener, ListenerState::Degraded).await;
    wait_for_state(&listener, ListenerState::Active).await;

    listener.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_start_twice_is_rejected() {
    let source = Arc::new(MemorySignalSource::new());
    let (sender, _receiver) = refresh_channel(metrics());
    let listener = ChangeListener::new(source, &engine_config(), sender, metrics());

    listener.start().await.unwrap();
    assert!(listener.start().await.is_err());
    listener.stop().await;
}
