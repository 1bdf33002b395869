//! Integration tests for the signal engine
//!
//! Listener, scheduler, reconciler and hub wired together over the in-memory
//! source, with a queue attached directly to the hub in place of a client.

use crate::fixtures::{engine_config, metrics, recent_signal, signal_with_score};
use signal_relay::broadcast::OutboundQueue;
use signal_relay::config::EngineConfig;
use signal_relay::engine::{ListenerState, SignalEngine, SourceHealth};
use signal_relay::models::SignalEvent;
use signal_relay::services::MemorySignalSource;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

async fn start(config: EngineConfig, source: Arc<MemorySignalSource>) -> (SignalEngine, Arc<OutboundQueue>) {
    let engine = SignalEngine::start(config, source, metrics())
        .await
        .expect("engine starts");
    let queue = Arc::new(OutboundQueue::new(64, Duration::from_secs(5)));
    engine
        .fanout()
        .attach(1, None, queue.clone())
        .await
        .expect("attach");
    (engine, queue)
}

/// Polls the queue until something arrives or `limit` passes.
async fn wait_for_events(queue: &OutboundQueue, limit: Duration) -> Vec<SignalEvent> {
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        let drained = queue.drain();
        if !drained.events.is_empty() {
            return drained.events;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    Vec::new()
}

#[tokio::test(start_paused = true)]
async fn notification_reaches_subscriber() {
    let source = Arc::new(MemorySignalSource::new());
    let config = EngineConfig {
        lightweight_interval: Duration::from_secs(300),
        safety_net_interval: Duration::from_secs(600),
        ..engine_config()
    };
    let (mut engine, queue) = start(config, source.clone()).await;
    engine.status().wait_for_listener(ListenerState::Active).await;

    source.upsert(recent_signal(1, 5));

    let events = wait_for_events(&queue, Duration::from_secs(1)).await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].signal.id, 1);
    engine.stop().await;
}

#[tokio::test(start_paused = true)]
async fn lost_notification_is_caught_by_lightweight_poll() {
    let source = Arc::new(MemorySignalSource::new());
    let config = EngineConfig {
        use_notify: false,
        lightweight_interval: Duration::from_secs(1),
        safety_net_interval: Duration::from_secs(60),
        ..engine_config()
    };
    let (mut engine, queue) = start(config, source.clone()).await;
    assert_eq!(engine.status().listener_state(), ListenerState::Disabled);

    let written = Instant::now();
    source.upsert_silently(recent_signal(2, 1));

    let events = wait_for_events(&queue, Duration::from_secs(5)).await;
    assert_eq!(events.len(), 1);
    assert!(
        written.elapsed() <= Duration::from_millis(1100),
        "delivered within one lightweight interval, took {:?}",
        written.elapsed()
    );
    engine.stop().await;
}

#[tokio::test(start_paused = true)]
async fn polling_delivers_within_bound_while_listener_is_degraded() {
    let source = Arc::new(MemorySignalSource::new());
    let config = EngineConfig {
        lightweight_interval: Duration::from_secs(1),
        safety_net_interval: Duration::from_secs(60),
        ..engine_config()
    };
    let (mut engine, queue) = start(config.clone(), source.clone()).await;
    let status = engine.status();
    status.wait_for_listener(ListenerState::Active).await;

    source.set_fail_subscribe(true);
    source.drop_subscriptions();
    status.wait_for_listener(ListenerState::Degraded).await;

    let written = Instant::now();
    source.upsert_silently(recent_signal(21, 1));

    let events = wait_for_events(&queue, config.safety_net_interval).await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].signal.id, 21);
    assert!(
        written.elapsed() <= config.lightweight_interval + Duration::from_millis(100),
        "delivered by the lightweight poll, took {:?}",
        written.elapsed()
    );
    assert_eq!(status.listener_state(), ListenerState::Degraded);
    engine.stop().await;
}

#[tokio::test(start_paused = true)]
async fn in_place_update_is_caught_by_safety_net() {
    let source = Arc::new(MemorySignalSource::new());
    let original = recent_signal(5, 10);
    source.upsert_silently(original.clone());
    let config = EngineConfig {
        use_notify: false,
        lightweight_interval: Duration::from_secs(1),
        safety_net_interval: Duration::from_secs(5),
        ..engine_config()
    };
    let (mut engine, queue) = start(config, source.clone()).await;
    let fetches = source.fetch_count();

    source.upsert_silently(signal_with_score(5, original.timestamp, 95.0));

    // Lightweight checks see the same id, timestamp and count.
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(source.fetch_count(), fetches);
    assert!(source.marker_count() >= 3);

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert!(source.fetch_count() > fetches, "safety net ran a full fetch");

    let catch_up = engine
        .fanout()
        .attach(2, None, Arc::new(OutboundQueue::new(8, Duration::from_secs(5))))
        .await
        .unwrap();
    assert_eq!(catch_up.signals.len(), 1);
    assert_eq!(catch_up.signals[0].score_week, 95.0);
    assert!(
        queue.is_empty(),
        "same cursor as already delivered, so the attached session is not sent it again"
    );
    engine.stop().await;
}

#[tokio::test(start_paused = true)]
async fn resubscribe_resyncs_signals_missed_while_down() {
    let source = Arc::new(MemorySignalSource::new());
    let config = EngineConfig {
        lightweight_interval: Duration::from_secs(300),
        safety_net_interval: Duration::from_secs(600),
        ..engine_config()
    };
    let (mut engine, queue) = start(config, source.clone()).await;
    let status = engine.status();
    status.wait_for_listener(ListenerState::Active).await;

    source.set_fail_subscribe(true);
    source.drop_subscriptions();
    status.wait_for_listener(ListenerState::Degraded).await;

    // Written while nobody listens: no notification will ever arrive for it.
    source.upsert(recent_signal(9, 2));
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert!(queue.is_empty());

    source.set_fail_subscribe(false);
    status.wait_for_listener(ListenerState::Active).await;

    let events = wait_for_events(&queue, Duration::from_secs(1)).await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].signal.id, 9);
    engine.stop().await;
}

#[tokio::test(start_paused = true)]
async fn repeated_fetch_failures_escalate_to_fatal() {
    let source = Arc::new(MemorySignalSource::new());
    let config = EngineConfig {
        use_notify: false,
        ..engine_config()
    };
    let (mut engine, _queue) = start(config, source.clone()).await;
    let status = engine.status();
    assert_eq!(status.source_health(), SourceHealth::Healthy);

    source.set_fail_fetch(true);
    let health = tokio::time::timeout(Duration::from_secs(30), status.wait_for_fatal())
        .await
        .expect("fatal within the poll cadence");

    assert!(health.is_fatal());
    engine.stop().await;
}

#[tokio::test(start_paused = true)]
async fn stop_closes_session_queues() {
    let source = Arc::new(MemorySignalSource::new());
    let (mut engine, queue) = start(engine_config(), source).await;
    let fanout = engine.fanout();

    engine.stop().await;

    assert!(queue.is_closed());
    assert_eq!(fanout.session_count(), 0);
    assert!(fanout
        .attach(2, None, Arc::new(OutboundQueue::new(4, Duration::from_secs(1))))
        .await
        .is_err());
}

#[tokio::test(start_paused = true)]
async fn stalled_subscriber_is_dropped_after_grace() {
    let source = Arc::new(MemorySignalSource::new());
    let config = EngineConfig {
        lightweight_interval: Duration::from_secs(300),
        safety_net_interval: Duration::from_secs(600),
        ..engine_config()
    };
    let mut engine = SignalEngine::start(config, source.clone(), metrics())
        .await
        .expect("engine starts");
    engine.status().wait_for_listener(ListenerState::Active).await;

    // Never drained, as if the client stopped reading.
    let stalled = Arc::new(OutboundQueue::new(1, Duration::from_millis(500)));
    let healthy = Arc::new(OutboundQueue::new(64, Duration::from_millis(500)));
    let fanout = engine.fanout();
    fanout.attach(1, None, stalled.clone()).await.unwrap();
    fanout.attach(2, None, healthy.clone()).await.unwrap();

    source.upsert(recent_signal(1, 3));
    tokio::time::sleep(Duration::from_millis(100)).await;
    source.upsert(recent_signal(2, 2));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(stalled.dropped(), 1, "oldest entry dropped on overflow");

    tokio::time::sleep(Duration::from_secs(1)).await;
    source.upsert(recent_signal(3, 1));
    let mut sessions = fanout.subscribe_sessions();
    tokio::time::timeout(Duration::from_secs(1), sessions.wait_for(|count| *count == 1))
        .await
        .expect("stalled session removed")
        .unwrap();

    assert!(stalled.drain().disconnect);
    let ids: Vec<i64> = healthy.drain().events.iter().map(|e| e.signal.id).collect();
    assert_eq!(ids, vec![1, 2, 3]);

    engine.stop().await;
}
