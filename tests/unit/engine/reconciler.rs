//! Unit tests for the reconciler

use crate::fixtures::{at, engine_config, metrics, signal, signal_with_score};
use chrono::Duration;
use signal_relay::engine::{RefreshBatch, Reconciler, SourceHealth};
use signal_relay::models::{Cursor, EventKind, RefreshReason, RefreshRequest};
use signal_relay::services::MemorySignalSource;
use std::sync::Arc;

fn setup() -> (Arc<MemorySignalSource>, Reconciler) {
    let source = Arc::new(MemorySignalSource::new());
    let reconciler = Reconciler::new(source.clone(), engine_config(), metrics());
    (source, reconciler)
}

fn notify() -> RefreshRequest {
    RefreshRequest::notify(None)
}

#[tokio::test]
async fn test_initial_pass_admits_in_cursor_order() {
    let (source, mut reconciler) = setup();
    source.upsert_silently(signal(3, at(-30)));
    source.upsert_silently(signal(1, at(-60)));
    source.upsert_silently(signal(2, at(-30)));

    let delta = reconciler
        .handle_refresh_at(RefreshRequest::new(RefreshReason::Resync), at(0))
        .await
        .expect("pass succeeds");

    let cursors: Vec<Cursor> = delta.events.iter().map(|e| e.cursor()).collect();
    assert_eq!(
        cursors,
        vec![
            Cursor::new(at(-60), 1),
            Cursor::new(at(-30), 2),
            Cursor::new(at(-30), 3),
        ]
    );
    assert!(delta.events.iter().all(|e| e.event == EventKind::Insert));
    assert_eq!(reconciler.window().len(), 3);
}

#[tokio::test]
async fn test_overlapping_fetches_are_idempotent() {
    let (source, mut reconciler) = setup();
    source.upsert_silently(signal(1, at(-10)));

    let first = reconciler.handle_refresh_at(notify(), at(0)).await.unwrap();
    let second = reconciler.handle_refresh_at(notify(), at(1)).await.unwrap();

    assert_eq!(first.len(), 1);
    assert!(second.is_empty(), "unchanged signal must not be delivered twice");
}

#[tokio::test]
async fn test_update_moves_signal_to_new_cursor() {
    let (source, mut reconciler) = setup();
    source.upsert_silently(signal(100, at(-20)));
    reconciler.handle_refresh_at(notify(), at(0)).await.unwrap();

    source.upsert_silently(signal(100, at(-5)));
    let delta = reconciler.handle_refresh_at(notify(), at(1)).await.unwrap();

    assert_eq!(delta.len(), 1);
    assert_eq!(delta.events[0].event, EventKind::Update);
    assert_eq!(delta.events[0].cursor(), Cursor::new(at(-5), 100));
    assert_eq!(reconciler.window().len(), 1);
}

#[tokio::test]
async fn test_late_insert_with_older_timestamp_is_admitted() {
    let (source, mut reconciler) = setup();
    source.upsert_silently(signal(10, at(-5)));
    reconciler.handle_refresh_at(notify(), at(0)).await.unwrap();

    source.upsert_silently(signal(11, at(-50)));
    let delta = reconciler.handle_refresh_at(notify(), at(1)).await.unwrap();

    assert_eq!(delta.len(), 1);
    assert_eq!(delta.events[0].signal.id, 11);
    assert_eq!(
        reconciler.window().cursor(),
        Some(Cursor::new(at(-5), 10)),
        "window cursor never moves back"
    );
}

#[tokio::test]
async fn test_pass_evicts_signals_that_left_the_window() {
    let (source, mut reconciler) = setup();
    source.upsert_silently(signal(1, at(0)));
    source.upsert_silently(signal(2, at(60)));
    reconciler.handle_refresh_at(notify(), at(60)).await.unwrap();
    assert_eq!(reconciler.window().len(), 2);

    // 32 minutes after the first signal it sits exactly on the boundary.
    let boundary = at(0) + Duration::minutes(32);
    let outcome = reconciler
        .reconcile_at(RefreshBatch::new(notify()), boundary)
        .await
        .unwrap();
    assert_eq!(outcome.evicted, 0);

    let outcome = reconciler
        .reconcile_at(RefreshBatch::new(notify()), boundary + Duration::milliseconds(1))
        .await
        .unwrap();
    assert_eq!(outcome.evicted, 1);
    assert!(outcome.changed());
    assert!(!reconciler.window().contains(1));
    assert!(reconciler.window().contains(2));
}

#[tokio::test]
async fn test_failed_pass_keeps_window_and_degrades_health() {
    let (source, mut reconciler) = setup();
    source.upsert_silently(signal(1, at(-10)));
    reconciler.handle_refresh_at(notify(), at(0)).await.unwrap();
    let health = reconciler.subscribe_health();

    source.set_fail_fetch(true);
    assert!(reconciler.handle_refresh_at(notify(), at(1)).await.is_err());
    assert_eq!(reconciler.health(), SourceHealth::Healthy);
    assert_eq!(reconciler.window().len(), 1);

    assert!(reconciler.handle_refresh_at(notify(), at(2)).await.is_err());
    assert_eq!(
        *health.borrow(),
        SourceHealth::Degraded {
            consecutive_failures: 2
        }
    );
    assert_eq!(reconciler.window().len(), 1, "window survives failed passes");

    source.set_fail_fetch(false);
    source.upsert_silently(signal(2, at(1)));
    let delta = reconciler.handle_refresh_at(notify(), at(3)).await.unwrap();
    assert_eq!(delta.len(), 1);
    assert_eq!(reconciler.health(), SourceHealth::Healthy);
    assert_eq!(reconciler.consecutive_failures(), 0);
}

#[tokio::test]
async fn test_repeated_failures_mark_source_unavailable() {
    let (source, mut reconciler) = setup();
    source.set_fail_fetch(true);

    for step in 0..4 {
        let _ = reconciler.handle_refresh_at(notify(), at(step)).await;
    }

    assert!(reconciler.health().is_fatal());
    assert_eq!(reconciler.consecutive_failures(), 4);
}

#[tokio::test]
async fn test_light_poll_skips_fetch_when_marker_unchanged() {
    let (source, mut reconciler) = setup();
    source.upsert_silently(signal(1, at(-10)));
    reconciler.handle_refresh_at(notify(), at(0)).await.unwrap();
    let fetches = source.fetch_count();

    let outcome = reconciler
        .reconcile_at(RefreshBatch::new(RefreshRequest::new(RefreshReason::PollLight)), at(1))
        .await
        .unwrap();

    assert!(!outcome.fetched);
    assert!(outcome.delta.is_empty());
    assert_eq!(source.fetch_count(), fetches);
}

#[tokio::test]
async fn test_light_poll_fetches_when_marker_moves() {
    let (source, mut reconciler) = setup();
    source.upsert_silently(signal(1, at(-10)));
    reconciler.handle_refresh_at(notify(), at(0)).await.unwrap();

    source.upsert_silently(signal(2, at(-1)));
    let delta = reconciler
        .handle_refresh_at(RefreshRequest::new(RefreshReason::PollLight), at(1))
        .await
        .unwrap();

    assert_eq!(delta.len(), 1);
    assert_eq!(delta.events[0].signal.id, 2);
}

#[tokio::test]
async fn test_full_poll_catches_in_place_update_missed_by_marker() {
    let (source, mut reconciler) = setup();
    source.upsert_silently(signal(1, at(-10)));
    reconciler.handle_refresh_at(notify(), at(0)).await.unwrap();

    // Same id and timestamp: the lightweight marker cannot see this.
    source.upsert_silently(signal_with_score(1, at(-10), 91.0));
    let light = reconciler
        .handle_refresh_at(RefreshRequest::new(RefreshReason::PollLight), at(1))
        .await
        .unwrap();
    assert!(light.is_empty());

    let full = reconciler
        .handle_refresh_at(RefreshRequest::new(RefreshReason::PollFull), at(2))
        .await
        .unwrap();
    assert_eq!(full.len(), 1);
    assert_eq!(full.events[0].event, EventKind::Update);
    assert_eq!(full.events[0].signal.score_week, 91.0);
}

#[tokio::test]
async fn test_batch_with_notify_forces_full_fetch() {
    let (source, mut reconciler) = setup();
    source.upsert_silently(signal(1, at(-10)));
    reconciler.handle_refresh_at(notify(), at(0)).await.unwrap();
    let fetches = source.fetch_count();

    let mut batch = RefreshBatch::new(RefreshRequest::new(RefreshReason::PollLight));
    batch.push(notify());
    let outcome = reconciler.reconcile_at(batch, at(1)).await.unwrap();

    assert!(outcome.fetched);
    assert_eq!(source.fetch_count(), fetches + 1, "one pass covers the whole batch");
}

#[tokio::test]
async fn test_signals_outside_window_are_never_admitted() {
    let (source, mut reconciler) = setup();
    source.upsert_silently(signal(1, at(0) - Duration::minutes(40)));
    source.upsert_silently(signal(2, at(-1)));

    let delta = reconciler.handle_refresh_at(notify(), at(0)).await.unwrap();

    assert_eq!(delta.len(), 1);
    assert_eq!(delta.events[0].signal.id, 2);
}
