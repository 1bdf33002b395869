//! Unit tests for refresh request coalescing

use crate::fixtures::metrics;
use signal_relay::engine::{refresh_channel, RefreshBatch};
use signal_relay::models::{RefreshReason, RefreshRequest, SourceMarker};
use std::time::Duration;

#[test]
fn test_light_only_batch_skips_full_fetch() {
    let mut batch = RefreshBatch::new(RefreshRequest::new(RefreshReason::PollLight));
    batch.push(RefreshRequest::new(RefreshReason::PollLight));

    assert!(!batch.needs_full_fetch());
    assert_eq!(batch.requests(), 2);
    assert_eq!(batch.count(RefreshReason::PollLight), 2);
}

#[test]
fn test_any_non_light_reason_forces_full_fetch() {
    for reason in [RefreshReason::Notify, RefreshReason::Resync, RefreshReason::PollFull] {
        let mut batch = RefreshBatch::new(RefreshRequest::new(RefreshReason::PollLight));
        batch.push(RefreshRequest::new(reason));
        assert!(batch.needs_full_fetch(), "{} must force a full fetch", reason);
    }
}

#[test]
fn test_batch_keeps_latest_marker_hint() {
    let older = SourceMarker {
        max_id: Some(1),
        max_timestamp: None,
        count: 1,
    };
    let newer = SourceMarker {
        max_id: Some(2),
        max_timestamp: None,
        count: 2,
    };
    let mut batch = RefreshBatch::new(RefreshRequest::new(RefreshReason::PollLight).with_marker(older));
    batch.push(RefreshRequest::new(RefreshReason::PollLight).with_marker(newer.clone()));

    assert_eq!(batch.marker(), Some(&newer));
}

#[tokio::test]
async fn test_pending_requests_coalesce_into_one_batch() {
    let metrics = metrics();
    let (sender, mut receiver) = refresh_channel(metrics.clone());

    assert!(sender.send(RefreshRequest::notify(None)));
    assert!(sender.send(RefreshRequest::new(RefreshReason::PollLight)));
    assert!(sender.send(RefreshRequest::notify(None)));

    let batch = receiver.recv().await.expect("batch pending");
    assert_eq!(batch.requests(), 3);
    assert_eq!(batch.count(RefreshReason::Notify), 2);
    assert!(batch.needs_full_fetch());
    assert_eq!(metrics.refresh_coalesced_total.get(), 2);
    assert!(receiver.try_recv().is_none());
}

#[tokio::test]
async fn test_receiver_wakes_on_send() {
    let (sender, mut receiver) = refresh_channel(metrics());

    let waiter = tokio::spawn(async move { receiver.recv().await });
    tokio::time::sleep(Duration::from_millis(10)).await;
    sender.send(RefreshRequest::new(RefreshReason::PollFull));

    let batch = tokio::time::timeout(Duration::from_secs(1), waiter)
        .await
        .expect("receiver woke up")
        .expect("task joined")
        .expect("batch delivered");
    assert_eq!(batch.count(RefreshReason::PollFull), 1);
}

#[tokio::test]
async fn test_close_drains_pending_then_ends() {
    let (sender, mut receiver) = refresh_channel(metrics());
    sender.send(RefreshRequest::notify(None));
    sender.close();

    assert!(!sender.send(RefreshRequest::notify(None)), "closed channel rejects requests");
    assert!(receiver.recv().await.is_some(), "pending work is still delivered");
    assert!(receiver.recv().await.is_none());
}
