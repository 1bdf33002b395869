//! In-process signal source for tests and local runs.
//!
//! Behaves like the store plus its NOTIFY trigger: every `upsert` publishes a
//! change event to active subscribers, `upsert_silently` simulates a lost
//! notification, and failures can be switched on to exercise degraded paths.

use crate::error::{EngineError, Result};
use crate::models::{ChangeEvent, Signal, SourceMarker};
use crate::services::signal_source::{ChangeStream, SignalSource};
use chrono::{DateTime, Utc};
use futures_util::stream::{self, StreamExt};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;

type Subscriber = mpsc::UnboundedSender<Result<ChangeEvent>>;

#[derive(Default)]
struct MemoryState {
    signals: BTreeMap<i64, Signal>,
    subscribers: Vec<(String, Subscriber)>,
    fail_fetch: bool,
    fail_subscribe: bool,
    fetch_count: usize,
    marker_count: usize,
    subscribe_count: usize,
}

#[derive(Default)]
pub struct MemorySignalSource {
    state: Mutex<MemoryState>,
}

impl MemorySignalSource {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Inserts or replaces a signal and notifies subscribers.
    pub fn upsert(&self, signal: Signal) {
        let mut state = self.lock();
        let operation = if state.signals.contains_key(&signal.id) {
            "UPDATE"
        } else {
            "INSERT"
        };
        let payload = serde_json::json!({
            "event": operation,
            "id": signal.id,
            "pair_symbol": signal.pair_symbol,
            "score_week": signal.score_week,
            "score_month": signal.score_month,
            "timestamp": signal.timestamp.to_rfc3339(),
            "action": signal.recommended_action,
        })
        .to_string();
        state.signals.insert(signal.id, signal);
        Self::publish(&mut state, payload);
    }

    /// Inserts or replaces a signal without publishing a notification.
    pub fn upsert_silently(&self, signal: Signal) {
        self.lock().signals.insert(signal.id, signal);
    }

    pub fn remove(&self, id: i64) -> Option<Signal> {
        self.lock().signals.remove(&id)
    }

    /// Publishes a raw payload on every active subscription.
    pub fn notify_raw(&self, payload: &str) {
        let mut state = self.lock();
        Self::publish(&mut state, payload.to_string());
    }

    fn publish(state: &mut MemoryState, payload: String) {
        state.subscribers.retain(|(channel, tx)| {
            tx.send(Ok(ChangeEvent {
                channel: channel.clone(),
                payload: payload.clone(),
            }))
            .is_ok()
        });
    }

    /// Ends every active subscription, as a dropped connection would.
    pub fn drop_subscriptions(&self) {
        let mut state = self.lock();
        for (_, tx) in state.subscribers.drain(..) {
            let _ = tx.send(Err(EngineError::ChannelDegraded(
                "notification connection closed".to_string(),
            )));
        }
    }

    pub fn set_fail_fetch(&self, fail: bool) {
        self.lock().fail_fetch = fail;
    }

    pub fn set_fail_subscribe(&self, fail: bool) {
        self.lock().fail_subscribe = fail;
    }

    pub fn fetch_count(&self) -> usize {
        self.lock().fetch_count
    }

    pub fn marker_count(&self) -> usize {
        self.lock().marker_count
    }

    pub fn subscribe_count(&self) -> usize {
        self.lock().subscribe_count
    }

    pub fn subscriber_count(&self) -> usize {
        let mut state = self.lock();
        state.subscribers.retain(|(_, tx)| !tx.is_closed());
        state.subscribers.len()
    }
}

#[async_trait::async_trait]
impl SignalSource for MemorySignalSource {
    async fn fetch_qualifying(&self, since: DateTime<Utc>) -> Result<Vec<Signal>> {
        let mut state = self.lock();
        state.fetch_count += 1;
        if state.fail_fetch {
            return Err(EngineError::SourceUnavailable("memory source set to fail".into()));
        }
        let mut signals: Vec<Signal> = state
            .signals
            .values()
            .filter(|s| s.timestamp >= since)
            .cloned()
            .collect();
        signals.sort_by_key(Signal::cursor);
        Ok(signals)
    }

    async fn fetch_marker(&self, since: DateTime<Utc>) -> Result<SourceMarker> {
        let mut state = self.lock();
        state.marker_count += 1;
        if state.fail_fetch {
            return Err(EngineError::SourceUnavailable("memory source set to fail".into()));
        }
        let live = state.signals.values().filter(|s| s.timestamp >= since);
        let mut marker = SourceMarker::default();
        for signal in live {
            marker.count += 1;
            marker.max_id = marker.max_id.max(Some(signal.id));
            marker.max_timestamp = marker.max_timestamp.max(Some(signal.timestamp));
        }
        Ok(marker)
    }

    async fn subscribe_changes(&self, channel: &str) -> Result<ChangeStream> {
        let mut state = self.lock();
        state.subscribe_count += 1;
        if state.fail_subscribe {
            return Err(EngineError::ChannelDegraded(format!(
                "cannot LISTEN on {}: memory source set to fail",
                channel
            )));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        state.subscribers.push((channel.to_string(), tx));

        let stream = stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        });
        Ok(stream.boxed())
    }
}
