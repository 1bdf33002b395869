//! Bounded per-session outbound queue with drop-oldest overflow.
//!
//! The hub pushes, the session's writer drains. A session whose queue stays
//! full for longer than the grace period is marked for disconnect.

use crate::models::SignalEvent;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackpressureState {
    Normal,
    /// Queue overflowed since the last drain; oldest entries are being dropped.
    Throttled,
    Disconnecting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// Queued after dropping the oldest pending entry.
    DroppedOldest,
    /// The queue has been full for longer than the grace period, or is already
    /// marked for disconnect. Nothing was queued.
    Disconnect,
}

/// Everything pending at the time of a drain.
#[derive(Debug, Default)]
pub struct Drained {
    pub events: Vec<SignalEvent>,
    pub disconnect: bool,
    pub closed: bool,
}

struct QueueInner {
    items: VecDeque<SignalEvent>,
    state: BackpressureState,
    saturated_since: Option<Instant>,
    dropped: u64,
    closed: bool,
}

pub struct OutboundQueue {
    capacity: usize,
    grace: Duration,
    inner: Mutex<QueueInner>,
    notify: Notify,
}

impl OutboundQueue {
    pub fn new(capacity: usize, grace: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            grace,
            inner: Mutex::new(QueueInner {
                items: VecDeque::with_capacity(capacity.max(1)),
                state: BackpressureState::Normal,
                saturated_since: None,
                dropped: 0,
                closed: false,
            }),
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push(&self, event: SignalEvent, now: Instant) -> PushOutcome {
        let mut inner = self.lock();
        if inner.closed || inner.state == BackpressureState::Disconnecting {
            return PushOutcome::Disconnect;
        }

        if let Some(since) = inner.saturated_since {
            if now.saturating_duration_since(since) > self.grace {
                inner.state = BackpressureState::Disconnecting;
                return PushOutcome::Disconnect;
            }
        }

        let mut outcome = PushOutcome::Queued;
        if inner.items.len() >= self.capacity {
            inner.items.pop_front();
            inner.dropped += 1;
            inner.state = BackpressureState::Throttled;
            inner.saturated_since.get_or_insert(now);
            outcome = PushOutcome::DroppedOldest;
        }
        inner.items.push_back(event);
        outcome
    }

    /// Takes everything pending. A drain relieves saturation unless the queue
    /// is already marked for disconnect.
    pub fn drain(&self) -> Drained {
        let mut inner = self.lock();
        let disconnect = inner.state == BackpressureState::Disconnecting;
        if !disconnect {
            inner.state = BackpressureState::Normal;
            inner.saturated_since = None;
        }
        Drained {
            events: inner.items.drain(..).collect(),
            disconnect,
            closed: inner.closed,
        }
    }

    pub fn mark_disconnecting(&self) {
        self.lock().state = BackpressureState::Disconnecting;
        self.notify.notify_one();
    }

    /// No further pushes are accepted; pending entries can still be drained.
    pub fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_one();
    }

    /// Wakes the writer.
    pub fn wake(&self) {
        self.notify.notify_one();
    }

    pub async fn notified(&self) {
        self.notify.notified().await
    }

    pub fn state(&self) -> BackpressureState {
        self.lock().state
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().items.is_empty()
    }

    pub fn dropped(&self) -> u64 {
        self.lock().dropped
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
