//! Coalescing hand-off of refresh requests to the single-writer reconciler.
//!
//! Producers never block: a request arriving while another is pending is
//! folded into the pending batch. Fetches are range based, so one pass
//! covers every trigger in the batch.

use crate::metrics::Metrics;
use crate::models::{RefreshReason, RefreshRequest, SourceMarker};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;
use tracing::debug;

/// Every request received since the reconciler last became free.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RefreshBatch {
    reasons: BTreeMap<&'static str, usize>,
    full_fetch: bool,
    marker: Option<SourceMarker>,
    requests: usize,
}

impl RefreshBatch {
    pub fn new(request: RefreshRequest) -> Self {
        let mut batch = Self::default();
        batch.push(request);
        batch
    }

    pub fn push(&mut self, request: RefreshRequest) {
        self.requests += 1;
        *self.reasons.entry(request.reason.as_str()).or_insert(0) += 1;
        self.full_fetch |= request.reason.requires_full_fetch();
        if let Some(marker) = request.marker() {
            self.marker = Some(marker.clone());
        }
    }

    /// A full fetch is needed unless every request was a lightweight poll.
    pub fn needs_full_fetch(&self) -> bool {
        self.full_fetch
    }

    /// Latest marker carried as a hint by a lightweight poll, if any.
    pub fn marker(&self) -> Option<&SourceMarker> {
        self.marker.as_ref()
    }

    pub fn requests(&self) -> usize {
        self.requests
    }

    pub fn count(&self, reason: RefreshReason) -> usize {
        self.reasons.get(reason.as_str()).copied().unwrap_or(0)
    }

    /// `reason=count` pairs for logging.
    pub fn summary(&self) -> String {
        self.reasons
            .iter()
            .map(|(reason, count)| format!("{}={}", reason, count))
            .collect::<Vec<_>>()
            .join(",")
    }
}

#[derive(Default)]
struct Pending {
    batch: Option<RefreshBatch>,
    closed: bool,
}

struct Shared {
    pending: Mutex<Pending>,
    notify: Notify,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Pending> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub fn refresh_channel(metrics: Arc<Metrics>) -> (RefreshSender, RefreshReceiver) {
    let shared = Arc::new(Shared {
        pending: Mutex::new(Pending::default()),
        notify: Notify::new(),
    });
    (
        RefreshSender {
            shared: shared.clone(),
            metrics,
        },
        RefreshReceiver { shared },
    )
}

#[derive(Clone)]
pub struct RefreshSender {
    shared: Arc<Shared>,
    metrics: Arc<Metrics>,
}

impl RefreshSender {
    /// Queues a request. Returns false once the channel is closed.
    pub fn send(&self, request: RefreshRequest) -> bool {
        let reason = request.reason;
        {
            let mut pending = self.shared.lock();
            if pending.closed {
                return false;
            }
            self.metrics
                .refresh_requests_total
                .with_label_values(&[reason.as_str()])
                .inc();
            match pending.batch.as_mut() {
                Some(batch) => {
                    batch.push(request);
                    self.metrics.refresh_coalesced_total.inc();
                    debug!(reason = %reason, pending = batch.requests(), "Refresh coalesced into pending pass");
                }
                None => pending.batch = Some(RefreshBatch::new(request)),
            }
        }
        self.shared.notify.notify_one();
        true
    }

    /// Stops accepting requests. Whatever is already pending is still delivered.
    pub fn close(&self) {
        self.shared.lock().closed = true;
        self.shared.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }
}

pub struct RefreshReceiver {
    shared: Arc<Shared>,
}

impl RefreshReceiver {
    /// Waits for the next batch. `None` once closed and drained.
    pub async fn recv(&mut self) -> Option<RefreshBatch> {
        loop {
            {
                let mut pending = self.shared.lock();
                if let Some(batch) = pending.batch.take() {
                    return Some(batch);
                }
                if pending.closed {
                    return None;
                }
            }
            self.shared.notify.notified().await;
        }
    }

    /// Takes the pending batch without waiting.
    pub fn try_recv(&mut self) -> Option<RefreshBatch> {
        self.shared.lock().batch.take()
    }
}
