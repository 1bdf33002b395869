//! Single writer of the signal window.
//!
//! Each pass fetches the qualifying range from the source, admits the result
//! into the window, evicts what aged out and reports the delta. Passes never
//! overlap: the reconciler task owns the `Reconciler` and handles one batch at
//! a time.

use crate::config::EngineConfig;
use crate::engine::refresh_queue::RefreshBatch;
use crate::engine::window::{Admission, Delta, WindowSnapshot, WindowState};
use crate::error::{EngineError, Result};
use crate::metrics::Metrics;
use crate::models::{Cursor, RefreshRequest, Signal, SourceMarker};
use crate::services::signal_source::SignalSource;
use backon::{ExponentialBuilder, Retryable};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Health of the signal source as seen by the reconciler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SourceHealth {
    Healthy,
    /// Several passes in a row failed; the window is stale but still served.
    Degraded { consecutive_failures: u32 },
    /// Failures crossed the fatal threshold and need operator attention.
    Unavailable { consecutive_failures: u32 },
}

impl SourceHealth {
    pub fn is_healthy(&self) -> bool {
        matches!(self, SourceHealth::Healthy)
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, SourceHealth::Unavailable { .. })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceHealth::Healthy => "healthy",
            SourceHealth::Degraded { .. } => "degraded",
            SourceHealth::Unavailable { .. } => "unavailable",
        }
    }
}

/// Size and position of the window after the latest pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct WindowSummary {
    pub len: usize,
    pub cursor: Option<Cursor>,
}

/// What one pass did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PassOutcome {
    pub delta: Delta,
    pub evicted: usize,
    /// False when the lightweight check found nothing new and the fetch was skipped.
    pub fetched: bool,
}

impl PassOutcome {
    /// Subscribers only need to hear about passes that changed the window.
    pub fn changed(&self) -> bool {
        !self.delta.is_empty() || self.evicted > 0
    }
}

pub struct Reconciler {
    source: Arc<dyn SignalSource>,
    window: WindowState,
    config: EngineConfig,
    metrics: Arc<Metrics>,
    last_marker: Option<SourceMarker>,
    consecutive_failures: u32,
    health: watch::Sender<SourceHealth>,
    summary: watch::Sender<WindowSummary>,
}

impl Reconciler {
    pub fn new(source: Arc<dyn SignalSource>, config: EngineConfig, metrics: Arc<Metrics>) -> Self {
        let (health, _) = watch::channel(SourceHealth::Healthy);
        let (summary, _) = watch::channel(WindowSummary::default());
        Self {
            source,
            window: WindowState::new(config.window),
            config,
            metrics,
            last_marker: None,
            consecutive_failures: 0,
            health,
            summary,
        }
    }

    pub fn subscribe_health(&self) -> watch::Receiver<SourceHealth> {
        self.health.subscribe()
    }

    pub fn subscribe_summary(&self) -> watch::Receiver<WindowSummary> {
        self.summary.subscribe()
    }

    pub fn health(&self) -> SourceHealth {
        *self.health.borrow()
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn window(&self) -> &WindowState {
        &self.window
    }

    pub fn snapshot(&self) -> WindowSnapshot {
        self.window.snapshot()
    }

    /// Runs one pass for a single request and returns what it admitted.
    pub async fn handle_refresh(&mut self, request: RefreshRequest) -> Result<Delta> {
        self.handle_refresh_at(request, Utc::now()).await
    }

    pub async fn handle_refresh_at(&mut self, request: RefreshRequest, now: DateTime<Utc>) -> Result<Delta> {
        self.reconcile_at(RefreshBatch::new(request), now)
            .await
            .map(|outcome| outcome.delta)
    }

    /// Runs one pass covering every request in the batch.
    pub async fn reconcile(&mut self, batch: RefreshBatch) -> Result<PassOutcome> {
        self.reconcile_at(batch, Utc::now()).await
    }

    pub async fn reconcile_at(&mut self, batch: RefreshBatch, now: DateTime<Utc>) -> Result<PassOutcome> {
        let started = Instant::now();
        let cutoff = self.window.cutoff(now);

        let marker = if batch.needs_full_fetch() {
            // Best effort: recorded so the next lightweight check has a baseline.
            self.fetch_marker(cutoff).await.ok()
        } else {
            let marker = match batch.marker() {
                Some(hint) => Ok(hint.clone()),
                None => self.fetch_marker(cutoff).await,
            };
            match marker {
                Ok(marker) if self.last_marker.as_ref() == Some(&marker) => {
                    let evicted = self.evict(cutoff);
                    debug!(batch = %batch.summary(), "Reconciler: marker unchanged, fetch skipped");
                    return Ok(PassOutcome {
                        delta: Delta::default(),
                        evicted,
                        fetched: false,
                    });
                }
                Ok(marker) => Some(marker),
                Err(e) => {
                    debug!(error = %e, "Reconciler: marker check failed, running full fetch");
                    None
                }
            }
        };

        let fetched = match self.fetch_with_retry(cutoff).await {
            Ok(signals) => signals,
            Err(e) => {
                self.record_failure(&e);
                return Err(e);
            }
        };
        self.record_success();
        self.last_marker = marker;

        let fetched_count = fetched.len();
        let delta = self.admit_all(fetched, cutoff);
        let evicted = self.evict(cutoff);

        self.metrics.reconcile_passes_total.inc();
        self.metrics
            .reconcile_duration_seconds
            .observe(started.elapsed().as_secs_f64());

        if !delta.is_empty() || evicted > 0 {
            info!(
                batch = %batch.summary(),
                fetched = fetched_count,
                admitted = delta.len(),
                evicted = evicted,
                window = self.window.len(),
                "Reconciler: pass admitted {} signal(s), evicted {}",
                delta.len(),
                evicted
            );
        } else {
            debug!(batch = %batch.summary(), fetched = fetched_count, "Reconciler: no changes");
        }

        Ok(PassOutcome {
            delta,
            evicted,
            fetched: true,
        })
    }

    /// Admits a fetched set in cursor order and returns the resulting delta.
    pub fn admit_all(&mut self, mut signals: Vec<Signal>, cutoff: DateTime<Utc>) -> Delta {
        signals.sort_by_key(Signal::cursor);
        let mut events = Vec::new();
        for signal in signals {
            let id = signal.id;
            let (admission, event) = self.window.admit(signal, cutoff);
            match admission {
                Admission::Stale => {
                    debug!(signal_id = id, "Reconciler: ignoring stale copy of admitted signal");
                }
                Admission::Inserted | Admission::Updated => {
                    self.metrics
                        .signals_admitted_total
                        .with_label_values(&[if admission == Admission::Updated { "update" } else { "insert" }])
                        .inc();
                }
                Admission::Unchanged | Admission::Expired => {}
            }
            events.extend(event);
        }
        events.sort_by_key(|e| e.cursor());
        self.publish_summary();
        Delta { events }
    }

    /// Drops signals that left the trailing window.
    pub fn evict(&mut self, cutoff: DateTime<Utc>) -> usize {
        let evicted = self.window.evict(cutoff);
        if evicted > 0 {
            self.metrics.signals_evicted_total.inc_by(evicted as u64);
            debug!(evicted = evicted, "Reconciler: evicted {} expired signal(s)", evicted);
        }
        self.publish_summary();
        evicted
    }

    async fn fetch_marker(&self, since: DateTime<Utc>) -> Result<SourceMarker> {
        let source = &self.source;
        (|| source.fetch_marker(since))
            .retry(self.backoff())
            .sleep(tokio::time::sleep)
            .when(EngineError::is_transient)
            .await
    }

    async fn fetch_with_retry(&self, since: DateTime<Utc>) -> Result<Vec<Signal>> {
        let source = &self.source;
        (|| source.fetch_qualifying(since))
            .retry(self.backoff())
            .sleep(tokio::time::sleep)
            .when(EngineError::is_transient)
            .notify(|e: &EngineError, delay| {
                warn!(error = %e, delay_ms = delay.as_millis() as u64, "Reconciler: fetch failed, retrying");
            })
            .await
    }

    fn backoff(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(self.config.fetch_retry_min_delay)
            .with_max_delay(self.config.fetch_retry_min_delay * 10)
            .with_max_times(self.config.fetch_retry_attempts)
    }

    fn record_failure(&mut self, e: &EngineError) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.metrics.reconcile_failures_total.inc();
        let failures = self.consecutive_failures;

        let health = if self.config.fatal_after_failures > 0 && failures >= self.config.fatal_after_failures {
            SourceHealth::Unavailable {
                consecutive_failures: failures,
            }
        } else if failures >= self.config.degraded_after_failures {
            SourceHealth::Degraded {
                consecutive_failures: failures,
            }
        } else {
            SourceHealth::Healthy
        };

        match health {
            SourceHealth::Unavailable { .. } => error!(
                error = %e,
                consecutive_failures = failures,
                "Reconciler: source unavailable after {} failed passes",
                failures
            ),
            _ => warn!(
                error = %e,
                consecutive_failures = failures,
                window = self.window.len(),
                "Reconciler: pass failed, keeping current window"
            ),
        }
        self.set_health(health);
    }

    fn record_success(&mut self) {
        if self.consecutive_failures > 0 {
            info!(
                previous_failures = self.consecutive_failures,
                "Reconciler: source recovered after {} failed passes",
                self.consecutive_failures
            );
        }
        self.consecutive_failures = 0;
        self.set_health(SourceHealth::Healthy);
    }

    fn set_health(&self, health: SourceHealth) {
        self.metrics
            .source_healthy
            .set(if health.is_healthy() { 1.0 } else { 0.0 });
        self.health.send_if_modified(|current| {
            if *current != health {
                *current = health;
                true
            } else {
                false
            }
        });
    }

    fn publish_summary(&self) {
        let summary = WindowSummary {
            len: self.window.len(),
            cursor: self.window.cursor(),
        };
        self.metrics.window_size.set(summary.len as i64);
        self.summary.send_if_modified(|current| {
            if *current != summary {
                *current = summary;
                true
            } else {
                false
            }
        });
    }
}
