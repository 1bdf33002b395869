//! Interval scheduler feeding the reconciler with poll requests

use crate::engine::refresh_queue::RefreshSender;
use crate::error::{EngineError, Result};
use crate::models::{RefreshReason, RefreshRequest};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Emits `POLL_LIGHT` on the lightweight cadence and `POLL_FULL` on the
/// safety-net cadence, independent of listener health.
pub struct PollScheduler {
    refresh: RefreshSender,
    cancel: CancellationToken,
    handle: Arc<RwLock<Option<tokio::task::JoinHandle<()>>>>,
}

impl PollScheduler {
    pub fn new(refresh: RefreshSender) -> Self {
        Self {
            refresh,
            cancel: CancellationToken::new(),
            handle: Arc::new(RwLock::new(None)),
        }
    }

    /// Start the scheduler
    ///
    /// # Arguments
    /// * `lightweight` - Period of the cheap existence check
    /// * `safety_net` - Period of the unconditional full fetch
    ///
    /// The first tick of each timer fires one full period after start; the
    /// engine runs its own initial resync.
    pub async fn start(&self, lightweight: Duration, safety_net: Duration) -> Result<()> {
        if lightweight.is_zero() || safety_net.is_zero() {
            return Err(EngineError::Config("poll intervals must be > 0".into()));
        }

        let mut handle = self.handle.write().await;
        if handle.is_some() {
            return Err(EngineError::Config("poll scheduler already started".into()));
        }

        let refresh = self.refresh.clone();
        let cancel = self.cancel.clone();

        *handle = Some(tokio::spawn(async move {
            let now = Instant::now();
            let mut light = interval_at(now + lightweight, lightweight);
            let mut full = interval_at(now + safety_net, safety_net);
            light.set_missed_tick_behavior(MissedTickBehavior::Delay);
            full.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                // Full before light when both are due: the pair coalesces into one full pass.
                let reason = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = full.tick() => RefreshReason::PollFull,
                    _ = light.tick() => RefreshReason::PollLight,
                };
                debug!(reason = %reason, "PollScheduler: tick");
                if !refresh.send(RefreshRequest::new(reason)) {
                    debug!("PollScheduler: refresh channel closed");
                    break;
                }
            }
        }));

        info!(
            lightweight_ms = lightweight.as_millis() as u64,
            safety_net_ms = safety_net.as_millis() as u64,
            "PollScheduler: started with light check every {:?}, full fetch every {:?}",
            lightweight,
            safety_net
        );
        Ok(())
    }

    /// Stop the scheduler
    pub async fn stop(&self) {
        self.cancel.cancel();
        let handle = self.handle.write().await.take();
        if let Some(h) = handle {
            let _ = h.await;
            info!("PollScheduler: stopped");
        }
    }

    /// Check if the scheduler is running
    pub async fn is_running(&self) -> bool {
        let handle = self.handle.read().await;
        handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}
