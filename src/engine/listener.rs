//! Change listener: turns store notifications into refresh requests.
//!
//! The subscription is kept alive with exponential backoff. Every time it
//! comes back after a loss a RESYNC is requested, because notifications sent
//! while it was down are gone for good.

use crate::config::EngineConfig;
use crate::engine::refresh_queue::RefreshSender;
use crate::error::{EngineError, Result};
use crate::metrics::Metrics;
use crate::models::{ChangeHint, RefreshReason, RefreshRequest};
use crate::services::signal_source::SignalSource;
use backon::{BackoffBuilder, ExponentialBuilder};
use futures_util::StreamExt;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ListenerState {
    /// Not started yet.
    Idle,
    Active,
    /// Subscription lost; retrying with backoff while polling covers the gap.
    Degraded,
    /// Notifications switched off by configuration.
    Disabled,
    Stopped,
}

impl ListenerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ListenerState::Idle => "idle",
            ListenerState::Active => "active",
            ListenerState::Degraded => "degraded",
            ListenerState::Disabled => "disabled",
            ListenerState::Stopped => "stopped",
        }
    }
}

pub struct ChangeListener {
    source: Arc<dyn SignalSource>,
    channel: String,
    backoff_min: Duration,
    backoff_max: Duration,
    refresh: RefreshSender,
    metrics: Arc<Metrics>,
    state: Arc<watch::Sender<ListenerState>>,
    cancel: CancellationToken,
    handle: Arc<RwLock<Option<tokio::task::JoinHandle<()>>>>,
}

impl ChangeListener {
    pub fn new(
        source: Arc<dyn SignalSource>,
        config: &EngineConfig,
        refresh: RefreshSender,
        metrics: Arc<Metrics>,
    ) -> Self {
        let (state, _) = watch::channel(ListenerState::Idle);
        Self {
            source,
            channel: config.notify_channel.clone(),
            backoff_min: config.listener_backoff_min,
            backoff_max: config.listener_backoff_max,
            refresh,
            metrics,
            state: Arc::new(state),
            cancel: CancellationToken::new(),
            handle: Arc::new(RwLock::new(None)),
        }
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ListenerState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> ListenerState {
        *self.state.borrow()
    }

    /// Spawns the subscription loop.
    pub async fn start(&self) -> Result<()> {
        let mut handle = self.handle.write().await;
        if handle.is_some() {
            return Err(EngineError::Config("change listener already started".into()));
        }

        let task = ListenerTask {
            source: self.source.clone(),
            channel: self.channel.clone(),
            backoff: ExponentialBuilder::default()
                .with_min_delay(self.backoff_min)
                .with_max_delay(self.backoff_max)
                .with_factor(2.0)
                .with_max_times(usize::MAX),
            max_delay: self.backoff_max,
            refresh: self.refresh.clone(),
            metrics: self.metrics.clone(),
            state: self.state.clone(),
            cancel: self.cancel.clone(),
        };
        *handle = Some(tokio::spawn(task.run()));

        info!(channel = %self.channel, "ChangeListener: started on channel '{}'", self.channel);
        Ok(())
    }

    /// Cancels the subscription loop and waits for it to exit.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let handle = self.handle.write().await.take();
        if let Some(h) = handle {
            if let Err(e) = h.await {
                warn!(error = %e, "ChangeListener: task ended abnormally");
            }
            info!("ChangeListener: stopped");
        }
    }

    pub async fn is_running(&self) -> bool {
        let handle = self.handle.read().await;
        handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

struct ListenerTask {
    source: Arc<dyn SignalSource>,
    channel: String,
    backoff: ExponentialBuilder,
    max_delay: Duration,
    refresh: RefreshSender,
    metrics: Arc<Metrics>,
    state: Arc<watch::Sender<ListenerState>>,
    cancel: CancellationToken,
}

enum StreamEnd {
    Cancelled,
    Lost(String),
}

impl ListenerTask {
    async fn run(self) {
        let mut delays = self.backoff.clone().build();
        let mut recovering = false;

        loop {
            let subscribed = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                r = self.source.subscribe_changes(&self.channel) => r,
            };

            match subscribed {
                Ok(stream) => {
                    self.set_state(ListenerState::Active);
                    delays = self.backoff.clone().build();
                    if recovering {
                        info!(channel = %self.channel, "ChangeListener: subscription restored, requesting resync");
                        self.refresh.send(RefreshRequest::new(RefreshReason::Resync));
                    }
                    recovering = false;

                    match self.pump(stream).await {
                        StreamEnd::Cancelled => break,
                        StreamEnd::Lost(reason) => {
                            warn!(channel = %self.channel, reason = %reason, "ChangeListener: subscription lost");
                        }
                    }
                }
                Err(e) => {
                    warn!(channel = %self.channel, error = %e, "ChangeListener: subscribe failed");
                }
            }

            recovering = true;
            self.set_state(ListenerState::Degraded);

            let delay = delays.next().unwrap_or(self.max_delay);
            info!(
                delay_ms = delay.as_millis() as u64,
                "ChangeListener: retrying subscription in {:?}",
                delay
            );
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.set_state(ListenerState::Stopped);
    }

    /// Forwards events until the stream fails, ends or the listener is cancelled.
    async fn pump(&self, mut stream: crate::services::ChangeStream) -> StreamEnd {
        loop {
            let item = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return StreamEnd::Cancelled,
                item = stream.next() => item,
            };

            match item {
                Some(Ok(event)) => match ChangeHint::parse(&event.payload) {
                    Ok(hint) => {
                        debug!(
                            channel = %event.channel,
                            signal_id = ?hint.as_ref().and_then(|h| h.id),
                            operation = ?hint.as_ref().and_then(|h| h.operation.clone()),
                            "ChangeListener: notification received"
                        );
                        self.refresh.send(RefreshRequest::notify(hint));
                    }
                    Err(e) => return StreamEnd::Lost(e.to_string()),
                },
                Some(Err(e)) => return StreamEnd::Lost(e.to_string()),
                None => return StreamEnd::Lost("change stream ended".to_string()),
            }
        }
    }

    fn set_state(&self, state: ListenerState) {
        self.metrics
            .listener_connected
            .set(if state == ListenerState::Active { 1.0 } else { 0.0 });
        self.state.send_replace(state);
    }
}
