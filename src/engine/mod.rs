//! Signal engine: change listener, poll scheduler, reconciler and fan-out.

pub mod listener;
pub mod reconciler;
pub mod refresh_queue;
pub mod window;

pub use listener::{ChangeListener, ListenerState};
pub use reconciler::{PassOutcome, Reconciler, SourceHealth, WindowSummary};
pub use refresh_queue::{refresh_channel, RefreshBatch, RefreshReceiver, RefreshSender};
pub use window::{Admission, Delta, WindowSnapshot, WindowState};

use crate::broadcast::{BroadcastHub, FanoutHandle};
use crate::config::EngineConfig;
use crate::core::scheduler::PollScheduler;
use crate::error::Result;
use crate::metrics::Metrics;
use crate::models::{RefreshReason, RefreshRequest};
use crate::services::signal_source::SignalSource;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Read-only view of the engine for health reporting and session stats.
#[derive(Clone)]
pub struct EngineStatus {
    listener: watch::Receiver<ListenerState>,
    source: watch::Receiver<SourceHealth>,
    window: watch::Receiver<WindowSummary>,
    sessions: watch::Receiver<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub listener: ListenerState,
    pub source: SourceHealth,
    pub window: WindowSummary,
    pub sessions: usize,
}

impl EngineStatus {
    pub fn listener_state(&self) -> ListenerState {
        *self.listener.borrow()
    }

    pub fn source_health(&self) -> SourceHealth {
        *self.source.borrow()
    }

    pub fn window(&self) -> WindowSummary {
        *self.window.borrow()
    }

    pub fn sessions(&self) -> usize {
        *self.sessions.borrow()
    }

    pub fn report(&self) -> StatusReport {
        StatusReport {
            listener: self.listener_state(),
            source: self.source_health(),
            window: self.window(),
            sessions: self.sessions(),
        }
    }

    /// Resolves once the source is declared unavailable, or the engine is gone.
    pub async fn wait_for_fatal(&self) -> SourceHealth {
        let mut source = self.source.clone();
        let fatal = source.wait_for(SourceHealth::is_fatal).await.map(|health| *health);
        fatal.unwrap_or_else(|_| *source.borrow())
    }

    /// Resolves once the listener reaches `state`.
    pub async fn wait_for_listener(&self, state: ListenerState) {
        let mut listener = self.listener.clone();
        let _ = listener.wait_for(|s| *s == state).await;
    }
}

/// Owns the background tasks that keep the window current and fan it out.
pub struct SignalEngine {
    refresh: RefreshSender,
    listener: Option<ChangeListener>,
    scheduler: PollScheduler,
    fanout: FanoutHandle,
    status: EngineStatus,
    reconciler_task: Option<JoinHandle<()>>,
    hub_task: Option<JoinHandle<()>>,
}

impl SignalEngine {
    /// Builds the window with one RESYNC pass, then starts notifications and polling.
    ///
    /// A failed initial pass is not fatal: sessions start from an empty window
    /// and the poll cadence keeps retrying.
    pub async fn start(
        config: EngineConfig,
        source: Arc<dyn SignalSource>,
        metrics: Arc<Metrics>,
    ) -> Result<Self> {
        let (refresh, mut receiver) = refresh_channel(metrics.clone());
        let mut reconciler = Reconciler::new(source.clone(), config.clone(), metrics.clone());

        let hub = BroadcastHub::new(metrics.clone());
        let (fanout, hub_task) = FanoutHandle::spawn(hub);

        match reconciler.handle_refresh(RefreshRequest::new(RefreshReason::Resync)).await {
            Ok(delta) => info!(signals = delta.len(), "SignalEngine: initial window loaded"),
            Err(e) => warn!(error = %e, "SignalEngine: initial load failed, starting with an empty window"),
        }
        fanout
            .publish(Arc::new(Delta::default()), Arc::new(reconciler.snapshot()))
            .await?;

        let listener = if config.use_notify {
            Some(ChangeListener::new(source.clone(), &config, refresh.clone(), metrics.clone()))
        } else {
            info!("SignalEngine: notifications disabled, relying on polling only");
            None
        };
        let listener_state = match &listener {
            Some(l) => l.subscribe_state(),
            None => watch::channel(ListenerState::Disabled).1,
        };

        let status = EngineStatus {
            listener: listener_state,
            source: reconciler.subscribe_health(),
            window: reconciler.subscribe_summary(),
            sessions: fanout.subscribe_sessions(),
        };

        let reconciler_fanout = fanout.clone();
        let reconciler_task = tokio::spawn(async move {
            while let Some(batch) = receiver.recv().await {
                match reconciler.reconcile(batch).await {
                    Ok(outcome) if outcome.changed() => {
                        let snapshot = Arc::new(reconciler.snapshot());
                        if reconciler_fanout
                            .publish(Arc::new(outcome.delta), snapshot)
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    Ok(_) => {}
                    // Already logged and reflected in source health.
                    Err(_) => {}
                }
            }
            info!("SignalEngine: reconciler drained");
        });

        if let Some(listener) = &listener {
            listener.start().await?;
        }
        let scheduler = PollScheduler::new(refresh.clone());
        scheduler
            .start(config.lightweight_interval, config.safety_net_interval)
            .await?;

        info!(
            window_minutes = config.window.as_secs() / 60,
            use_notify = config.use_notify,
            "SignalEngine: started"
        );

        Ok(Self {
            refresh,
            listener,
            scheduler,
            fanout,
            status,
            reconciler_task: Some(reconciler_task),
            hub_task: Some(hub_task),
        })
    }

    pub fn fanout(&self) -> FanoutHandle {
        self.fanout.clone()
    }

    pub fn status(&self) -> EngineStatus {
        self.status.clone()
    }

    /// Submits a refresh request as if it came from the listener or scheduler.
    pub fn request_refresh(&self, request: RefreshRequest) -> bool {
        self.refresh.send(request)
    }

    /// Stops the inputs, lets the reconciler finish pending work, then closes
    /// every session queue.
    pub async fn stop(&mut self) {
        if let Some(listener) = &self.listener {
            listener.stop().await;
        }
        self.scheduler.stop().await;

        self.refresh.close();
        if let Some(task) = self.reconciler_task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "SignalEngine: reconciler task ended abnormally");
            }
        }

        self.fanout.shutdown().await;
        if let Some(task) = self.hub_task.take() {
            let _ = task.await;
        }
        info!("SignalEngine: stopped");
    }
}
