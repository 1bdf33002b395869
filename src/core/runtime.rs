//! Relay runtime: wires the signal engine, the WebSocket server and the HTTP
//! surface together and owns the shutdown sequence.

use crate::config::Config;
use crate::core::http::{self, AppState};
use crate::engine::{EngineStatus, SignalEngine, SourceHealth};
use crate::error::Result;
use crate::metrics::Metrics;
use crate::services::signal_source::SignalSource;
use crate::services::websocket::{SessionContext, WebSocketService};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::info;

const SESSION_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

pub struct RelayRuntime {
    engine: SignalEngine,
    websocket: WebSocketService,
    ws_addr: SocketAddr,
    http_addr: Option<SocketAddr>,
    http_shutdown: CancellationToken,
    metrics: Arc<Metrics>,
}

impl RelayRuntime {
    /// Loads the initial window, then starts serving clients.
    pub async fn start(config: Config, source: Arc<dyn SignalSource>, metrics: Arc<Metrics>) -> Result<Self> {
        let started_at = Instant::now();
        let engine = SignalEngine::start(config.engine.clone(), source, metrics.clone()).await?;

        let ctx = SessionContext {
            config: config.session.clone(),
            credential: config.credential.clone(),
            fanout: engine.fanout(),
            status: engine.status(),
            metrics: metrics.clone(),
            window_minutes: config.engine.window.as_secs() / 60,
            started_at: tokio::time::Instant::now(),
            shutdown: CancellationToken::new(),
        };
        let websocket = WebSocketService::new(config.bind_addr, ctx);
        let ws_addr = websocket.start().await?;

        let http_shutdown = CancellationToken::new();
        let http_addr = if config.http_port > 0 {
            let addr = SocketAddr::new(config.bind_addr.ip(), config.http_port);
            let state = AppState {
                metrics: metrics.clone(),
                start_time: Arc::new(started_at),
                status: engine.status(),
            };
            Some(http::start_server(addr, state, http_shutdown.clone()).await?)
        } else {
            None
        };

        info!(
            environment = %config.environment,
            websocket = %ws_addr,
            http = ?http_addr,
            "Signal relay started"
        );

        Ok(Self {
            engine,
            websocket,
            ws_addr,
            http_addr,
            http_shutdown,
            metrics,
        })
    }

    pub fn ws_addr(&self) -> SocketAddr {
        self.ws_addr
    }

    pub fn http_addr(&self) -> Option<SocketAddr> {
        self.http_addr
    }

    pub fn status(&self) -> EngineStatus {
        self.engine.status()
    }

    pub fn engine(&self) -> &SignalEngine {
        &self.engine
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        self.metrics.clone()
    }

    /// Resolves once the source is declared unavailable.
    pub async fn wait_for_fatal(&self) -> SourceHealth {
        self.engine.status().wait_for_fatal().await
    }

    /// Stops accepting, drains the engine, closes sessions, then stops HTTP.
    pub async fn shutdown(mut self) {
        info!("Shutting down signal relay...");
        self.websocket.stop_accepting();
        self.engine.stop().await;
        self.websocket.stop(SESSION_DRAIN_TIMEOUT).await;
        self.http_shutdown.cancel();
        info!("Signal relay stopped");
    }
}
