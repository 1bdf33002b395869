//! HTTP health and metrics endpoints using Axum

use axum::{extract::State, http::StatusCode, response::Json, routing::get, Router};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tower::ServiceBuilder;
use tower_http::trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tokio_util::sync::CancellationToken;
use tracing::{info, Level};

use crate::engine::{EngineStatus, ListenerState, SourceHealth};
use crate::metrics::Metrics;

#[derive(Clone)]
pub struct AppState {
    pub metrics: Arc<Metrics>,
    pub start_time: Arc<Instant>,
    pub status: EngineStatus,
}

/// `healthy` when the source answers and notifications flow, `degraded` when
/// the relay runs on polling or a stale window, `unavailable` once the source
/// crossed the fatal threshold.
pub fn overall_status(listener: ListenerState, source: SourceHealth) -> &'static str {
    match (source, listener) {
        (SourceHealth::Unavailable { .. }, _) => "unavailable",
        (SourceHealth::Degraded { .. }, _) => "degraded",
        (_, ListenerState::Degraded) => "degraded",
        _ => "healthy",
    }
}

pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    let report = state.status.report();
    let status = overall_status(report.listener, report.source);
    let code = if report.source.is_fatal() {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (
        code,
        Json(json!({
            "status": status,
            "uptime_seconds": state.start_time.elapsed().as_secs(),
            "service": "signal-relay",
            "listener": report.listener,
            "source": report.source,
            "sessions": report.sessions,
            "window_size": report.window.len,
            "cursor": report.window.cursor,
        })),
    )
}

pub async fn metrics_handler(State(state): State<AppState>) -> Result<String, StatusCode> {
    state
        .metrics
        .export()
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics_handler))
        .layer(
            ServiceBuilder::new().layer(
                TraceLayer::new_for_http()
                    .make_span_with(DefaultMakeSpan::new().level(Level::DEBUG))
                    .on_request(DefaultOnRequest::new().level(Level::DEBUG))
                    .on_response(DefaultOnResponse::new().level(Level::DEBUG)),
            ),
        )
        .with_state(state)
}

/// Serves the router on `addr` until `shutdown` is cancelled.
pub async fn start_server(
    addr: SocketAddr,
    state: AppState,
    shutdown: CancellationToken,
) -> Result<SocketAddr, std::io::Error> {
    let app = create_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let local_addr = listener.local_addr()?;

    info!(address = %local_addr, "HTTP server listening on {}", local_addr);
    info!("Metrics endpoint available at http://{}/metrics", local_addr);

    tokio::spawn(async move {
        let serve = axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await });
        if let Err(e) = serve.await {
            tracing::error!(error = %e, "HTTP server error");
        }
    });
    Ok(local_addr)
}
