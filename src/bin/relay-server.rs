//! Signal Relay Server
//!
//! Keeps a trailing window of qualifying signals in sync with PostgreSQL via
//! LISTEN/NOTIFY plus polling, and streams it to authenticated WebSocket
//! clients. Run as a single instance per database.

use dotenvy::dotenv;
use signal_relay::config::Config;
use signal_relay::core::RelayRuntime;
use signal_relay::db::PostgresSignalSource;
use signal_relay::logging;
use signal_relay::metrics::Metrics;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load environment variables from .env if present
    dotenv().ok();

    // Initialize logging based on environment
    logging::init_logging();

    let config = Config::from_env()?;
    info!("Starting Signal Relay Server");
    info!(environment = %config.environment, "Environment");
    info!(
        database = %config.database.redacted(),
        window_minutes = config.engine.window.as_secs() / 60,
        use_notify = config.engine.use_notify,
        channel = %config.engine.notify_channel,
        exchanges = ?config.exchanges.exchange_ids(),
        "Configuration loaded"
    );

    let metrics = Arc::new(Metrics::new()?);

    info!("Connecting to PostgreSQL...");
    let source = PostgresSignalSource::new(config.database.clone(), config.exchanges).await?;

    let runtime = RelayRuntime::start(config, Arc::new(source), metrics).await?;
    info!(address = %runtime.ws_addr(), "Signal relay running. Waiting for shutdown signal...");

    let fatal = tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Received Ctrl+C");
            None
        }
        _ = terminate() => {
            info!("Received SIGTERM");
            None
        }
        health = runtime.wait_for_fatal() => Some(health),
    };

    runtime.shutdown().await;

    if let Some(health) = fatal {
        error!(source = ?health, "Signal source unavailable, exiting");
        return Err(format!("signal source unavailable: {:?}", health).into());
    }
    Ok(())
}

#[cfg(unix)]
async fn terminate() {
    match signal::unix::signal(signal::unix::SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            error!(error = %e, "Failed to install SIGTERM handler");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate() {
    std::future::pending::<()>().await;
}
