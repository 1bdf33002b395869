//! Signal Relay Client
//!
//! Connects to a relay server, authenticates, prints every snapshot and delta
//! and reconnects with backoff, resuming from the last cursor it saw.
//!
//! Usage: relay-client [--url ws://host:8765] [--token SECRET]

use backon::{BackoffBuilder, ExponentialBackoff, ExponentialBuilder};
use clap::Parser;
use dotenvy::dotenv;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use signal_relay::logging;
use signal_relay::models::Cursor;
use signal_relay::services::websocket::ClientMessage;
use std::time::Duration;
use tokio::signal;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "relay-client", about = "Subscribe to a signal relay and print what it sends", version)]
struct ClientArgs {
    /// Relay WebSocket URL
    #[arg(long, env = "RELAY_URL", default_value = "ws://localhost:8765")]
    url: String,

    /// Shared credential sent in the auth message
    #[arg(long, env = "WS_AUTH_PASSWORD", hide_env_values = true)]
    token: Option<String>,
}

fn reconnect_backoff() -> ExponentialBackoff {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_secs(1))
        .with_max_delay(Duration::from_secs(30))
        .with_max_times(usize::MAX)
        .build()
}

enum SessionEnd {
    Interrupted,
    Disconnected(String),
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    logging::init_logging();

    let args = ClientArgs::parse();
    let mut cursor: Option<Cursor> = None;
    let mut delays = reconnect_backoff();

    loop {
        match run_session(&args, &mut cursor).await {
            Ok(SessionEnd::Interrupted) => break,
            Ok(SessionEnd::Disconnected(reason)) => {
                warn!(reason = %reason, "Disconnected from relay");
                delays = reconnect_backoff();
            }
            Err(e) => warn!(error = %e, "Connection to relay failed"),
        }

        let delay = delays.next().unwrap_or(Duration::from_secs(30));
        info!(delay_ms = delay.as_millis() as u64, resume_from = ?cursor, "Reconnecting in {:?}", delay);
        tokio::select! {
            _ = signal::ctrl_c() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    info!("Client stopped");
    Ok(())
}

async fn run_session(
    args: &ClientArgs,
    cursor: &mut Option<Cursor>,
) -> Result<SessionEnd, Box<dyn std::error::Error>> {
    let (ws, _) = connect_async(args.url.as_str()).await?;
    info!(url = %args.url, "Connected to relay");
    let (mut sink, mut stream) = ws.split();

    loop {
        let frame = tokio::select! {
            _ = signal::ctrl_c() => {
                let _ = sink.close().await;
                return Ok(SessionEnd::Interrupted);
            }
            frame = stream.next() => frame,
        };

        let text = match frame {
            None => return Ok(SessionEnd::Disconnected("stream ended".to_string())),
            Some(Err(e)) => return Ok(SessionEnd::Disconnected(e.to_string())),
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Close(frame))) => {
                return Ok(SessionEnd::Disconnected(format!("closed by server: {:?}", frame)))
            }
            Some(Ok(_)) => continue,
        };

        let message: Value = match serde_json::from_str(&text) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "Unparsable message from relay");
                continue;
            }
        };

        match message["type"].as_str().unwrap_or_default() {
            "auth_required" => {
                let auth = ClientMessage::Auth {
                    token: args.token.clone(),
                    cursor: *cursor,
                };
                sink.send(Message::Text(serde_json::to_string(&auth)?)).await?;
            }
            "auth_success" => {
                info!(
                    connection_id = %message["connection_id"],
                    window_minutes = %message["window_minutes"],
                    "Authenticated"
                );
            }
            kind @ ("snapshot" | "delta") => {
                let data = message["data"].as_array().cloned().unwrap_or_default();
                for signal in &data {
                    println!("{}", signal);
                }
                if let Some(c) = message
                    .get("cursor")
                    .and_then(|c| serde_json::from_value::<Option<Cursor>>(c.clone()).ok())
                    .flatten()
                {
                    *cursor = Some(c);
                }
                info!(kind = kind, count = data.len(), cursor = ?cursor, "Received {} with {} signal(s)", kind, data.len());
            }
            "ping" => {
                sink.send(Message::Text(serde_json::to_string(&ClientMessage::Pong)?))
                    .await?;
            }
            "error" => {
                warn!(code = %message["code"], detail = %message["message"], "Relay reported an error");
            }
            _ => info!(payload = %message, "Relay message"),
        }
    }
}
