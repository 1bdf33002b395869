//! WebSocket server distributing the signal window to authenticated clients

pub mod auth;
pub mod connection;
pub mod protocol;
pub mod session;

pub use auth::Credential;
pub use connection::{serve_connection, SessionContext};
pub use protocol::{ClientMessage, ServerMessage, SessionStats};
pub use session::{AuthState, ClientSession, CloseReason, SessionState};

use crate::error::{EngineError, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Accepts client connections and runs one session task per connection.
///
/// Shutdown happens in two steps so the engine can drain in between:
/// `stop_accepting` closes the listener, `stop` cancels whatever sessions are
/// still open and waits for their tasks.
pub struct WebSocketService {
    ctx: Arc<SessionContext>,
    bind_addr: SocketAddr,
    accept_cancel: CancellationToken,
    local_addr: Arc<RwLock<Option<SocketAddr>>>,
    handle: Arc<RwLock<Option<tokio::task::JoinHandle<()>>>>,
}

impl WebSocketService {
    pub fn new(bind_addr: SocketAddr, ctx: SessionContext) -> Self {
        Self {
            ctx: Arc::new(ctx),
            bind_addr,
            accept_cancel: CancellationToken::new(),
            local_addr: Arc::new(RwLock::new(None)),
            handle: Arc::new(RwLock::new(None)),
        }
    }

    /// Binds the listener and starts accepting. Returns the bound address.
    pub async fn start(&self) -> Result<SocketAddr> {
        let mut handle = self.handle.write().await;
        if handle.is_some() {
            return Err(EngineError::Config("WebSocket service already started".into()));
        }

        let listener = TcpListener::bind(self.bind_addr).await?;
        let local_addr = listener.local_addr()?;
        *self.local_addr.write().await = Some(local_addr);

        let ctx = self.ctx.clone();
        let accept_cancel = self.accept_cancel.clone();
        *handle = Some(tokio::spawn(accept_loop(listener, ctx, accept_cancel)));

        info!(address = %local_addr, "WebSocket server listening on ws://{}", local_addr);
        Ok(local_addr)
    }

    pub async fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.read().await
    }

    /// Stops accepting new connections. Open sessions keep running.
    pub fn stop_accepting(&self) {
        self.accept_cancel.cancel();
    }

    /// Cancels every remaining session and waits up to `drain` for their tasks.
    pub async fn stop(&self, drain: Duration) {
        self.accept_cancel.cancel();
        self.ctx.shutdown.cancel();

        let handle = self.handle.write().await.take();
        if let Some(mut h) = handle {
            match tokio::time::timeout(drain, &mut h).await {
                Ok(_) => info!("WebSocket service stopped"),
                Err(_) => {
                    warn!(drain_ms = drain.as_millis() as u64, "WebSocket sessions did not finish in time, aborting");
                    h.abort();
                }
            }
        }
    }

    /// Check if the service is running
    pub async fn is_running(&self) -> bool {
        let handle = self.handle.read().await;
        handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

async fn accept_loop(listener: TcpListener, ctx: Arc<SessionContext>, accept_cancel: CancellationToken) {
    let mut next_id: u64 = 0;
    let mut sessions = JoinSet::new();

    loop {
        tokio::select! {
            biased;
            _ = accept_cancel.cancelled() => break,
            Some(joined) = sessions.join_next(), if !sessions.is_empty() => {
                if let Err(e) = joined {
                    error!(error = %e, "Session task failed");
                }
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    next_id += 1;
                    let connection_id = next_id;
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!(error = %e, "Failed to set TCP_NODELAY");
                    }
                    sessions.spawn(serve_connection(stream, connection_id, Some(peer), ctx.clone()));
                }
                Err(e) => {
                    warn!(error = %e, "Failed to accept connection");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            },
        }
    }

    drop(listener);
    info!(open_sessions = sessions.len(), "WebSocket server stopped accepting connections");

    while let Some(joined) = sessions.join_next().await {
        if let Err(e) = joined {
            error!(error = %e, "Session task failed");
        }
    }
}
