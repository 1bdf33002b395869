//! One task per client connection: handshake, authentication, catch-up and
//! the delivery loop.

use crate::broadcast::{FanoutHandle, OutboundQueue};
use crate::config::SessionConfig;
use crate::engine::EngineStatus;
use crate::error::Result;
use crate::metrics::Metrics;
use crate::models::{Cursor, SignalEvent};
use crate::services::websocket::auth::Credential;
use crate::services::websocket::protocol::{ClientMessage, ServerMessage, SessionStats};
use crate::services::websocket::session::{ClientSession, CloseReason};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::{interval_at, sleep_until, timeout, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Everything a connection task needs from the server.
pub struct SessionContext {
    pub config: SessionConfig,
    pub credential: Credential,
    pub fanout: FanoutHandle,
    pub status: EngineStatus,
    pub metrics: Arc<Metrics>,
    pub window_minutes: u64,
    pub started_at: Instant,
    /// Cancelled at the end of shutdown to close sessions the hub does not know about.
    pub shutdown: CancellationToken,
}

/// Serves one accepted transport until the session closes.
pub async fn serve_connection<S>(stream: S, connection_id: u64, peer: Option<SocketAddr>, ctx: Arc<SessionContext>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut session = ClientSession::new(connection_id, Instant::now());

    let websocket = match timeout(ctx.config.auth_timeout, accept_async(stream)).await {
        Ok(Ok(ws)) => ws,
        Ok(Err(e)) => {
            debug!(connection_id = connection_id, peer = ?peer, error = %e, "WebSocket handshake failed");
            return;
        }
        Err(_) => {
            debug!(connection_id = connection_id, peer = ?peer, "WebSocket handshake timed out");
            return;
        }
    };
    session.handshake_complete(Instant::now(), ctx.config.auth_timeout);
    debug!(connection_id = connection_id, peer = ?peer, "Client connected, awaiting authentication");

    let (sink, stream) = websocket.split();
    let queue = Arc::new(OutboundQueue::new(
        ctx.config.queue_capacity,
        ctx.config.backpressure_grace,
    ));
    let mut connection = Connection {
        session,
        sink,
        stream,
        queue,
        ctx,
        peer,
        attached: false,
    };
    let reason = connection.run().await;
    connection.finish(reason).await;
}

struct Connection<S> {
    session: ClientSession,
    sink: SplitSink<WebSocketStream<S>, Message>,
    stream: SplitStream<WebSocketStream<S>>,
    queue: Arc<OutboundQueue>,
    ctx: Arc<SessionContext>,
    peer: Option<SocketAddr>,
    attached: bool,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn run(&mut self) -> CloseReason {
        if self.send(&ServerMessage::auth_required()).await.is_err() {
            return CloseReason::TransportError;
        }

        let resume_from = match self.authenticate().await {
            Ok(cursor) => cursor,
            Err(reason) => return reason,
        };

        let connection_id = self.session.connection_id();
        let catch_up = match self
            .ctx
            .fanout
            .attach(connection_id, resume_from, self.queue.clone())
            .await
        {
            Ok(catch_up) => catch_up,
            Err(_) => return CloseReason::ShuttingDown,
        };
        self.attached = true;

        info!(
            connection_id = connection_id,
            peer = ?self.peer,
            resume_from = ?resume_from,
            catch_up = catch_up.signals.len(),
            "Client {} authenticated",
            connection_id
        );

        let welcome = ServerMessage::AuthSuccess {
            connection_id,
            window_minutes: self.ctx.window_minutes,
            cursor: catch_up.cursor,
        };
        if self.send(&welcome).await.is_err() {
            return CloseReason::TransportError;
        }
        if self
            .send(&ServerMessage::snapshot(&catch_up.signals, catch_up.cursor))
            .await
            .is_err()
        {
            return CloseReason::TransportError;
        }
        self.session.on_delivered(catch_up.cursor);

        self.deliver().await
    }

    /// Waits for a valid `auth` message. Only `auth` and `ping` are accepted
    /// before authentication.
    async fn authenticate(&mut self) -> std::result::Result<Option<Cursor>, CloseReason> {
        let deadline = self
            .session
            .auth_deadline()
            .unwrap_or_else(|| Instant::now() + self.ctx.config.auth_timeout);

        loop {
            let frame = tokio::select! {
                biased;
                _ = self.ctx.shutdown.cancelled() => return Err(CloseReason::ShuttingDown),
                _ = sleep_until(deadline) => {
                    self.session.auth_expired(Instant::now().max(deadline));
                    return Err(CloseReason::AuthTimeout);
                }
                frame = self.stream.next() => frame,
            };

            let message = match frame {
                None => return Err(CloseReason::ClientClosed),
                Some(Err(e)) => {
                    debug!(error = %e, "Transport error before authentication");
                    return Err(CloseReason::TransportError);
                }
                Some(Ok(Message::Close(_))) => return Err(CloseReason::ClientClosed),
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
                Some(Ok(Message::Text(text))) => ClientMessage::parse(&text).ok(),
                Some(Ok(_)) => None,
            };

            match message {
                Some(ClientMessage::Auth { token, cursor }) => {
                    self.session
                        .authenticate(token.as_deref(), &self.ctx.credential, Instant::now())?;
                    return Ok(cursor);
                }
                Some(ClientMessage::Ping) => {
                    self.session.on_inbound(Instant::now());
                    if self.send(&ServerMessage::pong()).await.is_err() {
                        return Err(CloseReason::TransportError);
                    }
                }
                _ => {
                    self.session.close(CloseReason::AuthFailed);
                    return Err(CloseReason::AuthFailed);
                }
            }
        }
    }

    /// ACTIVE state: forwards queued deltas, answers requests, keeps the link alive.
    async fn deliver(&mut self) -> CloseReason {
        let queue = self.queue.clone();
        let keepalive_period = self.ctx.config.keepalive_interval;
        let mut keepalive = interval_at(Instant::now() + keepalive_period, keepalive_period);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = self.ctx.shutdown.cancelled() => {
                    // Whatever the hub queued before shutdown still goes out.
                    return self.flush().await.unwrap_or(CloseReason::ShuttingDown);
                }
                _ = queue.notified() => {
                    if let Some(reason) = self.flush().await {
                        return reason;
                    }
                }
                frame = self.stream.next() => {
                    if let Some(reason) = self.on_frame(frame).await {
                        return reason;
                    }
                }
                _ = keepalive.tick() => {
                    if self.session.is_idle(Instant::now(), self.ctx.config.idle_timeout) {
                        return CloseReason::IdleTimeout;
                    }
                    if self.send(&ServerMessage::ping()).await.is_err() {
                        return CloseReason::TransportError;
                    }
                }
            }
        }
    }

    /// Sends everything queued as one delta. Returns a reason when the session must close.
    async fn flush(&mut self) -> Option<CloseReason> {
        let drained = self.queue.drain();
        if drained.disconnect {
            return Some(CloseReason::Backpressure);
        }

        if !drained.events.is_empty() {
            let cursor = drained.events.last().map(SignalEvent::cursor);
            let message = ServerMessage::delta(drained.events);
            match timeout(self.ctx.config.backpressure_grace, self.send(&message)).await {
                Ok(Ok(())) => self.session.on_delivered(cursor),
                Ok(Err(_)) => return Some(CloseReason::TransportError),
                Err(_) => return Some(CloseReason::Backpressure),
            }
        }

        drained.closed.then_some(CloseReason::ShuttingDown)
    }

    async fn on_frame(
        &mut self,
        frame: Option<std::result::Result<Message, tokio_tungstenite::tungstenite::Error>>,
    ) -> Option<CloseReason> {
        let message = match frame {
            None => return Some(CloseReason::ClientClosed),
            Some(Err(e)) => {
                debug!(connection_id = self.session.connection_id(), error = %e, "Transport error");
                return Some(CloseReason::TransportError);
            }
            Some(Ok(message)) => message,
        };
        self.session.on_inbound(Instant::now());

        let text = match message {
            Message::Text(text) => text,
            Message::Close(_) => return Some(CloseReason::ClientClosed),
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => return None,
            Message::Binary(_) => return Some(CloseReason::ProtocolViolation),
        };

        let reply = match ClientMessage::parse(&text) {
            Ok(ClientMessage::Ping) => ServerMessage::pong(),
            Ok(ClientMessage::Pong) => return None,
            Ok(ClientMessage::GetStats) => ServerMessage::Stats(self.stats()),
            Ok(ClientMessage::Auth { .. }) => {
                debug!(connection_id = self.session.connection_id(), "Repeated auth on active session");
                return Some(CloseReason::ProtocolViolation);
            }
            Err(e) => {
                debug!(connection_id = self.session.connection_id(), error = %e, "Invalid client message");
                return Some(CloseReason::ProtocolViolation);
            }
        };

        if self.send(&reply).await.is_err() {
            return Some(CloseReason::TransportError);
        }
        None
    }

    fn stats(&self) -> SessionStats {
        let report = self.ctx.status.report();
        SessionStats {
            connection_id: self.session.connection_id(),
            uptime_seconds: self.ctx.started_at.elapsed().as_secs(),
            active_sessions: report.sessions,
            window_size: report.window.len,
            cursor: self.session.delivery_cursor(),
            listener: report.listener,
            source: report.source,
            dropped: self.queue.dropped(),
        }
    }

    async fn send(&mut self, message: &ServerMessage) -> Result<()> {
        let text = message.to_json()?;
        self.sink.send(Message::Text(text)).await?;
        self.ctx.metrics.messages_sent_total.inc();
        Ok(())
    }

    async fn finish(mut self, reason: CloseReason) {
        self.session.close(reason);
        let connection_id = self.session.connection_id();
        if self.attached {
            self.ctx.fanout.detach(connection_id).await;
        }

        let grace = self.ctx.config.backpressure_grace;
        if reason.notifies_client() {
            let notice = ServerMessage::error(reason.code(), close_message(reason));
            let _ = timeout(grace, self.send(&notice)).await;
        }
        if reason != CloseReason::TransportError {
            let _ = timeout(grace, self.sink.close()).await;
        }

        self.ctx
            .metrics
            .sessions_closed_total
            .with_label_values(&[reason.code()])
            .inc();

        match reason.as_error(connection_id) {
            Some(error) => warn!(
                connection_id = connection_id,
                peer = ?self.peer,
                reason = %reason,
                error = %error,
                dropped = self.queue.dropped(),
                "Client {} disconnected: {}",
                connection_id,
                reason
            ),
            None => info!(
                connection_id = connection_id,
                peer = ?self.peer,
                reason = %reason,
                delivered = ?self.session.delivery_cursor(),
                "Client {} disconnected: {}",
                connection_id,
                reason
            ),
        }
    }
}

fn close_message(reason: CloseReason) -> &'static str {
    match reason {
        CloseReason::AuthFailed => "Invalid or missing token",
        CloseReason::AuthTimeout => "Authentication timeout",
        CloseReason::ProtocolViolation => "Invalid message",
        CloseReason::IdleTimeout => "Idle timeout",
        CloseReason::Backpressure => "Client too slow, queue saturated",
        CloseReason::ShuttingDown => "Server shutting down",
        CloseReason::TransportError | CloseReason::ClientClosed => "Connection closed",
    }
}
