//! Client session lifecycle: CONNECTING → AUTHENTICATING → ACTIVE → CLOSING.
//!
//! Pure state, no I/O. The connection task drives it and acts on the
//! transitions it reports.

use crate::error::EngineError;
use crate::models::Cursor;
use crate::services::websocket::auth::Credential;
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    Connecting,
    Authenticating,
    Active,
    Closing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    Pending,
    Authenticated,
    Rejected,
}

/// Why a session ended. The code is sent to the client in the final `error`
/// message and used as the metrics label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseReason {
    AuthFailed,
    AuthTimeout,
    ProtocolViolation,
    IdleTimeout,
    Backpressure,
    TransportError,
    ShuttingDown,
    ClientClosed,
}

impl CloseReason {
    pub fn code(&self) -> &'static str {
        match self {
            CloseReason::AuthFailed => "auth_failed",
            CloseReason::AuthTimeout => "auth_timeout",
            CloseReason::ProtocolViolation => "protocol_violation",
            CloseReason::IdleTimeout => "idle_timeout",
            CloseReason::Backpressure => "backpressure",
            CloseReason::TransportError => "transport_error",
            CloseReason::ShuttingDown => "shutting_down",
            CloseReason::ClientClosed => "client_closed",
        }
    }

    /// The engine error behind a close caused by the client, if any.
    pub fn as_error(&self, connection_id: u64) -> Option<EngineError> {
        match self {
            CloseReason::AuthFailed => Some(EngineError::AuthenticationFailure("invalid or missing token".to_string())),
            CloseReason::AuthTimeout => Some(EngineError::AuthenticationFailure("no auth before deadline".to_string())),
            CloseReason::ProtocolViolation => {
                Some(EngineError::ClientProtocolViolation("unexpected or malformed message".to_string()))
            }
            CloseReason::Backpressure => Some(EngineError::BackpressureExceeded(connection_id)),
            _ => None,
        }
    }

    /// Whether the client should be told why before the socket closes.
    pub fn notifies_client(&self) -> bool {
        !matches!(self, CloseReason::TransportError | CloseReason::ClientClosed)
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

#[derive(Debug)]
pub struct ClientSession {
    connection_id: u64,
    state: SessionState,
    auth: AuthState,
    delivery_cursor: Option<Cursor>,
    auth_deadline: Option<Instant>,
    last_inbound: Instant,
    close_reason: Option<CloseReason>,
}

impl ClientSession {
    pub fn new(connection_id: u64, now: Instant) -> Self {
        Self {
            connection_id,
            state: SessionState::Connecting,
            auth: AuthState::Pending,
            delivery_cursor: None,
            auth_deadline: None,
            last_inbound: now,
            close_reason: None,
        }
    }

    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn auth_state(&self) -> AuthState {
        self.auth
    }

    pub fn delivery_cursor(&self) -> Option<Cursor> {
        self.delivery_cursor
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason
    }

    pub fn auth_deadline(&self) -> Option<Instant> {
        self.auth_deadline
    }

    pub fn is_closing(&self) -> bool {
        self.state == SessionState::Closing
    }

    /// Transport handshake done; the auth clock starts now.
    pub fn handshake_complete(&mut self, now: Instant, auth_timeout: Duration) -> bool {
        if self.state != SessionState::Connecting {
            return false;
        }
        self.state = SessionState::Authenticating;
        self.auth_deadline = Some(now + auth_timeout);
        self.last_inbound = now;
        true
    }

    /// Checks a presented token. Success moves the session to ACTIVE; any
    /// failure, including a late or missing token, moves it to CLOSING.
    pub fn authenticate(
        &mut self,
        token: Option<&str>,
        credential: &Credential,
        now: Instant,
    ) -> Result<(), CloseReason> {
        if self.state != SessionState::Authenticating {
            let reason = if self.state == SessionState::Active {
                CloseReason::ProtocolViolation
            } else {
                self.close_reason.unwrap_or(CloseReason::ProtocolViolation)
            };
            self.close(reason);
            return Err(reason);
        }
        self.last_inbound = now;
        if self.auth_expired(now) {
            return Err(CloseReason::AuthTimeout);
        }

        match token {
            Some(token) if credential.verify(token) => {
                self.auth = AuthState::Authenticated;
                self.state = SessionState::Active;
                self.auth_deadline = None;
                Ok(())
            }
            _ => {
                self.auth = AuthState::Rejected;
                self.close(CloseReason::AuthFailed);
                Err(CloseReason::AuthFailed)
            }
        }
    }

    /// Closes an unauthenticated session whose deadline passed. Returns true if
    /// this call closed it.
    pub fn auth_expired(&mut self, now: Instant) -> bool {
        match (self.state, self.auth_deadline) {
            (SessionState::Authenticating, Some(deadline)) if now >= deadline => {
                self.close(CloseReason::AuthTimeout)
            }
            _ => false,
        }
    }

    /// Anything received from the client keeps the session alive.
    pub fn on_inbound(&mut self, now: Instant) {
        self.last_inbound = now;
    }

    pub fn is_idle(&self, now: Instant, idle_timeout: Duration) -> bool {
        self.state == SessionState::Active && now.saturating_duration_since(self.last_inbound) > idle_timeout
    }

    /// Records what has been written to the client. Never moves backwards.
    pub fn on_delivered(&mut self, cursor: Option<Cursor>) {
        if let Some(cursor) = cursor {
            if cursor.is_after(self.delivery_cursor) {
                self.delivery_cursor = Some(cursor);
            }
        }
    }

    /// Moves to CLOSING. Idempotent: only the first reason is kept, and only
    /// the first call returns true.
    pub fn close(&mut self, reason: CloseReason) -> bool {
        if self.state == SessionState::Closing {
            return false;
        }
        self.state = SessionState::Closing;
        self.close_reason = Some(reason);
        true
    }
}
