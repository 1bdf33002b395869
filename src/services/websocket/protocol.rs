//! JSON messages exchanged with clients. Every message is an object tagged by `type`.

use crate::engine::{ListenerState, SourceHealth};
use crate::models::{Cursor, Signal, SignalEvent};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Auth {
        #[serde(default)]
        token: Option<String>,
        /// Last cursor the client saw, to resume without duplicates.
        #[serde(default)]
        cursor: Option<Cursor>,
    },
    Ping,
    Pong,
    GetStats,
}

impl ClientMessage {
    pub fn parse(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionStats {
    pub connection_id: u64,
    pub uptime_seconds: u64,
    pub active_sessions: usize,
    pub window_size: usize,
    pub cursor: Option<Cursor>,
    pub listener: ListenerState,
    pub source: SourceHealth,
    pub dropped: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    AuthRequired {
        message: String,
    },
    AuthSuccess {
        connection_id: u64,
        window_minutes: u64,
        cursor: Option<Cursor>,
    },
    Snapshot {
        timestamp: DateTime<Utc>,
        count: usize,
        cursor: Option<Cursor>,
        data: Vec<SignalEvent>,
    },
    Delta {
        timestamp: DateTime<Utc>,
        count: usize,
        cursor: Option<Cursor>,
        data: Vec<SignalEvent>,
    },
    Ping {
        timestamp: DateTime<Utc>,
    },
    Pong {
        timestamp: DateTime<Utc>,
    },
    Stats(SessionStats),
    Error {
        code: String,
        message: String,
    },
}

impl ServerMessage {
    pub fn auth_required() -> Self {
        ServerMessage::AuthRequired {
            message: "Send {\"type\": \"auth\", \"token\": \"...\"} to authenticate".to_string(),
        }
    }

    /// Catch-up sent right after authentication. `cursor` is where the session's
    /// delivery starts, which can be ahead of the last entry sent.
    pub fn snapshot(signals: &[Arc<Signal>], cursor: Option<Cursor>) -> Self {
        let data: Vec<SignalEvent> = signals.iter().cloned().map(SignalEvent::insert).collect();
        ServerMessage::Snapshot {
            timestamp: Utc::now(),
            count: data.len(),
            cursor,
            data,
        }
    }

    pub fn delta(events: Vec<SignalEvent>) -> Self {
        ServerMessage::Delta {
            timestamp: Utc::now(),
            count: events.len(),
            cursor: events.last().map(SignalEvent::cursor),
            data: events,
        }
    }

    pub fn ping() -> Self {
        ServerMessage::Ping { timestamp: Utc::now() }
    }

    pub fn pong() -> Self {
        ServerMessage::Pong { timestamp: Utc::now() }
    }

    pub fn error(code: &str, message: impl Into<String>) -> Self {
        ServerMessage::Error {
            code: code.to_string(),
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}
