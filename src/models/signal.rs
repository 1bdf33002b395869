//! Trading signal as fetched from the store, and its position in the total order.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;

/// A qualifying trading signal. Immutable once fetched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub id: i64,
    pub pair_symbol: String,
    pub recommended_action: String,
    pub score_week: f64,
    pub score_month: f64,
    /// Signal time. Primary ordering key.
    pub timestamp: DateTime<Utc>,
    /// Ingestion time in the store.
    pub created_at: DateTime<Utc>,
    pub trading_pair_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exchange_id: Option<i64>,
    /// Filter thresholds attached by the source. Never inspected by the engine.
    #[serde(flatten, default)]
    pub enrichment: Map<String, Value>,
}

impl Signal {
    pub fn cursor(&self) -> Cursor {
        Cursor::new(self.timestamp, self.id)
    }

    /// Replaces NaN and infinite scores with zero so that comparing a signal
    /// with its own refetch stays equal.
    pub fn with_finite_scores(mut self) -> Self {
        if !self.score_week.is_finite() {
            self.score_week = 0.0;
        }
        if !self.score_month.is_finite() {
            self.score_month = 0.0;
        }
        self
    }
}

/// `(timestamp, id)` position of a signal in the total order.
///
/// Field order matters: the derived `Ord` compares `timestamp` first and
/// breaks ties on `id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Cursor {
    pub timestamp: DateTime<Utc>,
    pub id: i64,
}

impl Cursor {
    pub fn new(timestamp: DateTime<Utc>, id: i64) -> Self {
        Self { timestamp, id }
    }

    /// True when a signal at `self` is newer than `watermark`. No watermark means
    /// nothing has been delivered yet.
    pub fn is_after(&self, watermark: Option<Cursor>) -> bool {
        watermark.map_or(true, |w| *self > w)
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.timestamp.to_rfc3339(), self.id)
    }
}

/// Discriminates first admission of an id from a re-admission with new content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Insert,
    Update,
}

/// A signal as it travels through deltas and onto the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalEvent {
    pub event: EventKind,
    #[serde(flatten)]
    pub signal: Arc<Signal>,
}

impl SignalEvent {
    pub fn insert(signal: Arc<Signal>) -> Self {
        Self {
            event: EventKind::Insert,
            signal,
        }
    }

    pub fn update(signal: Arc<Signal>) -> Self {
        Self {
            event: EventKind::Update,
            signal,
        }
    }

    pub fn cursor(&self) -> Cursor {
        self.signal.cursor()
    }
}
