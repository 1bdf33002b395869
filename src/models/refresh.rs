//! Refresh requests flowing from the listener and the poll scheduler into the reconciler.

use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Why a reconciliation pass was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RefreshReason {
    /// Low-latency path: the change channel delivered an event.
    Notify,
    /// The listener re-established its subscription, or the engine just started.
    Resync,
    /// Cheap existence check on the fast poll cadence.
    PollLight,
    /// Safety-net full fetch on the slow poll cadence.
    PollFull,
}

impl RefreshReason {
    /// Whether this reason always runs a full fetch.
    pub fn requires_full_fetch(&self) -> bool {
        !matches!(self, RefreshReason::PollLight)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RefreshReason::Notify => "notify",
            RefreshReason::Resync => "resync",
            RefreshReason::PollLight => "poll_light",
            RefreshReason::PollFull => "poll_full",
        }
    }
}

impl fmt::Display for RefreshReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of the lightweight existence check: how the qualifying set looks
/// without fetching it.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SourceMarker {
    pub max_id: Option<i64>,
    pub max_timestamp: Option<chrono::DateTime<chrono::Utc>>,
    pub count: i64,
}

/// Minimal hint parsed from a change notification payload. Only used for logging;
/// the reconciler always re-fetches.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ChangeHint {
    #[serde(default, alias = "event")]
    pub operation: Option<String>,
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(default)]
    pub pair_symbol: Option<String>,
    #[serde(default)]
    pub score_week: Option<f64>,
    #[serde(default)]
    pub score_month: Option<f64>,
    /// Kept verbatim; triggers emit timestamps without a zone.
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default, alias = "recommended_action")]
    pub action: Option<String>,
}

impl ChangeHint {
    /// Parses a notification payload. An empty payload carries no hint.
    pub fn parse(payload: &str) -> Result<Option<ChangeHint>> {
        let payload = payload.trim();
        if payload.is_empty() {
            return Ok(None);
        }
        serde_json::from_str(payload).map(Some).map_err(|e| {
            let preview: String = payload.chars().take(100).collect();
            EngineError::ChannelDegraded(format!("invalid notification payload '{}': {}", preview, e))
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RefreshHint {
    Change(ChangeHint),
    Marker(SourceMarker),
}

#[derive(Debug, Clone, PartialEq)]
pub struct RefreshRequest {
    pub reason: RefreshReason,
    pub hint: Option<RefreshHint>,
}

impl RefreshRequest {
    pub fn new(reason: RefreshReason) -> Self {
        Self { reason, hint: None }
    }

    pub fn notify(hint: Option<ChangeHint>) -> Self {
        Self {
            reason: RefreshReason::Notify,
            hint: hint.map(RefreshHint::Change),
        }
    }

    pub fn with_marker(mut self, marker: SourceMarker) -> Self {
        self.hint = Some(RefreshHint::Marker(marker));
        self
    }

    pub fn marker(&self) -> Option<&SourceMarker> {
        match &self.hint {
            Some(RefreshHint::Marker(m)) => Some(m),
            _ => None,
        }
    }
}

/// Raw event read from the store's change channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub channel: String,
    pub payload: String,
}
