//! Signal source interface wrapping the relational store.

use crate::error::Result;
use crate::models::{ChangeEvent, Signal, SourceMarker};
use chrono::{DateTime, Utc};
use futures_util::stream::BoxStream;

/// Stream of raw change events. An `Err` item or the end of the stream means
/// the subscription is gone and must be re-established.
pub type ChangeStream = BoxStream<'static, Result<ChangeEvent>>;

/// Adapter over the store holding qualifying signals.
///
/// The qualification predicate (score thresholds, activity flags, exchange set)
/// lives entirely behind this trait. It must be deterministic for a given store
/// state so that overlapping fetches are idempotent.
#[async_trait::async_trait]
pub trait SignalSource: Send + Sync {
    /// All qualifying signals with `timestamp >= since`, ordered by `(timestamp, id)`.
    async fn fetch_qualifying(&self, since: DateTime<Utc>) -> Result<Vec<Signal>>;

    /// Cheap summary of the qualifying set used to skip full fetches.
    async fn fetch_marker(&self, since: DateTime<Utc>) -> Result<SourceMarker>;

    /// Opens a subscription to the named change channel.
    async fn subscribe_changes(&self, channel: &str) -> Result<ChangeStream>;
}
