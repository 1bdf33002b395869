//! PostgreSQL signal source: qualifying-signal query, lightweight marker and LISTEN/NOTIFY.

use crate::config::{is_valid_channel, DatabaseConfig, ExchangeFilter};
use crate::error::{EngineError, Result};
use crate::models::{ChangeEvent, Signal, SourceMarker};
use crate::services::signal_source::{ChangeStream, SignalSource};
use chrono::{DateTime, Utc};
use futures_util::stream::{self, StreamExt};
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio_postgres::{AsyncMessage, Client, NoTls, Row};
use tracing::{debug, error, info};

/// Signals joined with the best backtest parameters of their exchange.
///
/// The best parameter row per exchange is the highest win rate among summaries
/// within 5% of the best total PnL. A signal qualifies when both its week and
/// month scores beat that row's filters, it and its pair are active, its hour
/// is not 00–01 and its exchange is enabled.
const QUALIFYING_SIGNALS_SQL: &str = r#"
WITH best_binance_id AS (
    WITH filtered AS (
        SELECT DISTINCT ON (total_pnl_usd) summary_id, win_rate, total_pnl_usd
        FROM web.backtest_summary_binance
        WHERE total_pnl_usd >= (SELECT MAX(total_pnl_usd) FROM web.backtest_summary_binance) * 0.95
        ORDER BY total_pnl_usd DESC, win_rate DESC
    )
    SELECT summary_id FROM filtered ORDER BY win_rate DESC LIMIT 1
),
best_bybit_id AS (
    WITH filtered AS (
        SELECT DISTINCT ON (total_pnl_usd) summary_id, win_rate, total_pnl_usd
        FROM web.backtest_summary_bybit
        WHERE total_pnl_usd >= (SELECT MAX(total_pnl_usd) FROM web.backtest_summary_bybit) * 0.95
        ORDER BY total_pnl_usd DESC, win_rate DESC
    )
    SELECT summary_id FROM filtered ORDER BY win_rate DESC LIMIT 1
),
all_best_params AS (
    (
        SELECT 1 AS exchange_id, score_week_filter, score_month_filter, max_trades_filter,
               stop_loss_filter, trailing_activation_filter, trailing_distance_filter
        FROM web.backtest_summary_binance
        WHERE summary_id = (SELECT summary_id FROM best_binance_id)
    )
    UNION ALL
    (
        SELECT 2 AS exchange_id, score_week_filter, score_month_filter, max_trades_filter,
               stop_loss_filter, trailing_activation_filter, trailing_distance_filter
        FROM web.backtest_summary_bybit
        WHERE summary_id = (SELECT summary_id FROM best_bybit_id)
    )
)
SELECT
    sc.id::int8 AS id,
    sc.pair_symbol::text AS pair_symbol,
    sc.recommended_action::text AS recommended_action,
    sc.score_week::float8 AS score_week,
    sc.score_month::float8 AS score_month,
    sc.timestamp::timestamptz AS signal_timestamp,
    sc.created_at::timestamptz AS created_at,
    sc.trading_pair_id::int8 AS trading_pair_id,
    tp.exchange_id::int8 AS exchange_id,
    bp.score_week_filter::float8 AS score_week_filter,
    bp.score_month_filter::float8 AS score_month_filter,
    bp.max_trades_filter::int8 AS max_trades_filter,
    bp.stop_loss_filter::float8 AS stop_loss_filter,
    bp.trailing_activation_filter::float8 AS trailing_activation_filter,
    bp.trailing_distance_filter::float8 AS trailing_distance_filter
FROM fas_v2.scoring_history AS sc
JOIN public.trading_pairs AS tp ON sc.trading_pair_id = tp.id
JOIN all_best_params AS bp ON tp.exchange_id = bp.exchange_id
WHERE sc.timestamp >= $1::timestamptz
    AND sc.is_active = true
    AND tp.is_active = true
    AND sc.score_week > bp.score_week_filter
    AND sc.score_month > bp.score_month_filter
    AND EXTRACT(HOUR FROM sc.timestamp) NOT BETWEEN 0 AND 1
    AND tp.exchange_id = ANY($2::int4[])
ORDER BY sc.timestamp ASC, sc.id ASC
"#;

const MARKER_SQL: &str = r#"
SELECT
    MAX(sc.id)::int8 AS max_id,
    MAX(sc.timestamp)::timestamptz AS max_timestamp,
    COUNT(*)::int8 AS total_count
FROM fas_v2.scoring_history sc
JOIN public.trading_pairs tp ON sc.trading_pair_id = tp.id
WHERE sc.timestamp >= $1::timestamptz
    AND sc.is_active = true
    AND tp.is_active = true
    AND tp.exchange_id = ANY($2::int4[])
"#;

const ENRICHMENT_FLOAT_COLUMNS: [&str; 5] = [
    "score_week_filter",
    "score_month_filter",
    "stop_loss_filter",
    "trailing_activation_filter",
    "trailing_distance_filter",
];

pub struct PostgresSignalSource {
    config: DatabaseConfig,
    exchange_ids: Vec<i32>,
    client: Arc<RwLock<Option<Arc<Client>>>>,
}

impl PostgresSignalSource {
    /// Connects the query client eagerly so misconfiguration surfaces at startup.
    pub async fn new(config: DatabaseConfig, exchanges: ExchangeFilter) -> Result<Self> {
        let source = Self {
            config,
            exchange_ids: exchanges.exchange_ids(),
            client: Arc::new(RwLock::new(None)),
        };
        let client = source.client().await?;
        client.query_one("SELECT 1", &[]).await?;
        info!(database = %source.config.redacted(), "Database connection verified");
        Ok(source)
    }

    async fn connect(&self) -> Result<Client> {
        let (client, connection) = tokio_postgres::connect(&self.config.url, NoTls)
            .await
            .map_err(|e| {
                EngineError::SourceUnavailable(format!(
                    "Failed to connect to {}: {}",
                    self.config.redacted(),
                    e
                ))
            })?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!(error = %e, "PostgreSQL connection error");
            }
        });

        client.batch_execute("SET TIME ZONE 'UTC'").await?;
        Ok(client)
    }

    /// Returns the shared query client, reconnecting when it is missing or closed.
    async fn client(&self) -> Result<Arc<Client>> {
        {
            let guard = self.client.read().await;
            if let Some(ref c) = *guard {
                if !c.is_closed() {
                    return Ok(c.clone());
                }
            }
        }

        let mut guard = self.client.write().await;
        if let Some(ref c) = *guard {
            if !c.is_closed() {
                return Ok(c.clone());
            }
        }
        debug!(database = %self.config.redacted(), "Opening PostgreSQL query connection");
        let client = Arc::new(self.connect().await?);
        *guard = Some(client.clone());
        Ok(client)
    }
}

fn row_to_signal(row: &Row) -> Result<Signal> {
    let timestamp: DateTime<Utc> = row.try_get("signal_timestamp")?;
    let created_at: Option<DateTime<Utc>> = row.try_get("created_at")?;

    let mut enrichment = Map::new();
    for column in ENRICHMENT_FLOAT_COLUMNS {
        let value: Option<f64> = row.try_get(column)?;
        enrichment.insert(column.to_string(), value.map(Value::from).unwrap_or(Value::Null));
    }
    let max_trades: Option<i64> = row.try_get("max_trades_filter")?;
    enrichment.insert(
        "max_trades_filter".to_string(),
        max_trades.map(Value::from).unwrap_or(Value::Null),
    );

    Ok(Signal {
        id: row.try_get("id")?,
        pair_symbol: row.try_get::<_, Option<String>>("pair_symbol")?.unwrap_or_default(),
        recommended_action: row
            .try_get::<_, Option<String>>("recommended_action")?
            .unwrap_or_default(),
        score_week: row.try_get::<_, Option<f64>>("score_week")?.unwrap_or(0.0),
        score_month: row.try_get::<_, Option<f64>>("score_month")?.unwrap_or(0.0),
        timestamp,
        created_at: created_at.unwrap_or(timestamp),
        trading_pair_id: row.try_get("trading_pair_id")?,
        exchange_id: row.try_get("exchange_id")?,
        enrichment,
    }
    .with_finite_scores())
}

#[async_trait::async_trait]
impl SignalSource for PostgresSignalSource {
    async fn fetch_qualifying(&self, since: DateTime<Utc>) -> Result<Vec<Signal>> {
        let client = self.client().await?;
        let rows = client
            .query(QUALIFYING_SIGNALS_SQL, &[&since, &self.exchange_ids])
            .await?;
        let signals = rows.iter().map(row_to_signal).collect::<Result<Vec<_>>>()?;
        debug!(count = signals.len(), "Fetched {} qualifying signals", signals.len());
        Ok(signals)
    }

    async fn fetch_marker(&self, since: DateTime<Utc>) -> Result<SourceMarker> {
        let client = self.client().await?;
        let row = client.query_one(MARKER_SQL, &[&since, &self.exchange_ids]).await?;
        Ok(SourceMarker {
            max_id: row.try_get("max_id")?,
            max_timestamp: row.try_get("max_timestamp")?,
            count: row.try_get("total_count")?,
        })
    }

    async fn subscribe_changes(&self, channel: &str) -> Result<ChangeStream> {
        if !is_valid_channel(channel) {
            return Err(EngineError::Config(format!("invalid channel name '{}'", channel)));
        }

        let (client, mut connection) = tokio_postgres::connect(&self.config.url, NoTls)
            .await
            .map_err(|e| EngineError::ChannelDegraded(format!("LISTEN connection failed: {}", e)))?;

        // Notifications only surface through poll_message, so the connection is
        // driven here instead of being awaited as a plain future.
        let (tx, rx) = mpsc::unbounded_channel::<Result<ChangeEvent>>();
        tokio::spawn(async move {
            let mut messages = Box::pin(stream::poll_fn(move |cx| connection.poll_message(cx)));
            while let Some(message) = messages.next().await {
                match message {
                    Ok(AsyncMessage::Notification(n)) => {
                        let event = ChangeEvent {
                            channel: n.channel().to_string(),
                            payload: n.payload().to_string(),
                        };
                        if tx.send(Ok(event)).is_err() {
                            return;
                        }
                    }
                    Ok(AsyncMessage::Notice(notice)) => {
                        debug!(notice = %notice, "PostgreSQL notice on LISTEN connection");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        let _ = tx.send(Err(EngineError::ChannelDegraded(e.to_string())));
                        return;
                    }
                }
            }
            let _ = tx.send(Err(EngineError::ChannelDegraded(
                "LISTEN connection closed".to_string(),
            )));
        });

        client
            .batch_execute(&format!("LISTEN \"{}\"", channel))
            .await
            .map_err(|e| EngineError::ChannelDegraded(format!("LISTEN {} failed: {}", channel, e)))?;
        info!(channel = %channel, "PostgreSQL LISTEN active on '{}'", channel);

        // The client travels with the stream: dropping it closes the connection.
        let stream = stream::unfold((rx, client), |(mut rx, client)| async move {
            rx.recv().await.map(|item| (item, (rx, client)))
        });
        Ok(stream.boxed())
    }
}
