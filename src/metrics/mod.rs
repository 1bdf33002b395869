//! Prometheus metrics for the relay.

use prometheus::{
    Encoder, Gauge, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

pub struct Metrics {
    registry: Registry,
    pub refresh_requests_total: IntCounterVec,
    pub refresh_coalesced_total: IntCounter,
    pub reconcile_passes_total: IntCounter,
    pub reconcile_failures_total: IntCounter,
    pub reconcile_duration_seconds: Histogram,
    pub signals_admitted_total: IntCounterVec,
    pub signals_evicted_total: IntCounter,
    pub window_size: IntGauge,
    pub listener_connected: Gauge,
    pub source_healthy: Gauge,
    pub sessions_active: IntGauge,
    pub sessions_closed_total: IntCounterVec,
    pub backpressure_dropped_total: IntCounter,
    pub messages_sent_total: IntCounter,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new_custom(Some("signal_relay".to_string()), None)?;

        let refresh_requests_total = IntCounterVec::new(
            Opts::new("refresh_requests_total", "Refresh requests received by reason"),
            &["reason"],
        )?;
        let refresh_coalesced_total = IntCounter::new(
            "refresh_coalesced_total",
            "Refresh requests folded into an already pending pass",
        )?;
        let reconcile_passes_total =
            IntCounter::new("reconcile_passes_total", "Completed reconciliation passes")?;
        let reconcile_failures_total = IntCounter::new(
            "reconcile_failures_total",
            "Reconciliation passes that failed after retries",
        )?;
        let reconcile_duration_seconds = Histogram::with_opts(
            HistogramOpts::new("reconcile_duration_seconds", "Reconciliation pass duration")
                .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5]),
        )?;
        let signals_admitted_total = IntCounterVec::new(
            Opts::new("signals_admitted_total", "Signals admitted into the window"),
            &["event"],
        )?;
        let signals_evicted_total =
            IntCounter::new("signals_evicted_total", "Signals evicted from the window by age")?;
        let window_size = IntGauge::new("window_size", "Signals currently in the window")?;
        let listener_connected = Gauge::new(
            "listener_connected",
            "1 when the change-notification subscription is active",
        )?;
        let source_healthy = Gauge::new("source_healthy", "1 when the signal source is healthy")?;
        let sessions_active = IntGauge::new("sessions_active", "Attached client sessions")?;
        let sessions_closed_total = IntCounterVec::new(
            Opts::new("sessions_closed_total", "Closed client sessions by reason"),
            &["reason"],
        )?;
        let backpressure_dropped_total = IntCounter::new(
            "backpressure_dropped_total",
            "Queued signals dropped to make room for newer ones",
        )?;
        let messages_sent_total =
            IntCounter::new("messages_sent_total", "Messages written to client transports")?;

        registry.register(Box::new(refresh_requests_total.clone()))?;
        registry.register(Box::new(refresh_coalesced_total.clone()))?;
        registry.register(Box::new(reconcile_passes_total.clone()))?;
        registry.register(Box::new(reconcile_failures_total.clone()))?;
        registry.register(Box::new(reconcile_duration_seconds.clone()))?;
        registry.register(Box::new(signals_admitted_total.clone()))?;
        registry.register(Box::new(signals_evicted_total.clone()))?;
        registry.register(Box::new(window_size.clone()))?;
        registry.register(Box::new(listener_connected.clone()))?;
        registry.register(Box::new(source_healthy.clone()))?;
        registry.register(Box::new(sessions_active.clone()))?;
        registry.register(Box::new(sessions_closed_total.clone()))?;
        registry.register(Box::new(backpressure_dropped_total.clone()))?;
        registry.register(Box::new(messages_sent_total.clone()))?;

        source_healthy.set(1.0);

        Ok(Self {
            registry,
            refresh_requests_total,
            refresh_coalesced_total,
            reconcile_passes_total,
            reconcile_failures_total,
            reconcile_duration_seconds,
            signals_admitted_total,
            signals_evicted_total,
            window_size,
            listener_connected,
            source_healthy,
            sessions_active,
            sessions_closed_total,
            backpressure_dropped_total,
            messages_sent_total,
        })
    }

    /// Prometheus text exposition of every registered metric.
    pub fn export(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}
