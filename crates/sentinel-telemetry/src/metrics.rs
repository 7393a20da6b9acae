//! Prometheus metrics for sentinel.
//!
//! Covers:
//! - Feed connection state, reconnects, frame throughput and drops
//! - Validation rejections and continuity anomalies
//! - Per-symbol quality scores
//! - REST fallback, gap repair and reconciliation outcomes
//!
//! # Panics
//!
//! Metric registration uses `unwrap()` intentionally. If registration fails,
//! it indicates a fatal configuration error (e.g., duplicate metric names)
//! that should cause an immediate crash at startup rather than silent failure.
//! These panics only occur during static initialization, never at runtime.

use crate::error::{TelemetryError, TelemetryResult};
use once_cell::sync::Lazy;
use prometheus::{
    register_counter, register_counter_vec, register_gauge_vec, register_histogram_vec, Counter,
    CounterVec, Encoder, GaugeVec, HistogramVec, TextEncoder,
};

/// Feed connection state (1 = connected, 0 = not connected).
pub static FEED_CONNECTED: Lazy<GaugeVec> = Lazy::new(|| {
    register_gauge_vec!(
        "sentinel_feed_connected",
        "Feed connection state (1=connected)",
        &["feed"]
    )
    .unwrap()
});

/// Feed state machine current state.
/// Labels: feed, state (disconnected/connecting/connected/reconnecting/stopped)
pub static FEED_STATE: Lazy<GaugeVec> = Lazy::new(|| {
    register_gauge_vec!(
        "sentinel_feed_state",
        "Feed state machine current state (1=active, 0=inactive)",
        &["feed", "state"]
    )
    .unwrap()
});

/// Total reconnection attempts per feed.
pub static FEED_RECONNECT_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "sentinel_feed_reconnect_total",
        "Total feed reconnection attempts",
        &["feed"]
    )
    .unwrap()
});

/// Frames received from the socket.
pub static FEED_FRAMES_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "sentinel_feed_frames_total",
        "Total data frames received",
        &["feed"]
    )
    .unwrap()
});

/// Frames dropped because the inbound queue was full.
pub static FEED_DROPPED_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "sentinel_feed_dropped_total",
        "Total frames dropped on queue overflow",
        &["feed"]
    )
    .unwrap()
});

/// Handler errors caught by the consumer loop.
pub static FEED_PROCESSING_ERRORS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "sentinel_feed_processing_errors_total",
        "Total errors raised while processing frames",
        &["feed"]
    )
    .unwrap()
});

/// Exchange-to-local latency in milliseconds.
pub static FEED_LATENCY_MS: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "sentinel_feed_latency_ms",
        "Message latency from exchange event time to local receipt",
        &["feed"],
        vec![5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0]
    )
    .unwrap()
});

/// Closed bars flushed to the downstream sink.
pub static BARS_FLUSHED_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "sentinel_bars_flushed_total",
        "Total closed bars flushed from shard batchers",
        &["feed"]
    )
    .unwrap()
});

/// Messages rejected by validation.
/// Labels: cause (missing_fields/invalid_prices)
pub static VALIDATION_REJECTED_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "sentinel_validation_rejected_total",
        "Total messages rejected by validation",
        &["cause"]
    )
    .unwrap()
});

/// Continuity anomalies.
/// Labels: kind (gap/out_of_order)
pub static CONTINUITY_ANOMALY_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "sentinel_continuity_anomaly_total",
        "Total timestamp continuity anomalies",
        &["kind"]
    )
    .unwrap()
});

/// Current quality score per symbol and source.
pub static QUALITY_SCORE: Lazy<GaugeVec> = Lazy::new(|| {
    register_gauge_vec!(
        "sentinel_quality_score",
        "Health quality score in [0,1]",
        &["symbol", "source"]
    )
    .unwrap()
});

/// REST fallback executions.
/// Labels: data_type (kline/price/position), result (success/failure)
pub static FALLBACK_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "sentinel_fallback_total",
        "Total REST fallback executions",
        &["data_type", "result"]
    )
    .unwrap()
});

/// Gap handling outcomes.
/// Labels: result (detected/fixed/unfixed)
pub static GAP_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "sentinel_gap_total",
        "Total major data gaps by outcome",
        &["result"]
    )
    .unwrap()
});

/// Bars recovered through REST backfill.
pub static GAP_RECOVERED_POINTS_TOTAL: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "sentinel_gap_recovered_points_total",
        "Total data points recovered by gap backfill"
    )
    .unwrap()
});

/// Reconciliation runs.
/// Labels: status (ok/warning/error)
pub static RECONCILE_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "sentinel_reconcile_total",
        "Total account reconciliations by status",
        &["status"]
    )
    .unwrap()
});

/// Reconciliation mismatches healed from REST.
/// Labels: kind (balance/position)
pub static RECONCILE_MISMATCH_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "sentinel_reconcile_mismatch_total",
        "Total cache entries corrected by reconciliation",
        &["kind"]
    )
    .unwrap()
});

/// Listen key lifecycle results.
/// Labels: op (obtain/renew/close), result (success/failure)
pub static LISTEN_KEY_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "sentinel_listen_key_total",
        "Total listen key operations",
        &["op", "result"]
    )
    .unwrap()
});

const FEED_STATES: [&str; 5] = [
    "disconnected",
    "connecting",
    "connected",
    "reconnecting",
    "stopped",
];

fn result_label(ok: bool) -> &'static str {
    if ok {
        "success"
    } else {
        "failure"
    }
}

/// Metrics facade for easy access.
pub struct Metrics;

impl Metrics {
    /// Set feed state. Only the active state is 1.
    pub fn feed_state_set(feed: &str, state: &str) {
        for s in &FEED_STATES {
            FEED_STATE.with_label_values(&[feed, s]).set(0.0);
        }
        FEED_STATE.with_label_values(&[feed, state]).set(1.0);
        let connected = if state == "connected" { 1.0 } else { 0.0 };
        FEED_CONNECTED.with_label_values(&[feed]).set(connected);
    }

    pub fn feed_reconnect(feed: &str) {
        FEED_RECONNECT_TOTAL.with_label_values(&[feed]).inc();
    }

    pub fn feed_frame(feed: &str) {
        FEED_FRAMES_TOTAL.with_label_values(&[feed]).inc();
    }

    pub fn feed_dropped(feed: &str) {
        FEED_DROPPED_TOTAL.with_label_values(&[feed]).inc();
    }

    pub fn feed_processing_error(feed: &str) {
        FEED_PROCESSING_ERRORS_TOTAL.with_label_values(&[feed]).inc();
    }

    pub fn feed_latency(feed: &str, latency_ms: f64) {
        FEED_LATENCY_MS.with_label_values(&[feed]).observe(latency_ms);
    }

    pub fn bars_flushed(feed: &str, count: usize) {
        BARS_FLUSHED_TOTAL
            .with_label_values(&[feed])
            .inc_by(count as f64);
    }

    /// Record a validation rejection by cause.
    pub fn validation_rejected(cause: &str) {
        VALIDATION_REJECTED_TOTAL.with_label_values(&[cause]).inc();
    }

    pub fn continuity_anomaly(kind: &str) {
        CONTINUITY_ANOMALY_TOTAL.with_label_values(&[kind]).inc();
    }

    pub fn quality_score(symbol: &str, source: &str, score: f64) {
        QUALITY_SCORE.with_label_values(&[symbol, source]).set(score);
    }

    pub fn fallback(data_type: &str, ok: bool) {
        FALLBACK_TOTAL
            .with_label_values(&[data_type, result_label(ok)])
            .inc();
    }

    pub fn gap(result: &str) {
        GAP_TOTAL.with_label_values(&[result]).inc();
    }

    pub fn gap_recovered(points: usize) {
        GAP_RECOVERED_POINTS_TOTAL.inc_by(points as f64);
    }

    pub fn reconcile(status: &str, balance_mismatches: usize, position_mismatches: usize) {
        RECONCILE_TOTAL.with_label_values(&[status]).inc();
        RECONCILE_MISMATCH_TOTAL
            .with_label_values(&["balance"])
            .inc_by(balance_mismatches as f64);
        RECONCILE_MISMATCH_TOTAL
            .with_label_values(&["position"])
            .inc_by(position_mismatches as f64);
    }

    pub fn listen_key(op: &str, ok: bool) {
        LISTEN_KEY_TOTAL
            .with_label_values(&[op, result_label(ok)])
            .inc();
    }

    /// Encode the default registry in Prometheus text format.
    pub fn render() -> TelemetryResult<String> {
        let encoder = TextEncoder::new();
        let mut buf = Vec::new();
        encoder
            .encode(&prometheus::gather(), &mut buf)
            .map_err(|e| TelemetryError::Metrics(e.to_string()))?;
        String::from_utf8(buf).map_err(|e| TelemetryError::Metrics(e.to_string()))
    }
}
