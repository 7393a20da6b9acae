//! Per-message validation and per-stream continuity tracking.
//!
//! Messages are the `data` payload of a stream frame. Every payload must
//! carry the envelope fields `e` (event type) and `E` (event time). Bar
//! payloads (those with a `k` object) must also carry OHLCV values that
//! pass price sanity:
//! - O, H, L, C > 0
//! - low <= high
//! - open and close within [low, high]

use crate::error::ValidationError;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use sentinel_telemetry::Metrics;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, trace};

const ENVELOPE_FIELDS: [&str; 2] = ["e", "E"];
const OHLCV_FIELDS: [&str; 5] = ["o", "h", "l", "c", "v"];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityConfig {
    /// Interval between consecutive messages above which a gap is counted.
    #[serde(default = "default_gap_threshold_ms")]
    pub gap_threshold_ms: i64,
}

fn default_gap_threshold_ms() -> i64 {
    60_000
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            gap_threshold_ms: default_gap_threshold_ms(),
        }
    }
}

/// Outcome of a continuity check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Continuity {
    /// First timestamp seen on the stream.
    First,
    InOrder,
    /// Timestamp not after the last one seen.
    OutOfOrder { last_ts: i64, ts: i64 },
    /// Timestamp advanced by more than the gap threshold.
    Gap { gap_ms: i64 },
    /// Message carried no event time; nothing was recorded.
    Untimed,
}

/// Aggregate counters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QualityReport {
    pub validated: u64,
    pub rejected: u64,
    pub missing_fields: u64,
    pub invalid_prices: u64,
    pub gaps: u64,
    pub out_of_order: u64,
    /// (validated - rejected) / validated, 1.0 before any message.
    pub acceptance_rate: f64,
    pub tracked_streams: usize,
}

#[derive(Debug, Default)]
pub struct DataQualityMonitor {
    config: QualityConfig,
    validated: AtomicU64,
    rejected: AtomicU64,
    missing_fields: AtomicU64,
    invalid_prices: AtomicU64,
    gaps: AtomicU64,
    out_of_order: AtomicU64,
    last_seen: Mutex<HashMap<String, i64>>,
}

impl DataQualityMonitor {
    pub fn new(config: QualityConfig) -> Self {
        Self {
            config,
            ..Default::default()
        }
    }

    /// Validate one payload, updating counters.
    pub fn validate_message(&self, msg: &Value) -> Result<(), ValidationError> {
        self.validated.fetch_add(1, Ordering::Relaxed);
        let result = check_message(msg);
        if let Err(e) = &result {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            match e {
                ValidationError::NotAnObject | ValidationError::MissingFields(_) => {
                    self.missing_fields.fetch_add(1, Ordering::Relaxed);
                }
                ValidationError::InvalidPrices(_) => {
                    self.invalid_prices.fetch_add(1, Ordering::Relaxed);
                }
            }
            Metrics::validation_rejected(e.cause());
            debug!(error = %e, "Message rejected");
        }
        result
    }

    /// Track event-time ordering for one stream of a symbol, keyed like
    /// `BTCUSDT@kline_1m`. Streams of the same symbol share event times, so
    /// they must not share a key.
    ///
    /// The last-seen timestamp is updated whatever the outcome.
    pub fn check_continuity(&self, stream: &str, msg: &Value) -> Continuity {
        let Some(ts) = event_time(msg) else {
            return Continuity::Untimed;
        };
        self.observe_timestamp(stream, ts)
    }

    pub(crate) fn observe_timestamp(&self, stream: &str, ts: i64) -> Continuity {
        let previous = self.last_seen.lock().insert(stream.to_string(), ts);
        let outcome = match previous {
            None => Continuity::First,
            Some(last_ts) if ts <= last_ts => {
                self.out_of_order.fetch_add(1, Ordering::Relaxed);
                Metrics::continuity_anomaly("out_of_order");
                Continuity::OutOfOrder { last_ts, ts }
            }
            Some(last_ts) if ts - last_ts > self.config.gap_threshold_ms => {
                self.gaps.fetch_add(1, Ordering::Relaxed);
                Metrics::continuity_anomaly("gap");
                Continuity::Gap {
                    gap_ms: ts - last_ts,
                }
            }
            Some(_) => Continuity::InOrder,
        };
        if !matches!(outcome, Continuity::InOrder | Continuity::First) {
            trace!(stream, ?outcome, "Continuity anomaly");
        }
        outcome
    }

    /// Last event time seen on a stream.
    pub fn last_seen(&self, stream: &str) -> Option<i64> {
        self.last_seen.lock().get(stream).copied()
    }

    pub fn report(&self) -> QualityReport {
        let validated = self.validated.load(Ordering::Relaxed);
        let rejected = self.rejected.load(Ordering::Relaxed);
        let acceptance_rate = if validated == 0 {
            1.0
        } else {
            validated.saturating_sub(rejected) as f64 / validated as f64
        };
        QualityReport {
            validated,
            rejected,
            missing_fields: self.missing_fields.load(Ordering::Relaxed),
            invalid_prices: self.invalid_prices.load(Ordering::Relaxed),
            gaps: self.gaps.load(Ordering::Relaxed),
            out_of_order: self.out_of_order.load(Ordering::Relaxed),
            acceptance_rate,
            tracked_streams: self.last_seen.lock().len(),
        }
    }
}

/// Event time (`E`) of a payload, in epoch ms.
pub fn event_time(msg: &Value) -> Option<i64> {
    msg.get("E").and_then(Value::as_i64)
}

fn check_message(msg: &Value) -> Result<(), ValidationError> {
    let obj = msg.as_object().ok_or(ValidationError::NotAnObject)?;

    let missing: Vec<&str> = ENVELOPE_FIELDS
        .iter()
        .copied()
        .filter(|f| obj.get(*f).map_or(true, Value::is_null))
        .collect();
    if !missing.is_empty() {
        return Err(ValidationError::MissingFields(missing.join(",")));
    }

    match obj.get("k") {
        Some(Value::Object(bar)) => check_bar(bar),
        Some(_) => Err(ValidationError::MissingFields("k".to_string())),
        None => Ok(()),
    }
}

fn check_bar(bar: &serde_json::Map<String, Value>) -> Result<(), ValidationError> {
    let missing: Vec<&str> = OHLCV_FIELDS
        .iter()
        .copied()
        .filter(|f| bar.get(*f).map_or(true, Value::is_null))
        .collect();
    if !missing.is_empty() {
        return Err(ValidationError::MissingFields(format!("k.{}", missing.join(",k."))));
    }

    let field = |name: &str| -> Result<Decimal, ValidationError> {
        bar.get(name)
            .and_then(parse_decimal)
            .ok_or_else(|| ValidationError::InvalidPrices(format!("unparseable {name}")))
    };
    let open = field("o")?;
    let high = field("h")?;
    let low = field("l")?;
    let close = field("c")?;
    let volume = field("v")?;

    if [open, high, low, close].iter().any(|p| *p <= Decimal::ZERO) {
        return Err(ValidationError::InvalidPrices(format!(
            "non-positive price o={open} h={high} l={low} c={close}"
        )));
    }
    if high < low {
        return Err(ValidationError::InvalidPrices(format!(
            "high {high} below low {low}"
        )));
    }
    if !(low <= open && open <= high) || !(low <= close && close <= high) {
        return Err(ValidationError::InvalidPrices(format!(
            "open/close outside range o={open} c={close} l={low} h={high}"
        )));
    }
    if volume < Decimal::ZERO {
        return Err(ValidationError::InvalidPrices(format!(
            "negative volume {volume}"
        )));
    }
    Ok(())
}

/// Numeric string or JSON number as a decimal.
pub(crate) fn parse_decimal(value: &Value) -> Option<Decimal> {
    match value {
        Value::String(s) => Decimal::from_str(s)
            .or_else(|_| Decimal::from_scientific(s))
            .ok(),
        Value::Number(n) => {
            let s = n.to_string();
            Decimal::from_str(&s)
                .or_else(|_| Decimal::from_scientific(&s))
                .ok()
        }
        _ => None,
    }
}
