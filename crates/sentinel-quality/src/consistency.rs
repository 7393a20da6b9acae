//! WebSocket vs REST arbitration.
//!
//! Every stream payload passes through [`DataConsistencyManager::process_websocket_message`],
//! which validates it, tracks continuity and updates the health record of
//! the stream it arrived on. Health is keyed per stream
//! ([`DataType::stream_key`]), so a silent kline stream is noticed even while
//! the symbol's book ticker keeps flowing. Periodic freshness checks turn
//! unhealthy or silent streams into [`FallbackDecision`]s, which callers
//! execute against REST.

use crate::error::{FallbackError, FallbackResult};
use crate::gap::{DataGapHandler, GapConfig, GapRepair, GapStats, SymbolBuffer};
use crate::health::{HealthConfig, HealthRecord, HealthStatus, SourceType};
use crate::monitor::{DataQualityMonitor, QualityConfig, QualityReport};
use parking_lot::{Mutex, RwLock};
use sentinel_core::{now_ms, Interval, KlineBar, Position, PriceQuote, Symbol};
use sentinel_rest::{ExchangeRest, RestError, RestResult};
use sentinel_telemetry::Metrics;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Acceptance rate below which every symbol is penalized.
const ACCEPTANCE_FLOOR: f64 = 0.85;
const ACCEPTANCE_PENALTY: f64 = 0.8;
const GAP_COUNT_LIMIT: u64 = 10;
const GAP_PENALTY: f64 = 0.9;
const OUT_OF_ORDER_LIMIT: u64 = 5;
const OUT_OF_ORDER_PENALTY: f64 = 0.95;

/// Data requested from REST by a fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    Kline(Interval),
    Price,
    Position,
}

impl DataType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Kline(_) => "kline",
            Self::Price => "price",
            Self::Position => "position",
        }
    }

    /// Health, continuity and cooldown key of this data on `symbol`.
    ///
    /// Market data is keyed per stream (`BTCUSDT@kline_1m`,
    /// `BTCUSDT@bookTicker`); positions use the key as given.
    pub fn stream_key(&self, symbol: &str) -> String {
        match self {
            Self::Kline(interval) => format!("{symbol}@kline_{interval}"),
            Self::Price => format!("{symbol}@bookTicker"),
            Self::Position => symbol.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FallbackReason {
    NoData,
    Stale { age_ms: i64 },
    Unavailable { consecutive_errors: u32 },
    Degraded { quality_score: f64 },
}

impl fmt::Display for FallbackReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoData => write!(f, "no data"),
            Self::Stale { age_ms } => write!(f, "data stale for {age_ms}ms"),
            Self::Unavailable { consecutive_errors } => write!(
                f,
                "websocket unavailable after {consecutive_errors} consecutive errors"
            ),
            Self::Degraded { quality_score } => {
                write!(f, "quality degraded (score {quality_score:.2})")
            }
        }
    }
}

/// Advice to read a symbol from REST. Produced per freshness check.
#[derive(Debug, Clone, PartialEq)]
pub struct FallbackDecision {
    pub should_fallback: bool,
    pub reason: FallbackReason,
    pub target: SourceType,
    pub estimated_recovery_ms: i64,
}

/// Payload returned by a successful fallback.
#[derive(Debug, Clone, PartialEq)]
pub enum FallbackData {
    Klines(Vec<KlineBar>),
    Price(PriceQuote),
    Positions(Vec<Position>),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FallbackStats {
    pub total: u64,
    pub successful: u64,
    pub failed: u64,
    /// successful / total, 1.0 before any fallback.
    pub success_rate: f64,
    pub active: usize,
}

/// Aggregate health report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthSummary {
    /// Streams with a health record.
    pub streams: usize,
    pub healthy: usize,
    pub degraded: usize,
    pub unavailable: usize,
    pub fallback: FallbackStats,
    pub quality: QualityReport,
    pub gaps: GapStats,
    pub gap_repairs: u64,
    pub uptime_secs: u64,
}

#[derive(Debug, Default)]
struct SymbolHealth {
    websocket: Option<HealthRecord>,
    rest: Option<HealthRecord>,
}

impl SymbolHealth {
    fn slot(&mut self, source: SourceType) -> &mut Option<HealthRecord> {
        match source {
            SourceType::WebSocket => &mut self.websocket,
            SourceType::Rest => &mut self.rest,
        }
    }

    fn get(&self, source: SourceType) -> Option<&HealthRecord> {
        match source {
            SourceType::WebSocket => self.websocket.as_ref(),
            SourceType::Rest => self.rest.as_ref(),
        }
    }
}

#[derive(Debug, Default)]
struct FallbackState {
    last_started_ms: i64,
    active: bool,
}

/// Clears the active flag when the fallback call ends, including on
/// cancellation.
struct ActiveFallback<'a> {
    fallbacks: &'a Mutex<HashMap<String, FallbackState>>,
    stream: &'a str,
}

impl Drop for ActiveFallback<'_> {
    fn drop(&mut self) {
        if let Some(state) = self.fallbacks.lock().get_mut(self.stream) {
            state.active = false;
        }
    }
}

pub struct DataConsistencyManager {
    config: HealthConfig,
    monitor: DataQualityMonitor,
    gaps: DataGapHandler,
    rest: Option<Arc<dyn ExchangeRest>>,
    health: RwLock<HashMap<String, SymbolHealth>>,
    fallbacks: Mutex<HashMap<String, FallbackState>>,
    fallback_total: AtomicU64,
    fallback_successful: AtomicU64,
    fallback_failed: AtomicU64,
    gap_repairs: AtomicU64,
    started_at: Instant,
}

impl DataConsistencyManager {
    pub fn new(
        config: HealthConfig,
        quality: QualityConfig,
        gap: GapConfig,
        rest: Option<Arc<dyn ExchangeRest>>,
    ) -> Self {
        Self {
            config,
            monitor: DataQualityMonitor::new(quality),
            gaps: DataGapHandler::new(gap),
            rest,
            health: RwLock::new(HashMap::new()),
            fallbacks: Mutex::new(HashMap::new()),
            fallback_total: AtomicU64::new(0),
            fallback_successful: AtomicU64::new(0),
            fallback_failed: AtomicU64::new(0),
            gap_repairs: AtomicU64::new(0),
            started_at: Instant::now(),
        }
    }

    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    pub fn monitor(&self) -> &DataQualityMonitor {
        &self.monitor
    }

    pub fn has_rest(&self) -> bool {
        self.rest.is_some()
    }

    // =========================================================================
    // Observation
    // =========================================================================

    /// Validate a payload and fold the result into the WebSocket health of
    /// `stream`, which also keys continuity.
    ///
    /// Returns true if the payload was accepted. Rejected payloads must not
    /// be applied to any store.
    pub fn process_websocket_message(&self, stream: &str, msg: &Value, latency_ms: f64) -> bool {
        self.process_websocket_message_as(stream, stream, msg, latency_ms)
    }

    /// Like [`process_websocket_message`](Self::process_websocket_message)
    /// for streams that multiplex several event types under one health
    /// record. Each event type gets its own `continuity_key`.
    pub fn process_websocket_message_as(
        &self,
        health_key: &str,
        continuity_key: &str,
        msg: &Value,
        latency_ms: f64,
    ) -> bool {
        let accepted = self.monitor.validate_message(msg).is_ok();
        if accepted {
            self.monitor.check_continuity(continuity_key, msg);
        }

        let penalty = Self::report_penalty(&self.monitor.report());
        self.observe(health_key, SourceType::WebSocket, accepted, latency_ms, penalty);
        accepted
    }

    /// Multiplicative score adjustment derived from the aggregate report.
    fn report_penalty(report: &QualityReport) -> f64 {
        let mut factor = 1.0;
        if report.acceptance_rate < ACCEPTANCE_FLOOR {
            factor *= ACCEPTANCE_PENALTY;
        }
        if report.gaps > GAP_COUNT_LIMIT {
            factor *= GAP_PENALTY;
        }
        if report.out_of_order > OUT_OF_ORDER_LIMIT {
            factor *= OUT_OF_ORDER_PENALTY;
        }
        factor
    }

    pub fn update_websocket_health(&self, symbol: &str, ok: bool, latency_ms: f64) -> HealthRecord {
        self.observe(symbol, SourceType::WebSocket, ok, latency_ms, 1.0)
    }

    pub fn update_rest_health(&self, symbol: &str, ok: bool, latency_ms: f64) -> HealthRecord {
        self.observe(symbol, SourceType::Rest, ok, latency_ms, 1.0)
    }

    fn observe(
        &self,
        symbol: &str,
        source: SourceType,
        ok: bool,
        latency_ms: f64,
        penalty: f64,
    ) -> HealthRecord {
        let now = now_ms();
        let (previous, record) = {
            let mut health = self.health.write();
            let slot = health.entry(symbol.to_string()).or_default().slot(source);
            let record = slot.get_or_insert_with(|| HealthRecord::new(source, now));
            let previous = record.status;
            record.observe(ok, latency_ms, now, &self.config);
            if penalty < 1.0 {
                record.apply_penalty(penalty, &self.config);
            }
            (previous, record.clone())
        };

        if previous != record.status {
            match record.status {
                HealthStatus::Healthy => info!(
                    symbol,
                    %source,
                    score = record.quality_score,
                    "Data source recovered"
                ),
                status => warn!(
                    symbol,
                    %source,
                    ?status,
                    score = record.quality_score,
                    consecutive_errors = record.consecutive_errors,
                    "Data source health changed"
                ),
            }
        }
        Metrics::quality_score(symbol, source.as_str(), record.quality_score);
        record
    }

    pub fn get_health(&self, symbol: &str, source: SourceType) -> Option<HealthRecord> {
        self.health
            .read()
            .get(symbol)
            .and_then(|h| h.get(source))
            .cloned()
    }

    /// Streams with a WebSocket health record, sorted.
    pub fn tracked_streams(&self) -> Vec<String> {
        let mut streams: Vec<String> = self
            .health
            .read()
            .iter()
            .filter(|(_, h)| h.websocket.is_some())
            .map(|(s, _)| s.clone())
            .collect();
        streams.sort();
        streams
    }

    // =========================================================================
    // Fallback
    // =========================================================================

    /// Decide whether a stream should be read from REST. `stream` is a key
    /// from [`DataType::stream_key`].
    ///
    /// Returns `None` when the stream is healthy or a fallback for it
    /// started within the cooldown window.
    pub fn check_data_freshness(&self, stream: &str) -> Option<FallbackDecision> {
        self.freshness_at(stream, now_ms())
    }

    pub(crate) fn freshness_at(&self, stream: &str, now: i64) -> Option<FallbackDecision> {
        let (reason, estimated_recovery_ms) = {
            let health = self.health.read();
            match health.get(stream).and_then(|h| h.websocket.as_ref()) {
                None => (FallbackReason::NoData, self.config.data_timeout_ms),
                Some(record) => {
                    let age_ms = record.age_ms(now);
                    if age_ms > self.config.data_timeout_ms {
                        (FallbackReason::Stale { age_ms }, self.config.data_timeout_ms)
                    } else if record.status == HealthStatus::Unavailable {
                        (
                            FallbackReason::Unavailable {
                                consecutive_errors: record.consecutive_errors,
                            },
                            self.config.fallback_cooldown_ms,
                        )
                    } else if record.status == HealthStatus::Degraded {
                        (
                            FallbackReason::Degraded {
                                quality_score: record.quality_score,
                            },
                            self.config.fallback_cooldown_ms / 2,
                        )
                    } else {
                        return None;
                    }
                }
            }
        };

        if let Some(state) = self.fallbacks.lock().get(stream) {
            let since = now - state.last_started_ms;
            if since < self.config.fallback_cooldown_ms {
                debug!(stream, since_ms = since, %reason, "Fallback suppressed by cooldown");
                return None;
            }
        }

        Some(FallbackDecision {
            should_fallback: true,
            reason,
            target: SourceType::Rest,
            estimated_recovery_ms,
        })
    }

    /// Fetch `data_type` for `symbol` from REST with bounded retries.
    ///
    /// Cooldown and REST health are recorded under
    /// `data_type.stream_key(symbol)`.
    pub async fn execute_fallback(
        &self,
        symbol: &str,
        data_type: DataType,
        decision: &FallbackDecision,
    ) -> FallbackResult<FallbackData> {
        self.fallback_total.fetch_add(1, Ordering::Relaxed);
        let stream = data_type.stream_key(symbol);
        let result = match self.rest.clone() {
            None => Err(FallbackError::NoRestClient),
            Some(rest) => {
                let _active = self.begin_fallback(&stream);
                info!(
                    %stream,
                    data_type = data_type.as_str(),
                    reason = %decision.reason,
                    "Executing REST fallback"
                );
                self.fetch_with_retry(rest.as_ref(), symbol, &stream, data_type)
                    .await
            }
        };

        match &result {
            Ok(_) => {
                self.fallback_successful.fetch_add(1, Ordering::Relaxed);
                Metrics::fallback(data_type.as_str(), true);
            }
            Err(e) => {
                self.fallback_failed.fetch_add(1, Ordering::Relaxed);
                Metrics::fallback(data_type.as_str(), false);
                warn!(symbol, data_type = data_type.as_str(), error = %e, "REST fallback failed");
            }
        }
        result
    }

    fn begin_fallback<'a>(&'a self, stream: &'a str) -> ActiveFallback<'a> {
        let mut fallbacks = self.fallbacks.lock();
        let state = fallbacks.entry(stream.to_string()).or_default();
        state.active = true;
        state.last_started_ms = now_ms();
        ActiveFallback {
            fallbacks: &self.fallbacks,
            stream,
        }
    }

    async fn fetch_with_retry(
        &self,
        rest: &dyn ExchangeRest,
        symbol: &str,
        stream: &str,
        data_type: DataType,
    ) -> FallbackResult<FallbackData> {
        let market = match data_type {
            DataType::Position => None,
            DataType::Kline(_) | DataType::Price => Some(
                Symbol::new(symbol).map_err(|_| FallbackError::InvalidSymbol(symbol.to_string()))?,
            ),
        };

        let attempts = self.config.fallback_max_retries.max(1);
        let timeout = Duration::from_millis(self.config.rest_timeout_ms);
        let mut delay = Duration::from_millis(self.config.fallback_retry_delay_ms);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            let started = Instant::now();
            let outcome =
                tokio::time::timeout(timeout, self.fetch_once(rest, market.as_ref(), data_type))
                    .await;
            let elapsed_ms = started.elapsed().as_secs_f64() * 1_000.0;

            match outcome {
                Ok(Ok(data)) => {
                    self.update_rest_health(stream, true, elapsed_ms);
                    return Ok(data);
                }
                Ok(Err(e)) => {
                    self.update_rest_health(stream, false, elapsed_ms);
                    if !e.is_retryable() {
                        return Err(FallbackError::Rest(e));
                    }
                    last_error = e.to_string();
                }
                Err(_) => {
                    self.update_rest_health(stream, false, elapsed_ms);
                    last_error = format!("timed out after {}ms", self.config.rest_timeout_ms);
                }
            }

            debug!(stream, attempt, attempts, error = %last_error, "REST fallback attempt failed");
            if attempt < attempts {
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
        }

        Err(FallbackError::Exhausted {
            attempts,
            last_error,
        })
    }

    async fn fetch_once(
        &self,
        rest: &dyn ExchangeRest,
        market: Option<&Symbol>,
        data_type: DataType,
    ) -> RestResult<FallbackData> {
        match (data_type, market) {
            (DataType::Kline(interval), Some(symbol)) => rest
                .get_klines(symbol.clone(), interval, self.config.fallback_kline_limit)
                .await
                .map(FallbackData::Klines),
            (DataType::Price, Some(symbol)) => rest
                .get_ticker(symbol.clone())
                .await
                .map(FallbackData::Price),
            (DataType::Position, _) => rest
                .get_position_info()
                .await
                .map(FallbackData::Positions),
            (_, None) => Err(RestError::Decode(format!(
                "{} fallback needs a symbol",
                data_type.as_str()
            ))),
        }
    }

    /// True while a fallback call for the stream is in flight.
    pub fn is_fallback_active(&self, stream: &str) -> bool {
        self.fallbacks
            .lock()
            .get(stream)
            .is_some_and(|s| s.active)
    }

    // =========================================================================
    // Gaps
    // =========================================================================

    /// Backfill a stalled symbol through the gap handler.
    pub async fn auto_repair_data_gaps(&self, buffer: &SymbolBuffer) -> Option<GapRepair> {
        let repair = self
            .gaps
            .detect_and_repair(buffer, self.rest.as_deref())
            .await;
        if repair.is_some() {
            self.gap_repairs.fetch_add(1, Ordering::Relaxed);
        }
        repair
    }

    // =========================================================================
    // Reporting
    // =========================================================================

    pub fn fallback_stats(&self) -> FallbackStats {
        let total = self.fallback_total.load(Ordering::Relaxed);
        let successful = self.fallback_successful.load(Ordering::Relaxed);
        FallbackStats {
            total,
            successful,
            failed: self.fallback_failed.load(Ordering::Relaxed),
            success_rate: if total == 0 {
                1.0
            } else {
                successful as f64 / total as f64
            },
            active: self.fallbacks.lock().values().filter(|s| s.active).count(),
        }
    }

    pub fn get_health_summary(&self) -> HealthSummary {
        let (mut healthy, mut degraded, mut unavailable) = (0, 0, 0);
        let streams = {
            let health = self.health.read();
            for record in health.values().filter_map(|h| h.websocket.as_ref()) {
                match record.status {
                    HealthStatus::Healthy => healthy += 1,
                    HealthStatus::Degraded => degraded += 1,
                    HealthStatus::Unavailable => unavailable += 1,
                }
            }
            health.len()
        };

        HealthSummary {
            streams,
            healthy,
            degraded,
            unavailable,
            fallback: self.fallback_stats(),
            quality: self.monitor.report(),
            gaps: self.gaps.stats(),
            gap_repairs: self.gap_repairs.load(Ordering::Relaxed),
            uptime_secs: self.started_at.elapsed().as_secs(),
        }
    }
}
