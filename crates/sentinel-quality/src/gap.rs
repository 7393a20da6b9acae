//! Stale-symbol detection and REST backfill.

use parking_lot::Mutex;
use sentinel_core::{now_ms, Interval, KlineBar, Symbol};
use sentinel_rest::{ExchangeRest, MAX_KLINE_LIMIT};
use sentinel_telemetry::Metrics;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GapConfig {
    /// Gaps longer than this trigger a backfill.
    #[serde(default = "default_major_gap_ms")]
    pub major_gap_ms: i64,

    /// Timeout of each backfill request.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

fn default_major_gap_ms() -> i64 {
    300_000
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

impl Default for GapConfig {
    fn default() -> Self {
        Self {
            major_gap_ms: default_major_gap_ms(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

/// Latest bar close time per tracked interval for one symbol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolBuffer {
    pub symbol: Symbol,
    pub last_close_ms: BTreeMap<Interval, i64>,
}

impl SymbolBuffer {
    pub fn new(symbol: Symbol) -> Self {
        Self {
            symbol,
            last_close_ms: BTreeMap::new(),
        }
    }

    pub fn with_interval(mut self, interval: Interval, last_close_ms: i64) -> Self {
        self.last_close_ms.insert(interval, last_close_ms);
        self
    }

    /// Most recent timestamp across all intervals.
    pub fn latest_ms(&self) -> Option<i64> {
        self.last_close_ms.values().copied().max()
    }
}

/// Result of handling one major gap.
#[derive(Debug, Clone, PartialEq)]
pub struct GapRepair {
    pub symbol: Symbol,
    pub gap_ms: i64,
    /// Backfilled closed bars inside the missing window, oldest first per
    /// interval.
    pub bars: Vec<KlineBar>,
    /// True when every interval was backfilled.
    pub fixed: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GapStats {
    pub detected: u64,
    pub fixed: u64,
    pub unfixed: u64,
    pub recovered_points: u64,
    /// Duration of the most recent major gap per symbol.
    pub last_gap_ms: BTreeMap<String, i64>,
}

#[derive(Debug, Default)]
pub struct DataGapHandler {
    config: GapConfig,
    stats: Mutex<GapStats>,
}

impl DataGapHandler {
    pub fn new(config: GapConfig) -> Self {
        Self {
            config,
            stats: Mutex::new(GapStats::default()),
        }
    }

    pub fn config(&self) -> &GapConfig {
        &self.config
    }

    /// Check a buffer and backfill if it has fallen behind.
    ///
    /// Returns `None` when there is no major gap. Without a REST client the
    /// gap is recorded as detected but unfixed.
    pub async fn detect_and_repair(
        &self,
        buffer: &SymbolBuffer,
        rest: Option<&dyn ExchangeRest>,
    ) -> Option<GapRepair> {
        self.repair_at(buffer, rest, now_ms()).await
    }

    pub(crate) async fn repair_at(
        &self,
        buffer: &SymbolBuffer,
        rest: Option<&dyn ExchangeRest>,
        now: i64,
    ) -> Option<GapRepair> {
        // Only intervals whose next close is overdue by more than the
        // threshold count; a 1h bar closed 10 minutes ago is on schedule.
        let stale: Vec<(Interval, i64)> = buffer
            .last_close_ms
            .iter()
            .map(|(&interval, &last_close)| (interval, last_close))
            .filter(|&(interval, last_close)| {
                overdue_ms(interval, last_close, now) > self.config.major_gap_ms
            })
            .collect();
        let gap_ms = stale.iter().map(|&(_, last_close)| now - last_close).max()?;

        {
            let mut stats = self.stats.lock();
            stats.detected += 1;
            stats
                .last_gap_ms
                .insert(buffer.symbol.to_string(), gap_ms);
        }
        Metrics::gap("detected");

        let Some(rest) = rest else {
            warn!(symbol = %buffer.symbol, gap_ms, "Major data gap, no REST client for backfill");
            self.record_unfixed();
            return Some(GapRepair {
                symbol: buffer.symbol.clone(),
                gap_ms,
                bars: Vec::new(),
                fixed: false,
            });
        };

        let mut bars = Vec::new();
        let mut fixed = true;
        for (interval, last_close) in stale {
            match self
                .backfill_interval(rest, &buffer.symbol, interval, last_close, now)
                .await
            {
                Ok(mut recovered) => bars.append(&mut recovered),
                Err(e) => {
                    warn!(
                        symbol = %buffer.symbol,
                        %interval,
                        error = %e,
                        "Gap backfill failed"
                    );
                    fixed = false;
                }
            }
        }

        if fixed {
            let mut stats = self.stats.lock();
            stats.fixed += 1;
            stats.recovered_points += bars.len() as u64;
            drop(stats);
            Metrics::gap("fixed");
            info!(
                symbol = %buffer.symbol,
                gap_ms,
                recovered = bars.len(),
                "Data gap repaired from REST"
            );
        } else {
            self.stats.lock().recovered_points += bars.len() as u64;
            self.record_unfixed();
        }
        Metrics::gap_recovered(bars.len());

        Some(GapRepair {
            symbol: buffer.symbol.clone(),
            gap_ms,
            bars,
            fixed,
        })
    }

    async fn backfill_interval(
        &self,
        rest: &dyn ExchangeRest,
        symbol: &Symbol,
        interval: Interval,
        last_close: i64,
        now: i64,
    ) -> Result<Vec<KlineBar>, String> {
        let missing = ((now - last_close) / interval.duration_ms()).max(0) as u64;
        let limit = (missing + 1).min(u64::from(MAX_KLINE_LIMIT)) as u32;
        let request = rest.get_klines(symbol.clone(), interval, limit);
        let bars = tokio::time::timeout(
            Duration::from_millis(self.config.request_timeout_ms),
            request,
        )
        .await
        .map_err(|_| format!("timed out after {}ms", self.config.request_timeout_ms))?
        .map_err(|e| e.to_string())?;

        Ok(bars
            .into_iter()
            .filter(|b| b.is_final && b.open_time > last_close)
            .collect())
    }

    fn record_unfixed(&self) {
        self.stats.lock().unfixed += 1;
        Metrics::gap("unfixed");
    }

    pub fn stats(&self) -> GapStats {
        self.stats.lock().clone()
    }
}

/// Time past the expected close of the bar after `last_close`.
fn overdue_ms(interval: Interval, last_close: i64, now: i64) -> i64 {
    now - (last_close + interval.duration_ms())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use sentinel_rest::MockExchangeRest;

    const MINUTE: i64 = 60_000;

    fn sym() -> Symbol {
        Symbol::new("BTCUSDT").unwrap()
    }

    fn bar(open_time: i64) -> KlineBar {
        KlineBar {
            symbol: sym(),
            interval: Interval::M1,
            open_time,
            close_time: open_time + MINUTE - 1,
            open: dec!(100),
            high: dec!(101),
            low: dec!(99),
            close: dec!(100),
            volume: dec!(1),
            server_ts: open_time,
            local_ts: open_time,
            latency_ms: 0,
            shard_id: None,
            is_final: true,
        }
    }

    #[tokio::test]
    async fn test_no_gap_below_threshold() {
        let handler = DataGapHandler::default();
        let buffer = SymbolBuffer::new(sym()).with_interval(Interval::M1, 0);
        assert!(handler.repair_at(&buffer, None, 4 * MINUTE).await.is_none());
        assert_eq!(handler.stats().detected, 0);
    }

    #[tokio::test]
    async fn test_gap_measured_against_interval() {
        let handler = DataGapHandler::default();
        let now = 100 * 60 * MINUTE;

        // Hourly bar closed 10 minutes ago: the next one is not due yet.
        let on_schedule = SymbolBuffer::new(sym()).with_interval(Interval::H1, now - 10 * MINUTE);
        assert!(handler.repair_at(&on_schedule, None, now).await.is_none());

        // Five-minute bar closed nine minutes ago: four minutes overdue.
        let five = SymbolBuffer::new(sym()).with_interval(Interval::M5, now - 9 * MINUTE);
        assert!(handler.repair_at(&five, None, now).await.is_none());
        assert_eq!(handler.stats().detected, 0);

        // Hourly bar closed two hours ago: a whole bar is missing.
        let stalled = SymbolBuffer::new(sym()).with_interval(Interval::H1, now - 120 * MINUTE);
        let repair = handler.repair_at(&stalled, None, now).await.unwrap();
        assert_eq!(repair.gap_ms, 120 * MINUTE);
        assert_eq!(handler.stats().detected, 1);
    }

    #[tokio::test]
    async fn test_only_overdue_intervals_backfilled() {
        let handler = DataGapHandler::default();
        let rest = MockExchangeRest::new();
        rest.set_klines(sym(), Interval::M1, (0..10).map(|i| bar(i * MINUTE)).collect());
        let buffer = SymbolBuffer::new(sym())
            .with_interval(Interval::M1, 2 * MINUTE - 1)
            .with_interval(Interval::H1, 10 * MINUTE - 30 * MINUTE);

        let repair = handler
            .repair_at(&buffer, Some(&rest as &dyn ExchangeRest), 10 * MINUTE)
            .await
            .unwrap();
        assert!(repair.fixed);
        assert_eq!(rest.call_count("get_klines"), 1);
        assert!(repair.bars.iter().all(|b| b.interval == Interval::M1));
    }

    #[tokio::test]
    async fn test_empty_buffer_ignored() {
        let handler = DataGapHandler::default();
        assert!(handler
            .repair_at(&SymbolBuffer::new(sym()), None, i64::MAX)
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_gap_without_rest_is_unfixed() {
        let handler = DataGapHandler::default();
        let buffer = SymbolBuffer::new(sym()).with_interval(Interval::M1, 0);
        let repair = handler.repair_at(&buffer, None, 10 * MINUTE).await.unwrap();
        assert!(!repair.fixed);
        assert!(repair.bars.is_empty());
        let stats = handler.stats();
        assert_eq!(stats.detected, 1);
        assert_eq!(stats.unfixed, 1);
        assert_eq!(stats.last_gap_ms["BTCUSDT"], 10 * MINUTE);
    }

    #[tokio::test]
    async fn test_gap_backfilled_from_rest() {
        let handler = DataGapHandler::default();
        let rest = MockExchangeRest::new();
        // Bars 0..=9 minutes; the buffer last saw the bar closing at 3m.
        rest.set_klines(sym(), Interval::M1, (0..10).map(|i| bar(i * MINUTE)).collect());
        let buffer = SymbolBuffer::new(sym()).with_interval(Interval::M1, 4 * MINUTE - 1);

        let repair = handler
            .repair_at(&buffer, Some(&rest as &dyn ExchangeRest), 10 * MINUTE)
            .await
            .unwrap();
        assert!(repair.fixed);
        let opens: Vec<i64> = repair.bars.iter().map(|b| b.open_time / MINUTE).collect();
        assert_eq!(opens, vec![4, 5, 6, 7, 8, 9]);
        let stats = handler.stats();
        assert_eq!(stats.fixed, 1);
        assert_eq!(stats.recovered_points, 6);
    }

    #[tokio::test]
    async fn test_rest_failure_leaves_gap_unfixed() {
        let handler = DataGapHandler::default();
        let rest = MockExchangeRest::new();
        rest.set_failing(true);
        let buffer = SymbolBuffer::new(sym()).with_interval(Interval::M1, 0);
        let repair = handler
            .repair_at(&buffer, Some(&rest as &dyn ExchangeRest), 10 * MINUTE)
            .await
            .unwrap();
        assert!(!repair.fixed);
        assert_eq!(handler.stats().unfixed, 1);
        assert_eq!(rest.call_count("get_klines"), 1);
    }
}
