//! Market data types.

use crate::symbol::{Interval, Symbol};
use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Current wall-clock time in epoch milliseconds.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// OHLCV bar.
///
/// Only closed (`is_final`) bars are retained in history; in-progress bars
/// are discarded when the stream is decoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KlineBar {
    pub symbol: Symbol,
    pub interval: Interval,
    /// Bar open time (epoch ms).
    pub open_time: i64,
    /// Bar close time (epoch ms).
    pub close_time: i64,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    /// Exchange event time (epoch ms).
    pub server_ts: i64,
    /// Local receipt time (epoch ms).
    pub local_ts: i64,
    /// `local_ts - server_ts`, floored at zero.
    pub latency_ms: i64,
    /// Shard that delivered the bar. REST backfill uses `None`.
    pub shard_id: Option<usize>,
    pub is_final: bool,
}

impl KlineBar {
    /// Derive latency from server and local timestamps.
    pub fn latency_between(server_ts: i64, local_ts: i64) -> i64 {
        (local_ts - server_ts).max(0)
    }
}

/// Top of book for one symbol. Latest value wins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceQuote {
    pub symbol: Symbol,
    pub bid: Decimal,
    pub ask: Decimal,
    pub bid_qty: Decimal,
    pub ask_qty: Decimal,
    /// Exchange event time (epoch ms).
    pub server_ts: i64,
    /// Local receipt time (epoch ms).
    pub local_ts: i64,
}

impl PriceQuote {
    /// Mid price: (bid + ask) / 2.
    ///
    /// Returns None when either side is missing.
    pub fn mid_price(&self) -> Option<Decimal> {
        if self.bid <= Decimal::ZERO || self.ask <= Decimal::ZERO {
            return None;
        }
        Some((self.bid + self.ask) / Decimal::TWO)
    }

    /// Spread in basis points relative to mid.
    pub fn spread_bps(&self) -> Option<Decimal> {
        let mid = self.mid_price()?;
        Some((self.ask - self.bid) / mid * Decimal::from(10_000))
    }

    /// Age in milliseconds since local receipt.
    pub fn age_ms(&self) -> i64 {
        now_ms() - self.local_ts
    }
}
