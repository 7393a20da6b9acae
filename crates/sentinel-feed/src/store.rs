//! Shared market data store.
//!
//! One entry per symbol holding the latest quote and a bounded bar history
//! per interval. Shards write, the query surface reads copies.

use dashmap::DashMap;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use sentinel_core::{now_ms, Interval, KlineBar, PriceQuote, RingBuffer, Symbol};
use sentinel_quality::SymbolBuffer;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::trace;

/// Bars kept per symbol and interval by default.
pub const DEFAULT_HISTORY_CAPACITY: usize = 500;

/// Downstream consumer of flushed bar batches.
pub trait BarSink: Send + Sync {
    fn on_bars(&self, bars: Vec<KlineBar>);
}

#[derive(Debug)]
struct SymbolEntry {
    quote: Option<PriceQuote>,
    bars: HashMap<Interval, RingBuffer<KlineBar>>,
    last_update_ms: i64,
}

impl SymbolEntry {
    fn new() -> Self {
        Self {
            quote: None,
            bars: HashMap::new(),
            last_update_ms: 0,
        }
    }
}

type StoreEntry = Arc<RwLock<SymbolEntry>>;

pub struct MarketStore {
    history_capacity: usize,
    entries: DashMap<Symbol, StoreEntry>,
}

impl Default for MarketStore {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}

impl MarketStore {
    pub fn new(history_capacity: usize) -> Self {
        Self {
            history_capacity: history_capacity.max(1),
            entries: DashMap::new(),
        }
    }

    fn get_or_create(&self, symbol: &Symbol) -> StoreEntry {
        if let Some(entry) = self.entries.get(symbol) {
            return entry.clone();
        }
        self.entries
            .entry(symbol.clone())
            .or_insert_with(|| Arc::new(RwLock::new(SymbolEntry::new())))
            .clone()
    }

    fn get(&self, symbol: &str) -> Option<StoreEntry> {
        self.entries.get(symbol).map(|e| e.clone())
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Replace the quote for its symbol.
    pub fn update_quote(&self, quote: PriceQuote) {
        let entry = self.get_or_create(&quote.symbol);
        let mut guard = entry.write();
        guard.quote = Some(quote);
        guard.last_update_ms = now_ms();
    }

    /// Add a closed bar to the history.
    ///
    /// A bar with the same open time as the newest one replaces it; older
    /// bars and in-progress bars are ignored. Returns true if stored.
    pub fn insert_bar(&self, bar: KlineBar) -> bool {
        if !bar.is_final {
            return false;
        }
        let entry = self.get_or_create(&bar.symbol);
        let mut guard = entry.write();
        let capacity = self.history_capacity;
        let ring = guard
            .bars
            .entry(bar.interval)
            .or_insert_with(|| RingBuffer::new(capacity));

        let newest_open = ring.latest().map(|b| b.open_time);
        let stored = match newest_open {
            Some(open_time) if open_time == bar.open_time => {
                if let Some(latest) = ring.latest_mut() {
                    *latest = bar;
                }
                true
            }
            Some(open_time) if open_time > bar.open_time => {
                trace!(symbol = %bar.symbol, open_time = bar.open_time, "Ignoring stale bar");
                false
            }
            _ => {
                ring.push(bar);
                true
            }
        };
        if stored {
            guard.last_update_ms = now_ms();
        }
        stored
    }

    /// Insert bars oldest first. Returns how many were stored.
    pub fn insert_bars(&self, mut bars: Vec<KlineBar>) -> usize {
        bars.sort_by_key(|b| b.open_time);
        bars.into_iter()
            .map(|b| self.insert_bar(b))
            .filter(|stored| *stored)
            .count()
    }

    // =========================================================================
    // Reads
    // =========================================================================

    pub fn get_price(&self, symbol: &str) -> Option<PriceQuote> {
        self.get(symbol).and_then(|entry| {
            let guard = entry.read();
            guard.quote.clone()
        })
    }

    pub fn get_mid_price(&self, symbol: &str) -> Option<Decimal> {
        self.get_price(symbol).and_then(|q| q.mid_price())
    }

    pub fn get_spread_bps(&self, symbol: &str) -> Option<Decimal> {
        self.get_price(symbol).and_then(|q| q.spread_bps())
    }

    /// Newest closed bar.
    pub fn get_kline(&self, symbol: &str, interval: Interval) -> Option<KlineBar> {
        self.get(symbol).and_then(|entry| {
            let guard = entry.read();
            guard.bars.get(&interval).and_then(|r| r.latest().cloned())
        })
    }

    /// Up to `limit` newest bars, oldest first.
    pub fn get_kline_history(&self, symbol: &str, interval: Interval, limit: usize) -> Vec<KlineBar> {
        self.get(symbol)
            .map(|entry| {
                let guard = entry.read();
                guard
                    .bars
                    .get(&interval)
                    .map(|r| r.last_n(limit))
                    .unwrap_or_default()
            })
            .unwrap_or_default()
    }

    /// Last bar close time per interval, for gap detection.
    pub fn symbol_buffer(&self, symbol: &str) -> Option<SymbolBuffer> {
        let entry = self.entries.get(symbol)?;
        let guard = entry.read();
        let mut buffer = SymbolBuffer::new(entry.key().clone());
        for (interval, ring) in &guard.bars {
            if let Some(latest) = ring.latest() {
                buffer.last_close_ms.insert(*interval, latest.close_time);
            }
        }
        Some(buffer)
    }

    /// Epoch ms of the last write for a symbol.
    pub fn last_update_ms(&self, symbol: &str) -> Option<i64> {
        self.get(symbol)
            .map(|entry| {
                let guard = entry.read();
                guard.last_update_ms
            })
            .filter(|ts| *ts > 0)
    }

    /// All symbols with an entry, sorted.
    pub fn symbols(&self) -> Vec<Symbol> {
        let mut symbols: Vec<Symbol> = self.entries.iter().map(|e| e.key().clone()).collect();
        symbols.sort();
        symbols
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl BarSink for MarketStore {
    fn on_bars(&self, bars: Vec<KlineBar>) {
        self.insert_bars(bars);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    const MINUTE: i64 = 60_000;

    fn sym(s: &str) -> Symbol {
        Symbol::new(s).unwrap()
    }

    fn bar(symbol: &str, open_time: i64, close: Decimal) -> KlineBar {
        KlineBar {
            symbol: sym(symbol),
            interval: Interval::M1,
            open_time,
            close_time: open_time + MINUTE - 1,
            open: close,
            high: close,
            low: close,
            close,
            volume: dec!(1),
            server_ts: open_time + MINUTE,
            local_ts: open_time + MINUTE,
            latency_ms: 0,
            shard_id: Some(0),
            is_final: true,
        }
    }

    #[test]
    fn test_quote_reads() {
        let store = MarketStore::default();
        store.update_quote(PriceQuote {
            symbol: sym("BTCUSDT"),
            bid: dec!(99.95),
            ask: dec!(100.05),
            bid_qty: dec!(1),
            ask_qty: dec!(2),
            server_ts: 0,
            local_ts: 0,
        });
        assert_eq!(store.get_mid_price("BTCUSDT"), Some(dec!(100)));
        assert_eq!(store.get_spread_bps("BTCUSDT"), Some(dec!(10)));
        assert!(store.get_price("ETHUSDT").is_none());
    }

    #[test]
    fn test_history_bounded_oldest_evicted() {
        let store = MarketStore::new(3);
        for i in 0..5 {
            assert!(store.insert_bar(bar("BTCUSDT", i * MINUTE, Decimal::from(i))));
        }
        let history = store.get_kline_history("BTCUSDT", Interval::M1, 10);
        let opens: Vec<i64> = history.iter().map(|b| b.open_time / MINUTE).collect();
        assert_eq!(opens, vec![2, 3, 4]);
        assert_eq!(store.get_kline("BTCUSDT", Interval::M1).unwrap().close, dec!(4));
        assert_eq!(store.get_kline_history("BTCUSDT", Interval::M1, 2).len(), 2);
    }

    #[test]
    fn test_same_open_time_replaces_and_stale_ignored() {
        let store = MarketStore::default();
        store.insert_bar(bar("BTCUSDT", MINUTE, dec!(1)));
        assert!(store.insert_bar(bar("BTCUSDT", MINUTE, dec!(2))));
        assert!(!store.insert_bar(bar("BTCUSDT", 0, dec!(3))));
        let history = store.get_kline_history("BTCUSDT", Interval::M1, 10);
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].close, dec!(2));
    }

    #[test]
    fn test_non_final_bar_ignored() {
        let store = MarketStore::default();
        let mut forming = bar("BTCUSDT", 0, dec!(1));
        forming.is_final = false;
        assert!(!store.insert_bar(forming));
        assert!(store.get_kline("BTCUSDT", Interval::M1).is_none());
    }

    #[test]
    fn test_insert_bars_sorts() {
        let store = MarketStore::default();
        let stored = store.insert_bars(vec![
            bar("ETHUSDT", 2 * MINUTE, dec!(3)),
            bar("ETHUSDT", 0, dec!(1)),
            bar("ETHUSDT", MINUTE, dec!(2)),
        ]);
        assert_eq!(stored, 3);
        assert_eq!(store.get_kline_history("ETHUSDT", Interval::M1, 10).len(), 3);
    }

    #[test]
    fn test_symbol_buffer() {
        let store = MarketStore::default();
        store.insert_bar(bar("BTCUSDT", 0, dec!(1)));
        let mut five = bar("BTCUSDT", 0, dec!(1));
        five.interval = Interval::M5;
        five.close_time = 5 * MINUTE - 1;
        store.insert_bar(five);

        let buffer = store.symbol_buffer("BTCUSDT").unwrap();
        assert_eq!(buffer.last_close_ms[&Interval::M1], MINUTE - 1);
        assert_eq!(buffer.latest_ms(), Some(5 * MINUTE - 1));
        assert!(store.symbol_buffer("ETHUSDT").is_none());
        assert_eq!(store.symbols(), vec![sym("BTCUSDT")]);
    }
}
