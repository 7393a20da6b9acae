//! Per-symbol micro-batching of closed bars.

use parking_lot::Mutex;
use sentinel_core::{KlineBar, Symbol};
use std::collections::HashMap;

/// Buffers closed bars between timer flushes.
#[derive(Debug, Default)]
pub struct BarBatcher {
    pending: Mutex<HashMap<Symbol, Vec<KlineBar>>>,
}

impl BarBatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer a bar. A repeat of a buffered (interval, open time) replaces it.
    pub fn push(&self, bar: KlineBar) {
        let mut pending = self.pending.lock();
        let bars = pending.entry(bar.symbol.clone()).or_default();
        match bars
            .iter_mut()
            .find(|b| b.interval == bar.interval && b.open_time == bar.open_time)
        {
            Some(existing) => *existing = bar,
            None => bars.push(bar),
        }
    }

    /// Drain everything buffered, grouped by symbol in arrival order.
    pub fn take(&self) -> Vec<KlineBar> {
        let mut groups: Vec<(Symbol, Vec<KlineBar>)> =
            std::mem::take(&mut *self.pending.lock()).into_iter().collect();
        groups.sort_by(|a, b| a.0.cmp(&b.0));
        groups.into_iter().flat_map(|(_, bars)| bars).collect()
    }

    /// Bars currently buffered.
    pub fn len(&self) -> usize {
        self.pending.lock().values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use sentinel_core::Interval;

    fn bar(symbol: &str, open_time: i64) -> KlineBar {
        KlineBar {
            symbol: Symbol::new(symbol).unwrap(),
            interval: Interval::M1,
            open_time,
            close_time: open_time + 59_999,
            open: dec!(1),
            high: dec!(1),
            low: dec!(1),
            close: dec!(1),
            volume: dec!(1),
            server_ts: 0,
            local_ts: 0,
            latency_ms: 0,
            shard_id: Some(0),
            is_final: true,
        }
    }

    #[test]
    fn test_take_drains_grouped() {
        let batcher = BarBatcher::new();
        batcher.push(bar("ETHUSDT", 0));
        batcher.push(bar("BTCUSDT", 0));
        batcher.push(bar("ETHUSDT", 60_000));
        assert_eq!(batcher.len(), 3);

        let drained = batcher.take();
        let keys: Vec<(&str, i64)> = drained
            .iter()
            .map(|b| (b.symbol.as_str(), b.open_time))
            .collect();
        assert_eq!(
            keys,
            vec![("BTCUSDT", 0), ("ETHUSDT", 0), ("ETHUSDT", 60_000)]
        );
        assert!(batcher.is_empty());
        assert!(batcher.take().is_empty());
    }

    #[test]
    fn test_repeated_bar_coalesced() {
        let batcher = BarBatcher::new();
        batcher.push(bar("BTCUSDT", 0));
        let mut revised = bar("BTCUSDT", 0);
        revised.close = dec!(2);
        batcher.push(revised);
        let mut other_interval = bar("BTCUSDT", 0);
        other_interval.interval = Interval::M5;
        batcher.push(other_interval);
        assert_eq!(batcher.len(), 2);

        let drained = batcher.take();
        assert_eq!(drained[0].interval, Interval::M1);
        assert_eq!(drained[0].close, dec!(2));
        assert_eq!(drained[1].interval, Interval::M5);
    }
}
