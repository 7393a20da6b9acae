//! In-memory [`ExchangeRest`] for tests.

use crate::client::{BoxFuture, ExchangeRest};
use crate::error::{RestError, RestResult};
use parking_lot::Mutex;
use sentinel_core::{AccountSnapshot, Interval, KlineBar, Position, PriceQuote, Symbol};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

/// Mock REST collaborator.
///
/// Serves canned data, records every call by name, and can be told to fail
/// the next N calls, fail everything, or respond slowly.
#[derive(Default)]
pub struct MockExchangeRest {
    klines: Mutex<HashMap<(Symbol, Interval), Vec<KlineBar>>>,
    tickers: Mutex<HashMap<Symbol, PriceQuote>>,
    positions: Mutex<Vec<Position>>,
    snapshot: Mutex<AccountSnapshot>,
    calls: Mutex<Vec<String>>,
    latency: Mutex<Option<Duration>>,
    fail_remaining: AtomicU32,
    fail_all: AtomicBool,
    listen_key_seq: AtomicU64,
}

impl MockExchangeRest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_klines(&self, symbol: Symbol, interval: Interval, bars: Vec<KlineBar>) {
        self.klines.lock().insert((symbol, interval), bars);
    }

    pub fn set_ticker(&self, quote: PriceQuote) {
        self.tickers.lock().insert(quote.symbol.clone(), quote);
    }

    pub fn set_positions(&self, positions: Vec<Position>) {
        *self.positions.lock() = positions;
    }

    pub fn set_snapshot(&self, snapshot: AccountSnapshot) {
        *self.snapshot.lock() = snapshot;
    }

    /// Fail the next `n` calls with HTTP 503.
    pub fn fail_next(&self, n: u32) {
        self.fail_remaining.store(n, Ordering::SeqCst);
    }

    /// Fail every call until reset.
    pub fn set_failing(&self, failing: bool) {
        self.fail_all.store(failing, Ordering::SeqCst);
    }

    /// Delay every response.
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock() = latency;
    }

    /// Names of all calls made so far.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self, name: &str) -> usize {
        self.calls.lock().iter().filter(|c| c.as_str() == name).count()
    }

    async fn enter(&self, name: &str) -> RestResult<()> {
        self.calls.lock().push(name.to_string());
        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        let fail_once = self
            .fail_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail_once || self.fail_all.load(Ordering::SeqCst) {
            return Err(RestError::Status {
                status: 503,
                body: format!("mock failure in {name}"),
            });
        }
        Ok(())
    }
}

impl ExchangeRest for MockExchangeRest {
    fn get_klines(
        &self,
        symbol: Symbol,
        interval: Interval,
        limit: u32,
    ) -> BoxFuture<'_, RestResult<Vec<KlineBar>>> {
        Box::pin(async move {
            self.enter("get_klines").await?;
            let klines = self.klines.lock();
            let bars = klines.get(&(symbol, interval)).cloned().unwrap_or_default();
            let skip = bars.len().saturating_sub(limit as usize);
            Ok(bars.into_iter().skip(skip).collect())
        })
    }

    fn get_ticker(&self, symbol: Symbol) -> BoxFuture<'_, RestResult<PriceQuote>> {
        Box::pin(async move {
            self.enter("get_ticker").await?;
            self.tickers.lock().get(&symbol).cloned().ok_or(RestError::Status {
                status: 400,
                body: format!("unknown symbol {symbol}"),
            })
        })
    }

    fn get_position_info(&self) -> BoxFuture<'_, RestResult<Vec<Position>>> {
        Box::pin(async move {
            self.enter("get_position_info").await?;
            Ok(self.positions.lock().clone())
        })
    }

    fn get_account_snapshot(&self) -> BoxFuture<'_, RestResult<AccountSnapshot>> {
        Box::pin(async move {
            self.enter("get_account_snapshot").await?;
            Ok(self.snapshot.lock().clone())
        })
    }

    fn get_listen_key(&self) -> BoxFuture<'_, RestResult<String>> {
        Box::pin(async move {
            self.enter("get_listen_key").await?;
            let seq = self.listen_key_seq.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(format!("listen-key-{seq}"))
        })
    }

    fn renew_listen_key(&self, _listen_key: String) -> BoxFuture<'_, RestResult<()>> {
        Box::pin(async move { self.enter("renew_listen_key").await })
    }

    fn close_listen_key(&self, _listen_key: String) -> BoxFuture<'_, RestResult<()>> {
        Box::pin(async move { self.enter("close_listen_key").await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn bar(open_time: i64) -> KlineBar {
        KlineBar {
            symbol: Symbol::new("BTCUSDT").unwrap(),
            interval: Interval::M1,
            open_time,
            close_time: open_time + 59_999,
            open: dec!(1),
            high: dec!(1),
            low: dec!(1),
            close: dec!(1),
            volume: dec!(1),
            server_ts: open_time,
            local_ts: open_time,
            latency_ms: 0,
            shard_id: None,
            is_final: true,
        }
    }

    #[tokio::test]
    async fn test_klines_respect_limit() {
        let mock = MockExchangeRest::new();
        let sym = Symbol::new("BTCUSDT").unwrap();
        mock.set_klines(
            sym.clone(),
            Interval::M1,
            (0..5).map(|i| bar(i * 60_000)).collect(),
        );
        let bars = mock.get_klines(sym, Interval::M1, 2).await.unwrap();
        assert_eq!(bars.len(), 2);
        assert_eq!(bars[0].open_time, 180_000);
        assert_eq!(mock.call_count("get_klines"), 1);
    }

    #[tokio::test]
    async fn test_fail_next() {
        let mock = MockExchangeRest::new();
        mock.fail_next(2);
        assert!(mock.get_listen_key().await.is_err());
        assert!(mock.get_listen_key().await.is_err());
        assert_eq!(mock.get_listen_key().await.unwrap(), "listen-key-1");
        assert_eq!(mock.call_count("get_listen_key"), 3);
    }

    #[tokio::test]
    async fn test_set_failing() {
        let mock = MockExchangeRest::new();
        mock.set_failing(true);
        let err = mock.get_position_info().await.unwrap_err();
        assert!(err.is_retryable());
        mock.set_failing(false);
        assert!(mock.get_position_info().await.unwrap().is_empty());
    }
}
