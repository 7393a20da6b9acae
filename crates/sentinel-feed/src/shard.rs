//! Symbol shard feeds.
//!
//! A shard subscribes to one combined stream covering its slice of the
//! symbol universe. Every payload is scored by the consistency manager
//! under its stream key (`BTCUSDT@kline_1m`) before decoding; rejected
//! payloads never reach the store.
//!
//! Kline shards buffer closed bars and flush them to a [`BarSink`] on a
//! fixed timer. Price shards write quotes straight into the store.

use crate::batcher::BarBatcher;
use crate::error::{FeedError, FeedResult};
use crate::events::{payload_symbol, split_frame, StreamEvent};
use crate::store::{BarSink, MarketStore};
use crate::stream::combined_stream_url;
use parking_lot::Mutex;
use sentinel_core::{now_ms, Interval, KlineBar, Symbol};
use sentinel_quality::monitor::event_time;
use sentinel_quality::{DataConsistencyManager, DataType};
use sentinel_telemetry::Metrics;
use sentinel_ws::{Feed, FeedConfig, FeedHandler, FeedState, FeedStatsSnapshot, HandlerResult};
use serde::Deserialize;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardKind {
    Kline(Interval),
    Price,
}

impl ShardKind {
    /// Stream identifier for one symbol.
    pub fn stream_name(&self, symbol: &Symbol) -> String {
        match self {
            Self::Kline(interval) => format!("{}@kline_{}", symbol.stream_name(), interval),
            Self::Price => format!("{}@bookTicker", symbol.stream_name()),
        }
    }

    pub fn data_type(&self) -> DataType {
        match self {
            Self::Kline(interval) => DataType::Kline(*interval),
            Self::Price => DataType::Price,
        }
    }

    /// Health and continuity key for one symbol's stream.
    pub fn health_key(&self, symbol: &str) -> String {
        self.data_type().stream_key(&symbol.to_ascii_uppercase())
    }

    /// Whether a payload belongs to this kind of stream. Payloads without an
    /// event type are let through so validation can reject them.
    fn subscribed(&self, data: &Value) -> bool {
        let Some(event_type) = data.get("e").and_then(Value::as_str) else {
            return true;
        };
        match self {
            Self::Kline(interval) => {
                event_type == "kline"
                    && data
                        .pointer("/k/i")
                        .and_then(Value::as_str)
                        .map_or(true, |i| i == interval.as_str())
            }
            Self::Price => event_type == "bookTicker",
        }
    }
}

impl fmt::Display for ShardKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Kline(interval) => write!(f, "kline_{interval}"),
            Self::Price => f.write_str("price"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ShardConfig {
    /// Bar batch flush period.
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
    #[serde(default)]
    pub feed: FeedConfig,
}

fn default_flush_interval_ms() -> u64 {
    100
}

impl Default for ShardConfig {
    fn default() -> Self {
        Self {
            flush_interval_ms: default_flush_interval_ms(),
            feed: FeedConfig::default(),
        }
    }
}

/// Shared state a shard writes into.
#[derive(Clone)]
pub struct ShardContext {
    pub consistency: Arc<DataConsistencyManager>,
    pub store: Arc<MarketStore>,
    /// Receives flushed bar batches.
    pub bar_sink: Arc<dyn BarSink>,
}

impl ShardContext {
    /// Context whose bar sink is the store itself.
    pub fn new(consistency: Arc<DataConsistencyManager>, store: Arc<MarketStore>) -> Self {
        Self {
            consistency,
            bar_sink: store.clone(),
            store,
        }
    }

    pub fn with_bar_sink(mut self, sink: Arc<dyn BarSink>) -> Self {
        self.bar_sink = sink;
        self
    }
}

pub(crate) struct ShardHandler {
    name: String,
    url: String,
    shard_id: usize,
    kind: ShardKind,
    symbols: Vec<Symbol>,
    ctx: ShardContext,
    batcher: BarBatcher,
}

impl ShardHandler {
    pub(crate) fn new(
        shard_id: usize,
        kind: ShardKind,
        symbols: Vec<Symbol>,
        ws_base_url: &str,
        ctx: ShardContext,
    ) -> Self {
        let streams: Vec<String> = symbols.iter().map(|s| kind.stream_name(s)).collect();
        Self {
            name: format!("shard-{shard_id}-{kind}"),
            url: combined_stream_url(ws_base_url, &streams),
            shard_id,
            kind,
            symbols,
            ctx,
            batcher: BarBatcher::new(),
        }
    }

    fn handle(&self, raw: &str) -> FeedResult<()> {
        let local_ts = now_ms();
        let (_, data) = split_frame(raw)?;
        let symbol = payload_symbol(&data)
            .ok_or_else(|| FeedError::Protocol("payload without symbol".to_string()))?
            .to_string();
        if !self.kind.subscribed(&data) {
            debug!(feed = %self.name, %symbol, "Ignoring event outside subscription");
            return Ok(());
        }
        let latency_ms = event_time(&data).map_or(0, |ts| KlineBar::latency_between(ts, local_ts));
        Metrics::feed_latency(&self.name, latency_ms as f64);

        let stream = self.kind.health_key(&symbol);
        if !self
            .ctx
            .consistency
            .process_websocket_message(&stream, &data, latency_ms as f64)
        {
            trace!(feed = %self.name, %stream, "Dropping rejected payload");
            return Ok(());
        }

        match (self.kind, StreamEvent::decode(data)?) {
            (ShardKind::Kline(interval), StreamEvent::Kline(event))
                if event.kline.interval == interval =>
            {
                if let Some(bar) = event.into_bar(local_ts, Some(self.shard_id)) {
                    self.batcher.push(bar);
                }
            }
            (ShardKind::Price, StreamEvent::BookTicker(event)) => {
                self.ctx.store.update_quote(event.into_quote(local_ts));
            }
            _ => debug!(feed = %self.name, %symbol, "Ignoring event outside subscription"),
        }
        Ok(())
    }

    /// Hand buffered bars to the sink. Returns the number flushed.
    pub(crate) fn flush(&self) -> usize {
        let bars = self.batcher.take();
        if bars.is_empty() {
            return 0;
        }
        let count = bars.len();
        self.ctx.bar_sink.on_bars(bars);
        Metrics::bars_flushed(&self.name, count);
        count
    }
}

impl FeedHandler for ShardHandler {
    fn name(&self) -> &str {
        &self.name
    }

    fn url(&self) -> String {
        self.url.clone()
    }

    fn process_message(&self, raw: &str) -> HandlerResult<()> {
        Ok(self.handle(raw)?)
    }

    fn on_connect(&self) {
        info!(feed = %self.name, symbols = self.symbols.len(), "Shard subscribed");
    }

    fn on_stop(&self) {
        let flushed = self.flush();
        if flushed > 0 {
            debug!(feed = %self.name, flushed, "Flushed remaining bars on stop");
        }
    }
}

/// One combined-stream connection for a slice of the symbol universe.
pub struct ShardFeed {
    feed: Feed<ShardHandler>,
    flush_interval: Duration,
    cancel: CancellationToken,
    flush_task: Mutex<Option<JoinHandle<()>>>,
}

impl ShardFeed {
    pub fn new(
        shard_id: usize,
        kind: ShardKind,
        symbols: Vec<Symbol>,
        ws_base_url: &str,
        config: ShardConfig,
        ctx: ShardContext,
    ) -> Self {
        let handler = Arc::new(ShardHandler::new(shard_id, kind, symbols, ws_base_url, ctx));
        Self {
            feed: Feed::new(handler, config.feed),
            flush_interval: Duration::from_millis(config.flush_interval_ms.max(1)),
            cancel: CancellationToken::new(),
            flush_task: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        self.feed.name()
    }

    pub fn url(&self) -> String {
        self.feed.handler().url()
    }

    pub fn shard_id(&self) -> usize {
        self.feed.handler().shard_id
    }

    pub fn kind(&self) -> ShardKind {
        self.feed.handler().kind
    }

    pub fn symbols(&self) -> &[Symbol] {
        &self.feed.handler().symbols
    }

    pub fn state(&self) -> FeedState {
        self.feed.state()
    }

    pub fn stats(&self) -> FeedStatsSnapshot {
        self.feed.stats()
    }

    /// Start the feed and, for kline shards, the flush timer. Idempotent.
    pub fn start(&self) {
        if self.cancel.is_cancelled() {
            warn!(feed = %self.name(), "start() called on stopped shard, ignoring");
            return;
        }
        self.feed.start();

        if !matches!(self.kind(), ShardKind::Kline(_)) {
            return;
        }
        let mut flush_task = self.flush_task.lock();
        if flush_task.is_some() {
            return;
        }
        let handler = self.feed.handler().clone();
        let cancel = self.cancel.clone();
        let period = self.flush_interval;
        *flush_task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        handler.flush();
                    }
                }
            }
        }));
    }

    /// Flush pending bars, then close the connection. Idempotent.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let task = self.flush_task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(feed = %self.name(), error = %e, "Flush task ended abnormally");
            }
        }
        self.feed.handler().flush();
        self.feed.stop().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PlMutex;
    use rust_decimal_macros::dec;
    use sentinel_quality::{GapConfig, HealthConfig, HealthStatus, QualityConfig, SourceType};
    use serde_json::json;

    #[derive(Default)]
    struct RecordingSink {
        batches: PlMutex<Vec<Vec<KlineBar>>>,
    }

    impl BarSink for RecordingSink {
        fn on_bars(&self, bars: Vec<KlineBar>) {
            self.batches.lock().push(bars);
        }
    }

    fn context() -> (ShardContext, Arc<RecordingSink>) {
        let consistency = Arc::new(DataConsistencyManager::new(
            HealthConfig::default(),
            QualityConfig::default(),
            GapConfig::default(),
            None,
        ));
        let sink = Arc::new(RecordingSink::default());
        let ctx = ShardContext::new(consistency, Arc::new(MarketStore::default()))
            .with_bar_sink(sink.clone());
        (ctx, sink)
    }

    fn symbols() -> Vec<Symbol> {
        vec![
            Symbol::new("BTCUSDT").unwrap(),
            Symbol::new("ETHUSDT").unwrap(),
        ]
    }

    fn kline_frame(symbol: &str, open_time: i64, high: &str, low: &str, is_final: bool) -> String {
        json!({
            "stream": format!("{}@kline_1m", symbol.to_lowercase()),
            "data": {
                "e": "kline", "E": open_time + 60_000, "s": symbol,
                "k": {"t": open_time, "T": open_time + 59_999, "s": symbol, "i": "1m",
                      "o": "100", "c": "100", "h": high, "l": low, "v": "5", "x": is_final}
            }
        })
        .to_string()
    }

    #[test]
    fn test_stream_names_and_url() {
        let (ctx, _) = context();
        let handler = ShardHandler::new(
            2,
            ShardKind::Kline(Interval::M5),
            symbols(),
            "wss://fstream.binance.com",
            ctx.clone(),
        );
        assert_eq!(handler.name, "shard-2-kline_5m");
        assert_eq!(
            handler.url,
            "wss://fstream.binance.com/stream?streams=btcusdt@kline_5m/ethusdt@kline_5m"
        );

        let price = ShardHandler::new(0, ShardKind::Price, symbols(), "wss://x", ctx);
        assert_eq!(
            price.url,
            "wss://x/stream?streams=btcusdt@bookTicker/ethusdt@bookTicker"
        );
    }

    #[test]
    fn test_closed_bars_batched_until_flush() {
        let (ctx, sink) = context();
        let handler = ShardHandler::new(0, ShardKind::Kline(Interval::M1), symbols(), "ws://x", ctx);

        handler
            .process_message(&kline_frame("BTCUSDT", 0, "101", "99", true))
            .unwrap();
        handler
            .process_message(&kline_frame("ETHUSDT", 0, "101", "99", false))
            .unwrap();
        assert!(sink.batches.lock().is_empty());
        assert_eq!(handler.batcher.len(), 1);

        assert_eq!(handler.flush(), 1);
        assert_eq!(handler.flush(), 0);
        let batches = sink.batches.lock();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0][0].symbol.as_str(), "BTCUSDT");
        assert_eq!(batches[0][0].shard_id, Some(0));
    }

    #[test]
    fn test_health_keys() {
        let kline = ShardKind::Kline(Interval::M5);
        assert_eq!(kline.health_key("btcusdt"), "BTCUSDT@kline_5m");
        assert_eq!(ShardKind::Price.health_key("BTCUSDT"), "BTCUSDT@bookTicker");
        assert_eq!(kline.data_type(), DataType::Kline(Interval::M5));
    }

    fn interval_frame(symbol: &str, interval: Interval, event_time: i64) -> String {
        json!({
            "stream": format!("{}@kline_{}", symbol.to_lowercase(), interval),
            "data": {
                "e": "kline", "E": event_time, "s": symbol,
                "k": {"t": event_time - 1_000, "T": event_time - 1, "s": symbol,
                      "i": interval.as_str(), "o": "100", "c": "100", "h": "101", "l": "99",
                      "v": "5", "x": false}
            }
        })
        .to_string()
    }

    #[test]
    fn test_interval_and_price_shards_share_one_manager() {
        let (ctx, _) = context();
        let consistency = ctx.consistency.clone();
        let one = ShardHandler::new(0, ShardKind::Kline(Interval::M1), symbols(), "ws://x", ctx.clone());
        let five = ShardHandler::new(1, ShardKind::Kline(Interval::M5), symbols(), "ws://x", ctx.clone());
        let price = ShardHandler::new(2, ShardKind::Price, symbols(), "ws://x", ctx);

        // Every stream is in order; the kline streams carry identical event
        // times and book ticks trail them by 100ms. Event times ahead of the
        // local clock count as zero latency.
        let base = now_ms() + 60_000;
        for i in 0..10 {
            let ts = base + i * 1_000;
            one.process_message(&interval_frame("BTCUSDT", Interval::M1, ts)).unwrap();
            five.process_message(&interval_frame("BTCUSDT", Interval::M5, ts)).unwrap();
            let tick = json!({
                "stream": "btcusdt@bookTicker",
                "data": {"e": "bookTicker", "E": ts - 100, "s": "BTCUSDT",
                         "b": "99", "B": "1", "a": "101", "A": "1"}
            })
            .to_string();
            price.process_message(&tick).unwrap();
        }

        let report = consistency.monitor().report();
        assert_eq!(report.validated, 30);
        assert_eq!(report.rejected, 0);
        assert_eq!(report.out_of_order, 0);
        assert_eq!(
            consistency.tracked_streams(),
            vec!["BTCUSDT@bookTicker", "BTCUSDT@kline_1m", "BTCUSDT@kline_5m"]
        );
        for stream in consistency.tracked_streams() {
            let record = consistency.get_health(&stream, SourceType::WebSocket).unwrap();
            assert_eq!(record.status, HealthStatus::Healthy);
            assert!((record.quality_score - 1.0).abs() < 1e-9);
        }
        // ETHUSDT streams never spoke.
        assert!(consistency.check_data_freshness("ETHUSDT@kline_1m").is_some());
    }

    #[test]
    fn test_rejected_bar_never_batched() {
        let (ctx, _) = context();
        let consistency = ctx.consistency.clone();
        let handler = ShardHandler::new(0, ShardKind::Kline(Interval::M1), symbols(), "ws://x", ctx);

        handler
            .process_message(&kline_frame("ETHUSDT", 0, "95", "105", true))
            .unwrap();
        assert!(handler.batcher.is_empty());
        assert_eq!(consistency.monitor().report().rejected, 1);
    }

    #[test]
    fn test_book_ticker_written_to_store() {
        let (ctx, _) = context();
        let store = ctx.store.clone();
        let handler = ShardHandler::new(0, ShardKind::Price, symbols(), "ws://x", ctx);
        let frame = json!({
            "stream": "btcusdt@bookTicker",
            "data": {"e": "bookTicker", "E": 1, "s": "BTCUSDT",
                     "b": "99.95", "B": "1", "a": "100.05", "A": "2"}
        })
        .to_string();
        handler.process_message(&frame).unwrap();
        assert_eq!(store.get_mid_price("BTCUSDT"), Some(dec!(100)));
    }

    #[test]
    fn test_events_outside_subscription_ignored() {
        let (ctx, _) = context();
        let store = ctx.store.clone();
        let handler = ShardHandler::new(0, ShardKind::Kline(Interval::M5), symbols(), "ws://x", ctx);
        handler
            .process_message(&kline_frame("BTCUSDT", 0, "101", "99", true))
            .unwrap();
        let ticker = json!({
            "e": "bookTicker", "E": 1, "s": "BTCUSDT",
            "b": "1", "B": "1", "a": "2", "A": "1"
        })
        .to_string();
        handler.process_message(&ticker).unwrap();
        assert!(handler.batcher.is_empty());
        assert!(store.get_price("BTCUSDT").is_none());
        // Neither event is scored against the 5m stream.
        assert_eq!(handler.ctx.consistency.monitor().report().validated, 0);
    }

    #[test]
    fn test_malformed_frames_are_errors() {
        let (ctx, _) = context();
        let handler = ShardHandler::new(0, ShardKind::Price, symbols(), "ws://x", ctx);
        assert!(handler.process_message("{not json").is_err());
        assert!(handler
            .process_message(r#"{"result": null, "id": 1}"#)
            .is_err());
    }

    #[test]
    fn test_on_stop_flushes() {
        let (ctx, sink) = context();
        let handler = ShardHandler::new(0, ShardKind::Kline(Interval::M1), symbols(), "ws://x", ctx);
        handler
            .process_message(&kline_frame("BTCUSDT", 0, "101", "99", true))
            .unwrap();
        handler.on_stop();
        assert_eq!(sink.batches.lock().len(), 1);
    }
}
