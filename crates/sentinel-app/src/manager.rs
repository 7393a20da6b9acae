//! Feed orchestration and the read-only query surface.
//!
//! The manager owns every shard feed and the optional account feed, plus the
//! shared stores they write into. Callers read through typed getters that
//! return copies; nothing outside the feeds mutates the stores except REST
//! fallback, gap repair and reconciliation, which also live here.

use crate::config::AppConfig;
use crate::error::{AppError, AppResult};
use rust_decimal::Decimal;
use sentinel_account::{AccountStateCache, ReconciliationResult};
use sentinel_core::{Balance, Interval, KlineBar, OpenOrder, Position, PriceQuote, Symbol};
use sentinel_feed::{
    partition_symbols, AccountFeed, MarketStore, ShardContext, ShardFeed, ShardKind,
    ACCOUNT_HEALTH_KEY,
};
use sentinel_quality::{
    DataConsistencyManager, DataType, FallbackData, FallbackDecision, HealthSummary,
};
use sentinel_rest::ExchangeRest;
use sentinel_ws::{FeedState, FeedStatsSnapshot};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// State and counters of one feed.
#[derive(Debug, Clone, Serialize)]
pub struct FeedStatus {
    pub name: String,
    pub state: FeedState,
    pub stats: FeedStatsSnapshot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Created,
    Running,
    Stopped,
}

pub struct WebSocketManager {
    shards: Vec<ShardFeed>,
    account: Option<AccountFeed>,
    symbols: Vec<Symbol>,
    intervals: Vec<Interval>,
    price_feed: bool,
    store: Arc<MarketStore>,
    cache: Arc<AccountStateCache>,
    consistency: Arc<DataConsistencyManager>,
    rest: Option<Arc<dyn ExchangeRest>>,
    lifecycle: tokio::sync::Mutex<Lifecycle>,
}

impl WebSocketManager {
    /// Build every feed from configuration. Nothing connects until `start()`.
    pub fn new(config: &AppConfig, rest: Option<Arc<dyn ExchangeRest>>) -> AppResult<Self> {
        let partitions = partition_symbols(config.symbols.as_slice(), config.shard_size)?;
        let symbols: Vec<Symbol> = partitions.iter().flatten().cloned().collect();

        let store = Arc::new(MarketStore::new(config.history_capacity));
        let cache = Arc::new(AccountStateCache::new());
        let consistency = Arc::new(DataConsistencyManager::new(
            config.health.clone(),
            config.quality.clone(),
            config.gap.clone(),
            rest.clone(),
        ));
        let ctx = ShardContext::new(consistency.clone(), store.clone());

        let mut kinds: Vec<ShardKind> = Vec::new();
        for interval in &config.intervals {
            let kind = ShardKind::Kline(*interval);
            if !kinds.contains(&kind) {
                kinds.push(kind);
            }
        }
        if config.price_feed {
            kinds.push(ShardKind::Price);
        }

        let mut shards = Vec::with_capacity(kinds.len() * partitions.len());
        for kind in &kinds {
            for partition in &partitions {
                shards.push(ShardFeed::new(
                    shards.len(),
                    *kind,
                    partition.clone(),
                    &config.ws_base_url,
                    config.shard.clone(),
                    ctx.clone(),
                ));
            }
        }

        let account = if config.account_feed {
            let rest = rest.clone().ok_or_else(|| {
                AppError::Config("account feed enabled without a REST client".to_string())
            })?;
            Some(AccountFeed::new(
                &config.ws_base_url,
                config.account.clone(),
                rest,
                cache.clone(),
                consistency.clone(),
            ))
        } else {
            None
        };

        info!(
            symbols = symbols.len(),
            shards = shards.len(),
            account_feed = account.is_some(),
            "WebSocket manager built"
        );

        Ok(Self {
            shards,
            account,
            symbols,
            intervals: config.intervals.clone(),
            price_feed: config.price_feed,
            store,
            cache,
            consistency,
            rest,
            lifecycle: tokio::sync::Mutex::new(Lifecycle::Created),
        })
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Start every feed. Idempotent; a stopped manager stays stopped.
    pub async fn start(&self) -> AppResult<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        match *lifecycle {
            Lifecycle::Running => return Ok(()),
            Lifecycle::Stopped => {
                return Err(AppError::Config("manager already stopped".to_string()))
            }
            Lifecycle::Created => {}
        }

        if let Some(account) = &self.account {
            account.start().await?;
        }
        for shard in &self.shards {
            shard.start();
        }
        *lifecycle = Lifecycle::Running;
        info!(shards = self.shards.len(), "All feeds started");
        Ok(())
    }

    /// Stop every feed, flushing pending bars first. Idempotent.
    pub async fn stop(&self) {
        let mut lifecycle = self.lifecycle.lock().await;
        if *lifecycle == Lifecycle::Stopped {
            return;
        }
        for shard in &self.shards {
            shard.stop().await;
        }
        if let Some(account) = &self.account {
            account.stop().await;
        }
        *lifecycle = Lifecycle::Stopped;
        info!("All feeds stopped");
    }

    pub async fn is_running(&self) -> bool {
        *self.lifecycle.lock().await == Lifecycle::Running
    }

    // =========================================================================
    // Query surface
    // =========================================================================

    pub fn get_balance(&self, asset: &str) -> Option<Balance> {
        self.cache.get_balance(asset)
    }

    pub fn get_all_balances(&self) -> Vec<Balance> {
        self.cache.get_all_balances()
    }

    pub fn get_position(&self, symbol: &str) -> Option<Position> {
        self.cache.get_position(symbol)
    }

    pub fn get_all_positions(&self) -> Vec<Position> {
        self.cache.get_all_positions()
    }

    pub fn get_open_orders(&self, symbol: &str) -> Vec<OpenOrder> {
        self.cache.get_open_orders(symbol)
    }

    pub fn get_price(&self, symbol: &str) -> Option<PriceQuote> {
        self.store.get_price(symbol)
    }

    pub fn get_mid_price(&self, symbol: &str) -> Option<Decimal> {
        self.store.get_mid_price(symbol)
    }

    pub fn get_spread_bps(&self, symbol: &str) -> Option<Decimal> {
        self.store.get_spread_bps(symbol)
    }

    pub fn get_kline(&self, symbol: &str, interval: Interval) -> Option<KlineBar> {
        self.store.get_kline(symbol, interval)
    }

    pub fn get_kline_history(&self, symbol: &str, interval: Interval, limit: usize) -> Vec<KlineBar> {
        self.store.get_kline_history(symbol, interval, limit)
    }

    pub fn get_health_summary(&self) -> HealthSummary {
        self.consistency.get_health_summary()
    }

    pub fn feed_stats(&self) -> Vec<FeedStatus> {
        let shards = self.shards.iter().map(|shard| FeedStatus {
            name: shard.name().to_string(),
            state: shard.state(),
            stats: shard.stats(),
        });
        let account = self.account.iter().map(|account| FeedStatus {
            name: account.name().to_string(),
            state: account.state(),
            stats: account.stats(),
        });
        shards.chain(account).collect()
    }

    pub fn symbols(&self) -> &[Symbol] {
        &self.symbols
    }

    pub fn has_account_feed(&self) -> bool {
        self.account.is_some()
    }

    pub fn store(&self) -> &Arc<MarketStore> {
        &self.store
    }

    pub fn cache(&self) -> &Arc<AccountStateCache> {
        &self.cache
    }

    pub fn consistency(&self) -> &Arc<DataConsistencyManager> {
        &self.consistency
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// Pull an account snapshot from REST and correct the cache.
    pub async fn reconcile(&self) -> AppResult<ReconciliationResult> {
        let rest = self
            .rest
            .as_ref()
            .ok_or_else(|| AppError::Config("reconciliation needs a REST client".to_string()))?;
        let snapshot = rest.get_account_snapshot().await?;
        Ok(self.cache.reconcile(&snapshot))
    }

    /// Check every symbol (and the account stream) for staleness and serve
    /// the unhealthy ones from REST. Returns the number of fallbacks that
    /// produced data.
    pub async fn run_freshness_sweep(&self) -> usize {
        let mut served = 0;
        for symbol in &self.symbols {
            for data_type in self.market_data_types() {
                let stream = data_type.stream_key(symbol.as_str());
                let Some(decision) = self.consistency.check_data_freshness(&stream) else {
                    continue;
                };
                info!(
                    %stream,
                    reason = %decision.reason,
                    estimated_recovery_ms = decision.estimated_recovery_ms,
                    "Serving stream from REST"
                );
                served += self.serve_market_fallback(symbol, data_type, &decision).await;
            }
        }

        if self.account.is_some() {
            if let Some(decision) = self.consistency.check_data_freshness(ACCOUNT_HEALTH_KEY) {
                served += self.serve_account_fallback(&decision).await;
            }
        }
        served
    }

    /// Market streams opened per symbol.
    fn market_data_types(&self) -> Vec<DataType> {
        let mut data_types: Vec<DataType> = self.intervals.iter().map(|i| DataType::Kline(*i)).collect();
        if self.price_feed {
            data_types.push(DataType::Price);
        }
        data_types
    }

    async fn serve_market_fallback(
        &self,
        symbol: &Symbol,
        data_type: DataType,
        decision: &FallbackDecision,
    ) -> usize {
        match self
            .consistency
            .execute_fallback(symbol.as_str(), data_type, decision)
            .await
        {
            Ok(FallbackData::Klines(bars)) => {
                let stored = self.store.insert_bars(bars);
                debug!(%symbol, stored, "Fallback bars stored");
                1
            }
            Ok(FallbackData::Price(quote)) => {
                self.store.update_quote(quote);
                1
            }
            Ok(FallbackData::Positions(_)) => 0,
            Err(e) => {
                warn!(%symbol, data_type = data_type.as_str(), error = %e, "Fallback failed");
                0
            }
        }
    }

    async fn serve_account_fallback(&self, decision: &FallbackDecision) -> usize {
        match self
            .consistency
            .execute_fallback(ACCOUNT_HEALTH_KEY, DataType::Position, decision)
            .await
        {
            Ok(FallbackData::Positions(positions)) => {
                let count = positions.len();
                let removed = replace_positions(&self.cache, positions);
                info!(
                    positions = count,
                    removed,
                    reason = %decision.reason,
                    "Positions refreshed from REST"
                );
                1
            }
            Ok(_) => 0,
            Err(e) => {
                warn!(error = %e, "Account fallback failed");
                0
            }
        }
    }

    /// Backfill symbols whose bar history stalled. Returns bars stored.
    pub async fn run_gap_sweep(&self) -> usize {
        let mut stored = 0;
        for symbol in &self.symbols {
            let Some(buffer) = self.store.symbol_buffer(symbol.as_str()) else {
                continue;
            };
            if let Some(repair) = self.consistency.auto_repair_data_gaps(&buffer).await {
                stored += self.store.insert_bars(repair.bars);
            }
        }
        stored
    }
}

/// Make the cached positions match a REST snapshot. Cached symbols absent
/// from the snapshot were closed while the stream was down and are removed.
/// Returns how many were removed.
fn replace_positions(cache: &AccountStateCache, positions: Vec<Position>) -> usize {
    let open: HashSet<Symbol> = positions.iter().map(|p| p.symbol.clone()).collect();
    let mut removed = 0;
    for cached in cache.get_all_positions() {
        if !open.contains(&cached.symbol) && cache.remove_position(cached.symbol.as_str()).is_some() {
            removed += 1;
        }
    }
    for position in positions {
        cache.update_position(position);
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use sentinel_rest::MockExchangeRest;

    fn config(extra: &str) -> AppConfig {
        let mut config = AppConfig::from_toml_str(&format!(
            "symbols = [\"BTCUSDT\", \"ETHUSDT\", \"SOLUSDT\"]\nshard_size = 2\n{extra}"
        ))
        .unwrap();
        config.ws_base_url = "ws://127.0.0.1:1".to_string();
        config
    }

    #[test]
    fn test_shards_per_kind_and_partition() {
        let manager = WebSocketManager::new(&config("intervals = [\"1m\", \"5m\"]"), None).unwrap();
        let names: Vec<String> = manager.feed_stats().into_iter().map(|f| f.name).collect();
        assert_eq!(
            names,
            vec![
                "shard-0-kline_1m",
                "shard-1-kline_1m",
                "shard-2-kline_5m",
                "shard-3-kline_5m",
                "shard-4-price",
                "shard-5-price",
            ]
        );
        assert_eq!(manager.symbols().len(), 3);
        assert!(!manager.has_account_feed());
    }

    #[test]
    fn test_account_feed_needs_rest() {
        let result = WebSocketManager::new(&config("account_feed = true"), None);
        assert!(matches!(result, Err(AppError::Config(_))));

        let rest: Arc<dyn ExchangeRest> = Arc::new(MockExchangeRest::new());
        let manager = WebSocketManager::new(&config("account_feed = true"), Some(rest)).unwrap();
        assert!(manager.has_account_feed());
        assert_eq!(manager.feed_stats().last().unwrap().name, "account");
    }

    #[test]
    fn test_queries_on_empty_state() {
        let manager = WebSocketManager::new(&config(""), None).unwrap();
        assert!(manager.get_price("BTCUSDT").is_none());
        assert!(manager.get_mid_price("BTCUSDT").is_none());
        assert!(manager.get_kline("BTCUSDT", Interval::M1).is_none());
        assert!(manager.get_kline_history("BTCUSDT", Interval::M1, 10).is_empty());
        assert!(manager.get_balance("USDT").is_none());
        assert!(manager.get_all_positions().is_empty());
        assert_eq!(manager.get_health_summary().streams, 0);
    }

    #[test]
    fn test_replace_positions_drops_closed() {
        let cache = AccountStateCache::new();
        let sym = |s: &str| Symbol::new(s).unwrap();
        cache.update_position(Position::new(sym("ETHUSDT"), dec!(1), dec!(2000), dec!(5)));
        cache.update_position(Position::new(sym("BTCUSDT"), dec!(0.1), dec!(30000), dec!(0)));

        let removed = replace_positions(
            &cache,
            vec![Position::new(sym("BTCUSDT"), dec!(0.2), dec!(30000), dec!(10))],
        );
        assert_eq!(removed, 1);
        assert!(cache.get_position("ETHUSDT").is_none());
        assert_eq!(cache.get_position("BTCUSDT").unwrap().amount, dec!(0.2));
    }

    #[tokio::test]
    async fn test_account_fallback_replaces_positions() {
        let mock = Arc::new(MockExchangeRest::new());
        mock.set_positions(vec![Position::new(
            Symbol::new("BTCUSDT").unwrap(),
            dec!(0.5),
            dec!(30000),
            dec!(25),
        )]);
        let rest: Arc<dyn ExchangeRest> = mock.clone();
        let manager =
            WebSocketManager::new(&config("account_feed = true\nprice_feed = false"), Some(rest)).unwrap();
        manager.cache.update_position(Position::new(
            Symbol::new("ETHUSDT").unwrap(),
            dec!(1),
            dec!(2000),
            dec!(5),
        ));

        // Three silent kline streams plus the silent account stream.
        assert_eq!(manager.run_freshness_sweep().await, 4);
        assert_eq!(mock.call_count("get_position_info"), 1);
        let positions = manager.get_all_positions();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].symbol.as_str(), "BTCUSDT");
    }

    #[tokio::test]
    async fn test_reconcile_without_rest_is_config_error() {
        let manager = WebSocketManager::new(&config(""), None).unwrap();
        assert!(matches!(manager.reconcile().await, Err(AppError::Config(_))));
    }

    #[tokio::test]
    async fn test_stop_before_start_and_twice() {
        let manager = WebSocketManager::new(&config(""), None).unwrap();
        manager.stop().await;
        manager.stop().await;
        assert!(!manager.is_running().await);
        assert!(manager.start().await.is_err());
    }
}
