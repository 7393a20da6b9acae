//! User data stream feed.
//!
//! Holds one listen key for the lifetime of the feed. The key is created
//! before connecting, renewed on a fixed schedule, replaced when the stream
//! reports it expired, and closed on stop. Account deltas are written into
//! the shared [`AccountStateCache`].

use crate::error::{FeedError, FeedResult};
use crate::events::{
    split_frame, AccountUpdateEvent, BalanceUpdateEvent, OrderTradeUpdateEvent, StreamEvent,
};
use parking_lot::{Mutex, RwLock};
use sentinel_account::AccountStateCache;
use sentinel_core::{now_ms, KlineBar, MarginType, Position};
use sentinel_quality::monitor::event_time;
use sentinel_quality::DataConsistencyManager;
use sentinel_rest::{ExchangeRest, RestResult};
use sentinel_telemetry::Metrics;
use sentinel_ws::{Feed, FeedConfig, FeedHandler, FeedState, FeedStatsSnapshot, HandlerResult};
use serde::Deserialize;
use serde_json::Value;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Health key under which account stream activity is scored.
pub const ACCOUNT_HEALTH_KEY: &str = "@account";

#[derive(Debug, Clone, Deserialize)]
pub struct AccountFeedConfig {
    /// Keep-alive period. Half the exchange's 30 minute key lifetime.
    #[serde(default = "default_renew_interval_ms")]
    pub renew_interval_ms: u64,
    #[serde(default = "default_renew_max_retries")]
    pub renew_max_retries: u32,
    #[serde(default = "default_renew_retry_delay_ms")]
    pub renew_retry_delay_ms: u64,
    /// Per-request timeout for create, renew and close.
    #[serde(default = "default_renew_timeout_ms")]
    pub renew_timeout_ms: u64,
    #[serde(default = "default_initial_key_retries")]
    pub initial_key_retries: u32,
    #[serde(default)]
    pub feed: FeedConfig,
}

fn default_renew_interval_ms() -> u64 {
    15 * 60 * 1000
}

fn default_renew_max_retries() -> u32 {
    3
}

fn default_renew_retry_delay_ms() -> u64 {
    1_000
}

fn default_renew_timeout_ms() -> u64 {
    10_000
}

fn default_initial_key_retries() -> u32 {
    3
}

impl Default for AccountFeedConfig {
    fn default() -> Self {
        Self {
            renew_interval_ms: default_renew_interval_ms(),
            renew_max_retries: default_renew_max_retries(),
            renew_retry_delay_ms: default_renew_retry_delay_ms(),
            renew_timeout_ms: default_renew_timeout_ms(),
            initial_key_retries: default_initial_key_retries(),
            feed: FeedConfig::default(),
        }
    }
}

// =============================================================================
// Handler
// =============================================================================

pub(crate) struct AccountHandler {
    ws_base_url: String,
    listen_key: RwLock<Option<String>>,
    key_expired: Notify,
    cache: Arc<AccountStateCache>,
    consistency: Arc<DataConsistencyManager>,
}

impl AccountHandler {
    pub(crate) fn new(
        ws_base_url: &str,
        cache: Arc<AccountStateCache>,
        consistency: Arc<DataConsistencyManager>,
    ) -> Self {
        Self {
            ws_base_url: ws_base_url.trim_end_matches('/').to_string(),
            listen_key: RwLock::new(None),
            key_expired: Notify::new(),
            cache,
            consistency,
        }
    }

    fn current_key(&self) -> Option<String> {
        self.listen_key.read().clone()
    }

    fn set_key(&self, key: String) {
        *self.listen_key.write() = Some(key);
    }

    /// Validate, decode and apply one frame.
    ///
    /// Unparseable frames count as errors on the account stream; parsed
    /// payloads are scored by the consistency manager and dropped before
    /// reaching the cache if they fail validation.
    fn handle(&self, raw: &str) -> FeedResult<()> {
        let local_ts = now_ms();
        let data = match split_frame(raw) {
            Ok((_, data)) => data,
            Err(e) => {
                self.consistency
                    .update_websocket_health(ACCOUNT_HEALTH_KEY, false, 0.0);
                return Err(e);
            }
        };
        let latency_ms = event_time(&data).map_or(0, |ts| KlineBar::latency_between(ts, local_ts));
        Metrics::feed_latency(self.name(), latency_ms as f64);

        // Account and order events of one fill share an event time.
        let continuity_key = format!(
            "{ACCOUNT_HEALTH_KEY}/{}",
            data.get("e").and_then(Value::as_str).unwrap_or("unknown")
        );
        if !self.consistency.process_websocket_message_as(
            ACCOUNT_HEALTH_KEY,
            &continuity_key,
            &data,
            latency_ms as f64,
        ) {
            warn!("Dropping invalid account payload");
            return Ok(());
        }

        match StreamEvent::decode(data)? {
            StreamEvent::AccountUpdate(event) => self.apply_account_update(event),
            StreamEvent::BalanceUpdate(event) => self.apply_balance_update(event),
            StreamEvent::OrderTradeUpdate(event) => self.apply_order_update(event),
            StreamEvent::ListenKeyExpired(event) => {
                warn!(event_time = event.event_time, "Listen key expired");
                self.key_expired.notify_one();
            }
            _ => debug!("Ignoring non-account event"),
        }
        Ok(())
    }

    fn apply_account_update(&self, event: AccountUpdateEvent) {
        let update = event.update;
        debug!(
            reason = %update.reason,
            balances = update.balances.len(),
            positions = update.positions.len(),
            "Account update"
        );

        for balance in &update.balances {
            let (free, locked) = balance.free_locked();
            self.cache.update_balance(&balance.asset, free, locked);
        }

        for raw in update.positions {
            if raw.amount.is_zero() {
                if self.cache.remove_position(raw.symbol.as_str()).is_some() {
                    info!(symbol = %raw.symbol, "Position closed");
                }
                continue;
            }

            // Leverage and liquidation price are not part of the delta.
            let previous = self.cache.get_position(raw.symbol.as_str());
            let margin_type = match raw.margin_type.as_deref().map(str::parse::<MarginType>) {
                Some(Ok(margin_type)) => Some(margin_type),
                Some(Err(e)) => {
                    warn!(symbol = %raw.symbol, error = %e, "Unrecognized margin type");
                    None
                }
                None => None,
            }
            .or_else(|| previous.as_ref().map(|p| p.margin_type))
            .unwrap_or_default();

            let mut position =
                Position::new(raw.symbol, raw.amount, raw.entry_price, raw.unrealized_pnl)
                    .with_margin_type(margin_type);
            if let Some(previous) = previous {
                position = position
                    .with_leverage(previous.leverage)
                    .with_liquidation_price(previous.liquidation_price);
            }
            self.cache.update_position(position);
        }
    }

    fn apply_balance_update(&self, event: BalanceUpdateEvent) {
        for balance in &event.balances {
            self.cache
                .update_balance(&balance.asset, balance.free, balance.locked);
        }
    }

    fn apply_order_update(&self, event: OrderTradeUpdateEvent) {
        let (symbol, order) = event.order.into_open_order();
        debug!(
            %symbol,
            order_id = order.order_id,
            status = %order.status,
            "Order update"
        );
        let mut orders = self.cache.get_open_orders(symbol.as_str());
        orders.retain(|o| o.order_id != order.order_id);
        if order.is_open() {
            orders.push(order);
        }
        self.cache.update_open_orders(&symbol, orders);
    }
}

impl FeedHandler for AccountHandler {
    fn name(&self) -> &str {
        "account"
    }

    fn url(&self) -> String {
        format!(
            "{}/ws/{}",
            self.ws_base_url,
            self.current_key().unwrap_or_default()
        )
    }

    fn process_message(&self, raw: &str) -> HandlerResult<()> {
        Ok(self.handle(raw)?)
    }

    fn on_connect(&self) {
        info!("Account stream connected");
    }
}

// =============================================================================
// Listen key requests
// =============================================================================

/// Run a listen key request with a per-attempt timeout and bounded retries.
async fn listen_key_request<T, F, Fut>(
    op: &'static str,
    attempts: u32,
    config: &AccountFeedConfig,
    cancel: &CancellationToken,
    mut call: F,
) -> Result<T, String>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = RestResult<T>>,
{
    let attempts = attempts.max(1);
    let timeout = Duration::from_millis(config.renew_timeout_ms);
    let delay = Duration::from_millis(config.renew_retry_delay_ms);
    let mut last_error = String::from("cancelled");

    for attempt in 1..=attempts {
        if cancel.is_cancelled() {
            break;
        }
        match tokio::time::timeout(timeout, call()).await {
            Ok(Ok(value)) => {
                Metrics::listen_key(op, true);
                return Ok(value);
            }
            Ok(Err(e)) => last_error = e.to_string(),
            Err(_) => last_error = format!("timed out after {}ms", config.renew_timeout_ms),
        }
        warn!(op, attempt, attempts, error = %last_error, "Listen key request failed");

        if attempt < attempts {
            tokio::select! {
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(delay) => {}
            }
        }
    }

    Metrics::listen_key(op, false);
    Err(last_error)
}

async fn run_renewal_loop(
    handler: Arc<AccountHandler>,
    rest: Arc<dyn ExchangeRest>,
    config: AccountFeedConfig,
    cancel: CancellationToken,
) {
    let period = Duration::from_millis(config.renew_interval_ms.max(1));
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            () = tokio::time::sleep(period) => {
                let Some(key) = handler.current_key() else {
                    continue;
                };
                let renewed = listen_key_request(
                    "renew",
                    config.renew_max_retries,
                    &config,
                    &cancel,
                    || rest.renew_listen_key(key.clone()),
                )
                .await;
                match renewed {
                    Ok(()) => debug!("Listen key renewed"),
                    Err(e) => error!(error = %e, "Listen key renewal exhausted retries"),
                }
            }
            () = handler.key_expired.notified() => {
                let created = listen_key_request(
                    "create",
                    config.renew_max_retries,
                    &config,
                    &cancel,
                    || rest.get_listen_key(),
                )
                .await;
                match created {
                    Ok(key) => {
                        handler.set_key(key);
                        info!("Replaced expired listen key");
                    }
                    Err(e) => error!(error = %e, "Could not replace expired listen key"),
                }
            }
        }
    }
    debug!("Listen key renewal loop exited");
}

// =============================================================================
// Feed
// =============================================================================

/// Account stream with listen key lifecycle.
pub struct AccountFeed {
    feed: Feed<AccountHandler>,
    rest: Arc<dyn ExchangeRest>,
    config: AccountFeedConfig,
    cancel: CancellationToken,
    started: AtomicBool,
    renew_task: Mutex<Option<JoinHandle<()>>>,
}

impl AccountFeed {
    pub fn new(
        ws_base_url: &str,
        config: AccountFeedConfig,
        rest: Arc<dyn ExchangeRest>,
        cache: Arc<AccountStateCache>,
        consistency: Arc<DataConsistencyManager>,
    ) -> Self {
        let handler = Arc::new(AccountHandler::new(ws_base_url, cache, consistency));
        Self {
            feed: Feed::new(handler, config.feed.clone()),
            rest,
            config,
            cancel: CancellationToken::new(),
            started: AtomicBool::new(false),
            renew_task: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        self.feed.name()
    }

    pub fn state(&self) -> FeedState {
        self.feed.state()
    }

    pub fn stats(&self) -> FeedStatsSnapshot {
        self.feed.stats()
    }

    pub fn listen_key(&self) -> Option<String> {
        self.feed.handler().current_key()
    }

    /// Obtain a listen key, connect, and start the renewal schedule.
    ///
    /// Fails if no key could be obtained. Idempotent once started.
    pub async fn start(&self) -> FeedResult<()> {
        if self.cancel.is_cancelled() {
            return Err(FeedError::Config("account feed already stopped".to_string()));
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let key = listen_key_request(
            "create",
            self.config.initial_key_retries,
            &self.config,
            &self.cancel,
            || self.rest.get_listen_key(),
        )
        .await
        .map_err(|e| {
            self.started.store(false, Ordering::SeqCst);
            FeedError::Renewal(format!("could not obtain listen key: {e}"))
        })?;

        let handler = self.feed.handler().clone();
        handler.set_key(key);
        self.feed.start();

        let task = tokio::spawn(run_renewal_loop(
            handler,
            self.rest.clone(),
            self.config.clone(),
            self.cancel.clone(),
        ));
        *self.renew_task.lock() = Some(task);
        info!(
            renew_interval_ms = self.config.renew_interval_ms,
            "Account feed started"
        );
        Ok(())
    }

    /// Stop renewal, close the stream, then close the key. Idempotent.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let task = self.renew_task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "Renewal task ended abnormally");
            }
        }
        self.feed.stop().await;

        let key = self.feed.handler().listen_key.write().take();
        let Some(key) = key else {
            return;
        };
        let timeout = Duration::from_millis(self.config.renew_timeout_ms);
        match tokio::time::timeout(timeout, self.rest.close_listen_key(key)).await {
            Ok(Ok(())) => {
                Metrics::listen_key("close", true);
                debug!("Listen key closed");
            }
            Ok(Err(e)) => {
                Metrics::listen_key("close", false);
                warn!(error = %e, "Failed to close listen key");
            }
            Err(_) => {
                Metrics::listen_key("close", false);
                warn!("Timed out closing listen key");
            }
        }
    }
}
