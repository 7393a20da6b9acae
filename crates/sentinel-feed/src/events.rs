//! Stream frame decoding.
//!
//! Combined streams wrap each payload as `{"stream": "...", "data": {...}}`;
//! the raw user data stream sends the payload directly. Payloads are
//! decoded by their `e` field into [`StreamEvent`].

use crate::error::{FeedError, FeedResult};
use rust_decimal::Decimal;
use sentinel_core::{Interval, KlineBar, OpenOrder, OrderSide, PriceQuote, Symbol};
use serde::Deserialize;
use serde_json::Value;

/// Split a frame into its stream name (if enveloped) and payload.
pub fn split_frame(raw: &str) -> FeedResult<(Option<String>, Value)> {
    let mut value: Value = serde_json::from_str(raw)?;
    let enveloped = value.get("stream").is_some_and(Value::is_string) && value.get("data").is_some();
    if !enveloped {
        return Ok((None, value));
    }
    let stream = value
        .get("stream")
        .and_then(Value::as_str)
        .map(str::to_string);
    let data = value
        .get_mut("data")
        .map(Value::take)
        .ok_or_else(|| FeedError::Protocol("envelope without data".to_string()))?;
    Ok((stream, data))
}

/// Symbol field (`s`) of a market payload.
pub fn payload_symbol(data: &Value) -> Option<&str> {
    data.get("s").and_then(Value::as_str)
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "e")]
pub enum StreamEvent {
    #[serde(rename = "kline")]
    Kline(KlineEvent),
    #[serde(rename = "bookTicker")]
    BookTicker(BookTickerEvent),
    #[serde(rename = "ACCOUNT_UPDATE")]
    AccountUpdate(AccountUpdateEvent),
    #[serde(rename = "outboundAccountPosition")]
    BalanceUpdate(BalanceUpdateEvent),
    #[serde(rename = "ORDER_TRADE_UPDATE")]
    OrderTradeUpdate(OrderTradeUpdateEvent),
    #[serde(rename = "listenKeyExpired")]
    ListenKeyExpired(ListenKeyExpiredEvent),
    #[serde(other)]
    Unknown,
}

impl StreamEvent {
    pub fn decode(data: Value) -> FeedResult<Self> {
        Ok(serde_json::from_value(data)?)
    }
}

// =============================================================================
// Market events
// =============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct KlineEvent {
    #[serde(rename = "E")]
    pub event_time: i64,
    #[serde(rename = "s")]
    pub symbol: Symbol,
    #[serde(rename = "k")]
    pub kline: RawKline,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawKline {
    #[serde(rename = "t")]
    pub open_time: i64,
    #[serde(rename = "T")]
    pub close_time: i64,
    #[serde(rename = "i")]
    pub interval: Interval,
    #[serde(rename = "o")]
    pub open: Decimal,
    #[serde(rename = "h")]
    pub high: Decimal,
    #[serde(rename = "l")]
    pub low: Decimal,
    #[serde(rename = "c")]
    pub close: Decimal,
    #[serde(rename = "v")]
    pub volume: Decimal,
    #[serde(rename = "x")]
    pub is_final: bool,
}

impl KlineEvent {
    /// Closed bar, or `None` while the bar is still forming.
    pub fn into_bar(self, local_ts: i64, shard_id: Option<usize>) -> Option<KlineBar> {
        if !self.kline.is_final {
            return None;
        }
        Some(KlineBar {
            symbol: self.symbol,
            interval: self.kline.interval,
            open_time: self.kline.open_time,
            close_time: self.kline.close_time,
            open: self.kline.open,
            high: self.kline.high,
            low: self.kline.low,
            close: self.kline.close,
            volume: self.kline.volume,
            server_ts: self.event_time,
            local_ts,
            latency_ms: KlineBar::latency_between(self.event_time, local_ts),
            shard_id,
            is_final: true,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BookTickerEvent {
    #[serde(rename = "E")]
    pub event_time: i64,
    #[serde(rename = "s")]
    pub symbol: Symbol,
    #[serde(rename = "b")]
    pub bid: Decimal,
    #[serde(rename = "B")]
    pub bid_qty: Decimal,
    #[serde(rename = "a")]
    pub ask: Decimal,
    #[serde(rename = "A")]
    pub ask_qty: Decimal,
}

impl BookTickerEvent {
    pub fn into_quote(self, local_ts: i64) -> PriceQuote {
        PriceQuote {
            symbol: self.symbol,
            bid: self.bid,
            ask: self.ask,
            bid_qty: self.bid_qty,
            ask_qty: self.ask_qty,
            server_ts: self.event_time,
            local_ts,
        }
    }
}

// =============================================================================
// Account events
// =============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct AccountUpdateEvent {
    #[serde(rename = "E")]
    pub event_time: i64,
    #[serde(rename = "a")]
    pub update: AccountUpdateData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AccountUpdateData {
    /// Update reason (ORDER, FUNDING_FEE, ...).
    #[serde(rename = "m", default)]
    pub reason: String,
    #[serde(rename = "B", default)]
    pub balances: Vec<RawFuturesBalance>,
    #[serde(rename = "P", default)]
    pub positions: Vec<RawFuturesPosition>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawFuturesBalance {
    #[serde(rename = "a")]
    pub asset: String,
    #[serde(rename = "wb")]
    pub wallet_balance: Decimal,
    #[serde(rename = "cw")]
    pub cross_wallet_balance: Decimal,
}

impl RawFuturesBalance {
    /// (free, locked): cross wallet is free, the rest of the wallet is locked.
    pub fn free_locked(&self) -> (Decimal, Decimal) {
        let locked = (self.wallet_balance - self.cross_wallet_balance).max(Decimal::ZERO);
        (self.cross_wallet_balance, locked)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawFuturesPosition {
    #[serde(rename = "s")]
    pub symbol: Symbol,
    #[serde(rename = "pa")]
    pub amount: Decimal,
    #[serde(rename = "ep")]
    pub entry_price: Decimal,
    #[serde(rename = "up", default)]
    pub unrealized_pnl: Decimal,
    #[serde(rename = "mt", default)]
    pub margin_type: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BalanceUpdateEvent {
    #[serde(rename = "E")]
    pub event_time: i64,
    #[serde(rename = "B", default)]
    pub balances: Vec<RawSpotBalance>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawSpotBalance {
    #[serde(rename = "a")]
    pub asset: String,
    #[serde(rename = "f")]
    pub free: Decimal,
    #[serde(rename = "l")]
    pub locked: Decimal,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OrderTradeUpdateEvent {
    #[serde(rename = "E")]
    pub event_time: i64,
    #[serde(rename = "o")]
    pub order: RawOrder,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawOrder {
    #[serde(rename = "s")]
    pub symbol: Symbol,
    #[serde(rename = "c", default)]
    pub client_order_id: String,
    #[serde(rename = "S")]
    pub side: OrderSide,
    #[serde(rename = "o")]
    pub order_type: String,
    #[serde(rename = "X")]
    pub status: String,
    #[serde(rename = "i")]
    pub order_id: i64,
    #[serde(rename = "p")]
    pub price: Decimal,
    #[serde(rename = "q")]
    pub orig_qty: Decimal,
    #[serde(rename = "z", default)]
    pub filled_qty: Decimal,
    #[serde(rename = "T", default)]
    pub update_time: i64,
}

impl RawOrder {
    pub fn into_open_order(self) -> (Symbol, OpenOrder) {
        (
            self.symbol,
            OpenOrder {
                order_id: self.order_id,
                client_order_id: self.client_order_id,
                side: self.side,
                order_type: self.order_type,
                status: self.status,
                price: self.price,
                orig_qty: self.orig_qty,
                filled_qty: self.filled_qty,
                update_time: self.update_time,
            },
        )
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListenKeyExpiredEvent {
    #[serde(rename = "E")]
    pub event_time: i64,
}
