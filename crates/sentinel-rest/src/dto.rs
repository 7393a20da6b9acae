//! Raw REST response types.
//!
//! Field names follow the USDⓈ-M futures REST API. Decimal fields accept the
//! exchange's string encoding directly.

use rust_decimal::Decimal;
use sentinel_core::{Interval, KlineBar, MarginType, Position, PriceQuote, Symbol};
use serde::Deserialize;

use crate::error::{RestError, RestResult};

/// `POST /fapi/v1/listenKey` response.
#[derive(Debug, Deserialize)]
pub struct ListenKeyResponse {
    #[serde(rename = "listenKey")]
    pub listen_key: String,
}

/// `GET /fapi/v1/ticker/bookTicker` response.
#[derive(Debug, Deserialize)]
pub struct RawBookTicker {
    pub symbol: String,
    #[serde(rename = "bidPrice")]
    pub bid_price: Decimal,
    #[serde(rename = "bidQty")]
    pub bid_qty: Decimal,
    #[serde(rename = "askPrice")]
    pub ask_price: Decimal,
    #[serde(rename = "askQty")]
    pub ask_qty: Decimal,
    #[serde(default)]
    pub time: i64,
}

impl RawBookTicker {
    pub fn into_quote(self, local_ts: i64) -> RestResult<PriceQuote> {
        Ok(PriceQuote {
            symbol: parse_symbol(&self.symbol)?,
            bid: self.bid_price,
            ask: self.ask_price,
            bid_qty: self.bid_qty,
            ask_qty: self.ask_qty,
            server_ts: if self.time > 0 { self.time } else { local_ts },
            local_ts,
        })
    }
}

/// `GET /fapi/v2/positionRisk` entry.
#[derive(Debug, Deserialize)]
pub struct RawPositionRisk {
    pub symbol: String,
    #[serde(rename = "positionAmt")]
    pub position_amt: Decimal,
    #[serde(rename = "entryPrice")]
    pub entry_price: Decimal,
    #[serde(rename = "unRealizedProfit")]
    pub unrealized_profit: Decimal,
    #[serde(rename = "liquidationPrice", default)]
    pub liquidation_price: Decimal,
    #[serde(default = "default_leverage_str")]
    pub leverage: String,
    #[serde(rename = "marginType", default = "default_margin_type_str")]
    pub margin_type: String,
}

fn default_leverage_str() -> String {
    "1".to_string()
}

fn default_margin_type_str() -> String {
    "cross".to_string()
}

impl RawPositionRisk {
    /// Convert, returning None for flat entries.
    pub fn into_position(self) -> RestResult<Option<Position>> {
        if self.position_amt.is_zero() {
            return Ok(None);
        }
        let leverage = self
            .leverage
            .parse::<u32>()
            .map_err(|e| RestError::Decode(format!("leverage {:?}: {e}", self.leverage)))?;
        let margin_type = self
            .margin_type
            .parse::<MarginType>()
            .map_err(|e| RestError::Decode(e.to_string()))?;
        let position = Position::new(
            parse_symbol(&self.symbol)?,
            self.position_amt,
            self.entry_price,
            self.unrealized_profit,
        )
        .with_liquidation_price(self.liquidation_price)
        .with_margin_type(margin_type)
        .with_leverage(leverage);
        Ok(Some(position))
    }
}

/// `GET /fapi/v2/account` response (fields used for reconciliation).
#[derive(Debug, Deserialize)]
pub struct RawAccount {
    #[serde(default)]
    pub assets: Vec<RawAccountAsset>,
}

#[derive(Debug, Deserialize)]
pub struct RawAccountAsset {
    pub asset: String,
    #[serde(rename = "walletBalance")]
    pub wallet_balance: Decimal,
    #[serde(rename = "crossWalletBalance")]
    pub cross_wallet_balance: Decimal,
}

/// Parse one row of `GET /fapi/v1/klines`.
///
/// Rows are positional arrays:
/// `[openTime, open, high, low, close, volume, closeTime, ...]`.
pub fn parse_kline_row(
    symbol: &Symbol,
    interval: Interval,
    row: &[serde_json::Value],
    now_ms: i64,
) -> RestResult<KlineBar> {
    if row.len() < 7 {
        return Err(RestError::Decode(format!(
            "kline row has {} fields, expected at least 7",
            row.len()
        )));
    }
    let open_time = int_at(row, 0)?;
    let close_time = int_at(row, 6)?;
    Ok(KlineBar {
        symbol: symbol.clone(),
        interval,
        open_time,
        close_time,
        open: decimal_at(row, 1)?,
        high: decimal_at(row, 2)?,
        low: decimal_at(row, 3)?,
        close: decimal_at(row, 4)?,
        volume: decimal_at(row, 5)?,
        server_ts: close_time,
        local_ts: now_ms,
        latency_ms: 0,
        shard_id: None,
        is_final: close_time < now_ms,
    })
}

fn int_at(row: &[serde_json::Value], idx: usize) -> RestResult<i64> {
    row[idx]
        .as_i64()
        .ok_or_else(|| RestError::Decode(format!("kline field {idx} is not an integer")))
}

fn decimal_at(row: &[serde_json::Value], idx: usize) -> RestResult<Decimal> {
    let raw = match &row[idx] {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Number(n) => n.to_string(),
        other => {
            return Err(RestError::Decode(format!(
                "kline field {idx} has unexpected type: {other}"
            )))
        }
    };
    raw.parse::<Decimal>()
        .map_err(|e| RestError::Decode(format!("kline field {idx}: {e}")))
}

pub(crate) fn parse_symbol(raw: &str) -> RestResult<Symbol> {
    Symbol::new(raw).map_err(|e| RestError::Decode(e.to_string()))
}
