//! Account state types.
//!
//! These are plain values. The only owner of live account state is the
//! account cache; everything here is copied in and out of it.

use crate::error::{CoreError, Result};
use crate::symbol::Symbol;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Balance of a single asset.
///
/// `total` is always `free + locked`; construct through [`Balance::new`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balance {
    pub asset: String,
    pub free: Decimal,
    pub locked: Decimal,
    pub total: Decimal,
}

impl Balance {
    pub fn new(asset: impl Into<String>, free: Decimal, locked: Decimal) -> Self {
        Self {
            asset: asset.into(),
            free,
            locked,
            total: free + locked,
        }
    }
}

/// Margin mode of a position.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarginType {
    #[default]
    Cross,
    Isolated,
}

impl fmt::Display for MarginType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cross => write!(f, "cross"),
            Self::Isolated => write!(f, "isolated"),
        }
    }
}

impl FromStr for MarginType {
    type Err = CoreError;

    /// Accepts both stream (`cross`) and REST (`crossed`) spellings.
    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "cross" | "crossed" => Ok(Self::Cross),
            "isolated" => Ok(Self::Isolated),
            other => Err(CoreError::InvalidMarginType(other.to_string())),
        }
    }
}

/// Open derivatives position.
///
/// `amount` is signed: positive is long, negative is short. A zero amount
/// never lives in the cache; it means the position is closed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: Symbol,
    pub amount: Decimal,
    pub entry_price: Decimal,
    pub unrealized_pnl: Decimal,
    pub pnl_pct: Decimal,
    pub liquidation_price: Decimal,
    pub margin_type: MarginType,
    pub leverage: u32,
}

impl Position {
    /// Build a position, deriving `pnl_pct` from the other fields.
    pub fn new(
        symbol: Symbol,
        amount: Decimal,
        entry_price: Decimal,
        unrealized_pnl: Decimal,
    ) -> Self {
        Self {
            symbol,
            amount,
            entry_price,
            unrealized_pnl,
            pnl_pct: Self::compute_pnl_pct(amount, entry_price, unrealized_pnl),
            liquidation_price: Decimal::ZERO,
            margin_type: MarginType::default(),
            leverage: 1,
        }
    }

    pub fn with_liquidation_price(mut self, price: Decimal) -> Self {
        self.liquidation_price = price;
        self
    }

    pub fn with_margin_type(mut self, margin_type: MarginType) -> Self {
        self.margin_type = margin_type;
        self
    }

    pub fn with_leverage(mut self, leverage: u32) -> Self {
        self.leverage = leverage;
        self
    }

    /// Unrealized PnL as a percentage of entry notional.
    ///
    /// Returns zero when the notional is zero.
    pub fn compute_pnl_pct(amount: Decimal, entry_price: Decimal, unrealized_pnl: Decimal) -> Decimal {
        let notional = amount.abs() * entry_price;
        if notional.is_zero() {
            return Decimal::ZERO;
        }
        unrealized_pnl / notional * Decimal::ONE_HUNDRED
    }

    pub fn is_long(&self) -> bool {
        self.amount.is_sign_positive() && !self.amount.is_zero()
    }

    pub fn is_short(&self) -> bool {
        self.amount.is_sign_negative() && !self.amount.is_zero()
    }

    /// Entry notional (`|amount| * entry_price`).
    pub fn notional(&self) -> Decimal {
        self.amount.abs() * self.entry_price
    }
}

/// Order side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

/// Snapshot of one open order as last reported by the exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenOrder {
    pub order_id: i64,
    pub client_order_id: String,
    pub side: OrderSide,
    pub order_type: String,
    pub status: String,
    pub price: Decimal,
    pub orig_qty: Decimal,
    pub filled_qty: Decimal,
    pub update_time: i64,
}

impl OpenOrder {
    /// Whether the exchange still considers this order working.
    pub fn is_open(&self) -> bool {
        matches!(self.status.as_str(), "NEW" | "PARTIALLY_FILLED")
    }

    pub fn remaining_qty(&self) -> Decimal {
        (self.orig_qty - self.filled_qty).max(Decimal::ZERO)
    }
}

/// Balance entry as reported by a REST snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotBalance {
    pub asset: String,
    pub free: Decimal,
    pub locked: Decimal,
}

/// REST ground truth used for reconciliation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountSnapshot {
    pub balances: Vec<SnapshotBalance>,
    pub positions: Vec<Position>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn btc() -> Symbol {
        Symbol::new("BTCUSDT").unwrap()
    }

    #[test]
    fn test_balance_total() {
        let b = Balance::new("USDT", dec!(100.5), dec!(20.25));
        assert_eq!(b.total, dec!(120.75));
    }

    #[test]
    fn test_position_pnl_pct() {
        // 0.5 BTC at 40000 = 20000 notional, +200 upnl = 1%
        let p = Position::new(btc(), dec!(0.5), dec!(40000), dec!(200));
        assert_eq!(p.pnl_pct, dec!(1));
        assert!(p.is_long());
        assert_eq!(p.notional(), dec!(20000));

        let short = Position::new(btc(), dec!(-0.5), dec!(40000), dec!(-100));
        assert_eq!(short.pnl_pct, dec!(-0.5));
        assert!(short.is_short());
    }

    #[test]
    fn test_position_pnl_pct_zero_notional() {
        assert_eq!(
            Position::compute_pnl_pct(dec!(1), Decimal::ZERO, dec!(5)),
            Decimal::ZERO
        );
    }

    #[test]
    fn test_margin_type_parse() {
        assert_eq!("crossed".parse::<MarginType>().unwrap(), MarginType::Cross);
        assert_eq!("ISOLATED".parse::<MarginType>().unwrap(), MarginType::Isolated);
        assert!("portfolio".parse::<MarginType>().is_err());
    }

    #[test]
    fn test_open_order_status() {
        let mut order = OpenOrder {
            order_id: 1,
            client_order_id: "c1".to_string(),
            side: OrderSide::Buy,
            order_type: "LIMIT".to_string(),
            status: "PARTIALLY_FILLED".to_string(),
            price: dec!(100),
            orig_qty: dec!(2),
            filled_qty: dec!(0.5),
            update_time: 0,
        };
        assert!(order.is_open());
        assert_eq!(order.remaining_qty(), dec!(1.5));
        order.status = "FILLED".to_string();
        assert!(!order.is_open());
    }
}
