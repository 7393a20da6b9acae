//! Reconciliation of cached account state against a REST snapshot.
//!
//! REST is ground truth here:
//! - snapshot entry absent or different (beyond epsilon) in the cache is
//!   overwritten and reported as a mismatch
//! - cached position absent from the snapshot is deleted ("closed elsewhere")
//! - balances absent from the snapshot are left untouched
//!
//! A malformed snapshot yields status `error` and leaves the cache as it was.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use sentinel_core::{AccountSnapshot, Balance, Position, Symbol};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fmt;
use thiserror::Error;

/// Tolerance for treating two decimal values as equal.
pub const RECONCILE_EPSILON: Decimal = dec!(0.0001);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReconcileStatus {
    /// Cache already matched the snapshot.
    Ok,
    /// Mismatches found and healed.
    Warning,
    /// Snapshot rejected; cache unchanged.
    Error,
}

impl ReconcileStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Warning => "warning",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for ReconcileStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BalanceMismatch {
    pub asset: String,
    /// `None` when the asset was missing from the cache.
    pub cached: Option<Balance>,
    pub snapshot: Balance,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionMismatchKind {
    /// In the snapshot but not in the cache.
    Missing,
    /// Amount or entry price differ.
    Differs,
    /// In the cache but not in the snapshot.
    ClosedElsewhere,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PositionMismatch {
    pub symbol: Symbol,
    pub kind: PositionMismatchKind,
    pub cached_amount: Option<Decimal>,
    pub snapshot_amount: Option<Decimal>,
}

/// Outcome of one reconciliation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconciliationResult {
    pub status: ReconcileStatus,
    pub balance_mismatches: Vec<BalanceMismatch>,
    pub position_mismatches: Vec<PositionMismatch>,
    /// True when the cache was modified.
    pub reconciled: bool,
    pub error: Option<String>,
}

impl ReconciliationResult {
    pub(crate) fn failed(message: String) -> Self {
        Self {
            status: ReconcileStatus::Error,
            balance_mismatches: Vec::new(),
            position_mismatches: Vec::new(),
            reconciled: false,
            error: Some(message),
        }
    }

    pub fn mismatch_count(&self) -> usize {
        self.balance_mismatches.len() + self.position_mismatches.len()
    }
}

/// Reasons a snapshot is refused.
#[derive(Debug, Error, PartialEq, Eq)]
pub(crate) enum SnapshotError {
    #[error("empty asset name in snapshot")]
    EmptyAsset,

    #[error("duplicate asset {0} in snapshot")]
    DuplicateAsset(String),

    #[error("negative balance for {asset}: free={free}, locked={locked}")]
    NegativeBalance {
        asset: String,
        free: Decimal,
        locked: Decimal,
    },

    #[error("duplicate position {0} in snapshot")]
    DuplicatePosition(Symbol),

    #[error("negative entry price for {0}")]
    NegativeEntryPrice(Symbol),
}

pub(crate) fn validate_snapshot(snapshot: &AccountSnapshot) -> Result<(), SnapshotError> {
    let mut assets = HashSet::new();
    for b in &snapshot.balances {
        if b.asset.trim().is_empty() {
            return Err(SnapshotError::EmptyAsset);
        }
        if b.free < Decimal::ZERO || b.locked < Decimal::ZERO {
            return Err(SnapshotError::NegativeBalance {
                asset: b.asset.clone(),
                free: b.free,
                locked: b.locked,
            });
        }
        if !assets.insert(b.asset.as_str()) {
            return Err(SnapshotError::DuplicateAsset(b.asset.clone()));
        }
    }

    let mut symbols = HashSet::new();
    for p in &snapshot.positions {
        if p.entry_price < Decimal::ZERO {
            return Err(SnapshotError::NegativeEntryPrice(p.symbol.clone()));
        }
        if !symbols.insert(&p.symbol) {
            return Err(SnapshotError::DuplicatePosition(p.symbol.clone()));
        }
    }
    Ok(())
}

pub(crate) fn approx_eq(a: Decimal, b: Decimal) -> bool {
    (a - b).abs() <= RECONCILE_EPSILON
}

/// Apply a validated snapshot to the maps, returning the mismatches healed.
pub(crate) fn apply_snapshot(
    balances: &mut HashMap<String, Balance>,
    positions: &mut HashMap<Symbol, Position>,
    snapshot: &AccountSnapshot,
) -> (Vec<BalanceMismatch>, Vec<PositionMismatch>) {
    let mut balance_mismatches = Vec::new();
    for b in &snapshot.balances {
        let truth = Balance::new(b.asset.clone(), b.free, b.locked);
        let cached = balances.get(&b.asset);
        let matches = cached
            .is_some_and(|c| approx_eq(c.free, truth.free) && approx_eq(c.locked, truth.locked));
        if !matches {
            balance_mismatches.push(BalanceMismatch {
                asset: b.asset.clone(),
                cached: cached.cloned(),
                snapshot: truth.clone(),
            });
            balances.insert(b.asset.clone(), truth);
        }
    }

    let mut position_mismatches = Vec::new();
    // Zero amounts in the snapshot count as absent.
    let live: HashMap<&Symbol, &Position> = snapshot
        .positions
        .iter()
        .filter(|p| !p.amount.is_zero())
        .map(|p| (&p.symbol, p))
        .collect();

    for (symbol, truth) in &live {
        let kind = match positions.get(*symbol) {
            None => Some(PositionMismatchKind::Missing),
            Some(cached)
                if !approx_eq(cached.amount, truth.amount)
                    || !approx_eq(cached.entry_price, truth.entry_price) =>
            {
                Some(PositionMismatchKind::Differs)
            }
            Some(_) => None,
        };
        if let Some(kind) = kind {
            position_mismatches.push(PositionMismatch {
                symbol: (*symbol).clone(),
                kind,
                cached_amount: positions.get(*symbol).map(|p| p.amount),
                snapshot_amount: Some(truth.amount),
            });
            positions.insert((*symbol).clone(), (*truth).clone());
        }
    }

    let closed: Vec<Symbol> = positions
        .keys()
        .filter(|s| !live.contains_key(s))
        .cloned()
        .collect();
    for symbol in closed {
        if let Some(removed) = positions.remove(&symbol) {
            position_mismatches.push(PositionMismatch {
                symbol,
                kind: PositionMismatchKind::ClosedElsewhere,
                cached_amount: Some(removed.amount),
                snapshot_amount: None,
            });
        }
    }

    position_mismatches.sort_by(|a, b| a.symbol.cmp(&b.symbol));
    balance_mismatches.sort_by(|a, b| a.asset.cmp(&b.asset));
    (balance_mismatches, position_mismatches)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sentinel_core::SnapshotBalance;

    fn sym(s: &str) -> Symbol {
        Symbol::new(s).unwrap()
    }

    #[test]
    fn test_approx_eq_epsilon() {
        assert!(approx_eq(dec!(1.00000), dec!(1.00009)));
        assert!(approx_eq(dec!(1.0000), dec!(1.0001)));
        assert!(!approx_eq(dec!(1.0000), dec!(1.00011)));
    }

    #[test]
    fn test_validate_rejects_negative_balance() {
        let snapshot = AccountSnapshot {
            balances: vec![SnapshotBalance {
                asset: "USDT".to_string(),
                free: dec!(-1),
                locked: dec!(0),
            }],
            positions: Vec::new(),
        };
        assert!(matches!(
            validate_snapshot(&snapshot),
            Err(SnapshotError::NegativeBalance { .. })
        ));
    }

    #[test]
    fn test_validate_rejects_duplicates() {
        let b = SnapshotBalance {
            asset: "USDT".to_string(),
            free: dec!(1),
            locked: dec!(0),
        };
        let snapshot = AccountSnapshot {
            balances: vec![b.clone(), b],
            positions: Vec::new(),
        };
        assert_eq!(
            validate_snapshot(&snapshot),
            Err(SnapshotError::DuplicateAsset("USDT".to_string()))
        );

        let p = Position::new(sym("BTCUSDT"), dec!(1), dec!(100), dec!(0));
        let snapshot = AccountSnapshot {
            balances: Vec::new(),
            positions: vec![p.clone(), p],
        };
        assert_eq!(
            validate_snapshot(&snapshot),
            Err(SnapshotError::DuplicatePosition(sym("BTCUSDT")))
        );
    }

    #[test]
    fn test_apply_reports_kinds() {
        let mut balances = HashMap::new();
        let mut positions = HashMap::new();
        positions.insert(
            sym("ETHUSDT"),
            Position::new(sym("ETHUSDT"), dec!(1), dec!(2000), dec!(0)),
        );
        positions.insert(
            sym("SOLUSDT"),
            Position::new(sym("SOLUSDT"), dec!(10), dec!(100), dec!(0)),
        );

        let snapshot = AccountSnapshot {
            balances: Vec::new(),
            positions: vec![
                Position::new(sym("BTCUSDT"), dec!(0.1), dec!(50000), dec!(0)),
                Position::new(sym("ETHUSDT"), dec!(2), dec!(2000), dec!(0)),
            ],
        };
        let (b, p) = apply_snapshot(&mut balances, &mut positions, &snapshot);
        assert!(b.is_empty());
        let kinds: Vec<_> = p.iter().map(|m| (m.symbol.as_str(), m.kind)).collect();
        assert_eq!(
            kinds,
            vec![
                ("BTCUSDT", PositionMismatchKind::Missing),
                ("ETHUSDT", PositionMismatchKind::Differs),
                ("SOLUSDT", PositionMismatchKind::ClosedElsewhere),
            ]
        );
        assert_eq!(positions.len(), 2);
        assert_eq!(positions["ETHUSDT"].amount, dec!(2));
    }
}
