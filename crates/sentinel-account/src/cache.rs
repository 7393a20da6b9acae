//! Shared account state store.

use crate::reconcile::{apply_snapshot, validate_snapshot, ReconcileStatus, ReconciliationResult};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use sentinel_core::{now_ms, AccountSnapshot, Balance, OpenOrder, Position, Symbol};
use sentinel_telemetry::Metrics;
use serde::Serialize;
use std::collections::HashMap;
use tracing::{debug, error, info, warn};

#[derive(Debug, Default)]
struct AccountState {
    balances: HashMap<String, Balance>,
    positions: HashMap<Symbol, Position>,
    open_orders: HashMap<Symbol, Vec<OpenOrder>>,
    /// Epoch ms of the last applied write, 0 if none.
    last_update_ms: i64,
    writes: u64,
}

impl AccountState {
    fn touch(&mut self) {
        self.last_update_ms = now_ms();
        self.writes += 1;
    }
}

/// Cache statistics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub balances: usize,
    pub positions: usize,
    pub symbols_with_orders: usize,
    pub writes: u64,
    pub last_update_ms: Option<i64>,
}

/// Process-wide account state.
///
/// Construct once and share via `Arc`. All writes go through the typed
/// methods under one lock; reads clone.
#[derive(Debug, Default)]
pub struct AccountStateCache {
    state: RwLock<AccountState>,
}

impl AccountStateCache {
    pub fn new() -> Self {
        Self::default()
    }

    // =========================================================================
    // Balances
    // =========================================================================

    /// Set a balance. No-op if free and locked are unchanged.
    ///
    /// Returns true if the cache was modified.
    pub fn update_balance(&self, asset: &str, free: Decimal, locked: Decimal) -> bool {
        let mut state = self.state.write();
        if let Some(current) = state.balances.get(asset) {
            if current.free == free && current.locked == locked {
                return false;
            }
        }
        state
            .balances
            .insert(asset.to_string(), Balance::new(asset, free, locked));
        state.touch();
        debug!(asset, %free, %locked, "Balance updated");
        true
    }

    pub fn get_balance(&self, asset: &str) -> Option<Balance> {
        self.state.read().balances.get(asset).cloned()
    }

    /// All balances sorted by asset.
    pub fn get_all_balances(&self) -> Vec<Balance> {
        let mut balances: Vec<Balance> = self.state.read().balances.values().cloned().collect();
        balances.sort_by(|a, b| a.asset.cmp(&b.asset));
        balances
    }

    // =========================================================================
    // Positions
    // =========================================================================

    /// Replace the position for its symbol. A zero amount deletes it.
    pub fn update_position(&self, position: Position) {
        if position.amount.is_zero() {
            self.remove_position(position.symbol.as_str());
            return;
        }
        let mut state = self.state.write();
        debug!(symbol = %position.symbol, amount = %position.amount, "Position updated");
        state.positions.insert(position.symbol.clone(), position);
        state.touch();
    }

    /// Delete a position, returning it if it existed.
    pub fn remove_position(&self, symbol: &str) -> Option<Position> {
        let mut state = self.state.write();
        let removed = state.positions.remove(symbol);
        if removed.is_some() {
            state.touch();
            debug!(symbol, "Position removed");
        }
        removed
    }

    pub fn get_position(&self, symbol: &str) -> Option<Position> {
        self.state.read().positions.get(symbol).cloned()
    }

    /// All positions sorted by symbol.
    pub fn get_all_positions(&self) -> Vec<Position> {
        let mut positions: Vec<Position> =
            self.state.read().positions.values().cloned().collect();
        positions.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        positions
    }

    // =========================================================================
    // Open orders
    // =========================================================================

    /// Replace the open order list for a symbol. An empty list removes it.
    pub fn update_open_orders(&self, symbol: &Symbol, orders: Vec<OpenOrder>) {
        let mut state = self.state.write();
        if orders.is_empty() {
            state.open_orders.remove(symbol);
        } else {
            state.open_orders.insert(symbol.clone(), orders);
        }
        state.touch();
    }

    pub fn get_open_orders(&self, symbol: &str) -> Vec<OpenOrder> {
        self.state
            .read()
            .open_orders
            .get(symbol)
            .cloned()
            .unwrap_or_default()
    }

    // =========================================================================
    // Reconciliation
    // =========================================================================

    /// Correct the cache from a REST snapshot.
    ///
    /// Never fails: a snapshot that does not validate is reported with status
    /// `error` and the cache is left unmodified. The whole comparison runs
    /// under the write lock, so live updates never interleave with it.
    pub fn reconcile(&self, snapshot: &AccountSnapshot) -> ReconciliationResult {
        if let Err(e) = validate_snapshot(snapshot) {
            error!(error = %e, "Reconciliation rejected snapshot");
            Metrics::reconcile(ReconcileStatus::Error.as_str(), 0, 0);
            return ReconciliationResult::failed(e.to_string());
        }

        let (balance_mismatches, position_mismatches) = {
            let mut guard = self.state.write();
            let state = &mut *guard;
            let mismatches = apply_snapshot(&mut state.balances, &mut state.positions, snapshot);
            if !mismatches.0.is_empty() || !mismatches.1.is_empty() {
                state.touch();
            }
            mismatches
        };

        let reconciled = !balance_mismatches.is_empty() || !position_mismatches.is_empty();
        let status = if reconciled {
            ReconcileStatus::Warning
        } else {
            ReconcileStatus::Ok
        };

        for m in &balance_mismatches {
            warn!(
                asset = %m.asset,
                cached_total = ?m.cached.as_ref().map(|b| b.total),
                snapshot_total = %m.snapshot.total,
                "Balance drift corrected from REST"
            );
        }
        for m in &position_mismatches {
            warn!(
                symbol = %m.symbol,
                kind = ?m.kind,
                cached = ?m.cached_amount,
                snapshot = ?m.snapshot_amount,
                "Position drift corrected from REST"
            );
        }
        if !reconciled {
            info!("Reconciliation ok, cache matches REST");
        }
        Metrics::reconcile(
            status.as_str(),
            balance_mismatches.len(),
            position_mismatches.len(),
        );

        ReconciliationResult {
            status,
            balance_mismatches,
            position_mismatches,
            reconciled,
            error: None,
        }
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.state.read();
        CacheStats {
            balances: state.balances.len(),
            positions: state.positions.len(),
            symbols_with_orders: state.open_orders.len(),
            writes: state.writes,
            last_update_ms: (state.last_update_ms > 0).then_some(state.last_update_ms),
        }
    }
}
