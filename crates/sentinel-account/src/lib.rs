//! Account state cache.
//!
//! One shared, internally synchronized store of balances, positions and
//! open orders. Feeds write deltas through its typed methods; REST snapshots
//! correct drift through [`AccountStateCache::reconcile`]. Every read
//! returns an owned copy.

pub mod cache;
pub mod reconcile;

pub use cache::{AccountStateCache, CacheStats};
pub use reconcile::{
    BalanceMismatch, PositionMismatch, PositionMismatchKind, ReconcileStatus,
    ReconciliationResult, RECONCILE_EPSILON,
};
