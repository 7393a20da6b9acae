//! REST collaborator trait.

use crate::error::RestResult;
use sentinel_core::{AccountSnapshot, Interval, KlineBar, Position, PriceQuote, Symbol};
use std::pin::Pin;

/// Boxed future for dyn-compatible async trait methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn std::future::Future<Output = T> + Send + 'a>>;

/// Exchange REST surface consumed by the ingestion layer.
///
/// Object safe so callers can hold `Arc<dyn ExchangeRest>` and tests can
/// substitute [`crate::MockExchangeRest`].
pub trait ExchangeRest: Send + Sync {
    /// Most recent `limit` bars, oldest first.
    fn get_klines(
        &self,
        symbol: Symbol,
        interval: Interval,
        limit: u32,
    ) -> BoxFuture<'_, RestResult<Vec<KlineBar>>>;

    /// Current top of book.
    fn get_ticker(&self, symbol: Symbol) -> BoxFuture<'_, RestResult<PriceQuote>>;

    /// All open positions (zero amounts excluded).
    fn get_position_info(&self) -> BoxFuture<'_, RestResult<Vec<Position>>>;

    /// Balances and positions for reconciliation.
    fn get_account_snapshot(&self) -> BoxFuture<'_, RestResult<AccountSnapshot>>;

    /// Obtain a new listen key for the account stream.
    fn get_listen_key(&self) -> BoxFuture<'_, RestResult<String>>;

    /// Extend the validity of a listen key.
    fn renew_listen_key(&self, listen_key: String) -> BoxFuture<'_, RestResult<()>>;

    /// Invalidate a listen key.
    fn close_listen_key(&self, listen_key: String) -> BoxFuture<'_, RestResult<()>>;
}
