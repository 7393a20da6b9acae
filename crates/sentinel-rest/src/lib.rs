//! Exchange REST collaborator.
//!
//! The ingestion layer only ever talks to REST through [`ExchangeRest`]:
//! kline backfill, ticker and position fallback, account snapshots for
//! reconciliation, and the listen key lifecycle for the account stream.
//! [`BinanceRestClient`] implements it over reqwest; [`MockExchangeRest`]
//! is an in-memory implementation for tests.

pub mod binance;
pub mod client;
pub mod dto;
pub mod error;
pub mod mock;

pub use binance::{BinanceRestClient, RestConfig, MAX_KLINE_LIMIT};
pub use client::{BoxFuture, ExchangeRest};
pub use error::{RestError, RestResult};
pub use mock::MockExchangeRest;
