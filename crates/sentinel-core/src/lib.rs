//! Core domain types for the sentinel market data layer.
//!
//! This crate provides the types shared by every other crate:
//! - `Symbol`, `Interval`: stream identifiers
//! - `Balance`, `Position`, `OpenOrder`, `AccountSnapshot`: account state
//! - `KlineBar`, `PriceQuote`: market data
//! - `RingBuffer`: bounded history with oldest-first eviction

pub mod account;
pub mod error;
pub mod market;
pub mod ring;
pub mod symbol;

pub use account::{
    AccountSnapshot, Balance, MarginType, OpenOrder, OrderSide, Position, SnapshotBalance,
};
pub use error::{CoreError, Result};
pub use market::{now_ms, KlineBar, PriceQuote};
pub use ring::RingBuffer;
pub use symbol::{Interval, Symbol};
