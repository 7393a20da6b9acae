//! Market and account stream feeds.
//!
//! Concrete [`sentinel_ws::FeedHandler`]s built on the reconnecting feed:
//! - `ShardFeed`: one combined-stream connection for a static partition of
//!   the symbol universe (klines or book tickers)
//! - `AccountFeed`: the user data stream, with listen key lifecycle
//!
//! Decoded data lands in a shared `MarketStore` and `AccountStateCache`.

pub mod account;
pub mod batcher;
pub mod error;
pub mod events;
pub mod shard;
pub mod store;
pub mod stream;

pub use account::{AccountFeed, AccountFeedConfig, ACCOUNT_HEALTH_KEY};
pub use batcher::BarBatcher;
pub use error::{FeedError, FeedResult};
pub use events::{split_frame, StreamEvent};
pub use shard::{ShardConfig, ShardContext, ShardFeed, ShardKind};
pub use store::{BarSink, MarketStore};
pub use stream::{combined_stream_url, partition_symbols};
