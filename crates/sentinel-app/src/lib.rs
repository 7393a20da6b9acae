//! Market and account data ingestion service.
//!
//! Wires the shard feeds, the account feed, the consistency manager and the
//! REST client into one runtime, and exposes the read-only query surface
//! through [`WebSocketManager`].

pub mod app;
pub mod config;
pub mod error;
pub mod manager;
pub mod ops;

pub use app::Application;
pub use config::AppConfig;
pub use error::{AppError, AppResult};
pub use manager::{FeedStatus, WebSocketManager};
