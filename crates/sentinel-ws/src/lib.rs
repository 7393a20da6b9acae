//! Reconnecting WebSocket feed base for sentinel.
//!
//! A [`Feed`] owns one physical connection and splits work into two tasks:
//! - a producer that connects, answers pings, watches the heartbeat and pushes
//!   raw frames into a bounded queue (dropping the newest frame when full)
//! - a consumer that hands each frame to a [`FeedHandler`]
//!
//! Reconnects use exponential backoff (5s doubling by 1.5 up to 300s),
//! reset on every successful handshake.

pub mod backoff;
pub mod error;
pub mod feed;
pub mod handler;
pub mod heartbeat;
pub mod stats;
#[cfg(any(test, feature = "testing"))]
#[doc(hidden)]
pub mod testing;

pub use backoff::{Backoff, BackoffConfig};
pub use error::{HandlerError, HandlerResult, WsError, WsResult};
pub use feed::{Feed, FeedConfig, FeedState};
pub use handler::FeedHandler;
pub use heartbeat::{HeartbeatMonitor, HeartbeatStats};
pub use stats::{FeedStats, FeedStatsSnapshot};

use std::sync::Once;

static INIT_CRYPTO: Once = Once::new();

/// Install the rustls ring provider.
/// Must be called before any `wss://` connection is made.
pub fn init_crypto() {
    INIT_CRYPTO.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}
