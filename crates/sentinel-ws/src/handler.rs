//! Per-feed message handling.

use crate::error::HandlerResult;

/// Concrete behavior plugged into a [`crate::Feed`].
///
/// `process_message` runs on the feed's single consumer task, so frames are
/// handled strictly in receipt order. Hooks run on the producer task and must
/// not block.
pub trait FeedHandler: Send + Sync + 'static {
    /// Logical feed name used in logs and metrics.
    fn name(&self) -> &str;

    /// URL to connect to. Re-read on every connection attempt.
    fn url(&self) -> String;

    /// Handle one raw text frame.
    fn process_message(&self, raw: &str) -> HandlerResult<()>;

    /// Called after each successful handshake.
    fn on_connect(&self) {}

    /// Called when an established connection ends.
    fn on_disconnect(&self) {}

    /// Called once when the feed is stopped, after both tasks have exited.
    fn on_stop(&self) {}
}
