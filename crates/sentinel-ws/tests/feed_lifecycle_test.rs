//! Feed lifecycle integration tests.
//!
//! Tests the connection lifecycle against a local server:
//! - Connection establishment and frame delivery
//! - Reconnection after a server-side close
//! - Shutdown

use parking_lot::Mutex;
use sentinel_ws::testing::MockWsServer;
use sentinel_ws::{BackoffConfig, Feed, FeedConfig, FeedHandler, FeedState, HandlerResult};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

struct RecordingHandler {
    url: String,
    frames: Mutex<Vec<String>>,
    connects: AtomicUsize,
    disconnects: AtomicUsize,
}

impl RecordingHandler {
    fn new(url: String) -> Self {
        Self {
            url,
            frames: Mutex::new(Vec::new()),
            connects: AtomicUsize::new(0),
            disconnects: AtomicUsize::new(0),
        }
    }
}

impl FeedHandler for RecordingHandler {
    fn name(&self) -> &str {
        "recording"
    }

    fn url(&self) -> String {
        self.url.clone()
    }

    fn process_message(&self, raw: &str) -> HandlerResult<()> {
        self.frames.lock().push(raw.to_string());
        Ok(())
    }

    fn on_connect(&self) {
        self.connects.fetch_add(1, Ordering::SeqCst);
    }

    fn on_disconnect(&self) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
    }
}

fn fast_config() -> FeedConfig {
    FeedConfig {
        backoff: BackoffConfig {
            min_delay_ms: 50,
            max_delay_ms: 200,
            multiplier: 1.5,
        },
        stop_timeout_ms: 1_000,
        ..Default::default()
    }
}

async fn wait_until<F: Fn() -> bool>(f: F) -> bool {
    timeout(Duration::from_secs(3), async {
        loop {
            if f() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .is_ok()
}

/// Frames pushed by the server reach the handler in order.
#[tokio::test]
async fn test_feed_connects_and_delivers_frames() {
    let server = MockWsServer::start().await;
    let handler = Arc::new(RecordingHandler::new(format!("{}/ws/test", server.url())));
    let feed = Feed::new(handler.clone(), fast_config());

    feed.start();
    assert!(server.wait_for_connections(1, Duration::from_secs(3)).await);
    assert!(wait_until(|| feed.state() == FeedState::Connected).await);
    assert_eq!(server.requested_paths().await, vec!["/ws/test".to_string()]);

    for i in 0..5 {
        server.send_text(format!("frame-{i}")).await;
    }
    assert!(wait_until(|| handler.frames.lock().len() == 5).await);
    assert_eq!(
        *handler.frames.lock(),
        (0..5).map(|i| format!("frame-{i}")).collect::<Vec<_>>()
    );

    let stats = feed.stats();
    assert_eq!(stats.frames_received, 5);
    assert_eq!(stats.frames_processed, 5);
    assert_eq!(stats.frames_dropped, 0);

    feed.stop().await;
    assert_eq!(feed.state(), FeedState::Stopped);
    server.shutdown().await;
}

/// A server-side close triggers a reconnect after backoff.
#[tokio::test]
async fn test_feed_reconnects_after_server_close() {
    let server = MockWsServer::start().await;
    let handler = Arc::new(RecordingHandler::new(server.url()));
    let feed = Feed::new(handler.clone(), fast_config());

    feed.start();
    assert!(server.wait_for_connections(1, Duration::from_secs(3)).await);
    assert!(wait_until(|| handler.connects.load(Ordering::SeqCst) == 1).await);

    server.disconnect_all().await;
    assert!(server.wait_for_connections(2, Duration::from_secs(3)).await);
    assert!(wait_until(|| handler.connects.load(Ordering::SeqCst) == 2).await);
    assert!(handler.disconnects.load(Ordering::SeqCst) >= 1);
    assert!(feed.stats().reconnects >= 1);

    // Backoff resets after the successful reconnect.
    assert_eq!(feed.current_backoff(), Duration::from_millis(50));

    feed.stop().await;
    server.shutdown().await;
}

/// stop() ends both tasks promptly and does not reconnect afterwards.
#[tokio::test]
async fn test_feed_stop_is_terminal() {
    let server = MockWsServer::start().await;
    let handler = Arc::new(RecordingHandler::new(server.url()));
    let feed = Feed::new(handler, fast_config());

    feed.start();
    assert!(server.wait_for_connections(1, Duration::from_secs(3)).await);

    let stopped = timeout(Duration::from_secs(2), feed.stop()).await;
    assert!(stopped.is_ok(), "stop() should complete quickly");
    assert!(!feed.is_running());

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(server.connection_count().await, 1);
    assert_eq!(feed.state(), FeedState::Stopped);

    server.shutdown().await;
}
