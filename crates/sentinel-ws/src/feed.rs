//! Reconnecting feed.
//!
//! Handles connection lifecycle, heartbeat and reconnect backoff, and
//! decouples network receipt from message handling with a bounded queue.
//!
//! State machine:
//! Disconnected -> Connecting -> Connected -> Reconnecting -> Connecting ...
//! Any state -> Stopped (terminal).

use crate::backoff::{Backoff, BackoffConfig};
use crate::error::{WsError, WsResult};
use crate::handler::FeedHandler;
use crate::heartbeat::HeartbeatMonitor;
use crate::stats::{FeedStats, FeedStatsSnapshot};
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use sentinel_telemetry::Metrics;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async_tls_with_config, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Feed configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct FeedConfig {
    /// Bounded inbound queue capacity (frames).
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Handshake timeout.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Send a ping after this much silence.
    #[serde(default = "default_ping_interval_ms")]
    pub ping_interval_ms: u64,
    /// Fail the connection if a ping is unanswered for this long.
    #[serde(default = "default_pong_timeout_ms")]
    pub pong_timeout_ms: u64,
    /// How long `stop()` waits for each task before aborting it.
    #[serde(default = "default_stop_timeout_ms")]
    pub stop_timeout_ms: u64,
    #[serde(default)]
    pub backoff: BackoffConfig,
}

fn default_queue_capacity() -> usize {
    10_000
}

fn default_connect_timeout_ms() -> u64 {
    30_000
}

fn default_ping_interval_ms() -> u64 {
    20_000
}

fn default_pong_timeout_ms() -> u64 {
    15_000
}

fn default_stop_timeout_ms() -> u64 {
    5_000
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            connect_timeout_ms: default_connect_timeout_ms(),
            ping_interval_ms: default_ping_interval_ms(),
            pong_timeout_ms: default_pong_timeout_ms(),
            stop_timeout_ms: default_stop_timeout_ms(),
            backoff: BackoffConfig::default(),
        }
    }
}

/// Feed state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Stopped,
}

impl FeedState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Stopped => "stopped",
        }
    }
}

impl fmt::Display for FeedState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

type WsWrite = futures_util::stream::SplitSink<
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
    Message,
>;
type WsRead = futures_util::stream::SplitStream<
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
>;

struct FeedInner<H: FeedHandler> {
    handler: Arc<H>,
    config: FeedConfig,
    state: RwLock<FeedState>,
    backoff: Mutex<Backoff>,
    heartbeat: HeartbeatMonitor,
    stats: FeedStats,
    shutdown_token: CancellationToken,
}

/// Reconnecting WebSocket feed driving one [`FeedHandler`].
pub struct Feed<H: FeedHandler> {
    inner: Arc<FeedInner<H>>,
    started: AtomicBool,
    stopped: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<H: FeedHandler> Feed<H> {
    pub fn new(handler: Arc<H>, config: FeedConfig) -> Self {
        let heartbeat = HeartbeatMonitor::new(config.ping_interval_ms, config.pong_timeout_ms);
        let backoff = Backoff::new(config.backoff.clone());
        Self {
            inner: Arc::new(FeedInner {
                handler,
                config,
                state: RwLock::new(FeedState::Disconnected),
                backoff: Mutex::new(backoff),
                heartbeat,
                stats: FeedStats::new(),
                shutdown_token: CancellationToken::new(),
            }),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        self.inner.handler.name()
    }

    pub fn handler(&self) -> &Arc<H> {
        &self.inner.handler
    }

    pub fn state(&self) -> FeedState {
        *self.inner.state.read()
    }

    pub fn stats(&self) -> FeedStatsSnapshot {
        self.inner.stats.snapshot()
    }

    /// Delay the next reconnect would wait.
    pub fn current_backoff(&self) -> Duration {
        self.inner.backoff.lock().current_delay()
    }

    /// True between `start()` and `stop()`.
    pub fn is_running(&self) -> bool {
        self.started.load(Ordering::SeqCst) && !self.inner.shutdown_token.is_cancelled()
    }

    /// Spawn the connection and consumer tasks.
    ///
    /// Idempotent. A stopped feed cannot be restarted.
    pub fn start(&self) {
        if self.inner.shutdown_token.is_cancelled() {
            warn!(feed = %self.name(), "start() called on stopped feed, ignoring");
            return;
        }
        if self.started.swap(true, Ordering::SeqCst) {
            debug!(feed = %self.name(), "Feed already started");
            return;
        }

        let (tx, rx) = mpsc::channel(self.inner.config.queue_capacity.max(1));
        let producer = tokio::spawn(self.inner.clone().run_connection_loop(tx));
        let consumer = tokio::spawn(self.inner.clone().run_consumer_loop(rx));
        self.tasks.lock().extend([producer, consumer]);
        info!(feed = %self.name(), "Feed started");
    }

    /// Stop the feed: close the socket and end both tasks.
    ///
    /// Idempotent, safe before `start()`, and bounded by `stop_timeout_ms`
    /// per task.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(feed = %self.name(), "Feed stop requested");
        self.inner.shutdown_token.cancel();

        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        let wait = Duration::from_millis(self.inner.config.stop_timeout_ms);
        for mut handle in handles {
            if tokio::time::timeout(wait, &mut handle).await.is_err() {
                warn!(feed = %self.name(), "Feed task did not exit in time, aborting");
                handle.abort();
            }
        }

        self.inner.set_state(FeedState::Stopped);
        self.inner.handler.on_stop();
        info!(feed = %self.name(), "Feed stopped");
    }
}

impl<H: FeedHandler> FeedInner<H> {
    fn name(&self) -> &str {
        self.handler.name()
    }

    fn set_state(&self, state: FeedState) {
        let mut current = self.state.write();
        // Stopped is terminal.
        if *current == FeedState::Stopped || *current == state {
            return;
        }
        debug!(feed = %self.name(), from = %*current, to = %state, "Feed state change");
        *current = state;
        Metrics::feed_state_set(self.name(), state.as_str());
    }

    async fn run_connection_loop(self: Arc<Self>, tx: mpsc::Sender<String>) {
        loop {
            if self.shutdown_token.is_cancelled() {
                break;
            }

            self.set_state(FeedState::Connecting);
            match self.connect_and_read(&tx).await {
                Ok(()) => info!(feed = %self.name(), "Connection closed"),
                Err(e) => {
                    self.stats.record_connection_error();
                    error!(feed = %self.name(), error = %e, "Connection error");
                }
            }

            if self.shutdown_token.is_cancelled() {
                break;
            }

            self.set_state(FeedState::Reconnecting);
            let delay = self.backoff.lock().next_delay();
            self.stats.record_reconnect();
            Metrics::feed_reconnect(self.name());
            warn!(
                feed = %self.name(),
                delay_ms = delay.as_millis() as u64,
                "Reconnecting after backoff"
            );

            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = self.shutdown_token.cancelled() => break,
            }
        }
        debug!(feed = %self.name(), "Connection loop exited");
    }

    async fn connect_and_read(&self, tx: &mpsc::Sender<String>) -> WsResult<()> {
        let url = self.handler.url();
        info!(feed = %self.name(), url = %url, "Connecting");

        let timeout_ms = self.config.connect_timeout_ms;
        let connect = tokio::time::timeout(
            Duration::from_millis(timeout_ms),
            connect_async_tls_with_config(url.as_str(), None, true, None),
        );
        let (ws_stream, _response) = tokio::select! {
            result = connect => match result {
                Ok(connected) => connected?,
                Err(_) => return Err(WsError::ConnectTimeout(timeout_ms)),
            },
            () = self.shutdown_token.cancelled() => return Ok(()),
        };
        let (mut write, mut read) = ws_stream.split();

        self.set_state(FeedState::Connected);
        self.backoff.lock().reset();
        self.heartbeat.reset();
        self.stats.record_connect();
        info!(feed = %self.name(), "Connected");
        self.handler.on_connect();

        let result = self.read_loop(&mut write, &mut read, tx).await;
        self.handler.on_disconnect();
        result
    }

    async fn read_loop(
        &self,
        write: &mut WsWrite,
        read: &mut WsRead,
        tx: &mpsc::Sender<String>,
    ) -> WsResult<()> {
        let mut check = tokio::time::interval(self.heartbeat.check_period());
        check.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = self.shutdown_token.cancelled() => {
                    if let Err(e) = write.send(Message::Close(None)).await {
                        debug!(feed = %self.name(), error = %e, "Close frame not sent");
                    }
                    return Ok(());
                }

                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            self.heartbeat.record_activity();
                            self.enqueue(tx, text);
                        }
                        Some(Ok(Message::Binary(data))) => {
                            self.heartbeat.record_activity();
                            match String::from_utf8(data) {
                                Ok(text) => self.enqueue(tx, text),
                                Err(_) => {
                                    self.stats.record_processing_error();
                                    Metrics::feed_processing_error(self.name());
                                    warn!(feed = %self.name(), "Dropping non-UTF8 binary frame");
                                }
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            self.heartbeat.record_activity();
                            write.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Pong(_))) => {
                            self.heartbeat.record_pong();
                        }
                        Some(Ok(Message::Close(frame))) => {
                            let (code, reason) = frame
                                .map(|f| (f.code.into(), f.reason.to_string()))
                                .unwrap_or((1000, "Normal close".to_string()));
                            warn!(feed = %self.name(), code, %reason, "Closed by server");
                            return Err(WsError::ConnectionClosed { code, reason });
                        }
                        Some(Ok(Message::Frame(_))) => {}
                        Some(Err(e)) => return Err(e.into()),
                        None => {
                            warn!(feed = %self.name(), "Stream ended");
                            return Ok(());
                        }
                    }
                }

                _ = check.tick() => {
                    if self.heartbeat.is_timed_out() {
                        return Err(WsError::HeartbeatTimeout);
                    }
                    if self.heartbeat.should_send_ping() {
                        write.send(Message::Ping(Vec::new())).await?;
                        self.heartbeat.record_ping();
                        debug!(feed = %self.name(), "Sent ping");
                    }
                }
            }
        }
    }

    /// Push a frame without blocking; drop it if the queue is full.
    fn enqueue(&self, tx: &mpsc::Sender<String>, frame: String) {
        self.stats.record_received(chrono::Utc::now().timestamp_millis());
        Metrics::feed_frame(self.name());
        match tx.try_send(frame) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                let dropped = self.stats.record_dropped();
                Metrics::feed_dropped(self.name());
                if dropped == 1 || dropped % 1_000 == 0 {
                    warn!(feed = %self.name(), dropped, "Inbound queue full, dropping newest frame");
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(feed = %self.name(), "Consumer gone, discarding frame");
            }
        }
    }

    async fn run_consumer_loop(self: Arc<Self>, mut rx: mpsc::Receiver<String>) {
        loop {
            let frame = tokio::select! {
                () = self.shutdown_token.cancelled() => break,
                frame = rx.recv() => frame,
            };
            match frame {
                Some(raw) => self.dispatch(&raw),
                None => break,
            }
        }
        debug!(feed = %self.name(), "Consumer loop exited");
    }

    fn dispatch(&self, raw: &str) {
        match self.handler.process_message(raw) {
            Ok(()) => self.stats.record_processed(),
            Err(e) => {
                self.stats.record_processing_error();
                Metrics::feed_processing_error(self.name());
                warn!(feed = %self.name(), error = %e, "Failed to process message");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{HandlerError, HandlerResult};
    use std::sync::atomic::AtomicUsize;

    struct CountingHandler {
        processed: AtomicUsize,
        stops: AtomicUsize,
    }

    impl CountingHandler {
        fn new() -> Self {
            Self {
                processed: AtomicUsize::new(0),
                stops: AtomicUsize::new(0),
            }
        }
    }

    impl FeedHandler for CountingHandler {
        fn name(&self) -> &str {
            "counting"
        }

        fn url(&self) -> String {
            // Nothing listens here; connection attempts fail fast.
            "ws://127.0.0.1:1".to_string()
        }

        fn process_message(&self, raw: &str) -> HandlerResult<()> {
            if raw == "bad" {
                return Err(HandlerError::Protocol("bad frame".to_string()));
            }
            self.processed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn on_stop(&self) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn feed_with_queue(capacity: usize) -> Feed<CountingHandler> {
        let config = FeedConfig {
            queue_capacity: capacity,
            ..Default::default()
        };
        Feed::new(Arc::new(CountingHandler::new()), config)
    }

    #[test]
    fn test_initial_state() {
        let feed = feed_with_queue(10);
        assert_eq!(feed.state(), FeedState::Disconnected);
        assert!(!feed.is_running());
        assert_eq!(feed.current_backoff(), Duration::from_secs(5));
    }

    #[test]
    fn test_enqueue_drops_newest_when_full() {
        let feed = feed_with_queue(2);
        let (tx, mut rx) = mpsc::channel(2);
        for frame in ["a", "b", "c", "d"] {
            feed.inner.enqueue(&tx, frame.to_string());
        }
        assert_eq!(rx.try_recv().unwrap(), "a");
        assert_eq!(rx.try_recv().unwrap(), "b");
        assert!(rx.try_recv().is_err());

        let stats = feed.stats();
        assert_eq!(stats.frames_received, 4);
        assert_eq!(stats.frames_dropped, 2);
    }

    #[test]
    fn test_dispatch_counts_errors_without_stopping() {
        let feed = feed_with_queue(10);
        feed.inner.dispatch("ok");
        feed.inner.dispatch("bad");
        feed.inner.dispatch("ok");
        let stats = feed.stats();
        assert_eq!(stats.frames_processed, 2);
        assert_eq!(stats.processing_errors, 1);
        assert_eq!(feed.handler().processed.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_stop_before_start_is_safe() {
        let feed = feed_with_queue(10);
        feed.stop().await;
        feed.stop().await;
        assert_eq!(feed.state(), FeedState::Stopped);
        assert_eq!(feed.handler().stops.load(Ordering::SeqCst), 1);

        // Stopped is terminal.
        feed.start();
        assert!(!feed.is_running());
        assert_eq!(feed.state(), FeedState::Stopped);
    }

    #[tokio::test]
    async fn test_start_is_idempotent_and_stop_is_bounded() {
        let feed = feed_with_queue(10);
        feed.start();
        feed.start();
        assert!(feed.is_running());
        assert_eq!(feed.tasks.lock().len(), 2);

        let stopped =
            tokio::time::timeout(Duration::from_secs(2), feed.stop()).await;
        assert!(stopped.is_ok(), "stop() must not hang while reconnecting");
        assert_eq!(feed.state(), FeedState::Stopped);
        assert!(!feed.is_running());
    }
}
