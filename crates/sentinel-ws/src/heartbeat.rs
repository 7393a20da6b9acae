//! Heartbeat monitoring for feed connections.
//!
//! Sends a protocol-level ping when the connection has been silent for the
//! ping interval and fails the connection if nothing comes back within the
//! pong timeout. Any inbound frame counts as proof of life.

use parking_lot::Mutex;
use std::time::{Duration, Instant};
use tracing::debug;

#[derive(Debug)]
struct HeartbeatInner {
    last_ping: Option<Instant>,
    last_pong: Option<Instant>,
    last_activity: Instant,
    waiting_for_pong: bool,
}

/// Heartbeat state for one connection.
#[derive(Debug)]
pub struct HeartbeatMonitor {
    interval: Duration,
    timeout: Duration,
    inner: Mutex<HeartbeatInner>,
}

impl HeartbeatMonitor {
    pub fn new(interval_ms: u64, timeout_ms: u64) -> Self {
        Self {
            interval: Duration::from_millis(interval_ms),
            timeout: Duration::from_millis(timeout_ms),
            inner: Mutex::new(HeartbeatInner {
                last_ping: None,
                last_pong: None,
                last_activity: Instant::now(),
                waiting_for_pong: false,
            }),
        }
    }

    /// Reset state (called on every new connection).
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.last_ping = None;
        inner.last_pong = None;
        inner.last_activity = Instant::now();
        inner.waiting_for_pong = false;
    }

    pub fn record_ping(&self) {
        let mut inner = self.inner.lock();
        inner.last_ping = Some(Instant::now());
        inner.waiting_for_pong = true;
    }

    pub fn record_pong(&self) {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        if let Some(ping) = inner.last_ping {
            debug!(rtt_ms = now.duration_since(ping).as_millis() as u64, "Received pong");
        }
        inner.last_pong = Some(now);
        inner.last_activity = now;
        inner.waiting_for_pong = false;
    }

    /// Record any inbound frame (data or server ping).
    pub fn record_activity(&self) {
        let mut inner = self.inner.lock();
        inner.last_activity = Instant::now();
        inner.waiting_for_pong = false;
    }

    /// True when a ping is outstanding for longer than the timeout.
    pub fn is_timed_out(&self) -> bool {
        let inner = self.inner.lock();
        match (inner.waiting_for_pong, inner.last_ping) {
            (true, Some(ping)) => ping.elapsed() > self.timeout,
            _ => false,
        }
    }

    /// True when the connection has been silent for the ping interval and no
    /// ping is outstanding.
    pub fn should_send_ping(&self) -> bool {
        let inner = self.inner.lock();
        !inner.waiting_for_pong && inner.last_activity.elapsed() >= self.interval
    }

    /// How often the read loop should evaluate the heartbeat.
    pub fn check_period(&self) -> Duration {
        (self.interval.min(self.timeout) / 2).max(Duration::from_millis(10))
    }

    pub fn stats(&self) -> HeartbeatStats {
        let inner = self.inner.lock();
        HeartbeatStats {
            waiting_for_pong: inner.waiting_for_pong,
            ms_since_activity: inner.last_activity.elapsed().as_millis() as u64,
            ms_since_pong: inner.last_pong.map(|p| p.elapsed().as_millis() as u64),
        }
    }
}

/// Heartbeat statistics.
#[derive(Debug, Clone)]
pub struct HeartbeatStats {
    pub waiting_for_pong: bool,
    pub ms_since_activity: u64,
    pub ms_since_pong: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heartbeat_initial_state() {
        let hb = HeartbeatMonitor::new(20_000, 15_000);
        assert!(!hb.is_timed_out());
        assert!(!hb.should_send_ping());
        assert!(!hb.stats().waiting_for_pong);
    }

    #[test]
    fn test_heartbeat_ping_pong() {
        let hb = HeartbeatMonitor::new(20_000, 15_000);
        hb.record_ping();
        assert!(hb.stats().waiting_for_pong);
        hb.record_pong();
        assert!(!hb.stats().waiting_for_pong);
        assert!(hb.stats().ms_since_pong.is_some());
    }

    #[test]
    fn test_heartbeat_timeout() {
        let hb = HeartbeatMonitor::new(0, 0);
        hb.record_ping();
        std::thread::sleep(Duration::from_millis(5));
        assert!(hb.is_timed_out());
        hb.record_activity();
        assert!(!hb.is_timed_out());
    }

    #[test]
    fn test_should_send_ping_after_silence() {
        let hb = HeartbeatMonitor::new(0, 15_000);
        assert!(hb.should_send_ping());
        hb.record_ping();
        assert!(!hb.should_send_ping());
    }

    #[test]
    fn test_check_period() {
        let hb = HeartbeatMonitor::new(20_000, 15_000);
        assert_eq!(hb.check_period(), Duration::from_millis(7_500));
        let fast = HeartbeatMonitor::new(0, 0);
        assert_eq!(fast.check_period(), Duration::from_millis(10));
    }
}
