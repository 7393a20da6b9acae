//! Reconnect backoff.
//!
//! After N consecutive failures the delay is
//! `min(max_delay, min_delay * multiplier^(N-1))`. A successful handshake
//! resets the failure count so the next outage starts again at `min_delay`.

use serde::Deserialize;
use std::time::Duration;

/// Backoff configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct BackoffConfig {
    /// Delay before the first retry.
    #[serde(default = "default_min_delay_ms")]
    pub min_delay_ms: u64,
    /// Upper bound on any delay.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Growth factor per consecutive failure.
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

fn default_min_delay_ms() -> u64 {
    5_000
}

fn default_max_delay_ms() -> u64 {
    300_000
}

fn default_multiplier() -> f64 {
    1.5
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            min_delay_ms: default_min_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
        }
    }
}

/// Exponential backoff state for one feed.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    failures: u32,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            failures: 0,
        }
    }

    /// Delay to wait after the `attempt`-th consecutive failure (1-based).
    ///
    /// `attempt == 0` is treated as the first failure.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let min_secs = self.config.min_delay_ms as f64 / 1000.0;
        let max_secs = self.config.max_delay_ms as f64 / 1000.0;
        let secs = (min_secs * self.config.multiplier.powi(exponent)).min(max_secs);
        Duration::from_secs_f64(secs)
    }

    /// Record a failure and return the delay to sleep before retrying.
    pub fn next_delay(&mut self) -> Duration {
        self.failures = self.failures.saturating_add(1);
        self.delay_for_attempt(self.failures)
    }

    /// Delay the next failure would produce.
    pub fn current_delay(&self) -> Duration {
        self.delay_for_attempt(self.failures.saturating_add(1))
    }

    /// Reset after a successful connection.
    pub fn reset(&mut self) {
        self.failures = 0;
    }

    /// Consecutive failures since the last reset.
    pub fn failures(&self) -> u32 {
        self.failures
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(BackoffConfig::default())
    }
}
