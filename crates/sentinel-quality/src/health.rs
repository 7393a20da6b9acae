//! Per-symbol, per-source health records.
//!
//! Score = 0.7 * (1 - error_rate) + 0.3 * latency_score
//! - error_rate: unresolved error streak / updates
//! - latency_score: max(0, 1 - latency_ms / latency_ceiling_ms)
//!
//! Status: Unavailable once the streak reaches `max_consecutive_errors`,
//! Degraded below `min_quality_score`, Healthy otherwise. Healthy clears
//! the streak.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Error streak at which a source becomes unavailable.
    #[serde(default = "default_max_consecutive_errors")]
    pub max_consecutive_errors: u32,

    /// Scores below this are degraded.
    #[serde(default = "default_min_quality_score")]
    pub min_quality_score: f64,

    /// Latency at which the latency component reaches zero.
    #[serde(default = "default_latency_ceiling_ms")]
    pub latency_ceiling_ms: f64,

    /// Age after which a symbol's data is stale.
    #[serde(default = "default_data_timeout_ms")]
    pub data_timeout_ms: i64,

    /// Minimum time between fallbacks for one symbol.
    #[serde(default = "default_fallback_cooldown_ms")]
    pub fallback_cooldown_ms: i64,

    /// REST attempts per fallback.
    #[serde(default = "default_fallback_max_retries")]
    pub fallback_max_retries: u32,

    /// Delay before the first retry; doubles per attempt.
    #[serde(default = "default_fallback_retry_delay_ms")]
    pub fallback_retry_delay_ms: u64,

    /// Timeout of one REST attempt.
    #[serde(default = "default_rest_timeout_ms")]
    pub rest_timeout_ms: u64,

    /// Bars fetched by a kline fallback.
    #[serde(default = "default_fallback_kline_limit")]
    pub fallback_kline_limit: u32,
}

fn default_max_consecutive_errors() -> u32 {
    5
}
fn default_min_quality_score() -> f64 {
    0.85
}
fn default_latency_ceiling_ms() -> f64 {
    1_000.0
}
fn default_data_timeout_ms() -> i64 {
    60_000
}
fn default_fallback_cooldown_ms() -> i64 {
    60_000
}
fn default_fallback_max_retries() -> u32 {
    3
}
fn default_fallback_retry_delay_ms() -> u64 {
    500
}
fn default_rest_timeout_ms() -> u64 {
    10_000
}
fn default_fallback_kline_limit() -> u32 {
    100
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            max_consecutive_errors: default_max_consecutive_errors(),
            min_quality_score: default_min_quality_score(),
            latency_ceiling_ms: default_latency_ceiling_ms(),
            data_timeout_ms: default_data_timeout_ms(),
            fallback_cooldown_ms: default_fallback_cooldown_ms(),
            fallback_max_retries: default_fallback_max_retries(),
            fallback_retry_delay_ms: default_fallback_retry_delay_ms(),
            rest_timeout_ms: default_rest_timeout_ms(),
            fallback_kline_limit: default_fallback_kline_limit(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    WebSocket,
    Rest,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WebSocket => "websocket",
            Self::Rest => "rest",
        }
    }
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unavailable,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthRecord {
    pub source: SourceType,
    pub status: HealthStatus,
    /// Epoch ms of the last observation.
    pub last_update_ms: i64,
    pub updates: u64,
    /// Lifetime error observations.
    pub errors: u64,
    pub consecutive_errors: u32,
    /// Latency of the last observation.
    pub latency_ms: f64,
    pub quality_score: f64,
}

impl HealthRecord {
    pub fn new(source: SourceType, now_ms: i64) -> Self {
        Self {
            source,
            status: HealthStatus::Healthy,
            last_update_ms: now_ms,
            updates: 0,
            errors: 0,
            consecutive_errors: 0,
            latency_ms: 0.0,
            quality_score: 1.0,
        }
    }

    /// Record one observation and recompute score and status.
    pub fn observe(&mut self, ok: bool, latency_ms: f64, now_ms: i64, config: &HealthConfig) {
        self.updates += 1;
        self.last_update_ms = now_ms;
        self.latency_ms = latency_ms.max(0.0);
        if ok {
            self.consecutive_errors = 0;
        } else {
            self.errors += 1;
            self.consecutive_errors += 1;
        }

        let error_rate = f64::from(self.consecutive_errors) / self.updates as f64;
        let latency_score = if config.latency_ceiling_ms > 0.0 {
            (1.0 - self.latency_ms / config.latency_ceiling_ms).max(0.0)
        } else {
            1.0
        };
        self.quality_score = ((1.0 - error_rate) * 0.7 + latency_score * 0.3).clamp(0.0, 1.0);
        self.refresh_status(config);
    }

    /// Scale the score in place and recompute status.
    pub fn apply_penalty(&mut self, factor: f64, config: &HealthConfig) {
        self.quality_score = (self.quality_score * factor).clamp(0.0, 1.0);
        self.refresh_status(config);
    }

    fn refresh_status(&mut self, config: &HealthConfig) {
        self.status = if self.consecutive_errors >= config.max_consecutive_errors {
            HealthStatus::Unavailable
        } else if self.quality_score < config.min_quality_score {
            HealthStatus::Degraded
        } else {
            self.consecutive_errors = 0;
            HealthStatus::Healthy
        };
    }

    pub fn age_ms(&self, now_ms: i64) -> i64 {
        (now_ms - self.last_update_ms).max(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_score_formula() {
        let config = HealthConfig::default();
        let mut record = HealthRecord::new(SourceType::WebSocket, 0);
        record.observe(true, 200.0, 1, &config);
        // 0.7 * 1.0 + 0.3 * 0.8
        assert!((record.quality_score - 0.94).abs() < 1e-9);
        assert_eq!(record.status, HealthStatus::Healthy);
    }

    #[test]
    fn test_high_latency_degrades() {
        let config = HealthConfig::default();
        let mut record = HealthRecord::new(SourceType::WebSocket, 0);
        record.observe(true, 2_000.0, 1, &config);
        assert!((record.quality_score - 0.7).abs() < 1e-9);
        assert_eq!(record.status, HealthStatus::Degraded);
    }

    #[test]
    fn test_error_streak_then_recovery() {
        let config = HealthConfig::default();
        let mut record = HealthRecord::new(SourceType::WebSocket, 0);
        for i in 0..5 {
            record.observe(false, 10.0, i, &config);
        }
        assert_eq!(record.status, HealthStatus::Unavailable);
        assert_eq!(record.consecutive_errors, 5);

        record.observe(true, 10.0, 10, &config);
        assert_eq!(record.status, HealthStatus::Healthy);
        assert_eq!(record.consecutive_errors, 0);
        assert_eq!(record.errors, 5);
    }

    #[test]
    fn test_penalty_recomputes_status() {
        let config = HealthConfig::default();
        let mut record = HealthRecord::new(SourceType::Rest, 0);
        record.observe(true, 0.0, 1, &config);
        assert_eq!(record.status, HealthStatus::Healthy);
        record.apply_penalty(0.8, &config);
        assert!((record.quality_score - 0.8).abs() < 1e-9);
        assert_eq!(record.status, HealthStatus::Degraded);
    }
}
