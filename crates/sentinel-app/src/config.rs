//! Application configuration.
//!
//! Loaded once from TOML. Every section has defaults; the symbol list is
//! the only required value. API credentials may come from the environment
//! instead of the file.

use crate::error::{AppError, AppResult};
use sentinel_core::{Interval, Symbol};
use sentinel_feed::{AccountFeedConfig, ShardConfig};
use sentinel_quality::{GapConfig, HealthConfig, QualityConfig};
use sentinel_rest::RestConfig;
use serde::Deserialize;

pub const API_KEY_ENV: &str = "SENTINEL_API_KEY";
pub const API_SECRET_ENV: &str = "SENTINEL_API_SECRET";

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Stream endpoint root, e.g. `wss://fstream.binance.com`.
    #[serde(default = "default_ws_base_url")]
    pub ws_base_url: String,
    pub symbols: Vec<String>,
    /// Maximum symbols per connection.
    #[serde(default = "default_shard_size")]
    pub shard_size: usize,
    /// Kline intervals to subscribe. One set of shards per interval.
    #[serde(default = "default_intervals")]
    pub intervals: Vec<Interval>,
    #[serde(default = "default_true")]
    pub price_feed: bool,
    #[serde(default)]
    pub account_feed: bool,
    /// Closed bars kept per symbol and interval.
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,
    #[serde(default)]
    pub shard: ShardConfig,
    #[serde(default)]
    pub account: AccountFeedConfig,
    #[serde(default)]
    pub rest: RestConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub quality: QualityConfig,
    #[serde(default)]
    pub gap: GapConfig,
    #[serde(default)]
    pub tasks: TaskConfig,
    #[serde(default)]
    pub ops: OpsConfig,
}

fn default_ws_base_url() -> String {
    "wss://fstream.binance.com".to_string()
}

fn default_shard_size() -> usize {
    50
}

fn default_intervals() -> Vec<Interval> {
    vec![Interval::M1]
}

fn default_true() -> bool {
    true
}

fn default_history_capacity() -> usize {
    500
}

/// Periods of the background maintenance tasks.
#[derive(Debug, Clone, Deserialize)]
pub struct TaskConfig {
    #[serde(default = "default_reconcile_interval_secs")]
    pub reconcile_interval_secs: u64,
    #[serde(default = "default_freshness_interval_secs")]
    pub freshness_interval_secs: u64,
    #[serde(default = "default_gap_interval_secs")]
    pub gap_interval_secs: u64,
    #[serde(default = "default_health_log_interval_secs")]
    pub health_log_interval_secs: u64,
}

fn default_reconcile_interval_secs() -> u64 {
    60
}

fn default_freshness_interval_secs() -> u64 {
    10
}

fn default_gap_interval_secs() -> u64 {
    60
}

fn default_health_log_interval_secs() -> u64 {
    60
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            reconcile_interval_secs: default_reconcile_interval_secs(),
            freshness_interval_secs: default_freshness_interval_secs(),
            gap_interval_secs: default_gap_interval_secs(),
            health_log_interval_secs: default_health_log_interval_secs(),
        }
    }
}

/// Ops HTTP endpoint (`/health`, `/metrics`).
#[derive(Debug, Clone, Deserialize)]
pub struct OpsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_ops_port")]
    pub port: u16,
}

fn default_ops_port() -> u16 {
    9090
}

impl Default for OpsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_ops_port(),
        }
    }
}

impl AppConfig {
    /// Read, fill credentials from the environment, and validate.
    pub fn from_file(path: &str) -> AppResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| AppError::Config(format!("Failed to read config {path}: {e}")))?;
        let mut config = Self::from_toml_str(&content)?;
        config.apply_credentials(
            std::env::var(API_KEY_ENV).ok(),
            std::env::var(API_SECRET_ENV).ok(),
        );
        config.validate()?;
        Ok(config)
    }

    /// Parse without validating.
    pub fn from_toml_str(content: &str) -> AppResult<Self> {
        toml::from_str(content).map_err(|e| AppError::Config(format!("Failed to parse config: {e}")))
    }

    /// Fill credentials missing from the file.
    pub fn apply_credentials(&mut self, api_key: Option<String>, api_secret: Option<String>) {
        if self.rest.api_key.as_deref().map_or(true, str::is_empty) {
            self.rest.api_key = api_key;
        }
        if self.rest.api_secret.as_deref().map_or(true, str::is_empty) {
            self.rest.api_secret = api_secret;
        }
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.ws_base_url.trim().is_empty() {
            return Err(AppError::Config("ws_base_url is empty".to_string()));
        }
        if self.rest.base_url.trim().is_empty() {
            return Err(AppError::Config("rest.base_url is empty".to_string()));
        }
        if self.symbols.is_empty() {
            return Err(AppError::Config("symbols list is empty".to_string()));
        }
        for raw in &self.symbols {
            Symbol::new(raw)
                .map_err(|e| AppError::Config(format!("symbols: {e}")))?;
        }
        if self.shard_size == 0 {
            return Err(AppError::Config("shard_size must be positive".to_string()));
        }
        if self.intervals.is_empty() && !self.price_feed {
            return Err(AppError::Config(
                "no kline intervals and price feed disabled".to_string(),
            ));
        }
        if self.account_feed && !self.rest.has_credentials() {
            return Err(AppError::Config(format!(
                "account feed requires API credentials ({API_KEY_ENV} / {API_SECRET_ENV})"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"symbols = ["BTCUSDT", "ETHUSDT"]"#;

    #[test]
    fn test_defaults_fill_missing_sections() {
        let config = AppConfig::from_toml_str(MINIMAL).unwrap();
        config.validate().unwrap();
        assert_eq!(config.ws_base_url, "wss://fstream.binance.com");
        assert_eq!(config.shard_size, 50);
        assert_eq!(config.intervals, vec![Interval::M1]);
        assert!(config.price_feed);
        assert!(!config.account_feed);
        assert_eq!(config.shard.flush_interval_ms, 100);
        assert_eq!(config.account.renew_interval_ms, 900_000);
        assert_eq!(config.health.max_consecutive_errors, 5);
        assert_eq!(config.tasks.freshness_interval_secs, 10);
        assert_eq!(config.ops.port, 9090);
    }

    #[test]
    fn test_nested_sections_parse() {
        let config = AppConfig::from_toml_str(
            r#"
            symbols = ["BTCUSDT"]
            shard_size = 10
            intervals = ["1m", "5m"]

            [shard]
            flush_interval_ms = 250

            [shard.feed.backoff]
            min_delay_ms = 1000

            [health]
            data_timeout_ms = 30000
            "#,
        )
        .unwrap();
        assert_eq!(config.intervals, vec![Interval::M1, Interval::M5]);
        assert_eq!(config.shard.flush_interval_ms, 250);
        assert_eq!(config.shard.feed.backoff.min_delay_ms, 1000);
        assert_eq!(config.health.data_timeout_ms, 30_000);
        assert_eq!(config.health.min_quality_score, 0.85);
    }

    #[test]
    fn test_validation_errors() {
        let cases = [
            r#"symbols = []"#,
            r#"symbols = ["BTCUSDT"]
               shard_size = 0"#,
            r#"symbols = ["BTC/USDT"]"#,
            r#"symbols = ["BTCUSDT"]
               ws_base_url = "" "#,
            r#"symbols = ["BTCUSDT"]
               intervals = []
               price_feed = false"#,
            r#"symbols = ["BTCUSDT"]
               account_feed = true"#,
        ];
        for case in cases {
            let config = AppConfig::from_toml_str(case).unwrap();
            assert!(
                matches!(config.validate(), Err(AppError::Config(_))),
                "expected config error for {case}"
            );
        }
    }

    #[test]
    fn test_unknown_interval_rejected_at_parse() {
        let result = AppConfig::from_toml_str(
            r#"symbols = ["BTCUSDT"]
               intervals = ["2m"]"#,
        );
        assert!(matches!(result, Err(AppError::Config(_))));
    }

    #[test]
    fn test_credentials_from_environment_values() {
        let mut config = AppConfig::from_toml_str(
            r#"symbols = ["BTCUSDT"]
               account_feed = true"#,
        )
        .unwrap();
        config.apply_credentials(Some("key".to_string()), Some("secret".to_string()));
        config.validate().unwrap();

        let mut explicit = AppConfig::from_toml_str(
            r#"symbols = ["BTCUSDT"]
               [rest]
               api_key = "file-key"
               api_secret = "file-secret""#,
        )
        .unwrap();
        explicit.apply_credentials(Some("env-key".to_string()), None);
        assert_eq!(explicit.rest.api_key.as_deref(), Some("file-key"));
        assert_eq!(explicit.rest.api_secret.as_deref(), Some("file-secret"));
    }
}
