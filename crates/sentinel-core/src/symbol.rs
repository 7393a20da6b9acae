//! Stream identifiers.
//!
//! Exchange symbols are case-insensitive on the wire: REST uses `BTCUSDT`
//! while combined stream names use `btcusdt@kline_1m`. `Symbol` normalizes to
//! uppercase once at construction so map keys never disagree on case.

use crate::error::{CoreError, Result};
use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;
use std::str::FromStr;

/// Exchange trading symbol (e.g. `BTCUSDT`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Symbol(String);

impl Symbol {
    /// Create a symbol, normalizing to uppercase.
    ///
    /// Only ASCII alphanumerics are accepted.
    pub fn new(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() || !trimmed.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(CoreError::InvalidSymbol(raw.to_string()));
        }
        Ok(Self(trimmed.to_ascii_uppercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Lowercase form used in stream names.
    pub fn stream_name(&self) -> String {
        self.0.to_ascii_lowercase()
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Symbol {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

impl TryFrom<String> for Symbol {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self> {
        Self::new(&value)
    }
}

impl From<Symbol> for String {
    fn from(value: Symbol) -> Self {
        value.0
    }
}

impl Borrow<str> for Symbol {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for Symbol {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Kline interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Interval {
    #[serde(rename = "1m")]
    M1,
    #[serde(rename = "3m")]
    M3,
    #[serde(rename = "5m")]
    M5,
    #[serde(rename = "15m")]
    M15,
    #[serde(rename = "1h")]
    H1,
    #[serde(rename = "4h")]
    H4,
    #[serde(rename = "1d")]
    D1,
}

impl Interval {
    pub const ALL: [Interval; 7] = [
        Self::M1,
        Self::M3,
        Self::M5,
        Self::M15,
        Self::H1,
        Self::H4,
        Self::D1,
    ];

    /// Exchange notation (`1m`, `4h`, ...).
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::M1 => "1m",
            Self::M3 => "3m",
            Self::M5 => "5m",
            Self::M15 => "15m",
            Self::H1 => "1h",
            Self::H4 => "4h",
            Self::D1 => "1d",
        }
    }

    /// Bar length in milliseconds.
    pub fn duration_ms(&self) -> i64 {
        const MINUTE: i64 = 60_000;
        match self {
            Self::M1 => MINUTE,
            Self::M3 => 3 * MINUTE,
            Self::M5 => 5 * MINUTE,
            Self::M15 => 15 * MINUTE,
            Self::H1 => 60 * MINUTE,
            Self::H4 => 240 * MINUTE,
            Self::D1 => 1440 * MINUTE,
        }
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Interval {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|i| i.as_str() == s)
            .ok_or_else(|| CoreError::InvalidInterval(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_symbol_normalizes_case() {
        let sym = Symbol::new(" btcUsdt ").unwrap();
        assert_eq!(sym.as_str(), "BTCUSDT");
        assert_eq!(sym.stream_name(), "btcusdt");
        assert_eq!(sym.to_string(), "BTCUSDT");
    }

    #[test]
    fn test_symbol_rejects_invalid() {
        assert!(Symbol::new("").is_err());
        assert!(Symbol::new("BTC/USDT").is_err());
        assert!(Symbol::new("btc usdt").is_err());
    }

    #[test]
    fn test_symbol_borrow_lookup() {
        let mut map = HashMap::new();
        map.insert(Symbol::new("ethusdt").unwrap(), 1);
        assert_eq!(map.get("ETHUSDT"), Some(&1));
    }

    #[test]
    fn test_symbol_serde_roundtrip_normalizes() {
        let sym: Symbol = serde_json::from_str("\"solusdt\"").unwrap();
        assert_eq!(sym.as_str(), "SOLUSDT");
        assert_eq!(serde_json::to_string(&sym).unwrap(), "\"SOLUSDT\"");
    }

    #[test]
    fn test_interval_parse_and_duration() {
        assert_eq!("15m".parse::<Interval>().unwrap(), Interval::M15);
        assert_eq!(Interval::M15.duration_ms(), 900_000);
        assert_eq!(Interval::D1.duration_ms(), 86_400_000);
        assert!("2m".parse::<Interval>().is_err());
    }

    #[test]
    fn test_interval_serde_uses_exchange_notation() {
        assert_eq!(serde_json::to_string(&Interval::H4).unwrap(), "\"4h\"");
        let i: Interval = serde_json::from_str("\"1m\"").unwrap();
        assert_eq!(i, Interval::M1);
    }
}
