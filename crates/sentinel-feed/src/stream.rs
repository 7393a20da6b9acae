//! Symbol partitioning and combined stream URLs.

use crate::error::{FeedError, FeedResult};
use sentinel_core::Symbol;
use std::collections::HashSet;

/// Split the symbol universe into shards of at most `shard_size`.
///
/// Symbols are normalized and deduplicated; first-seen order is kept.
pub fn partition_symbols<S: AsRef<str>>(
    symbols: &[S],
    shard_size: usize,
) -> FeedResult<Vec<Vec<Symbol>>> {
    if shard_size == 0 {
        return Err(FeedError::Config("shard size must be positive".to_string()));
    }

    let mut seen = HashSet::new();
    let mut unique = Vec::with_capacity(symbols.len());
    for raw in symbols {
        let symbol = Symbol::new(raw.as_ref())
            .map_err(|e| FeedError::Config(format!("invalid symbol {:?}: {e}", raw.as_ref())))?;
        if seen.insert(symbol.clone()) {
            unique.push(symbol);
        }
    }

    Ok(unique.chunks(shard_size).map(<[Symbol]>::to_vec).collect())
}

/// `<base>/stream?streams=a/b/c`
pub fn combined_stream_url<S: AsRef<str>>(base_url: &str, streams: &[S]) -> String {
    let joined = streams
        .iter()
        .map(|s| s.as_ref())
        .collect::<Vec<&str>>()
        .join("/");
    format!("{}/stream?streams={}", base_url.trim_end_matches('/'), joined)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_dedup_and_order() {
        let shards =
            partition_symbols(&["btcusdt", "ETHUSDT", "BTCUSDT", "solusdt", "xrpusdt"], 2).unwrap();
        let names: Vec<Vec<&str>> = shards
            .iter()
            .map(|s| s.iter().map(Symbol::as_str).collect())
            .collect();
        assert_eq!(
            names,
            vec![vec!["BTCUSDT", "ETHUSDT"], vec!["SOLUSDT", "XRPUSDT"]]
        );
    }

    #[test]
    fn test_partition_uneven_tail() {
        let symbols: Vec<String> = (0..7).map(|i| format!("SYM{i}USDT")).collect();
        let shards = partition_symbols(&symbols, 3).unwrap();
        let sizes: Vec<usize> = shards.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![3, 3, 1]);
    }

    #[test]
    fn test_partition_rejects_bad_input() {
        assert!(partition_symbols(&["BTCUSDT"], 0).is_err());
        assert!(partition_symbols(&["BTC/USDT"], 10).is_err());
        assert!(partition_symbols::<&str>(&[], 10).unwrap().is_empty());
    }

    #[test]
    fn test_combined_stream_url() {
        let url = combined_stream_url(
            "wss://fstream.binance.com/",
            &["btcusdt@kline_1m", "ethusdt@kline_1m"],
        );
        assert_eq!(
            url,
            "wss://fstream.binance.com/stream?streams=btcusdt@kline_1m/ethusdt@kline_1m"
        );
    }
}
