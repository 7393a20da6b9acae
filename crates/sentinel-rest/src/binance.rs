//! reqwest implementation of [`ExchangeRest`] for USDⓈ-M futures.
//!
//! Public market endpoints are unauthenticated. Account endpoints are signed
//! with HMAC-SHA256 over the sorted query string and carry the API key in
//! the `X-MBX-APIKEY` header; listen key calls need only the header.

use crate::client::{BoxFuture, ExchangeRest};
use crate::dto::{
    parse_kline_row, ListenKeyResponse, RawAccount, RawBookTicker, RawPositionRisk,
};
use crate::error::{RestError, RestResult};
use hmac::{Hmac, Mac};
use reqwest::{Client, Method, RequestBuilder};
use rust_decimal::Decimal;
use sentinel_core::{
    now_ms, AccountSnapshot, Interval, KlineBar, Position, PriceQuote, SnapshotBalance, Symbol,
};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use sha2::Sha256;
use std::time::Duration;
use tracing::{debug, info};

type HmacSha256 = Hmac<Sha256>;

/// Binance caps `limit` on the klines endpoint.
pub const MAX_KLINE_LIMIT: u32 = 1_500;

const API_KEY_HEADER: &str = "X-MBX-APIKEY";
const LISTEN_KEY_PATH: &str = "/fapi/v1/listenKey";

/// REST client configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RestConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub api_secret: Option<String>,
    /// Per-request timeout.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub recv_window_ms: Option<u64>,
}

fn default_base_url() -> String {
    "https://fapi.binance.com".to_string()
}

fn default_timeout_ms() -> u64 {
    10_000
}

impl Default for RestConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key: None,
            api_secret: None,
            timeout_ms: default_timeout_ms(),
            recv_window_ms: None,
        }
    }
}

impl RestConfig {
    pub fn has_credentials(&self) -> bool {
        self.api_key.as_deref().is_some_and(|k| !k.is_empty())
            && self.api_secret.as_deref().is_some_and(|s| !s.is_empty())
    }
}

/// Futures REST client.
pub struct BinanceRestClient {
    client: Client,
    config: RestConfig,
}

impl BinanceRestClient {
    pub fn new(config: RestConfig) -> RestResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| RestError::HttpClient(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self { client, config })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    fn api_key(&self) -> RestResult<&str> {
        self.config
            .api_key
            .as_deref()
            .filter(|k| !k.is_empty())
            .ok_or(RestError::MissingCredentials)
    }

    /// Build `k=v&...&timestamp=..&signature=..` for a signed endpoint.
    fn signed_query(&self, mut params: Vec<(String, String)>) -> RestResult<String> {
        let secret = self
            .config
            .api_secret
            .as_deref()
            .filter(|s| !s.is_empty())
            .ok_or(RestError::MissingCredentials)?;
        params.push(("timestamp".to_string(), now_ms().to_string()));
        if let Some(recv_window) = self.config.recv_window_ms {
            params.push(("recvWindow".to_string(), recv_window.to_string()));
        }
        params.sort_by(|a, b| a.0.cmp(&b.0));
        let canonical = canonical_query(&params);
        let signature = sign_query(secret, &canonical)?;
        Ok(format!("{canonical}&signature={signature}"))
    }

    fn signed_request(
        &self,
        method: Method,
        path: &str,
        params: Vec<(String, String)>,
    ) -> RestResult<RequestBuilder> {
        let api_key = self.api_key()?;
        let query = self.signed_query(params)?;
        let url = format!("{}?{}", self.url(path), query);
        Ok(self
            .client
            .request(method, url)
            .header(API_KEY_HEADER, api_key))
    }

    async fn send(&self, request: RequestBuilder) -> RestResult<String> {
        let response = request
            .send()
            .await
            .map_err(|e| RestError::HttpClient(format!("HTTP request failed: {e}")))?;
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(RestError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(body)
    }

    async fn send_json<T: DeserializeOwned>(&self, request: RequestBuilder) -> RestResult<T> {
        let body = self.send(request).await?;
        Ok(serde_json::from_str(&body)?)
    }

    async fn fetch_klines(
        &self,
        symbol: Symbol,
        interval: Interval,
        limit: u32,
    ) -> RestResult<Vec<KlineBar>> {
        let limit = limit.clamp(1, MAX_KLINE_LIMIT);
        debug!(%symbol, %interval, limit, "Fetching klines");
        let request = self.client.get(self.url("/fapi/v1/klines")).query(&[
            ("symbol", symbol.as_str().to_string()),
            ("interval", interval.as_str().to_string()),
            ("limit", limit.to_string()),
        ]);
        let rows: Vec<Vec<serde_json::Value>> = self.send_json(request).await?;
        let now = now_ms();
        rows.iter()
            .map(|row| parse_kline_row(&symbol, interval, row, now))
            .collect()
    }

    async fn fetch_ticker(&self, symbol: Symbol) -> RestResult<PriceQuote> {
        let request = self
            .client
            .get(self.url("/fapi/v1/ticker/bookTicker"))
            .query(&[("symbol", symbol.as_str())]);
        let raw: RawBookTicker = self.send_json(request).await?;
        raw.into_quote(now_ms())
    }

    async fn fetch_positions(&self) -> RestResult<Vec<Position>> {
        let request = self.signed_request(Method::GET, "/fapi/v2/positionRisk", Vec::new())?;
        let raw: Vec<RawPositionRisk> = self.send_json(request).await?;
        let mut positions = Vec::new();
        for entry in raw {
            if let Some(position) = entry.into_position()? {
                positions.push(position);
            }
        }
        Ok(positions)
    }

    async fn fetch_account_snapshot(&self) -> RestResult<AccountSnapshot> {
        let request = self.signed_request(Method::GET, "/fapi/v2/account", Vec::new())?;
        let account: RawAccount = self.send_json(request).await?;
        let balances = account
            .assets
            .into_iter()
            .map(|a| SnapshotBalance {
                asset: a.asset,
                free: a.cross_wallet_balance,
                locked: (a.wallet_balance - a.cross_wallet_balance).max(Decimal::ZERO),
            })
            .collect();
        let positions = self.fetch_positions().await?;
        Ok(AccountSnapshot {
            balances,
            positions,
        })
    }

    async fn create_listen_key(&self) -> RestResult<String> {
        let request = self
            .client
            .post(self.url(LISTEN_KEY_PATH))
            .header(API_KEY_HEADER, self.api_key()?);
        let response: ListenKeyResponse = self.send_json(request).await?;
        info!("Listen key obtained");
        Ok(response.listen_key)
    }

    async fn listen_key_call(&self, method: Method, listen_key: String) -> RestResult<()> {
        let request = self
            .client
            .request(method, self.url(LISTEN_KEY_PATH))
            .header(API_KEY_HEADER, self.api_key()?)
            .query(&[("listenKey", listen_key.as_str())]);
        self.send(request).await.map(|_| ())
    }
}

impl ExchangeRest for BinanceRestClient {
    fn get_klines(
        &self,
        symbol: Symbol,
        interval: Interval,
        limit: u32,
    ) -> BoxFuture<'_, RestResult<Vec<KlineBar>>> {
        Box::pin(self.fetch_klines(symbol, interval, limit))
    }

    fn get_ticker(&self, symbol: Symbol) -> BoxFuture<'_, RestResult<PriceQuote>> {
        Box::pin(self.fetch_ticker(symbol))
    }

    fn get_position_info(&self) -> BoxFuture<'_, RestResult<Vec<Position>>> {
        Box::pin(self.fetch_positions())
    }

    fn get_account_snapshot(&self) -> BoxFuture<'_, RestResult<AccountSnapshot>> {
        Box::pin(self.fetch_account_snapshot())
    }

    fn get_listen_key(&self) -> BoxFuture<'_, RestResult<String>> {
        Box::pin(self.create_listen_key())
    }

    fn renew_listen_key(&self, listen_key: String) -> BoxFuture<'_, RestResult<()>> {
        Box::pin(self.listen_key_call(Method::PUT, listen_key))
    }

    fn close_listen_key(&self, listen_key: String) -> BoxFuture<'_, RestResult<()>> {
        Box::pin(self.listen_key_call(Method::DELETE, listen_key))
    }
}

fn canonical_query(params: &[(String, String)]) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&")
}

fn sign_query(secret: &str, query: &str) -> RestResult<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| RestError::HttpClient(format!("Invalid HMAC key: {e}")))?;
    mac.update(query.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_query_known_vector() {
        // Example from the exchange's signed endpoint documentation.
        let secret = "NhqPtmdSJYdKjVHjA7PZj4Mge3R5YNiP1e3UZjInClVN65XAbvqqM6A7H5fATj0j";
        let query = "symbol=LTCBTC&side=BUY&type=LIMIT&timeInForce=GTC&quantity=1&price=0.1&recvWindow=5000&timestamp=1499827319559";
        assert_eq!(
            sign_query(secret, query).unwrap(),
            "c8db56825ae71d6d79447849e617115f4a920fa2acdcab2b053c4b2838bd6b71"
        );
    }

    #[test]
    fn test_canonical_query() {
        let params = vec![
            ("a".to_string(), "1".to_string()),
            ("b".to_string(), "x".to_string()),
        ];
        assert_eq!(canonical_query(&params), "a=1&b=x");
    }

    #[test]
    fn test_signed_query_requires_secret() {
        let client = BinanceRestClient::new(RestConfig::default()).unwrap();
        assert!(matches!(
            client.signed_query(Vec::new()),
            Err(RestError::MissingCredentials)
        ));
    }

    #[test]
    fn test_signed_query_sorted_with_signature() {
        let client = BinanceRestClient::new(RestConfig {
            api_key: Some("key".to_string()),
            api_secret: Some("secret".to_string()),
            recv_window_ms: Some(5_000),
            ..Default::default()
        })
        .unwrap();
        let query = client
            .signed_query(vec![("symbol".to_string(), "BTCUSDT".to_string())])
            .unwrap();
        assert!(query.starts_with("recvWindow=5000&symbol=BTCUSDT&timestamp="));
        let signature = query.rsplit("signature=").next().unwrap();
        assert_eq!(signature.len(), 64);
    }

    #[test]
    fn test_has_credentials() {
        let mut config = RestConfig::default();
        assert!(!config.has_credentials());
        config.api_key = Some("k".to_string());
        config.api_secret = Some(String::new());
        assert!(!config.has_credentials());
        config.api_secret = Some("s".to_string());
        assert!(config.has_credentials());
    }
}
