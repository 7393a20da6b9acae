//! Ops HTTP endpoint.

use crate::manager::{FeedStatus, WebSocketManager};
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use sentinel_quality::HealthSummary;
use sentinel_telemetry::Metrics;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub summary: HealthSummary,
    pub feeds: Vec<FeedStatus>,
}

pub fn create_router(manager: Arc<WebSocketManager>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .with_state(manager)
}

pub(crate) async fn health(State(manager): State<Arc<WebSocketManager>>) -> Json<HealthReport> {
    Json(HealthReport {
        summary: manager.get_health_summary(),
        feeds: manager.feed_stats(),
    })
}

pub(crate) async fn metrics() -> Response {
    match Metrics::render() {
        Ok(body) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

/// Serve until `cancel` fires.
pub async fn serve(
    manager: Arc<WebSocketManager>,
    port: u16,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(port, "Ops endpoint listening");
    axum::serve(listener, create_router(manager))
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;

    #[tokio::test]
    async fn test_health_report_lists_feeds() {
        let config = AppConfig::from_toml_str(r#"symbols = ["BTCUSDT"]"#).unwrap();
        let manager = Arc::new(WebSocketManager::new(&config, None).unwrap());
        let Json(report) = health(State(manager)).await;
        assert_eq!(report.feeds.len(), 2);
        assert_eq!(report.summary.streams, 0);

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["feeds"][0]["state"], "disconnected");
    }

    #[tokio::test]
    async fn test_metrics_renders_text() {
        Metrics::feed_reconnect("ops-test");
        let response = metrics().await;
        assert_eq!(response.status(), StatusCode::OK);
    }
}
