//! WebSocket error types.

use thiserror::Error;

/// Transport-level errors. These never leave the connection loop; they
/// only decide whether to back off and reconnect.
#[derive(Debug, Error)]
pub enum WsError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Connect timed out after {0}ms")]
    ConnectTimeout(u64),

    #[error("Connection closed: code={code}, reason={reason}")]
    ConnectionClosed { code: u16, reason: String },

    #[error("Heartbeat timeout")]
    HeartbeatTimeout,

    #[error("Tungstenite error: {0}")]
    Tungstenite(#[from] tokio_tungstenite::tungstenite::Error),
}

pub type WsResult<T> = Result<T, WsError>;

/// Errors returned by [`crate::FeedHandler::process_message`].
///
/// The consumer loop logs and counts these; they never stop the feed.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Handler error: {0}")]
    Other(String),
}

pub type HandlerResult<T> = Result<T, HandlerError>;
