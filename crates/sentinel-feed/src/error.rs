//! Feed error types.

use sentinel_rest::RestError;
use sentinel_ws::HandlerError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Decode error: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Listen key error: {0}")]
    Renewal(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("REST error: {0}")]
    Rest(#[from] RestError),
}

pub type FeedResult<T> = Result<T, FeedError>;

impl From<FeedError> for HandlerError {
    fn from(e: FeedError) -> Self {
        match e {
            FeedError::Decode(e) => HandlerError::Json(e),
            FeedError::Protocol(msg) => HandlerError::Protocol(msg),
            other => HandlerError::Other(other.to_string()),
        }
    }
}
