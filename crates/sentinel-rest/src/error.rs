//! REST error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RestError {
    #[error("HTTP client error: {0}")]
    HttpClient(String),

    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Response decode error: {0}")]
    Decode(String),

    #[error("API credentials missing")]
    MissingCredentials,

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl RestError {
    /// Whether retrying the same request may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::HttpClient(_) => true,
            Self::Status { status, .. } => *status == 429 || *status >= 500,
            Self::Decode(_) | Self::MissingCredentials | Self::Json(_) => false,
        }
    }
}

pub type RestResult<T> = Result<T, RestError>;
