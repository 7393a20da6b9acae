//! Quality error types.

use sentinel_rest::RestError;
use thiserror::Error;

/// Why a message was rejected by the quality monitor.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("payload is not a JSON object")]
    NotAnObject,

    #[error("missing fields: {0}")]
    MissingFields(String),

    #[error("invalid prices: {0}")]
    InvalidPrices(String),
}

impl ValidationError {
    /// Counter label for the rejection cause.
    pub fn cause(&self) -> &'static str {
        match self {
            Self::NotAnObject | Self::MissingFields(_) => "missing_fields",
            Self::InvalidPrices(_) => "invalid_prices",
        }
    }
}

#[derive(Debug, Error)]
pub enum FallbackError {
    #[error("no REST client configured")]
    NoRestClient,

    #[error("invalid symbol for REST fallback: {0}")]
    InvalidSymbol(String),

    #[error("REST fallback failed after {attempts} attempts: {last_error}")]
    Exhausted { attempts: u32, last_error: String },

    #[error("REST fallback rejected: {0}")]
    Rest(#[from] RestError),
}

pub type FallbackResult<T> = Result<T, FallbackError>;
