//! Prometheus metrics and structured logging for sentinel.
//!
//! - Structured logging with tracing (JSON in production, pretty otherwise)
//! - Prometheus collectors for feeds, data quality, fallback and reconciliation

pub mod error;
pub mod logging;
pub mod metrics;

pub use error::{TelemetryError, TelemetryResult};
pub use logging::init_logging;
pub use metrics::Metrics;
