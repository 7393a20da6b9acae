//! Data quality and consistency for sentinel.
//!
//! Decides when the WebSocket view can be trusted and when REST must take
//! over:
//! - DataQualityMonitor: per-message schema/price checks and per-symbol
//!   continuity tracking
//! - DataGapHandler: detects stalled symbols and backfills bars over REST
//! - DataConsistencyManager: per-symbol health scoring, freshness checks
//!   and retried REST fallback

pub mod consistency;
pub mod error;
pub mod gap;
pub mod health;
pub mod monitor;

pub use consistency::{
    DataConsistencyManager, DataType, FallbackData, FallbackDecision, FallbackReason,
    FallbackStats, HealthSummary,
};
pub use error::{FallbackError, ValidationError};
pub use gap::{DataGapHandler, GapConfig, GapRepair, GapStats, SymbolBuffer};
pub use health::{HealthConfig, HealthRecord, HealthStatus, SourceType};
pub use monitor::{Continuity, DataQualityMonitor, QualityConfig, QualityReport};
