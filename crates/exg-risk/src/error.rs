//! Error types for exg-risk.

use thiserror::Error;

/// Risk engine error types.
#[derive(Debug, Error)]
pub enum RiskError {
    #[error("Degenerate signal geometry: {0}")]
    DegenerateGeometry(String),

    #[error("Snapshot missing data: {0}")]
    MissingData(String),
}

/// Result type alias for risk operations.
pub type RiskResult<T> = std::result::Result<T, RiskError>;
