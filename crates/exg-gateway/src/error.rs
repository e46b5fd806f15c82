//! Error types for the gateway application.

use thiserror::Error;

/// Application error types.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Core error: {0}")]
    Core(#[from] exg_core::CoreError),

    #[error("Audit error: {0}")]
    Audit(#[from] exg_audit::AuditError),

    #[error("Pool error: {0}")]
    Pool(#[from] exg_broker::PoolError),

    #[error("Broker error: {0}")]
    Broker(#[from] exg_broker::BrokerError),

    #[error("Telemetry error: {0}")]
    Telemetry(#[from] exg_telemetry::TelemetryError),
}

/// Result type alias for application operations.
pub type AppResult<T> = std::result::Result<T, AppError>;
