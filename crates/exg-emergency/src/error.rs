//! Error types for exg-emergency.

use thiserror::Error;

/// Emergency subsystem error types.
#[derive(Debug, Error)]
pub enum EmergencyError {
    #[error("Actor {0} lacks Owner capability")]
    NotOwnerCapable(String),

    #[error("Restore requires two distinct actors")]
    SameActor,

    #[error("Restore authorization code is empty")]
    EmptyAuthorization,

    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    #[error("Kill confirmation token is empty")]
    EmptyConfirmation,

    #[error("Audit write failed: {0}")]
    Audit(#[from] exg_audit::AuditError),

    #[error("Broker action failed: {0}")]
    Broker(#[from] exg_broker::BrokerError),
}

/// Result type alias for emergency operations.
pub type EmergencyResult<T> = std::result::Result<T, EmergencyError>;
