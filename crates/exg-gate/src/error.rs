//! Error types for exg-gate.

use exg_core::GatewayFault;
use thiserror::Error;

/// Gate error types.
#[derive(Debug, Error)]
pub enum GateError {
    /// Structural validation failed; no chain was created.
    #[error("{0}")]
    Fault(GatewayFault),

    #[error("Audit write failed: {0}")]
    Audit(#[from] exg_audit::AuditError),

    /// The profile's admission channel is gone (worker stopped).
    #[error("Admission channel closed for profile")]
    ChannelClosed,
}

/// Result type alias for gate operations.
pub type GateResult<T> = std::result::Result<T, GateError>;
