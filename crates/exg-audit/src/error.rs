//! Error types for exg-audit.

use exg_core::ChainId;
use thiserror::Error;

/// Audit log error types.
#[derive(Debug, Error)]
pub enum AuditError {
    #[error("Chain not found: {0}")]
    ChainNotFound(ChainId),

    #[error("Chain already sealed: {0}")]
    ChainSealed(ChainId),

    #[error("Cannot seal with non-terminal outcome")]
    NonTerminalOutcome,

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Sink I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for audit operations.
pub type AuditResult<T> = std::result::Result<T, AuditError>;
