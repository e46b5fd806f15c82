//! Error types for exg-executor.

use thiserror::Error;

/// Executor error types.
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("Audit write failed: {0}")]
    Audit(#[from] exg_audit::AuditError),

    #[error("State store error: {0}")]
    Store(#[from] exg_store::StoreError),
}

/// Result type alias for executor operations.
pub type ExecutorResult<T> = std::result::Result<T, ExecutorError>;
