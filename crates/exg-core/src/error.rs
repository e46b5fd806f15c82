//! Error types and the stable error taxonomy.

use crate::decision::ChainId;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Core error types.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Malformed signal: {0}")]
    MalformedSignal(String),

    #[error("Invalid price: {0}")]
    InvalidPrice(String),

    #[error("Invalid volume: {0}")]
    InvalidVolume(String),

    #[error("Decimal parse error: {0}")]
    DecimalParse(#[from] rust_decimal::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Stable error taxonomy surfaced to producers.
///
/// Every terminal failure maps to exactly one kind; unclassified failures
/// bubble up as `Internal` and seal the affected chain without unwinding
/// the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed signal; rejected synchronously, no chain created.
    Validation,
    /// Idempotency hit; the prior chain's outcome is returned.
    Duplicate,
    /// Rate limit, emergency state, or disabled profile; chain sealed blocked.
    GateBlocked,
    /// Vetoed by the risk sizer; chain sealed rejected.
    RiskRejected,
    /// Network, timeout, or degraded broker; retried per policy.
    Transient,
    /// Market closed, margin, invalid price; never retried.
    BrokerRejected,
    /// Pipeline preempted by emergency state.
    Emergency,
    /// Programmer error or broken invariant.
    Internal,
}

impl ErrorKind {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation => "EXG-VALIDATION",
            Self::Duplicate => "EXG-DUPLICATE",
            Self::GateBlocked => "EXG-GATE-BLOCKED",
            Self::RiskRejected => "EXG-RISK-REJECTED",
            Self::Transient => "EXG-TRANSIENT",
            Self::BrokerRejected => "EXG-BROKER-REJECTED",
            Self::Emergency => "EXG-EMERGENCY",
            Self::Internal => "EXG-INTERNAL",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// User-visible failure: kind, stable code, human message, and the chain
/// id for correlation when one was allocated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayFault {
    pub kind: ErrorKind,
    pub code: String,
    pub message: String,
    pub chain_id: Option<ChainId>,
}

impl GatewayFault {
    pub fn new(kind: ErrorKind, message: impl Into<String>, chain_id: Option<ChainId>) -> Self {
        Self {
            kind,
            code: kind.code().to_string(),
            message: message.into(),
            chain_id,
        }
    }
}

impl fmt::Display for GatewayFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for GatewayFault {}
