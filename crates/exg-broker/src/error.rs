//! Error types for exg-broker.

use exg_core::{PositionTicket, ProfileId};
use thiserror::Error;

/// Failures surfaced by broker adapters.
///
/// The executor's retry policy keys off these variants, so adapters must
/// classify faithfully: a mislabelled transient becomes a lost order.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Network failure or RPC timeout; retryable.
    #[error("Broker call timed out")]
    Timeout,

    /// Transport dropped mid-call; retry only after token reconciliation.
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// Broker refused the order (margin, spread, invalid price); final.
    #[error("Broker rejected order: {0}")]
    Rejected(String),

    /// Market closed for the symbol; final.
    #[error("Market closed for {0}")]
    MarketClosed(String),

    /// The client token was already used; the original ticket is returned
    /// and callers treat the submit as a success.
    #[error("Duplicate client token, original ticket {0}")]
    DuplicateTicket(PositionTicket),

    /// Session is not connected.
    #[error("Not connected: {0}")]
    NotConnected(ProfileId),

    /// Unknown position ticket.
    #[error("Unknown ticket: {0}")]
    UnknownTicket(PositionTicket),

    /// Credentials refused by the broker.
    #[error("Authentication failed: {0}")]
    AuthFailed(String),
}

/// Result type alias for broker operations.
pub type BrokerResult<T> = std::result::Result<T, BrokerError>;

/// Failures surfaced by the pool.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("No session for profile {0}")]
    NoSession(ProfileId),

    #[error("Acquire timed out after {0:?}")]
    AcquireTimeout(std::time::Duration),

    #[error("Session unhealthy: {0}")]
    Unhealthy(ProfileId),

    #[error("Position cap reached: {current}/{max}")]
    PositionCapReached { current: usize, max: u32 },

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

/// Result type alias for pool operations.
pub type PoolResult<T> = std::result::Result<T, PoolError>;
