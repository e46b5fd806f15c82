//! Error types for exg-store.

use exg_core::{PositionTicket, ProfileId};
use thiserror::Error;

/// State store error types.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Unknown profile: {0}")]
    UnknownProfile(ProfileId),

    #[error("Unknown position ticket: {0}")]
    UnknownTicket(PositionTicket),

    #[error("Position cap reached: {current}/{max}")]
    PositionCapReached { current: usize, max: u32 },
}

/// Result type alias for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;
