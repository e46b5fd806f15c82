//! Per-profile mutable state.
//!
//! Each profile's state (equity, peak equity, open positions, return
//! series, daily counters) has a single writer: the profile's pipeline
//! worker or the broker pool's reconciliation path. Readers take cheap
//! consistent snapshots; a snapshot never observes a partial update.

pub mod error;
pub mod state;

pub use error::{StoreError, StoreResult};
pub use state::{ReconciliationDiff, StateStore};
