//! The signal gate: single ingress for all trade proposals.
//!
//! Signals are evaluated, not trusted. Five checks run in a strict
//! order; the first failure is terminal and every verdict lands in the
//! decision chain before the call returns. Admitted signals flow out as
//! a per-profile FIFO stream.

pub mod error;
pub mod gate;
pub mod idempotency;
pub mod rate_limit;
pub mod validate;

pub use error::{GateError, GateResult};
pub use gate::{AdmittedSignal, GateStats, SignalGate, SubmitOutcome};
pub use idempotency::IdempotencyCache;
pub use rate_limit::{RateDecision, RateLimiter};
pub use validate::ValidationFailure;
