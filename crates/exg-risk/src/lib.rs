//! Risk sizing engine.
//!
//! Transforms an admitted signal into a sized order intent, or vetoes it.
//! The sizer is pure with respect to its inputs: identical
//! `(signal, snapshot)` pairs produce identical outputs, which is what
//! makes every sizing decision reproducible from its audit record.

pub mod correlation;
pub mod cvar;
pub mod drawdown;
pub mod error;
pub mod kelly;
pub mod sizer;

pub use correlation::pairwise_correlation;
pub use cvar::CvarEngine;
pub use drawdown::DrawdownLevel;
pub use error::{RiskError, RiskResult};
pub use kelly::{kelly_fraction, volume_for_risk, KELLY_CAP};
pub use sizer::{RiskSizer, SizeDecision, SizingReport, VetoReason};
