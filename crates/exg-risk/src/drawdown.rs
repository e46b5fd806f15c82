//! Tiered drawdown policy.
//!
//! Peak-to-trough drawdown maps to a graded response:
//! caution logs, reduce halves new sizes, halt vetoes and raises the
//! emergency state.

use exg_core::GatewayConfig;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Drawdown severity tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DrawdownLevel {
    Normal,
    Caution,
    Reduce,
    Halt,
}

impl DrawdownLevel {
    /// Classify a drawdown fraction against the configured tiers.
    pub fn assess(drawdown: Decimal, config: &GatewayConfig) -> Self {
        if drawdown >= config.dd_halt_threshold {
            Self::Halt
        } else if drawdown >= config.dd_reduce_threshold {
            Self::Reduce
        } else if drawdown >= config.dd_caution_threshold {
            Self::Caution
        } else {
            Self::Normal
        }
    }
}

impl fmt::Display for DrawdownLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Normal => write!(f, "normal"),
            Self::Caution => write!(f, "caution"),
            Self::Reduce => write!(f, "reduce"),
            Self::Halt => write!(f, "halt"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_assess_tiers() {
        let config = GatewayConfig::default();
        assert_eq!(
            DrawdownLevel::assess(dec!(0.02), &config),
            DrawdownLevel::Normal
        );
        assert_eq!(
            DrawdownLevel::assess(dec!(0.06), &config),
            DrawdownLevel::Caution
        );
        assert_eq!(
            DrawdownLevel::assess(dec!(0.10), &config),
            DrawdownLevel::Reduce
        );
        assert_eq!(
            DrawdownLevel::assess(dec!(0.15), &config),
            DrawdownLevel::Halt
        );
        assert_eq!(
            DrawdownLevel::assess(dec!(0.40), &config),
            DrawdownLevel::Halt
        );
    }
}
