//! Conditional Value-at-Risk (expected shortfall).
//!
//! CVaR at confidence `alpha` is the mean loss conditional on the loss
//! exceeding VaR(alpha). It is computed historically over a rolling
//! return window: sort the window, average the worst `(1 - alpha)`
//! fraction of observations. More robust than VaR for the fat-tailed
//! return distributions these accounts actually see.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

/// Historical VaR/CVaR engine over a rolling return window.
#[derive(Debug, Clone)]
pub struct CvarEngine {
    /// Minimum observations before an estimate is considered meaningful.
    pub min_samples: usize,
    /// Confidence level, e.g. 0.95.
    pub confidence: Decimal,
}

impl Default for CvarEngine {
    fn default() -> Self {
        Self {
            min_samples: 30,
            confidence: Decimal::new(95, 2),
        }
    }
}

impl CvarEngine {
    pub fn new(confidence: Decimal, min_samples: usize) -> Self {
        Self {
            min_samples,
            confidence,
        }
    }

    /// Value at Risk: the `(1 - confidence)` quantile of the return
    /// window, as a loss fraction (positive number).
    ///
    /// Returns `None` when the window is too short.
    pub fn var(&self, returns: &[Decimal]) -> Option<Decimal> {
        if returns.len() < self.min_samples {
            return None;
        }
        let mut sorted = returns.to_vec();
        sorted.sort();
        let tail = self.tail_len(sorted.len());
        // The VaR boundary is the best return inside the tail.
        sorted.get(tail - 1).map(|r| (-*r).max(Decimal::ZERO))
    }

    /// Conditional VaR: mean of the tail beyond VaR, as a loss fraction.
    ///
    /// Returns `None` when the window is too short.
    pub fn cvar(&self, returns: &[Decimal]) -> Option<Decimal> {
        if returns.len() < self.min_samples {
            return None;
        }
        let mut sorted = returns.to_vec();
        sorted.sort();
        let tail = self.tail_len(sorted.len());
        let worst = &sorted[..tail];
        let sum: Decimal = worst.iter().copied().sum();
        let mean = sum / Decimal::from(worst.len() as u64);
        Some((-mean).max(Decimal::ZERO))
    }

    /// Largest notional exposure whose estimated tail loss stays within
    /// `budget` (an absolute loss amount), given the portfolio's CVaR
    /// loss fraction. `None` means the window was too short to estimate,
    /// which callers treat as "no CVaR constraint".
    pub fn max_notional_within(&self, returns: &[Decimal], budget: Decimal) -> Option<Decimal> {
        let cvar = self.cvar(returns)?;
        if cvar.is_zero() {
            return Some(Decimal::MAX);
        }
        Some(budget / cvar)
    }

    fn tail_len(&self, n: usize) -> usize {
        let alpha = Decimal::ONE - self.confidence;
        let len = (alpha * Decimal::from(n as u64))
            .floor()
            .to_usize()
            .unwrap_or(0);
        len.max(1)
    }
}
