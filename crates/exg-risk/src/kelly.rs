//! Kelly criterion sizing.
//!
//! The growth-optimal fraction for a bet with win probability `p`,
//! loss probability `q = 1 - p`, and payoff ratio `b` is
//!
//! ```text
//! f = (p * b - q) / b
//! ```
//!
//! The raw fraction is scaled by a configured factor (full Kelly is far
//! too aggressive for leveraged retail accounts) and clipped to
//! `[0, KELLY_CAP]`.

use exg_core::Volume;
use rust_decimal::Decimal;

/// Upper clip for the scaled Kelly fraction.
pub const KELLY_CAP: Decimal = Decimal::from_parts(5, 0, 0, false, 1); // 0.5

/// Scaled, clipped Kelly fraction.
///
/// Returns zero when the edge is non-positive (no bet) or the payoff
/// ratio is degenerate.
pub fn kelly_fraction(confidence: Decimal, payoff_ratio: Decimal, scale: Decimal) -> Decimal {
    if payoff_ratio <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    let p = confidence;
    let q = Decimal::ONE - p;
    let raw = (p * payoff_ratio - q) / payoff_ratio;
    if raw <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    (raw * scale).min(KELLY_CAP)
}

/// Convert a risk amount into an order volume.
///
/// `volume = risk_amount / stop_distance`, floored to the broker step and
/// clamped to `[min_volume, max_volume]`. Returns zero volume when the
/// floored result falls below the broker minimum.
pub fn volume_for_risk(
    risk_amount: Decimal,
    stop_distance: Decimal,
    step: Decimal,
    min_volume: Decimal,
    max_volume: Decimal,
) -> Volume {
    if risk_amount <= Decimal::ZERO || stop_distance <= Decimal::ZERO {
        return Volume::ZERO;
    }
    let raw = risk_amount / stop_distance;
    let floored = Volume::new(raw).round_to_step(Volume::new(step));
    if floored.inner() < min_volume {
        return Volume::ZERO;
    }
    Volume::new(floored.inner().min(max_volume))
}
