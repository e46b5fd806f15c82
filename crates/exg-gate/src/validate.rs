//! Domain validation of admitted signal content.
//!
//! Runs after idempotency and rate limiting; a failure here produces a
//! `signal.rejected` node on the chain. Structural malformation (bad id
//! length, confidence outside [0,1], non-positive prices) is caught
//! earlier by `Signal::validate_shape` and never allocates a chain.

use exg_core::{GatewayConfig, Signal, Symbol};
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;

/// Why a signal failed domain validation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "check", rename_all = "snake_case")]
pub enum ValidationFailure {
    SymbolNotAllowed { symbol: String },
    ConfidenceBelowMinimum { confidence: String, minimum: String },
    StopsMisplaced,
    DegenerateStops,
}

impl fmt::Display for ValidationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SymbolNotAllowed { symbol } => write!(f, "symbol {symbol} not allowed"),
            Self::ConfidenceBelowMinimum {
                confidence,
                minimum,
            } => write!(f, "confidence {confidence} below minimum {minimum}"),
            Self::StopsMisplaced => write!(f, "stop-loss/take-profit on wrong side of entry"),
            Self::DegenerateStops => write!(f, "stop-loss equals entry price"),
        }
    }
}

/// Validate signal content against the gate configuration and symbol
/// allowlist. An empty allowlist admits every symbol.
pub fn validate_signal(
    signal: &Signal,
    config: &GatewayConfig,
    allowed_symbols: &HashSet<Symbol>,
) -> Result<(), ValidationFailure> {
    if !allowed_symbols.is_empty() && !allowed_symbols.contains(&signal.symbol) {
        return Err(ValidationFailure::SymbolNotAllowed {
            symbol: signal.symbol.to_string(),
        });
    }
    if signal.confidence < config.kelly_min_confidence {
        return Err(ValidationFailure::ConfidenceBelowMinimum {
            confidence: signal.confidence.to_string(),
            minimum: config.kelly_min_confidence.to_string(),
        });
    }
    if signal.stop_distance().is_zero() {
        return Err(ValidationFailure::DegenerateStops);
    }
    if !signal.stops_well_formed() {
        return Err(ValidationFailure::StopsMisplaced);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use exg_core::{Direction, Price, ProducerId, ProducerTier, ProfileId, SignalId};
    use rust_decimal_macros::dec;

    fn signal() -> Signal {
        Signal {
            signal_id: SignalId::from("s1"),
            profile_id: ProfileId::new(),
            symbol: Symbol::from("EURUSD"),
            direction: Direction::Buy,
            confidence: dec!(0.8),
            entry_price: Price::new(dec!(1.0850)),
            stop_loss: Price::new(dec!(1.0800)),
            take_profit: Price::new(dec!(1.0950)),
            source: ProducerId::from("tsm"),
            tier: ProducerTier::Normal,
            submitted_at: Utc::now(),
        }
    }

    fn allow(symbols: &[&str]) -> HashSet<Symbol> {
        symbols.iter().map(|s| Symbol::from(*s)).collect()
    }

    #[test]
    fn test_valid_signal_passes() {
        let config = GatewayConfig::default();
        assert!(validate_signal(&signal(), &config, &allow(&["EURUSD"])).is_ok());
        // Empty allowlist admits anything.
        assert!(validate_signal(&signal(), &config, &HashSet::new()).is_ok());
    }

    #[test]
    fn test_symbol_not_allowed() {
        let config = GatewayConfig::default();
        let err = validate_signal(&signal(), &config, &allow(&["XAUUSD"])).unwrap_err();
        assert!(matches!(err, ValidationFailure::SymbolNotAllowed { .. }));
    }

    #[test]
    fn test_low_confidence_rejected() {
        let config = GatewayConfig::default();
        let mut s = signal();
        s.confidence = dec!(0.40);
        let err = validate_signal(&s, &config, &HashSet::new()).unwrap_err();
        assert!(matches!(err, ValidationFailure::ConfidenceBelowMinimum { .. }));
    }

    #[test]
    fn test_misplaced_stops_rejected() {
        let config = GatewayConfig::default();
        let mut s = signal();
        s.direction = Direction::Sell; // stops now on the wrong side
        let err = validate_signal(&s, &config, &HashSet::new()).unwrap_err();
        assert_eq!(err, ValidationFailure::StopsMisplaced);
    }

    #[test]
    fn test_degenerate_stop_rejected() {
        let config = GatewayConfig::default();
        let mut s = signal();
        s.stop_loss = s.entry_price;
        let err = validate_signal(&s, &config, &HashSet::new()).unwrap_err();
        assert_eq!(err, ValidationFailure::DegenerateStops);
    }
}
