//! Trade proposal types.
//!
//! A `Signal` is an immutable trade proposal submitted by a producer.
//! It is keyed by `(profile_id, signal_id)` for at-most-once acceptance.

use crate::decimal::Price;
use crate::error::CoreError;
use crate::profile::ProfileId;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Maximum length of a producer-chosen signal id.
pub const MAX_SIGNAL_ID_LEN: usize = 64;

/// Trade direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    Buy,
    Sell,
}

impl Direction {
    /// Returns the opposite direction (used for panic hedging).
    pub fn opposite(&self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }

    /// Returns 1 for buy, -1 for sell (for exposure calculations).
    pub fn sign(&self) -> i8 {
        match self {
            Self::Buy => 1,
            Self::Sell => -1,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
        }
    }
}

/// Instrument symbol (e.g. "EURUSD", "XAUUSD").
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Symbol(String);

impl Symbol {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Symbol {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Producer-chosen signal identifier, opaque to the gateway.
///
/// Unique per `(profile, 24h window)`; reuse within the window is a
/// duplicate and replays the original decision.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SignalId(String);

impl SignalId {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for SignalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for SignalId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Identity of the signal producer (human or algorithmic).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProducerId(String);

impl ProducerId {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProducerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ProducerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Rate-limit tier of a producer, carried on every signal.
///
/// `Critical` producers bypass the token bucket but not validation,
/// emergency, or profile checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProducerTier {
    #[default]
    Normal,
    High,
    Critical,
}

impl ProducerTier {
    pub fn is_rate_limit_exempt(&self) -> bool {
        matches!(self, Self::Critical)
    }
}

/// Client-generated token carried on every broker submit.
///
/// CRITICAL: every submit must carry a unique token so that an in-flight
/// order can be identified at the broker after a reconnect. This is what
/// makes the retry-after-disconnect path idempotent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientToken(String);

impl ClientToken {
    /// Create a new unique client token.
    ///
    /// Format: `exg_{timestamp_ms}_{uuid_short}`
    pub fn new() -> Self {
        let ts = Utc::now().timestamp_millis();
        let uuid_short = &Uuid::new_v4().to_string()[..8];
        Self(format!("exg_{ts}_{uuid_short}"))
    }

    pub fn from_string(s: String) -> Self {
        Self(s)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ClientToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ClientToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A trade proposal. Immutable after submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    /// Producer-chosen id, unique per (profile, 24h window).
    pub signal_id: SignalId,
    /// Target profile (tenant broker binding).
    pub profile_id: ProfileId,
    /// Instrument symbol.
    pub symbol: Symbol,
    /// BUY or SELL.
    pub direction: Direction,
    /// Producer confidence in [0, 1].
    pub confidence: Decimal,
    /// Requested entry price.
    pub entry_price: Price,
    /// Stop-loss price.
    pub stop_loss: Price,
    /// Take-profit price.
    pub take_profit: Price,
    /// Producer identity.
    pub source: ProducerId,
    /// Producer rate-limit tier.
    #[serde(default)]
    pub tier: ProducerTier,
    /// Submission timestamp (RFC 3339).
    pub submitted_at: DateTime<Utc>,
}

impl Signal {
    /// Structural validation: malformed signals are rejected synchronously
    /// before any chain is allocated.
    ///
    /// Domain checks (symbol allowlist, minimum confidence, stop placement)
    /// run later inside the gate and do produce a decision chain.
    pub fn validate_shape(&self) -> Result<(), CoreError> {
        if self.signal_id.is_empty() {
            return Err(CoreError::MalformedSignal("empty signal_id".to_string()));
        }
        if self.signal_id.len() > MAX_SIGNAL_ID_LEN {
            return Err(CoreError::MalformedSignal(format!(
                "signal_id exceeds {MAX_SIGNAL_ID_LEN} chars"
            )));
        }
        if self.confidence < Decimal::ZERO || self.confidence > Decimal::ONE {
            return Err(CoreError::MalformedSignal(format!(
                "confidence {} outside [0, 1]",
                self.confidence
            )));
        }
        if !self.entry_price.is_positive()
            || !self.stop_loss.is_positive()
            || !self.take_profit.is_positive()
        {
            return Err(CoreError::MalformedSignal(
                "prices must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Stop distance in price units (used for sizing).
    pub fn stop_distance(&self) -> Decimal {
        self.entry_price.distance(self.stop_loss)
    }

    /// Take-profit distance in price units.
    pub fn target_distance(&self) -> Decimal {
        self.entry_price.distance(self.take_profit)
    }

    /// Payoff ratio b = target distance / stop distance.
    pub fn payoff_ratio(&self) -> Option<Decimal> {
        let stop = self.stop_distance();
        if stop.is_zero() {
            return None;
        }
        Some(self.target_distance() / stop)
    }

    /// Whether stop-loss and take-profit sit on the correct side of entry.
    pub fn stops_well_formed(&self) -> bool {
        match self.direction {
            Direction::Buy => {
                self.stop_loss < self.entry_price && self.take_profit > self.entry_price
            }
            Direction::Sell => {
                self.stop_loss > self.entry_price && self.take_profit < self.entry_price
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn sample_signal() -> Signal {
        Signal {
            signal_id: SignalId::from("sig-001"),
            profile_id: ProfileId::new(),
            symbol: Symbol::from("EURUSD"),
            direction: Direction::Buy,
            confidence: dec!(0.8),
            entry_price: Price::new(dec!(1.0850)),
            stop_loss: Price::new(dec!(1.0800)),
            take_profit: Price::new(dec!(1.0950)),
            source: ProducerId::from("tsm-live"),
            tier: ProducerTier::Normal,
            submitted_at: Utc::now(),
        }
    }

    #[test]
    fn test_direction_opposite() {
        assert_eq!(Direction::Buy.opposite(), Direction::Sell);
        assert_eq!(Direction::Sell.opposite(), Direction::Buy);
        assert_eq!(Direction::Buy.sign(), 1);
        assert_eq!(Direction::Sell.sign(), -1);
    }

    #[test]
    fn test_payoff_ratio() {
        let signal = sample_signal();
        // 100 pips target / 50 pips stop = 2
        assert_eq!(signal.payoff_ratio().unwrap(), dec!(2));
    }

    #[test]
    fn test_stops_well_formed_buy() {
        let signal = sample_signal();
        assert!(signal.stops_well_formed());

        let mut inverted = signal;
        inverted.stop_loss = Price::new(dec!(1.0950));
        inverted.take_profit = Price::new(dec!(1.0800));
        assert!(!inverted.stops_well_formed());
    }

    #[test]
    fn test_stops_well_formed_sell() {
        let mut signal = sample_signal();
        signal.direction = Direction::Sell;
        signal.stop_loss = Price::new(dec!(1.0950));
        signal.take_profit = Price::new(dec!(1.0750));
        assert!(signal.stops_well_formed());
    }

    #[test]
    fn test_validate_shape_rejects_long_id() {
        let mut signal = sample_signal();
        signal.signal_id = SignalId::new("x".repeat(65));
        assert!(signal.validate_shape().is_err());
    }

    #[test]
    fn test_validate_shape_rejects_bad_confidence() {
        let mut signal = sample_signal();
        signal.confidence = dec!(1.5);
        assert!(signal.validate_shape().is_err());
    }

    #[test]
    fn test_client_token_unique() {
        let a = ClientToken::new();
        let b = ClientToken::new();
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("exg_"));
    }
}
