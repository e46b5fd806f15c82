//! Open market exposure.

use crate::decimal::{Price, Volume};
use crate::profile::ProfileId;
use crate::signal::{Direction, SignalId, Symbol};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Broker-assigned position ticket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PositionTicket(pub u64);

impl PositionTicket {
    pub fn new(ticket: u64) -> Self {
        Self(ticket)
    }

    pub fn inner(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for PositionTicket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// An opened market exposure.
///
/// Mutated only by pool reconciliation or executor close operations;
/// archived on close.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub ticket: PositionTicket,
    pub profile_id: ProfileId,
    pub symbol: Symbol,
    pub side: Direction,
    pub volume: Volume,
    pub entry_price: Price,
    pub stop_loss: Price,
    pub take_profit: Price,
    /// Latest mark from the broker feed.
    pub mark_price: Price,
    /// The signal this position originated from. Its chain outcome is
    /// always `executed`.
    pub origin_signal: SignalId,
    pub opened_at: DateTime<Utc>,
}

impl Position {
    /// Unrealized profit and loss at the current mark.
    pub fn unrealized_pnl(&self) -> Decimal {
        let diff = self.mark_price.inner() - self.entry_price.inner();
        diff * Decimal::from(self.side.sign()) * self.volume.inner()
    }

    /// Amount at risk if the stop is hit: volume x |entry - stop|.
    pub fn risk_amount(&self) -> Decimal {
        self.volume.inner() * self.entry_price.distance(self.stop_loss)
    }

    pub fn is_long(&self) -> bool {
        self.side == Direction::Buy
    }

    pub fn is_short(&self) -> bool {
        self.side == Direction::Sell
    }
}
