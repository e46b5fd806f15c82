//! Sized order intents handed from the risk sizer to the executor.

use crate::decimal::{Price, Volume};
use crate::decision::ChainId;
use crate::profile::ProfileId;
use crate::signal::{ClientToken, Direction, Signal, SignalId, Symbol};
use serde::{Deserialize, Serialize};

/// An approved, sized order ready for broker submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderIntent {
    /// Client token for idempotent broker submission.
    pub client_token: ClientToken,
    pub profile_id: ProfileId,
    pub symbol: Symbol,
    pub side: Direction,
    /// Final volume after sizing and caps.
    pub volume: Volume,
    pub entry_price: Price,
    pub stop_loss: Price,
    pub take_profit: Price,
    /// The decision chain this intent belongs to.
    pub chain_id: ChainId,
    /// The originating signal.
    pub signal_id: SignalId,
}

impl OrderIntent {
    /// Build an intent from a signal and a final volume.
    pub fn from_signal(signal: &Signal, volume: Volume, chain_id: ChainId) -> Self {
        Self {
            client_token: ClientToken::new(),
            profile_id: signal.profile_id,
            symbol: signal.symbol.clone(),
            side: signal.direction,
            volume,
            entry_price: signal.entry_price,
            stop_loss: signal.stop_loss,
            take_profit: signal.take_profit,
            chain_id,
            signal_id: signal.signal_id.clone(),
        }
    }

    /// Amount at risk if the stop is hit.
    pub fn risk_amount(&self) -> rust_decimal::Decimal {
        self.volume.inner() * self.entry_price.distance(self.stop_loss)
    }
}
