//! The broker abstraction consumed by the pool.
//!
//! Adapters (live terminals, the in-process paper broker) implement this
//! trait; nothing above the pool knows which one is behind it.

use crate::error::BrokerResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use exg_core::{
    ClientToken, Direction, Position, PositionTicket, Price, Profile, ProfileId, Symbol, Volume,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// An order submission. The client token makes resubmission after a
/// dropped connection idempotent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub token: ClientToken,
    pub symbol: Symbol,
    pub side: Direction,
    pub volume: Volume,
    pub entry_price: Price,
    pub stop_loss: Price,
    pub take_profit: Price,
}

/// Broker confirmation of a filled order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderAck {
    pub ticket: PositionTicket,
    pub filled_price: Price,
    pub filled_volume: Volume,
    pub token: ClientToken,
}

/// A market data tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    pub symbol: Symbol,
    pub bid: Price,
    pub ask: Price,
    pub at: DateTime<Utc>,
}

impl Tick {
    pub fn mid(&self) -> Price {
        Price::new((self.bid.inner() + self.ask.inner()) / Decimal::from(2))
    }

    pub fn spread(&self) -> Decimal {
        self.ask.inner() - self.bid.inner()
    }
}

/// Operations every broker adapter provides.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Establish a session for the profile.
    async fn connect(&self, profile: &Profile) -> BrokerResult<()>;

    /// Tear the session down.
    async fn disconnect(&self, profile_id: ProfileId) -> BrokerResult<()>;

    /// Liveness probe; an error counts as a heartbeat miss.
    async fn heartbeat(&self, profile_id: ProfileId) -> BrokerResult<()>;

    /// Submit an order. Resubmitting the same client token must not open
    /// a second position.
    async fn submit_order(&self, profile_id: ProfileId, order: &OrderRequest)
        -> BrokerResult<OrderAck>;

    /// Close an open position, fully or partially.
    async fn close_position(
        &self,
        profile_id: ProfileId,
        ticket: PositionTicket,
        volume: Option<Volume>,
    ) -> BrokerResult<()>;

    /// Cancel all resting limit orders; returns the number cancelled.
    async fn cancel_open_orders(&self, profile_id: ProfileId) -> BrokerResult<u32>;

    /// The broker's authoritative view of open positions.
    async fn list_positions(&self, profile_id: ProfileId) -> BrokerResult<Vec<Position>>;

    /// Look up an order by client token (reconnect reconciliation).
    async fn find_order(
        &self,
        profile_id: ProfileId,
        token: &ClientToken,
    ) -> BrokerResult<Option<OrderAck>>;

    /// Account equity reading.
    async fn account_equity(&self, profile_id: ProfileId) -> BrokerResult<Decimal>;

    /// Stream of ticks for a symbol.
    async fn subscribe_ticks(
        &self,
        profile_id: ProfileId,
        symbol: &Symbol,
    ) -> BrokerResult<mpsc::Receiver<Tick>>;
}
