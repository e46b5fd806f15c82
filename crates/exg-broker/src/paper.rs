//! Deterministic in-memory broker.
//!
//! Fills every order at the requested entry price, keeps an authoritative
//! position book per profile, and supports failure injection so the
//! executor's retry and reconciliation paths can be exercised without a
//! live terminal.

use crate::broker::{Broker, OrderAck, OrderRequest, Tick};
use crate::error::{BrokerError, BrokerResult};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use exg_core::{
    ClientToken, Position, PositionTicket, Profile, ProfileId, SignalId, Symbol, Volume,
};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// Injected failure for the next matching call.
#[derive(Debug, Clone)]
pub enum FailureMode {
    /// Next submit times out; no order is placed.
    Timeout,
    /// Next submit is rejected outright.
    Reject(String),
    /// Next submit fails with market closed.
    MarketClosed,
    /// Next submit fails with connection lost; no order is placed.
    ConnectionLost,
    /// Next submit places the order, then reports connection lost.
    /// Exercises the find-order reconciliation path.
    DisconnectMidSubmit,
}

#[derive(Default)]
struct PaperAccount {
    connected: bool,
    equity: Decimal,
    positions: HashMap<PositionTicket, Position>,
    acks_by_token: HashMap<String, OrderAck>,
    submit_failures: VecDeque<FailureMode>,
    heartbeat_failures: u32,
    connect_failures: u32,
    resting_orders: u32,
}

/// In-memory paper broker.
pub struct PaperBroker {
    accounts: DashMap<ProfileId, Mutex<PaperAccount>>,
    tick_subscribers: DashMap<(ProfileId, Symbol), Vec<mpsc::Sender<Tick>>>,
    next_ticket: AtomicU64,
}

impl Default for PaperBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl PaperBroker {
    pub fn new() -> Self {
        Self {
            accounts: DashMap::new(),
            tick_subscribers: DashMap::new(),
            next_ticket: AtomicU64::new(1000),
        }
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    // === Test/control surface ===

    /// Seed an account so equity is defined before connect.
    pub fn seed_account(&self, profile_id: ProfileId, equity: Decimal) {
        let account = self.accounts.entry(profile_id).or_default();
        account.lock().equity = equity;
    }

    pub fn set_equity(&self, profile_id: ProfileId, equity: Decimal) {
        if let Some(account) = self.accounts.get(&profile_id) {
            account.lock().equity = equity;
        }
    }

    /// Queue a failure for the next submit on the profile.
    pub fn inject_submit_failure(&self, profile_id: ProfileId, mode: FailureMode) {
        let account = self.accounts.entry(profile_id).or_default();
        account.lock().submit_failures.push_back(mode);
    }

    /// Fail the next `n` heartbeats.
    pub fn fail_heartbeats(&self, profile_id: ProfileId, n: u32) {
        if let Some(account) = self.accounts.get(&profile_id) {
            account.lock().heartbeat_failures = n;
        }
    }

    /// Fail the next `n` connect attempts.
    pub fn fail_connects(&self, profile_id: ProfileId, n: u32) {
        let account = self.accounts.entry(profile_id).or_default();
        account.lock().connect_failures = n;
    }

    /// Pretend `n` limit orders are resting (for cancel tests).
    pub fn set_resting_orders(&self, profile_id: ProfileId, n: u32) {
        if let Some(account) = self.accounts.get(&profile_id) {
            account.lock().resting_orders = n;
        }
    }

    /// Place a position directly on the broker book (reconciliation tests).
    pub fn plant_position(&self, position: Position) {
        let account = self.accounts.entry(position.profile_id).or_default();
        account.lock().positions.insert(position.ticket, position);
    }

    pub fn position_count(&self, profile_id: ProfileId) -> usize {
        self.accounts
            .get(&profile_id)
            .map(|a| a.lock().positions.len())
            .unwrap_or(0)
    }

    /// Push a tick to all subscribers of the profile's symbol.
    pub async fn push_tick(&self, profile_id: ProfileId, tick: Tick) {
        let key = (profile_id, tick.symbol.clone());
        let senders = self
            .tick_subscribers
            .get(&key)
            .map(|s| s.clone())
            .unwrap_or_default();
        for sender in senders {
            let _ = sender.send(tick.clone()).await;
        }
    }

    fn fill(&self, profile_id: ProfileId, order: &OrderRequest) -> (PositionTicket, OrderAck) {
        let ticket = PositionTicket::new(self.next_ticket.fetch_add(1, Ordering::SeqCst));
        let ack = OrderAck {
            ticket,
            filled_price: order.entry_price,
            filled_volume: order.volume,
            token: order.token.clone(),
        };
        let position = Position {
            ticket,
            profile_id,
            symbol: order.symbol.clone(),
            side: order.side,
            volume: order.volume,
            entry_price: order.entry_price,
            stop_loss: order.stop_loss,
            take_profit: order.take_profit,
            mark_price: order.entry_price,
            origin_signal: SignalId::new(order.token.as_str()),
            opened_at: Utc::now(),
        };
        if let Some(account) = self.accounts.get(&profile_id) {
            let mut account = account.lock();
            account.positions.insert(ticket, position);
            account.acks_by_token.insert(order.token.to_string(), ack.clone());
        }
        (ticket, ack)
    }
}

#[async_trait]
impl Broker for PaperBroker {
    async fn connect(&self, profile: &Profile) -> BrokerResult<()> {
        let account = self.accounts.entry(profile.id).or_default();
        let mut account = account.lock();
        if account.connect_failures > 0 {
            account.connect_failures -= 1;
            return Err(BrokerError::ConnectionLost("injected connect failure".into()));
        }
        account.connected = true;
        if account.equity.is_zero() {
            account.equity = Decimal::from(10_000);
        }
        debug!(profile = %profile.id, "paper broker connected");
        Ok(())
    }

    async fn disconnect(&self, profile_id: ProfileId) -> BrokerResult<()> {
        if let Some(account) = self.accounts.get(&profile_id) {
            account.lock().connected = false;
        }
        Ok(())
    }

    async fn heartbeat(&self, profile_id: ProfileId) -> BrokerResult<()> {
        let account = self
            .accounts
            .get(&profile_id)
            .ok_or(BrokerError::NotConnected(profile_id))?;
        let mut account = account.lock();
        if !account.connected {
            return Err(BrokerError::NotConnected(profile_id));
        }
        if account.heartbeat_failures > 0 {
            account.heartbeat_failures -= 1;
            return Err(BrokerError::Timeout);
        }
        Ok(())
    }

    async fn submit_order(
        &self,
        profile_id: ProfileId,
        order: &OrderRequest,
    ) -> BrokerResult<OrderAck> {
        {
            let account = self
                .accounts
                .get(&profile_id)
                .ok_or(BrokerError::NotConnected(profile_id))?;
            let mut account = account.lock();
            if !account.connected {
                return Err(BrokerError::NotConnected(profile_id));
            }
            // Idempotency: a resubmitted token returns the original fill.
            if let Some(ack) = account.acks_by_token.get(order.token.as_str()) {
                return Ok(ack.clone());
            }
            if let Some(mode) = account.submit_failures.pop_front() {
                match mode {
                    FailureMode::Timeout => return Err(BrokerError::Timeout),
                    FailureMode::Reject(reason) => return Err(BrokerError::Rejected(reason)),
                    FailureMode::MarketClosed => {
                        return Err(BrokerError::MarketClosed(order.symbol.to_string()))
                    }
                    FailureMode::ConnectionLost => {
                        account.connected = false;
                        return Err(BrokerError::ConnectionLost("injected".into()));
                    }
                    FailureMode::DisconnectMidSubmit => {
                        drop(account);
                        let _ = self.fill(profile_id, order);
                        return Err(BrokerError::ConnectionLost(
                            "connection dropped after submit".into(),
                        ));
                    }
                }
            }
        }
        let (_, ack) = self.fill(profile_id, order);
        Ok(ack)
    }

    async fn close_position(
        &self,
        profile_id: ProfileId,
        ticket: PositionTicket,
        volume: Option<Volume>,
    ) -> BrokerResult<()> {
        let account = self
            .accounts
            .get(&profile_id)
            .ok_or(BrokerError::NotConnected(profile_id))?;
        let mut account = account.lock();
        let position = account
            .positions
            .get_mut(&ticket)
            .ok_or(BrokerError::UnknownTicket(ticket))?;
        match volume {
            Some(v) if v < position.volume => {
                position.volume = position.volume - v;
            }
            _ => {
                account.positions.remove(&ticket);
            }
        }
        Ok(())
    }

    async fn cancel_open_orders(&self, profile_id: ProfileId) -> BrokerResult<u32> {
        let account = self
            .accounts
            .get(&profile_id)
            .ok_or(BrokerError::NotConnected(profile_id))?;
        let mut account = account.lock();
        let cancelled = account.resting_orders;
        account.resting_orders = 0;
        Ok(cancelled)
    }

    async fn list_positions(&self, profile_id: ProfileId) -> BrokerResult<Vec<Position>> {
        let account = self
            .accounts
            .get(&profile_id)
            .ok_or(BrokerError::NotConnected(profile_id))?;
        let account = account.lock();
        Ok(account.positions.values().cloned().collect())
    }

    async fn find_order(
        &self,
        profile_id: ProfileId,
        token: &ClientToken,
    ) -> BrokerResult<Option<OrderAck>> {
        let account = self
            .accounts
            .get(&profile_id)
            .ok_or(BrokerError::NotConnected(profile_id))?;
        let account = account.lock();
        Ok(account.acks_by_token.get(token.as_str()).cloned())
    }

    async fn account_equity(&self, profile_id: ProfileId) -> BrokerResult<Decimal> {
        let account = self
            .accounts
            .get(&profile_id)
            .ok_or(BrokerError::NotConnected(profile_id))?;
        let equity = account.lock().equity;
        Ok(equity)
    }

    async fn subscribe_ticks(
        &self,
        profile_id: ProfileId,
        symbol: &Symbol,
    ) -> BrokerResult<mpsc::Receiver<Tick>> {
        let (tx, rx) = mpsc::channel(256);
        self.tick_subscribers
            .entry((profile_id, symbol.clone()))
            .or_default()
            .push(tx);
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use exg_core::{Direction, Price};
    use rust_decimal_macros::dec;

    fn order(token: ClientToken) -> OrderRequest {
        OrderRequest {
            token,
            symbol: Symbol::from("EURUSD"),
            side: Direction::Buy,
            volume: Volume::new(dec!(0.10)),
            entry_price: Price::new(dec!(1.0850)),
            stop_loss: Price::new(dec!(1.0800)),
            take_profit: Price::new(dec!(1.0950)),
        }
    }

    async fn connected_profile(broker: &PaperBroker) -> Profile {
        let profile = Profile::new("paper", "1", "paper");
        broker.connect(&profile).await.unwrap();
        profile
    }

    #[tokio::test]
    async fn test_submit_fills_at_entry() {
        let broker = PaperBroker::new();
        let profile = connected_profile(&broker).await;

        let ack = broker
            .submit_order(profile.id, &order(ClientToken::new()))
            .await
            .unwrap();
        assert_eq!(ack.filled_price, Price::new(dec!(1.0850)));
        assert_eq!(broker.position_count(profile.id), 1);
    }

    #[tokio::test]
    async fn test_duplicate_token_returns_original_fill() {
        let broker = PaperBroker::new();
        let profile = connected_profile(&broker).await;
        let token = ClientToken::new();

        let first = broker.submit_order(profile.id, &order(token.clone())).await.unwrap();
        let second = broker.submit_order(profile.id, &order(token)).await.unwrap();
        assert_eq!(first.ticket, second.ticket);
        assert_eq!(broker.position_count(profile.id), 1);
    }

    #[tokio::test]
    async fn test_injected_timeout() {
        let broker = PaperBroker::new();
        let profile = connected_profile(&broker).await;
        broker.inject_submit_failure(profile.id, FailureMode::Timeout);

        let err = broker
            .submit_order(profile.id, &order(ClientToken::new()))
            .await;
        assert!(matches!(err, Err(BrokerError::Timeout)));
        assert_eq!(broker.position_count(profile.id), 0);
    }

    #[tokio::test]
    async fn test_disconnect_mid_submit_leaves_order_findable() {
        let broker = PaperBroker::new();
        let profile = connected_profile(&broker).await;
        broker.inject_submit_failure(profile.id, FailureMode::DisconnectMidSubmit);
        let token = ClientToken::new();

        let err = broker.submit_order(profile.id, &order(token.clone())).await;
        assert!(matches!(err, Err(BrokerError::ConnectionLost(_))));

        let found = broker.find_order(profile.id, &token).await.unwrap();
        assert!(found.is_some(), "order must be discoverable by token");
        assert_eq!(broker.position_count(profile.id), 1);
    }

    #[tokio::test]
    async fn test_heartbeat_failure_injection() {
        let broker = PaperBroker::new();
        let profile = connected_profile(&broker).await;
        broker.fail_heartbeats(profile.id, 2);

        assert!(broker.heartbeat(profile.id).await.is_err());
        assert!(broker.heartbeat(profile.id).await.is_err());
        assert!(broker.heartbeat(profile.id).await.is_ok());
    }

    #[tokio::test]
    async fn test_close_position_partial_and_full() {
        let broker = PaperBroker::new();
        let profile = connected_profile(&broker).await;
        let ack = broker
            .submit_order(profile.id, &order(ClientToken::new()))
            .await
            .unwrap();

        broker
            .close_position(profile.id, ack.ticket, Some(Volume::new(dec!(0.04))))
            .await
            .unwrap();
        let positions = broker.list_positions(profile.id).await.unwrap();
        assert_eq!(positions[0].volume, Volume::new(dec!(0.06)));

        broker.close_position(profile.id, ack.ticket, None).await.unwrap();
        assert_eq!(broker.position_count(profile.id), 0);
    }

    #[tokio::test]
    async fn test_tick_subscription() {
        let broker = PaperBroker::new();
        let profile = connected_profile(&broker).await;
        let symbol = Symbol::from("EURUSD");

        let mut rx = broker.subscribe_ticks(profile.id, &symbol).await.unwrap();
        broker
            .push_tick(
                profile.id,
                Tick {
                    symbol: symbol.clone(),
                    bid: Price::new(dec!(1.0849)),
                    ask: Price::new(dec!(1.0851)),
                    at: Utc::now(),
                },
            )
            .await;

        let tick = rx.recv().await.unwrap();
        assert_eq!(tick.mid(), Price::new(dec!(1.0850)));
        assert_eq!(tick.spread(), dec!(0.0002));
    }
}
