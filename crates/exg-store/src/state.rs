//! State store implementation.

use crate::error::{StoreError, StoreResult};
use chrono::{NaiveDate, Utc};
use dashmap::DashMap;
use exg_core::{
    ConnectionHealth, Position, PositionTicket, Price, Profile, ProfileId, ProfileSnapshot,
    Symbol,
};
use rust_decimal::Decimal;
use std::collections::{HashMap, VecDeque};
use tracing::{debug, info, warn};

/// Default rolling window for return series (observations).
const DEFAULT_RETURN_WINDOW: usize = 120;

struct ProfileState {
    profile: Profile,
    connection: ConnectionHealth,
    equity: Decimal,
    peak_equity: Decimal,
    open_positions: HashMap<PositionTicket, Position>,
    portfolio_returns: VecDeque<Decimal>,
    symbol_returns: HashMap<Symbol, VecDeque<Decimal>>,
    marks: HashMap<Symbol, Price>,
    signals_day: NaiveDate,
    signals_today: u32,
}

impl ProfileState {
    fn new(profile: Profile, initial_equity: Decimal) -> Self {
        Self {
            profile,
            connection: ConnectionHealth::Unknown,
            equity: initial_equity,
            peak_equity: initial_equity,
            open_positions: HashMap::new(),
            portfolio_returns: VecDeque::new(),
            symbol_returns: HashMap::new(),
            marks: HashMap::new(),
            signals_day: Utc::now().date_naive(),
            signals_today: 0,
        }
    }

    fn drawdown(&self) -> Decimal {
        if self.peak_equity <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        ((self.peak_equity - self.equity) / self.peak_equity).max(Decimal::ZERO)
    }
}

/// Difference found while reconciling the local view against the broker.
#[derive(Debug, Clone, PartialEq)]
pub enum ReconciliationDiff {
    /// Present at the broker, missing locally; adopted.
    Adopted(Position),
    /// Present locally, missing at the broker; dropped.
    Dropped(PositionTicket),
    /// Present in both with different volume or prices; broker wins.
    Corrected {
        ticket: PositionTicket,
        local_volume: Decimal,
        broker_volume: Decimal,
    },
}

/// Per-profile state with consistent snapshot reads.
///
/// Mutations go through the owning worker (or the pool's reconciliation);
/// each method takes the profile's shard lock for the duration of the
/// update, so snapshots never observe partial writes.
pub struct StateStore {
    profiles: DashMap<ProfileId, ProfileState>,
    return_window: usize,
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl StateStore {
    pub fn new() -> Self {
        Self {
            profiles: DashMap::new(),
            return_window: DEFAULT_RETURN_WINDOW,
        }
    }

    pub fn with_return_window(window: usize) -> Self {
        Self {
            profiles: DashMap::new(),
            return_window: window,
        }
    }

    // === Profile lifecycle (admin surface) ===

    pub fn upsert_profile(&self, profile: Profile, initial_equity: Decimal) {
        let id = profile.id;
        self.profiles
            .entry(id)
            .and_modify(|state| state.profile = profile.clone())
            .or_insert_with(|| ProfileState::new(profile, initial_equity));
        info!(profile = %id, "profile registered");
    }

    pub fn remove_profile(&self, profile_id: ProfileId) {
        self.profiles.remove(&profile_id);
        info!(profile = %profile_id, "profile removed");
    }

    pub fn profile(&self, profile_id: ProfileId) -> Option<Profile> {
        self.profiles.get(&profile_id).map(|s| s.profile.clone())
    }

    pub fn profile_ids(&self) -> Vec<ProfileId> {
        self.profiles.iter().map(|e| *e.key()).collect()
    }

    pub fn set_trading_enabled(&self, profile_id: ProfileId, enabled: bool) {
        if let Some(mut state) = self.profiles.get_mut(&profile_id) {
            state.profile.trading_enabled = enabled;
        }
    }

    pub fn set_connection(&self, profile_id: ProfileId, health: ConnectionHealth) {
        if let Some(mut state) = self.profiles.get_mut(&profile_id) {
            if state.connection != health {
                debug!(profile = %profile_id, from = %state.connection, to = %health,
                    "connection health changed");
            }
            state.connection = health;
        }
    }

    pub fn connection(&self, profile_id: ProfileId) -> ConnectionHealth {
        self.profiles
            .get(&profile_id)
            .map(|s| s.connection)
            .unwrap_or_default()
    }

    // === Equity and marks ===

    /// Record a fresh equity reading; updates the peak and the portfolio
    /// return series.
    pub fn record_equity(&self, profile_id: ProfileId, equity: Decimal) {
        if let Some(mut state) = self.profiles.get_mut(&profile_id) {
            let prev = state.equity;
            if prev > Decimal::ZERO && equity != prev {
                let window = self.return_window;
                let ret = (equity - prev) / prev;
                push_capped(&mut state.portfolio_returns, ret, window);
            }
            state.equity = equity;
            if equity > state.peak_equity {
                state.peak_equity = equity;
            }
        }
    }

    /// Record a mark price; updates open positions on the symbol and the
    /// symbol's return series.
    pub fn record_mark(&self, profile_id: ProfileId, symbol: &Symbol, mark: Price) {
        if let Some(mut state) = self.profiles.get_mut(&profile_id) {
            let window = self.return_window;
            if let Some(prev) = state.marks.get(symbol).copied() {
                if prev.is_positive() && mark != prev {
                    let ret = (mark.inner() - prev.inner()) / prev.inner();
                    let series = state.symbol_returns.entry(symbol.clone()).or_default();
                    push_capped(series, ret, window);
                }
            }
            state.marks.insert(symbol.clone(), mark);
            for position in state.open_positions.values_mut() {
                if &position.symbol == symbol {
                    position.mark_price = mark;
                }
            }
        }
    }

    // === Positions ===

    pub fn open_position(&self, position: Position) -> StoreResult<()> {
        let mut state = self
            .profiles
            .get_mut(&position.profile_id)
            .ok_or(StoreError::UnknownProfile(position.profile_id))?;
        debug!(profile = %position.profile_id, ticket = %position.ticket,
            symbol = %position.symbol, volume = %position.volume, "position opened");
        state.open_positions.insert(position.ticket, position);
        Ok(())
    }

    pub fn close_position(
        &self,
        profile_id: ProfileId,
        ticket: PositionTicket,
    ) -> StoreResult<Position> {
        let mut state = self
            .profiles
            .get_mut(&profile_id)
            .ok_or(StoreError::UnknownProfile(profile_id))?;
        let position = state
            .open_positions
            .remove(&ticket)
            .ok_or(StoreError::UnknownTicket(ticket))?;
        debug!(profile = %profile_id, ticket = %ticket, "position closed");
        Ok(position)
    }

    pub fn open_position_count(&self, profile_id: ProfileId) -> usize {
        self.profiles
            .get(&profile_id)
            .map(|s| s.open_positions.len())
            .unwrap_or(0)
    }

    pub fn open_positions(&self, profile_id: ProfileId) -> Vec<Position> {
        self.profiles
            .get(&profile_id)
            .map(|s| s.open_positions.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Replace the local position view with the broker's; the broker is
    /// authoritative after a reconnect. Returns the differences found.
    pub fn reconcile(
        &self,
        profile_id: ProfileId,
        broker_positions: Vec<Position>,
    ) -> StoreResult<Vec<ReconciliationDiff>> {
        let mut state = self
            .profiles
            .get_mut(&profile_id)
            .ok_or(StoreError::UnknownProfile(profile_id))?;

        let mut diffs = Vec::new();
        let mut fresh: HashMap<PositionTicket, Position> = HashMap::new();

        for broker_pos in broker_positions {
            match state.open_positions.get(&broker_pos.ticket) {
                None => {
                    diffs.push(ReconciliationDiff::Adopted(broker_pos.clone()));
                }
                Some(local) if local.volume != broker_pos.volume => {
                    diffs.push(ReconciliationDiff::Corrected {
                        ticket: broker_pos.ticket,
                        local_volume: local.volume.inner(),
                        broker_volume: broker_pos.volume.inner(),
                    });
                }
                Some(_) => {}
            }
            fresh.insert(broker_pos.ticket, broker_pos);
        }

        for ticket in state.open_positions.keys() {
            if !fresh.contains_key(ticket) {
                diffs.push(ReconciliationDiff::Dropped(*ticket));
            }
        }

        if !diffs.is_empty() {
            warn!(profile = %profile_id, diffs = diffs.len(),
                "position view corrected against broker");
        }
        state.open_positions = fresh;
        Ok(diffs)
    }

    // === Daily counters ===

    /// Count an admitted signal against today's cap; returns the new count.
    pub fn increment_daily_signals(&self, profile_id: ProfileId) -> u32 {
        let today = Utc::now().date_naive();
        if let Some(mut state) = self.profiles.get_mut(&profile_id) {
            if state.signals_day != today {
                state.signals_day = today;
                state.signals_today = 0;
            }
            state.signals_today += 1;
            state.signals_today
        } else {
            0
        }
    }

    // === Snapshots ===

    /// Consistent snapshot of a profile's state.
    pub fn snapshot(&self, profile_id: ProfileId) -> Option<ProfileSnapshot> {
        let state = self.profiles.get(&profile_id)?;
        let today = Utc::now().date_naive();
        let signals_today = if state.signals_day == today {
            state.signals_today
        } else {
            0
        };
        Some(ProfileSnapshot {
            profile_id,
            trading_enabled: state.profile.trading_enabled,
            connection: state.connection,
            equity: state.equity,
            peak_equity: state.peak_equity,
            drawdown: state.drawdown(),
            open_positions: state.open_positions.values().cloned().collect(),
            portfolio_returns: state.portfolio_returns.iter().copied().collect(),
            symbol_returns: state
                .symbol_returns
                .iter()
                .map(|(k, v)| (k.clone(), v.iter().copied().collect()))
                .collect(),
            marks: state.marks.clone(),
            signals_today,
            taken_at: Utc::now(),
        })
    }
}

fn push_capped(series: &mut VecDeque<Decimal>, value: Decimal, cap: usize) {
    series.push_back(value);
    while series.len() > cap {
        series.pop_front();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use exg_core::{Direction, SignalId, Volume};
    use rust_decimal_macros::dec;

    fn sample_position(profile_id: ProfileId, ticket: u64) -> Position {
        Position {
            ticket: PositionTicket::new(ticket),
            profile_id,
            symbol: Symbol::from("EURUSD"),
            side: Direction::Buy,
            volume: Volume::new(dec!(0.10)),
            entry_price: Price::new(dec!(1.0850)),
            stop_loss: Price::new(dec!(1.0800)),
            take_profit: Price::new(dec!(1.0950)),
            mark_price: Price::new(dec!(1.0850)),
            origin_signal: SignalId::from("sig-1"),
            opened_at: Utc::now(),
        }
    }

    fn store_with_profile() -> (StateStore, ProfileId) {
        let store = StateStore::new();
        let profile = Profile::new("alpha", "10001", "demo");
        let id = profile.id;
        store.upsert_profile(profile, dec!(10000));
        (store, id)
    }

    #[test]
    fn test_drawdown_tracks_peak() {
        let (store, id) = store_with_profile();
        store.record_equity(id, dec!(12000));
        store.record_equity(id, dec!(10800));

        let snap = store.snapshot(id).unwrap();
        assert_eq!(snap.peak_equity, dec!(12000));
        assert_eq!(snap.drawdown, dec!(0.1));
    }

    #[test]
    fn test_equity_updates_build_return_series() {
        let (store, id) = store_with_profile();
        store.record_equity(id, dec!(10100));
        store.record_equity(id, dec!(10201));

        let snap = store.snapshot(id).unwrap();
        assert_eq!(snap.portfolio_returns.len(), 2);
        assert_eq!(snap.portfolio_returns[0], dec!(0.01));
    }

    #[test]
    fn test_mark_updates_positions_and_returns() {
        let (store, id) = store_with_profile();
        store.open_position(sample_position(id, 1)).unwrap();
        store.record_mark(id, &Symbol::from("EURUSD"), Price::new(dec!(1.0900)));
        store.record_mark(id, &Symbol::from("EURUSD"), Price::new(dec!(1.0955)));

        let snap = store.snapshot(id).unwrap();
        assert_eq!(snap.open_positions[0].mark_price, Price::new(dec!(1.0955)));
        let series = snap.symbol_returns.get(&Symbol::from("EURUSD")).unwrap();
        assert_eq!(series.len(), 1);
    }

    #[test]
    fn test_close_unknown_ticket() {
        let (store, id) = store_with_profile();
        let err = store.close_position(id, PositionTicket::new(99));
        assert!(matches!(err, Err(StoreError::UnknownTicket(_))));
    }

    #[test]
    fn test_reconcile_adopts_and_drops() {
        let (store, id) = store_with_profile();
        store.open_position(sample_position(id, 1)).unwrap();
        store.open_position(sample_position(id, 2)).unwrap();

        // Broker knows ticket 2 (different volume) and ticket 3.
        let mut pos2 = sample_position(id, 2);
        pos2.volume = Volume::new(dec!(0.20));
        let pos3 = sample_position(id, 3);

        let diffs = store.reconcile(id, vec![pos2, pos3]).unwrap();
        assert_eq!(diffs.len(), 3);
        assert!(diffs
            .iter()
            .any(|d| matches!(d, ReconciliationDiff::Dropped(t) if t.inner() == 1)));
        assert!(diffs
            .iter()
            .any(|d| matches!(d, ReconciliationDiff::Corrected { ticket, .. } if ticket.inner() == 2)));
        assert!(diffs
            .iter()
            .any(|d| matches!(d, ReconciliationDiff::Adopted(p) if p.ticket.inner() == 3)));

        let snap = store.snapshot(id).unwrap();
        assert_eq!(snap.open_position_count(), 2);
    }

    #[test]
    fn test_daily_counter() {
        let (store, id) = store_with_profile();
        assert_eq!(store.increment_daily_signals(id), 1);
        assert_eq!(store.increment_daily_signals(id), 2);
        assert_eq!(store.snapshot(id).unwrap().signals_today, 2);
    }
}
