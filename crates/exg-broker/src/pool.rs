//! The broker connection pool.
//!
//! Maintains one session per active profile, hands out fair-queued
//! single-writer leases, drives heartbeats, reconnects with backoff, and
//! reconciles positions against the broker on every recovery.

use crate::broker::{Broker, OrderAck, OrderRequest};
use crate::error::{BrokerResult, PoolError, PoolResult};
use crate::session::{BrokerSession, HeartbeatVerdict, SessionState};
use dashmap::DashMap;
use exg_audit::{AuditLog, NodeDraft};
use exg_core::{
    ChainOutcome, ClientToken, DecisionSource, DecisionType, GatewayConfig, Position,
    PositionTicket, Profile, ProfileId, Volume,
};
use exg_store::{ReconciliationDiff, StateStore};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OwnedMutexGuard;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// An exclusive lease on a profile's broker session.
///
/// Holding the lease is what makes the session single-writer; it is
/// released on drop. Leases are granted in request order.
pub struct SessionLease {
    session: Arc<BrokerSession>,
    broker: Arc<dyn Broker>,
    _guard: OwnedMutexGuard<()>,
}

impl SessionLease {
    pub fn profile_id(&self) -> ProfileId {
        self.session.profile_id()
    }

    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    pub async fn submit_order(&self, order: &OrderRequest) -> BrokerResult<OrderAck> {
        self.broker
            .submit_order(self.session.profile_id(), order)
            .await
    }

    pub async fn close_position(
        &self,
        ticket: PositionTicket,
        volume: Option<Volume>,
    ) -> BrokerResult<()> {
        self.broker
            .close_position(self.session.profile_id(), ticket, volume)
            .await
    }

    pub async fn find_order(&self, token: &ClientToken) -> BrokerResult<Option<OrderAck>> {
        self.broker.find_order(self.session.profile_id(), token).await
    }

    pub async fn cancel_open_orders(&self) -> BrokerResult<u32> {
        self.broker.cancel_open_orders(self.session.profile_id()).await
    }
}

/// Managed set of broker sessions.
pub struct BrokerPool {
    broker: Arc<dyn Broker>,
    sessions: DashMap<ProfileId, Arc<BrokerSession>>,
    store: Arc<StateStore>,
    audit: Arc<AuditLog>,
    heartbeat_interval: Duration,
    default_acquire_timeout: Duration,
    max_positions: u32,
    max_reconnect_attempts: u32,
}

impl BrokerPool {
    pub fn new(
        broker: Arc<dyn Broker>,
        store: Arc<StateStore>,
        audit: Arc<AuditLog>,
        config: &GatewayConfig,
    ) -> Self {
        Self {
            broker,
            sessions: DashMap::new(),
            store,
            audit,
            heartbeat_interval: Duration::from_secs(config.broker_heartbeat_s),
            default_acquire_timeout: Duration::from_secs(config.broker_acquire_timeout_s),
            max_positions: config.max_positions,
            max_reconnect_attempts: config.broker_reconnect_max_attempts,
        }
    }

    pub fn broker(&self) -> Arc<dyn Broker> {
        Arc::clone(&self.broker)
    }

    /// Create, connect, and reconcile a session for a profile.
    pub async fn register_profile(&self, profile: Profile) -> PoolResult<()> {
        let profile_id = profile.id;
        let session = Arc::new(BrokerSession::new(
            profile,
            Arc::clone(&self.broker),
            self.max_reconnect_attempts,
        ));
        session.connect().await?;
        self.store
            .set_connection(profile_id, session.state().health());
        self.sessions.insert(profile_id, session);
        self.reconcile(profile_id).await?;
        info!(profile = %profile_id, "profile session registered");
        Ok(())
    }

    /// Disconnect and drop a profile's session.
    pub async fn deregister_profile(&self, profile_id: ProfileId) {
        if let Some((_, session)) = self.sessions.remove(&profile_id) {
            session.force_disconnect().await;
            self.store
                .set_connection(profile_id, session.state().health());
        }
    }

    pub fn session_state(&self, profile_id: ProfileId) -> Option<SessionState> {
        self.sessions.get(&profile_id).map(|s| s.state())
    }

    /// Acquire an exclusive lease on the profile's session.
    ///
    /// Fair-queued: waiters are served in request order. Fails when the
    /// session is missing, unhealthy, the profile's position cap is
    /// reached, or `timeout` elapses.
    pub async fn acquire(
        &self,
        profile_id: ProfileId,
        timeout: Option<Duration>,
    ) -> PoolResult<SessionLease> {
        let session = self
            .sessions
            .get(&profile_id)
            .map(|s| Arc::clone(s.value()))
            .ok_or(PoolError::NoSession(profile_id))?;

        if session.state() != SessionState::Healthy {
            return Err(PoolError::Unhealthy(profile_id));
        }

        let open = self.store.open_position_count(profile_id);
        if open >= self.max_positions as usize {
            return Err(PoolError::PositionCapReached {
                current: open,
                max: self.max_positions,
            });
        }

        let timeout = timeout.unwrap_or(self.default_acquire_timeout);
        let guard = tokio::time::timeout(timeout, session.lease_handle().lock_owned())
            .await
            .map_err(|_| PoolError::AcquireTimeout(timeout))?;

        Ok(SessionLease {
            session,
            broker: Arc::clone(&self.broker),
            _guard: guard,
        })
    }

    /// Acquire a lease for closing a position.
    ///
    /// The position cap only constrains new exposure; a profile at its
    /// cap must still be able to reduce it.
    pub async fn acquire_for_close(
        &self,
        profile_id: ProfileId,
        timeout: Option<Duration>,
    ) -> PoolResult<SessionLease> {
        let session = self
            .sessions
            .get(&profile_id)
            .map(|s| Arc::clone(s.value()))
            .ok_or(PoolError::NoSession(profile_id))?;

        if session.state() != SessionState::Healthy {
            return Err(PoolError::Unhealthy(profile_id));
        }

        let timeout = timeout.unwrap_or(self.default_acquire_timeout);
        let guard = tokio::time::timeout(timeout, session.lease_handle().lock_owned())
            .await
            .map_err(|_| PoolError::AcquireTimeout(timeout))?;

        Ok(SessionLease {
            session,
            broker: Arc::clone(&self.broker),
            _guard: guard,
        })
    }

    /// Fetch the broker's open positions and align the local view.
    ///
    /// Runs on every transition to `Healthy`. Each difference produces a
    /// `position.reconciled` node; the local view is updated to match the
    /// broker.
    pub async fn reconcile(&self, profile_id: ProfileId) -> PoolResult<()> {
        let broker_positions = self.broker.list_positions(profile_id).await?;
        let diffs = self
            .store
            .reconcile(profile_id, broker_positions)
            .map_err(|_| PoolError::NoSession(profile_id))?;

        if diffs.is_empty() {
            return Ok(());
        }

        let chain = self.audit.begin_control_chain(NodeDraft::new(
            DecisionType::PositionReconciled,
            DecisionSource::BrokerPool,
            json!({ "profile_id": profile_id, "differences": diffs.len() }),
            json!({}),
            "local position view aligned to broker",
        ));
        let chain_id = match chain {
            Ok(id) => id,
            Err(e) => {
                error!(?e, profile = %profile_id, "failed to record reconciliation");
                return Ok(());
            }
        };
        for diff in &diffs {
            let (input, rationale) = match diff {
                ReconciliationDiff::Adopted(p) => (
                    json!({ "ticket": p.ticket, "symbol": p.symbol, "volume": p.volume }),
                    "position adopted from broker",
                ),
                ReconciliationDiff::Dropped(ticket) => (
                    json!({ "ticket": ticket }),
                    "position dropped, unknown to broker",
                ),
                ReconciliationDiff::Corrected {
                    ticket,
                    local_volume,
                    broker_volume,
                } => (
                    json!({
                        "ticket": ticket,
                        "local_volume": local_volume,
                        "broker_volume": broker_volume,
                    }),
                    "position volume corrected to broker value",
                ),
            };
            if let Err(e) = self.audit.append(
                chain_id,
                NodeDraft::new(
                    DecisionType::PositionReconciled,
                    DecisionSource::BrokerPool,
                    input,
                    json!({}),
                    rationale,
                ),
            ) {
                error!(?e, "failed to append reconciliation node");
            }
        }
        if let Err(e) = self.audit.seal(chain_id, ChainOutcome::Executed) {
            error!(?e, "failed to seal reconciliation chain");
        }
        Ok(())
    }

    /// Spawn the heartbeat/reconnect monitor for one profile.
    pub fn spawn_monitor(
        self: &Arc<Self>,
        profile_id: ProfileId,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            pool.monitor_loop(profile_id, shutdown).await;
        })
    }

    async fn monitor_loop(&self, profile_id: ProfileId, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                () = shutdown.cancelled() => {
                    debug!(profile = %profile_id, "session monitor shutting down");
                    return;
                }
                () = tokio::time::sleep(self.heartbeat_interval) => {}
            }

            let Some(session) = self.sessions.get(&profile_id).map(|s| Arc::clone(s.value())) else {
                return;
            };

            let verdict = session.heartbeat_round().await;
            self.store
                .set_connection(profile_id, session.state().health());

            match verdict {
                HeartbeatVerdict::Alive => {}
                HeartbeatVerdict::Degraded => {
                    warn!(profile = %profile_id, "session degraded");
                }
                HeartbeatVerdict::Lost => {
                    warn!(profile = %profile_id, "session lost, reconnecting");
                    match session.reconnect_with_backoff().await {
                        Ok(()) => {
                            self.store
                                .set_connection(profile_id, session.state().health());
                            if let Err(e) = self.reconcile(profile_id).await {
                                error!(?e, profile = %profile_id,
                                    "reconciliation after reconnect failed");
                            }
                            info!(profile = %profile_id, "session recovered");
                        }
                        Err(e) => {
                            self.store
                                .set_connection(profile_id, session.state().health());
                            let _ = self.audit.record_event(
                                NodeDraft::new(
                                    DecisionType::BrokerUnreachable,
                                    DecisionSource::BrokerPool,
                                    json!({
                                        "profile_id": profile_id,
                                        "attempts": session.reconnect_attempts(),
                                    }),
                                    json!({ "error": e.to_string() }),
                                    "reconnect attempts exhausted, pending admin action",
                                ),
                                ChainOutcome::Rejected,
                            );
                            error!(profile = %profile_id, ?e,
                                "session unreachable, monitor stopped");
                            return;
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paper::PaperBroker;
    use exg_core::{Direction, Price, SignalId, Symbol};
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn pool_fixture() -> (Arc<BrokerPool>, Arc<PaperBroker>, Arc<StateStore>, Profile) {
        let broker = PaperBroker::shared();
        let store = Arc::new(StateStore::new());
        let audit = Arc::new(AuditLog::in_memory());
        let config = GatewayConfig::default();
        let pool = Arc::new(BrokerPool::new(
            broker.clone() as Arc<dyn Broker>,
            Arc::clone(&store),
            audit,
            &config,
        ));
        let profile = Profile::new("alpha", "10001", "paper");
        store.upsert_profile(profile.clone(), Decimal::from(10_000));
        (pool, broker, store, profile)
    }

    fn planted_position(profile_id: ProfileId, ticket: u64) -> Position {
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
            origin_signal: SignalId::from("planted"),
            opened_at: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_register_and_acquire() {
        let (pool, _broker, _store, profile) = pool_fixture();
        pool.register_profile(profile.clone()).await.unwrap();
        assert_eq!(pool.session_state(profile.id), Some(SessionState::Healthy));

        let lease = pool.acquire(profile.id, None).await.unwrap();
        assert_eq!(lease.profile_id(), profile.id);
    }

    #[tokio::test]
    async fn test_acquire_unknown_profile() {
        let (pool, _broker, _store, _profile) = pool_fixture();
        let err = pool.acquire(ProfileId::new(), None).await;
        assert!(matches!(err, Err(PoolError::NoSession(_))));
    }

    #[tokio::test]
    async fn test_lease_is_exclusive() {
        let (pool, _broker, _store, profile) = pool_fixture();
        pool.register_profile(profile.clone()).await.unwrap();

        let _held = pool.acquire(profile.id, None).await.unwrap();
        let err = pool
            .acquire(profile.id, Some(Duration::from_millis(50)))
            .await;
        assert!(matches!(err, Err(PoolError::AcquireTimeout(_))));
    }

    #[tokio::test]
    async fn test_acquire_respects_position_cap() {
        let (pool, _broker, store, profile) = pool_fixture();
        pool.register_profile(profile.clone()).await.unwrap();

        store.open_position(planted_position(profile.id, 1)).unwrap();
        store.open_position(planted_position(profile.id, 2)).unwrap();

        let err = pool.acquire(profile.id, None).await;
        assert!(matches!(
            err,
            Err(PoolError::PositionCapReached { current: 2, max: 2 })
        ));
    }

    #[tokio::test]
    async fn test_reconcile_adopts_broker_positions() {
        let (pool, broker, store, profile) = pool_fixture();
        broker.plant_position(planted_position(profile.id, 77));
        pool.register_profile(profile.clone()).await.unwrap();

        let positions = store.open_positions(profile.id);
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].ticket, PositionTicket::new(77));
    }
}
