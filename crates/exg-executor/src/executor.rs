//! Order execution against a leased broker session.

use crate::error::ExecutorResult;
use crate::retry::{classify, FailureClass, RetryPolicy, MAX_SUBMIT_ATTEMPTS};
use chrono::Utc;
use exg_audit::{AuditLog, NodeDraft};
use exg_broker::{BrokerError, BrokerPool, OrderAck, OrderRequest, PoolError};
use exg_core::{
    ChainOutcome, DecisionSource, DecisionType, GatewayConfig, OrderIntent, Position,
};
use exg_store::StateStore;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Terminal result of executing one intent.
#[derive(Debug, Clone)]
pub enum ExecutionOutcome {
    /// Position opened; chain sealed `executed`.
    Opened(Position),
    /// Terminal failure; chain sealed `rejected`.
    Failed {
        node: DecisionType,
        reason: String,
        attempts: u32,
    },
}

impl ExecutionOutcome {
    pub fn is_opened(&self) -> bool {
        matches!(self, Self::Opened(_))
    }
}

/// Turns an order intent into an executed position or a reported,
/// classified failure, within `MAX_SUBMIT_ATTEMPTS` broker calls.
pub struct Executor {
    pool: Arc<BrokerPool>,
    audit: Arc<AuditLog>,
    store: Arc<StateStore>,
    policy: RetryPolicy,
    call_timeout: Duration,
    acquire_timeout: Duration,
}

impl Executor {
    pub fn new(
        pool: Arc<BrokerPool>,
        audit: Arc<AuditLog>,
        store: Arc<StateStore>,
        config: &GatewayConfig,
    ) -> Self {
        Self {
            pool,
            audit,
            store,
            policy: RetryPolicy::default(),
            call_timeout: Duration::from_secs(config.broker_call_timeout_s),
            acquire_timeout: Duration::from_secs(config.broker_acquire_timeout_s),
        }
    }

    /// Execute an approved intent. Always seals the chain.
    pub async fn execute(&self, intent: OrderIntent) -> ExecutorResult<ExecutionOutcome> {
        let lease = match self
            .pool
            .acquire(intent.profile_id, Some(self.acquire_timeout))
            .await
        {
            Ok(lease) => lease,
            Err(e) => return self.fail_on_acquire(&intent, e),
        };

        let request = OrderRequest {
            token: intent.client_token.clone(),
            symbol: intent.symbol.clone(),
            side: intent.side,
            volume: intent.volume,
            entry_price: intent.entry_price,
            stop_loss: intent.stop_loss,
            take_profit: intent.take_profit,
        };

        let mut attempts = 0u32;
        let mut transient_retries = 0u32;
        let mut reconnect_retried = false;

        loop {
            attempts += 1;
            let result = match tokio::time::timeout(
                self.call_timeout,
                lease.submit_order(&request),
            )
            .await
            {
                Ok(inner) => inner,
                Err(_) => Err(BrokerError::Timeout),
            };

            match result {
                Ok(ack) => return self.open_position(&intent, &ack, attempts, false),
                Err(e) => match classify(&e) {
                    FailureClass::Transient => {
                        if transient_retries < self.policy.max_transient_attempts
                            && attempts < MAX_SUBMIT_ATTEMPTS
                        {
                            transient_retries += 1;
                            let delay = self.policy.transient_backoff(transient_retries);
                            debug!(chain = %intent.chain_id, attempt = attempts,
                                delay_ms = delay.as_millis() as u64, "transient failure, retrying");
                            tokio::time::sleep(delay).await;
                            continue;
                        }
                        return self.fail(
                            &intent,
                            DecisionType::ExecutionFailed,
                            format!("transient failure persisted: {e}"),
                            attempts,
                        );
                    }
                    FailureClass::BrokerRejected => {
                        return self.fail(
                            &intent,
                            DecisionType::ExecutionRejected,
                            e.to_string(),
                            attempts,
                        );
                    }
                    FailureClass::MarketClosed => {
                        return self.fail(
                            &intent,
                            DecisionType::ExecutionMarketClosed,
                            e.to_string(),
                            attempts,
                        );
                    }
                    FailureClass::DuplicateTicket(ticket) => {
                        // The previous attempt actually landed; recover the
                        // fill and treat it as success.
                        info!(chain = %intent.chain_id, %ticket, "duplicate ticket, reconciling");
                        let ack = lease.find_order(&intent.client_token).await.ok().flatten();
                        let ack = ack.unwrap_or(OrderAck {
                            ticket,
                            filled_price: intent.entry_price,
                            filled_volume: intent.volume,
                            token: intent.client_token.clone(),
                        });
                        return self.open_position(&intent, &ack, attempts, true);
                    }
                    FailureClass::ConnectionLost => {
                        if reconnect_retried || attempts >= MAX_SUBMIT_ATTEMPTS {
                            return self.fail(
                                &intent,
                                DecisionType::ExecutionFailed,
                                format!("connection lost, retry exhausted: {e}"),
                                attempts,
                            );
                        }
                        warn!(chain = %intent.chain_id, "connection lost mid-submit, reconciling by token");
                        tokio::time::sleep(self.policy.reconnect_backoff()).await;
                        match lease.find_order(&intent.client_token).await {
                            Ok(Some(ack)) => {
                                return self.open_position(&intent, &ack, attempts, true)
                            }
                            Ok(None) => {
                                // The order never reached the book; one
                                // idempotent resubmit.
                                reconnect_retried = true;
                                continue;
                            }
                            Err(probe_err) => {
                                return self.fail(
                                    &intent,
                                    DecisionType::ExecutionFailed,
                                    format!("reconciliation probe failed: {probe_err}"),
                                    attempts,
                                );
                            }
                        }
                    }
                    FailureClass::SessionDead => {
                        return self.fail(
                            &intent,
                            DecisionType::ExecutionFailed,
                            format!("session unusable: {e}"),
                            attempts,
                        );
                    }
                },
            }
        }
    }

    /// Close an open position (operator or stop-management path).
    ///
    /// Recorded as a standalone `position.closed` event: the origin
    /// chain sealed when the position opened.
    pub async fn close(
        &self,
        profile_id: exg_core::ProfileId,
        ticket: exg_core::PositionTicket,
    ) -> ExecutorResult<bool> {
        let lease = match self.pool.acquire_for_close(profile_id, Some(self.acquire_timeout)).await
        {
            Ok(lease) => lease,
            Err(e) => {
                warn!(profile = %profile_id, %ticket, ?e, "close lease unavailable");
                return Ok(false);
            }
        };
        if let Err(e) = lease.close_position(ticket, None).await {
            warn!(profile = %profile_id, %ticket, ?e, "broker close failed");
            return Ok(false);
        }
        let position = self.store.close_position(profile_id, ticket)?;
        self.audit.record_event(
            NodeDraft::new(
                DecisionType::PositionClosed,
                DecisionSource::Executor,
                json!({ "ticket": ticket, "profile_id": profile_id }),
                json!({
                    "symbol": position.symbol,
                    "unrealized_pnl": position.unrealized_pnl(),
                }),
                "position closed by executor",
            ),
            ChainOutcome::Executed,
        )?;
        info!(profile = %profile_id, %ticket, "position closed");
        Ok(true)
    }

    fn open_position(
        &self,
        intent: &OrderIntent,
        ack: &OrderAck,
        attempts: u32,
        reconciled: bool,
    ) -> ExecutorResult<ExecutionOutcome> {
        if reconciled {
            self.audit.append(
                intent.chain_id,
                NodeDraft::new(
                    DecisionType::ExecutionReconciled,
                    DecisionSource::Executor,
                    json!({ "client_token": intent.client_token }),
                    json!({ "ticket": ack.ticket, "filled_price": ack.filled_price }),
                    "in-flight submit recovered by client token",
                ),
            )?;
        }

        let position = Position {
            ticket: ack.ticket,
            profile_id: intent.profile_id,
            symbol: intent.symbol.clone(),
            side: intent.side,
            volume: ack.filled_volume,
            entry_price: ack.filled_price,
            stop_loss: intent.stop_loss,
            take_profit: intent.take_profit,
            mark_price: ack.filled_price,
            origin_signal: intent.signal_id.clone(),
            opened_at: Utc::now(),
        };
        self.store.open_position(position.clone())?;

        self.audit.append(
            intent.chain_id,
            NodeDraft::new(
                DecisionType::PositionOpened,
                DecisionSource::Executor,
                json!({
                    "client_token": intent.client_token,
                    "chain_id": intent.chain_id,
                    "attempts": attempts,
                }),
                json!({
                    "ticket": ack.ticket.inner(),
                    "filled_price": ack.filled_price,
                    "volume": ack.filled_volume,
                }),
                "order confirmed by broker",
            ),
        )?;
        self.audit.seal(intent.chain_id, ChainOutcome::Executed)?;

        info!(chain = %intent.chain_id, ticket = %ack.ticket, volume = %ack.filled_volume,
            "position opened");
        Ok(ExecutionOutcome::Opened(position))
    }

    fn fail(
        &self,
        intent: &OrderIntent,
        node: DecisionType,
        reason: String,
        attempts: u32,
    ) -> ExecutorResult<ExecutionOutcome> {
        warn!(chain = %intent.chain_id, %reason, attempts, "execution failed");
        self.audit.append(
            intent.chain_id,
            NodeDraft::new(
                node,
                DecisionSource::Executor,
                json!({ "client_token": intent.client_token, "attempts": attempts }),
                json!({ "error": reason }),
                reason.clone(),
            ),
        )?;
        self.audit.seal(intent.chain_id, ChainOutcome::Rejected)?;
        Ok(ExecutionOutcome::Failed {
            node,
            reason,
            attempts,
        })
    }

    fn fail_on_acquire(
        &self,
        intent: &OrderIntent,
        error: PoolError,
    ) -> ExecutorResult<ExecutionOutcome> {
        let node = match &error {
            PoolError::PositionCapReached { .. } => DecisionType::ExecutionRejected,
            _ => DecisionType::ExecutionFailed,
        };
        self.fail(intent, node, format!("session acquire failed: {error}"), 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use exg_broker::{Broker, FailureMode, PaperBroker};
    use exg_core::{
        ChainId, ClientToken, Direction, Price, Profile, ProfileId, SignalId, Symbol, Volume,
    };
    use rust_decimal_macros::dec;
    use serde_json::json as j;

    struct Fixture {
        executor: Executor,
        broker: Arc<PaperBroker>,
        store: Arc<StateStore>,
        audit: Arc<AuditLog>,
        profile: Profile,
    }

    async fn fixture() -> Fixture {
        let broker = PaperBroker::shared();
        let store = Arc::new(StateStore::new());
        let audit = Arc::new(AuditLog::in_memory());
        let config = GatewayConfig::default();
        let pool = Arc::new(BrokerPool::new(
            broker.clone() as Arc<dyn Broker>,
            Arc::clone(&store),
            Arc::clone(&audit),
            &config,
        ));
        let profile = Profile::new("alpha", "10001", "paper");
        store.upsert_profile(profile.clone(), dec!(10000));
        pool.register_profile(profile.clone()).await.unwrap();

        let executor = Executor::new(pool, Arc::clone(&audit), Arc::clone(&store), &config);
        Fixture {
            executor,
            broker,
            store,
            audit,
            profile,
        }
    }

    fn intent(f: &Fixture) -> OrderIntent {
        let chain_id = f
            .audit
            .begin_chain(
                f.profile.id,
                SignalId::from("sig-1"),
                j!({"signal_id": "sig-1"}),
                "received",
            )
            .unwrap();
        OrderIntent {
            client_token: ClientToken::new(),
            profile_id: f.profile.id,
            symbol: Symbol::from("EURUSD"),
            side: Direction::Buy,
            volume: Volume::new(dec!(0.10)),
            entry_price: Price::new(dec!(1.0850)),
            stop_loss: Price::new(dec!(1.0800)),
            take_profit: Price::new(dec!(1.0950)),
            chain_id,
            signal_id: SignalId::from("sig-1"),
        }
    }

    fn chain_types(f: &Fixture, chain_id: ChainId) -> Vec<&'static str> {
        f.audit.chain(chain_id).unwrap().node_types()
    }

    #[tokio::test]
    async fn test_happy_path_opens_and_seals() {
        let f = fixture().await;
        let intent = intent(&f);
        let chain_id = intent.chain_id;

        let outcome = f.executor.execute(intent).await.unwrap();
        assert!(outcome.is_opened());
        assert_eq!(
            chain_types(&f, chain_id),
            vec!["signal.received", "position.opened"]
        );
        assert_eq!(
            f.audit.chain(chain_id).unwrap().outcome,
            ChainOutcome::Executed
        );
        assert_eq!(f.store.open_position_count(f.profile.id), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_retried_then_succeed() {
        let f = fixture().await;
        let intent = intent(&f);
        let chain_id = intent.chain_id;

        f.broker.inject_submit_failure(f.profile.id, FailureMode::Timeout);
        f.broker.inject_submit_failure(f.profile.id, FailureMode::Timeout);

        let outcome = f.executor.execute(intent).await.unwrap();
        assert!(outcome.is_opened());
        let opened = f
            .audit
            .chain(chain_id)
            .unwrap()
            .nodes
            .into_iter()
            .find(|n| n.decision_type == DecisionType::PositionOpened)
            .unwrap();
        assert_eq!(opened.input["attempts"], 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_bound_respected() {
        let f = fixture().await;
        let intent = intent(&f);
        let chain_id = intent.chain_id;

        for _ in 0..5 {
            f.broker.inject_submit_failure(f.profile.id, FailureMode::Timeout);
        }

        let outcome = f.executor.execute(intent).await.unwrap();
        match outcome {
            ExecutionOutcome::Failed { node, attempts, .. } => {
                assert_eq!(node, DecisionType::ExecutionFailed);
                assert!(attempts <= MAX_SUBMIT_ATTEMPTS);
                assert_eq!(attempts, 4, "initial + 3 transient retries");
            }
            other => panic!("expected Failed, got {other:?}"),
        }
        assert_eq!(
            f.audit.chain(chain_id).unwrap().outcome,
            ChainOutcome::Rejected
        );
    }

    #[tokio::test]
    async fn test_broker_reject_is_final() {
        let f = fixture().await;
        let intent = intent(&f);
        let chain_id = intent.chain_id;

        f.broker
            .inject_submit_failure(f.profile.id, FailureMode::Reject("insufficient margin".into()));

        let outcome = f.executor.execute(intent).await.unwrap();
        match outcome {
            ExecutionOutcome::Failed { node, attempts, .. } => {
                assert_eq!(node, DecisionType::ExecutionRejected);
                assert_eq!(attempts, 1, "no retry on broker reject");
            }
            other => panic!("expected Failed, got {other:?}"),
        }
        assert_eq!(
            chain_types(&f, chain_id),
            vec!["signal.received", "execution.rejected"]
        );
    }

    #[tokio::test]
    async fn test_market_closed_is_final() {
        let f = fixture().await;
        let intent = intent(&f);
        let chain_id = intent.chain_id;

        f.broker.inject_submit_failure(f.profile.id, FailureMode::MarketClosed);

        let outcome = f.executor.execute(intent).await.unwrap();
        match outcome {
            ExecutionOutcome::Failed { node, .. } => {
                assert_eq!(node, DecisionType::ExecutionMarketClosed);
            }
            other => panic!("expected Failed, got {other:?}"),
        }
        assert_eq!(
            chain_types(&f, chain_id),
            vec!["signal.received", "execution.market_closed"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_mid_submit_reconciles() {
        let f = fixture().await;
        let intent = intent(&f);
        let chain_id = intent.chain_id;

        f.broker
            .inject_submit_failure(f.profile.id, FailureMode::DisconnectMidSubmit);

        let outcome = f.executor.execute(intent).await.unwrap();
        assert!(outcome.is_opened());
        assert_eq!(
            chain_types(&f, chain_id),
            vec![
                "signal.received",
                "execution.reconciled",
                "position.opened"
            ]
        );
        // No second broker position was created.
        assert_eq!(f.broker.position_count(f.profile.id), 1);
    }

    #[tokio::test]
    async fn test_close_position_records_event() {
        let f = fixture().await;
        let intent = intent(&f);

        let outcome = f.executor.execute(intent).await.unwrap();
        let ExecutionOutcome::Opened(position) = outcome else {
            panic!("expected opened position");
        };

        let closed = f.executor.close(f.profile.id, position.ticket).await.unwrap();
        assert!(closed);
        assert_eq!(f.store.open_position_count(f.profile.id), 0);
        assert_eq!(f.broker.position_count(f.profile.id), 0);

        let closed_events = f
            .audit
            .sealed_chains()
            .iter()
            .flat_map(|c| c.nodes.clone())
            .filter(|n| n.decision_type == DecisionType::PositionClosed)
            .count();
        assert_eq!(closed_events, 1);
    }
}
