//! The emergency controller.
//!
//! Turns monitor triggers and operator commands into graded responses:
//!
//! - flash crash: counter-hedge every open position, state `hedged`
//! - volatility spike: stop admitting intents, keep positions, `halted`
//! - spread explosion: cancel resting limit orders, `halted`
//! - drawdown breach / manual kill: close everything, `killed`
//!
//! Broker calls go straight through the adapter rather than the leased
//! pipeline path: mitigation must not queue behind pending orders. Every
//! transition and every mitigating order is recorded as an `emergency.*`
//! decision node.

use crate::error::{EmergencyError, EmergencyResult};
use crate::monitor::{MarketMonitor, TriggerKind};
use crate::state::{EmergencyCell, EmergencyState};
use exg_audit::{AuditLog, NodeDraft};
use exg_broker::{BrokerPool, OrderRequest};
use exg_core::{
    Actor, ChainOutcome, ClientToken, DecisionSource, DecisionType, GatewayConfig, Price,
    ProfileId, Symbol,
};
use exg_store::StateStore;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde_json::json;
use std::sync::Arc;
use tracing::{error, info, warn};

/// System actor identity used for automatic transitions.
const SYSTEM_ACTOR: &str = "system-auto";

/// Emergency controller: monitor + state cell + mitigation actions.
pub struct EmergencyController {
    cell: Arc<EmergencyCell>,
    monitor: Mutex<MarketMonitor>,
    pool: Arc<BrokerPool>,
    store: Arc<StateStore>,
    audit: Arc<AuditLog>,
}

impl EmergencyController {
    pub fn new(
        cell: Arc<EmergencyCell>,
        pool: Arc<BrokerPool>,
        store: Arc<StateStore>,
        audit: Arc<AuditLog>,
        config: &GatewayConfig,
    ) -> Self {
        Self {
            cell,
            monitor: Mutex::new(MarketMonitor::new(config)),
            pool,
            store,
            audit,
        }
    }

    pub fn cell(&self) -> Arc<EmergencyCell> {
        Arc::clone(&self.cell)
    }

    pub fn state(&self) -> EmergencyState {
        self.cell.state()
    }

    /// Feed one market tick through the monitor and react to any trigger.
    pub async fn on_tick(
        &self,
        symbol: &Symbol,
        mid: Price,
        spread: Decimal,
        now_ms: i64,
    ) -> EmergencyResult<()> {
        let trigger = {
            let mut monitor = self.monitor.lock();
            monitor.observe_tick(symbol, mid, spread, now_ms)
        };
        if let Some(trigger) = trigger {
            self.handle_trigger(trigger, now_ms).await?;
        }
        Ok(())
    }

    /// Feed a drawdown observation through the monitor.
    pub async fn on_drawdown(
        &self,
        profile_id: ProfileId,
        drawdown: Decimal,
        now_ms: i64,
    ) -> EmergencyResult<()> {
        let trigger = {
            let mut monitor = self.monitor.lock();
            monitor.observe_drawdown(profile_id, drawdown, now_ms)
        };
        if let Some(trigger) = trigger {
            self.handle_trigger(trigger, now_ms).await?;
        }
        Ok(())
    }

    /// Apply the automatic response for a trigger.
    ///
    /// A trigger that would de-escalate the latched state (e.g. a flash
    /// crash observed while already halted) is logged and dropped; the
    /// more severe response stays in force.
    pub async fn handle_trigger(&self, trigger: TriggerKind, now_ms: i64) -> EmergencyResult<()> {
        warn!(%trigger, "emergency trigger observed");
        self.monitor.lock().start_cooldown(now_ms);
        let actor = Actor::new(SYSTEM_ACTOR, true);

        let target = match &trigger {
            TriggerKind::FlashCrash { .. } => EmergencyState::Hedged,
            TriggerKind::VolatilitySpike { .. } | TriggerKind::SpreadExplosion { .. } => {
                EmergencyState::Halted
            }
            TriggerKind::DrawdownBreach { .. } => EmergencyState::Killed,
        };
        if let Err(EmergencyError::InvalidTransition(msg)) =
            self.cell.escalate(target, &actor, trigger.to_string())
        {
            warn!(%trigger, %msg, "trigger dropped, latched state is more severe");
            return Ok(());
        }

        match &trigger {
            TriggerKind::FlashCrash { .. } => {
                self.hedge_all(&trigger).await?;
            }
            TriggerKind::VolatilitySpike { .. } => {
                self.audit.record_event(
                    NodeDraft::new(
                        DecisionType::EmergencyHalt,
                        DecisionSource::Emergency,
                        json!({ "trigger": trigger, "actor": SYSTEM_ACTOR }),
                        json!({ "state": "halted" }),
                        "new intents rejected, existing positions kept",
                    ),
                    ChainOutcome::Overridden,
                )?;
            }
            TriggerKind::SpreadExplosion { .. } => {
                self.cancel_all_orders(&trigger).await?;
            }
            TriggerKind::DrawdownBreach { .. } => {
                self.close_all(&json!({ "trigger": trigger }), SYSTEM_ACTOR).await?;
            }
        }
        Ok(())
    }

    // === Operator control surface ===

    /// `activate_hedge(reason, actor)` -> `hedged`.
    pub async fn activate_hedge(&self, reason: &str, actor: &Actor) -> EmergencyResult<()> {
        self.cell.escalate(EmergencyState::Hedged, actor, reason)?;
        let trigger = json!({ "reason": reason, "actor": actor.id });
        self.hedge_all_with_input(&trigger).await
    }

    /// `activate_halt(reason, actor)` -> `halted`.
    pub async fn activate_halt(&self, reason: &str, actor: &Actor) -> EmergencyResult<()> {
        self.cell.escalate(EmergencyState::Halted, actor, reason)?;
        self.audit.record_event(
            NodeDraft::new(
                DecisionType::EmergencyHalt,
                DecisionSource::Emergency,
                json!({ "reason": reason, "actor": actor.id }),
                json!({ "state": "halted" }),
                reason,
            ),
            ChainOutcome::Overridden,
        )?;
        Ok(())
    }

    /// `activate_kill(reason, actor, confirmation_token)` -> `killed`.
    pub async fn activate_kill(
        &self,
        reason: &str,
        actor: &Actor,
        confirmation_token: &str,
    ) -> EmergencyResult<()> {
        if confirmation_token.trim().is_empty() {
            return Err(EmergencyError::EmptyConfirmation);
        }
        self.cell.escalate(EmergencyState::Killed, actor, reason)?;
        self.close_all(
            &json!({ "reason": reason, "actor": actor.id }),
            &actor.id,
        )
        .await
    }

    /// `restore(authorization_code, actor1, actor2)` -> `normal`.
    pub fn restore(
        &self,
        authorization_code: &str,
        actor1: &Actor,
        actor2: &Actor,
    ) -> EmergencyResult<()> {
        self.cell.restore(authorization_code, actor1, actor2)?;
        self.audit.record_event(
            NodeDraft::new(
                DecisionType::EmergencyRestore,
                DecisionSource::Emergency,
                json!({ "actors": [actor1.id, actor2.id] }),
                json!({ "state": "normal" }),
                "kill switch restored by two-owner quorum",
            ),
            ChainOutcome::Overridden,
        )?;
        info!(first = %actor1, second = %actor2, "emergency state restored");
        Ok(())
    }

    /// Revert `hedged`/`halted` to normal (single Owner suffices).
    pub fn deactivate(&self, actor: &Actor) -> EmergencyResult<()> {
        let previous = self.cell.deactivate(actor)?;
        if previous != EmergencyState::Normal {
            self.audit.record_event(
                NodeDraft::new(
                    DecisionType::EmergencyRestore,
                    DecisionSource::Emergency,
                    json!({ "actor": actor.id, "from": previous }),
                    json!({ "state": "normal" }),
                    "emergency state deactivated by owner",
                ),
                ChainOutcome::Overridden,
            )?;
        }
        Ok(())
    }

    // === Mitigation actions ===

    async fn hedge_all(&self, trigger: &TriggerKind) -> EmergencyResult<()> {
        self.hedge_all_with_input(&json!({ "trigger": trigger })).await
    }

    /// Open a counter-position for every open position on every profile.
    async fn hedge_all_with_input(&self, input: &serde_json::Value) -> EmergencyResult<()> {
        let broker = self.pool.broker();
        let chain_id = self.audit.begin_control_chain(NodeDraft::new(
            DecisionType::EmergencyPanicHedge,
            DecisionSource::Emergency,
            input.clone(),
            json!({ "state": "hedged" }),
            "panic hedge engaged",
        ))?;

        for profile_id in self.store.profile_ids() {
            for position in self.store.open_positions(profile_id) {
                let hedge = OrderRequest {
                    token: ClientToken::new(),
                    symbol: position.symbol.clone(),
                    side: position.side.opposite(),
                    volume: position.volume,
                    entry_price: position.mark_price,
                    // Protective stops are meaningless on a hedge leg; the
                    // pair is closed together by the operator.
                    stop_loss: position.mark_price,
                    take_profit: position.mark_price,
                };
                match broker.submit_order(profile_id, &hedge).await {
                    Ok(ack) => {
                        self.audit.append(
                            chain_id,
                            NodeDraft::new(
                                DecisionType::EmergencyPanicHedge,
                                DecisionSource::Emergency,
                                json!({
                                    "ticket": position.ticket,
                                    "symbol": position.symbol,
                                    "side": position.side,
                                    "volume": position.volume,
                                }),
                                json!({
                                    "hedge_ticket": ack.ticket,
                                    "hedge_price": ack.filled_price,
                                }),
                                "counter-position opened",
                            ),
                        )?;
                    }
                    Err(e) => {
                        error!(?e, profile = %profile_id, ticket = %position.ticket,
                            "hedge order failed");
                        self.audit.append(
                            chain_id,
                            NodeDraft::new(
                                DecisionType::EmergencyPanicHedge,
                                DecisionSource::Emergency,
                                json!({ "ticket": position.ticket }),
                                json!({ "error": e.to_string() }),
                                "hedge order failed",
                            ),
                        )?;
                    }
                }
            }
        }
        self.audit.seal(chain_id, ChainOutcome::Overridden)?;
        Ok(())
    }

    /// Cancel all resting limit orders on every profile.
    async fn cancel_all_orders(&self, trigger: &TriggerKind) -> EmergencyResult<()> {
        let broker = self.pool.broker();
        let mut cancelled_total = 0u32;
        for profile_id in self.store.profile_ids() {
            match broker.cancel_open_orders(profile_id).await {
                Ok(n) => cancelled_total += n,
                Err(e) => error!(?e, profile = %profile_id, "cancel orders failed"),
            }
        }
        self.audit.record_event(
            NodeDraft::new(
                DecisionType::EmergencyHalt,
                DecisionSource::Emergency,
                json!({ "trigger": trigger }),
                json!({ "state": "halted", "orders_cancelled": cancelled_total }),
                "limit orders cancelled",
            ),
            ChainOutcome::Overridden,
        )?;
        Ok(())
    }

    /// Close every open position on every profile and record the kill.
    async fn close_all(
        &self,
        input: &serde_json::Value,
        actor: &str,
    ) -> EmergencyResult<()> {
        let broker = self.pool.broker();
        let chain_id = self.audit.begin_control_chain(NodeDraft::new(
            DecisionType::EmergencyKillSwitch,
            DecisionSource::Emergency,
            input.clone(),
            json!({ "state": "killed", "actor": actor }),
            "kill switch engaged, closing all positions",
        ))?;

        for profile_id in self.store.profile_ids() {
            for position in self.store.open_positions(profile_id) {
                match broker.close_position(profile_id, position.ticket, None).await {
                    Ok(()) => {
                        let _ = self.store.close_position(profile_id, position.ticket);
                        self.audit.append(
                            chain_id,
                            NodeDraft::new(
                                DecisionType::PositionClosed,
                                DecisionSource::Emergency,
                                json!({ "ticket": position.ticket, "symbol": position.symbol }),
                                json!({ "unrealized_pnl": position.unrealized_pnl() }),
                                "position closed by kill switch",
                            ),
                        )?;
                    }
                    Err(e) => {
                        error!(?e, profile = %profile_id, ticket = %position.ticket,
                            "kill-switch close failed");
                        self.audit.append(
                            chain_id,
                            NodeDraft::new(
                                DecisionType::PositionClosed,
                                DecisionSource::Emergency,
                                json!({ "ticket": position.ticket }),
                                json!({ "error": e.to_string() }),
                                "kill-switch close failed, operator attention required",
                            ),
                        )?;
                    }
                }
            }
        }
        self.audit.seal(chain_id, ChainOutcome::Overridden)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use exg_broker::{Broker, PaperBroker};
    use exg_core::{Direction, Position, PositionTicket, Profile, SignalId, Volume};
    use rust_decimal_macros::dec;

    struct Fixture {
        controller: EmergencyController,
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

        let controller = EmergencyController::new(
            Arc::new(EmergencyCell::new()),
            pool,
            Arc::clone(&store),
            Arc::clone(&audit),
            &config,
        );
        Fixture {
            controller,
            broker,
            store,
            audit,
            profile,
        }
    }

    fn position(profile_id: ProfileId, ticket: u64, symbol: &str) -> Position {
        Position {
            ticket: PositionTicket::new(ticket),
            profile_id,
            symbol: Symbol::from(symbol),
            side: Direction::Buy,
            volume: Volume::new(dec!(0.10)),
            entry_price: Price::new(dec!(1.0850)),
            stop_loss: Price::new(dec!(1.0800)),
            take_profit: Price::new(dec!(1.0950)),
            mark_price: Price::new(dec!(1.0850)),
            origin_signal: SignalId::from("sig"),
            opened_at: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_flash_crash_hedges_every_position() {
        let f = fixture().await;
        for (i, sym) in ["EURUSD", "GBPUSD", "USDJPY"].iter().enumerate() {
            f.store
                .open_position(position(f.profile.id, i as u64 + 1, sym))
                .unwrap();
        }

        f.controller
            .handle_trigger(
                TriggerKind::FlashCrash {
                    symbol: Symbol::from("EURUSD"),
                    drop_pct: dec!(2.4),
                },
                0,
            )
            .await
            .unwrap();

        assert_eq!(f.controller.state(), EmergencyState::Hedged);
        // Three hedge orders landed at the broker.
        assert_eq!(f.broker.position_count(f.profile.id), 3);

        // One panic-hedge node per position, each referencing its ticket.
        let chains = f.audit.sealed_chains();
        let hedge_nodes: Vec<_> = chains
            .iter()
            .flat_map(|c| &c.nodes)
            .filter(|n| {
                n.decision_type == DecisionType::EmergencyPanicHedge
                    && n.input.get("ticket").is_some()
            })
            .collect();
        assert_eq!(hedge_nodes.len(), 3);
    }

    #[tokio::test]
    async fn test_drawdown_breach_kills_and_closes() {
        let f = fixture().await;
        // Open a real broker position so close_position succeeds.
        let ack = f
            .broker
            .submit_order(
                f.profile.id,
                &OrderRequest {
                    token: ClientToken::new(),
                    symbol: Symbol::from("EURUSD"),
                    side: Direction::Buy,
                    volume: Volume::new(dec!(0.10)),
                    entry_price: Price::new(dec!(1.0850)),
                    stop_loss: Price::new(dec!(1.0800)),
                    take_profit: Price::new(dec!(1.0950)),
                },
            )
            .await
            .unwrap();
        let mut pos = position(f.profile.id, ack.ticket.inner(), "EURUSD");
        pos.ticket = ack.ticket;
        f.store.open_position(pos).unwrap();

        f.controller
            .on_drawdown(f.profile.id, dec!(0.16), 0)
            .await
            .unwrap();

        assert_eq!(f.controller.state(), EmergencyState::Killed);
        assert_eq!(f.broker.position_count(f.profile.id), 0);
        assert_eq!(f.store.open_position_count(f.profile.id), 0);
    }

    #[tokio::test]
    async fn test_spread_explosion_cancels_orders() {
        let f = fixture().await;
        f.broker.set_resting_orders(f.profile.id, 4);

        f.controller
            .handle_trigger(
                TriggerKind::SpreadExplosion {
                    symbol: Symbol::from("EURUSD"),
                    spread: dec!(0.0030),
                    median: dec!(0.0002),
                },
                0,
            )
            .await
            .unwrap();

        assert_eq!(f.controller.state(), EmergencyState::Halted);
        let chains = f.audit.sealed_chains();
        let halt = chains
            .iter()
            .flat_map(|c| &c.nodes)
            .find(|n| n.decision_type == DecisionType::EmergencyHalt)
            .unwrap();
        assert_eq!(halt.output["orders_cancelled"], 4);
    }

    #[tokio::test]
    async fn test_manual_kill_and_restore() {
        let f = fixture().await;
        let ops = Actor::owner("ops-1");

        assert!(matches!(
            f.controller.activate_kill("fat finger", &ops, "").await,
            Err(EmergencyError::EmptyConfirmation)
        ));

        f.controller
            .activate_kill("fat finger", &ops, "CONFIRM-KILL")
            .await
            .unwrap();
        assert_eq!(f.controller.state(), EmergencyState::Killed);

        // One owner is not enough.
        assert!(f
            .controller
            .restore("auth-1", &ops, &Actor::owner("ops-1"))
            .is_err());
        f.controller
            .restore("auth-1", &ops, &Actor::owner("ops-2"))
            .unwrap();
        assert_eq!(f.controller.state(), EmergencyState::Normal);
    }

    #[tokio::test]
    async fn test_vol_spike_halts_without_touching_positions() {
        let f = fixture().await;
        f.store
            .open_position(position(f.profile.id, 1, "EURUSD"))
            .unwrap();

        f.controller
            .handle_trigger(
                TriggerKind::VolatilitySpike {
                    symbol: Symbol::from("EURUSD"),
                    realized: dec!(0.5),
                    baseline: dec!(0.1),
                },
                0,
            )
            .await
            .unwrap();

        assert_eq!(f.controller.state(), EmergencyState::Halted);
        assert_eq!(f.store.open_position_count(f.profile.id), 1);
    }
}
