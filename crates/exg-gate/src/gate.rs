//! The gate itself.
//!
//! # Check order (strict)
//!
//! 1. Idempotency        -> replay the original chain, no new chain
//! 2. Rate limit         -> `gate.rate_limited`, chain sealed blocked
//! 3. Schema/range       -> `signal.rejected`, chain sealed rejected
//! 4. Emergency state    -> `gate.blocked`, chain sealed blocked
//! 5. Profile state      -> `gate.blocked`, chain sealed blocked
//! 6. (all passed)       -> `gate.passed`, admitted downstream
//!
//! Structural malformation is rejected synchronously before any chain
//! exists. `submit` returns once the `signal.received` node is durable;
//! downstream processing is asynchronous. Admission order per profile is
//! preserved: each profile has one FIFO channel consumed by its worker.

use crate::error::{GateError, GateResult};
use crate::idempotency::IdempotencyCache;
use crate::rate_limit::{RateDecision, RateLimiter};
use crate::validate::validate_signal;
use dashmap::DashMap;
use exg_audit::{AuditLog, NodeDraft};
use exg_core::{
    ChainId, ChainOutcome, DecisionSource, DecisionType, ErrorKind, GatewayConfig, GatewayFault,
    ProfileId, Signal, Symbol,
};
use exg_emergency::EmergencyCell;
use exg_store::StateStore;
use serde::Serialize;
use serde_json::json;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// A signal that passed every gate check, owned by the pipeline.
#[derive(Debug, Clone)]
pub struct AdmittedSignal {
    pub signal: Signal,
    pub chain_id: ChainId,
}

/// Producer-visible result of a submission.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubmitOutcome {
    pub accepted: bool,
    pub chain_id: ChainId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// True when this call replayed a previous decision.
    pub duplicate: bool,
    /// Classified failure with its stable machine-readable code; `None`
    /// on acceptance.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fault: Option<GatewayFault>,
}

/// Admission counters.
#[derive(Debug, Default)]
pub struct GateStats {
    pub submitted: AtomicU64,
    pub admitted: AtomicU64,
    pub duplicates: AtomicU64,
    pub rate_limited: AtomicU64,
    pub rejected: AtomicU64,
    pub blocked: AtomicU64,
}

impl GateStats {
    pub fn approval_rate(&self) -> f64 {
        let submitted = self.submitted.load(Ordering::Relaxed);
        if submitted == 0 {
            return 0.0;
        }
        self.admitted.load(Ordering::Relaxed) as f64 / submitted as f64
    }
}

/// The single ingress for all trade proposals.
pub struct SignalGate {
    config: GatewayConfig,
    allowed_symbols: HashSet<Symbol>,
    audit: Arc<AuditLog>,
    store: Arc<StateStore>,
    emergency: Arc<EmergencyCell>,
    idempotency: IdempotencyCache,
    limiter: RateLimiter,
    channels: DashMap<ProfileId, mpsc::Sender<AdmittedSignal>>,
    stats: GateStats,
}

impl SignalGate {
    pub fn new(
        config: GatewayConfig,
        allowed_symbols: HashSet<Symbol>,
        audit: Arc<AuditLog>,
        store: Arc<StateStore>,
        emergency: Arc<EmergencyCell>,
    ) -> Self {
        let limiter = RateLimiter::new(
            config.signal_rate_limit_per_minute,
            config.global_signal_rate_limit,
        );
        Self {
            config,
            allowed_symbols,
            audit,
            store,
            emergency,
            idempotency: IdempotencyCache::new(),
            limiter,
            channels: DashMap::new(),
            stats: GateStats::default(),
        }
    }

    /// Create the admission channel for a profile's worker.
    ///
    /// The receiver is the per-profile FIFO the pipeline consumes; its
    /// bound is the backpressure high-water mark.
    pub fn register_worker(&self, profile_id: ProfileId) -> mpsc::Receiver<AdmittedSignal> {
        let (tx, rx) = mpsc::channel(self.config.executor_queue_high_water);
        self.channels.insert(profile_id, tx);
        rx
    }

    pub fn stats(&self) -> &GateStats {
        &self.stats
    }

    /// Submit a signal through the gate.
    pub async fn submit(&self, signal: Signal) -> GateResult<SubmitOutcome> {
        self.stats.submitted.fetch_add(1, Ordering::Relaxed);

        // Structural validation: malformed input never allocates a chain.
        if let Err(e) = signal.validate_shape() {
            self.stats.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(GateError::Fault(GatewayFault::new(
                ErrorKind::Validation,
                e.to_string(),
                None,
            )));
        }

        // Check 1: idempotency.
        if let Some(prior_chain) = self
            .idempotency
            .lookup(signal.profile_id, &signal.signal_id)
        {
            return self.replay_duplicate(&signal, prior_chain);
        }

        // The proposal is new: open its chain. Durability of this node is
        // what `submit` guarantees on return.
        let chain_id = self.audit.begin_chain(
            signal.profile_id,
            signal.signal_id.clone(),
            serde_json::to_value(&signal).unwrap_or_else(|_| json!({})),
            "signal received at gate",
        )?;
        self.idempotency
            .insert(signal.profile_id, signal.signal_id.clone(), chain_id);

        // Check 2: rate limits (token bucket + daily cap).
        let rate = self
            .limiter
            .try_admit(signal.profile_id, &signal.source, signal.tier);
        if rate != RateDecision::Admitted {
            return self.reject_rate_limited(&signal, chain_id, rate);
        }
        let signals_today = self
            .store
            .snapshot(signal.profile_id)
            .map(|s| s.signals_today)
            .unwrap_or(0);
        if !signal.tier.is_rate_limit_exempt() && signals_today >= self.config.max_daily_signals {
            return self.reject_daily_cap(&signal, chain_id, signals_today);
        }

        // Check 3: schema/range.
        if let Err(failure) = validate_signal(&signal, &self.config, &self.allowed_symbols) {
            self.stats.rejected.fetch_add(1, Ordering::Relaxed);
            self.audit.append(
                chain_id,
                NodeDraft::new(
                    DecisionType::SignalRejected,
                    DecisionSource::SignalGate,
                    serde_json::to_value(&failure).unwrap_or_else(|_| json!({})),
                    json!({ "admitted": false }),
                    failure.to_string(),
                ),
            )?;
            self.audit.seal(chain_id, ChainOutcome::Rejected)?;
            debug!(signal = %signal.signal_id, %failure, "signal rejected by validation");
            return Ok(SubmitOutcome {
                accepted: false,
                chain_id,
                reason: Some(failure.to_string()),
                duplicate: false,
                fault: Some(GatewayFault::new(
                    ErrorKind::Validation,
                    failure.to_string(),
                    Some(chain_id),
                )),
            });
        }

        // Check 4: emergency state.
        let emergency_state = self.emergency.state();
        if !emergency_state.is_normal() {
            self.stats.blocked.fetch_add(1, Ordering::Relaxed);
            let reason = format!("emergency state is {emergency_state}");
            self.audit.append(
                chain_id,
                NodeDraft::new(
                    DecisionType::GateBlocked,
                    DecisionSource::SignalGate,
                    json!({ "emergency_state": emergency_state }),
                    json!({ "admitted": false }),
                    reason.clone(),
                ),
            )?;
            self.audit.seal(chain_id, ChainOutcome::Blocked)?;
            warn!(signal = %signal.signal_id, state = %emergency_state, "signal blocked by emergency state");
            return Ok(SubmitOutcome {
                accepted: false,
                chain_id,
                reason: Some(reason.clone()),
                duplicate: false,
                fault: Some(GatewayFault::new(
                    ErrorKind::Emergency,
                    reason,
                    Some(chain_id),
                )),
            });
        }

        // Check 5: profile state.
        if let Some(reason) = self.profile_block_reason(signal.profile_id) {
            self.stats.blocked.fetch_add(1, Ordering::Relaxed);
            self.audit.append(
                chain_id,
                NodeDraft::new(
                    DecisionType::GateBlocked,
                    DecisionSource::SignalGate,
                    json!({ "profile_id": signal.profile_id, "cause": reason }),
                    json!({ "admitted": false }),
                    reason.clone(),
                ),
            )?;
            self.audit.seal(chain_id, ChainOutcome::Blocked)?;
            debug!(signal = %signal.signal_id, %reason, "signal blocked by profile state");
            return Ok(SubmitOutcome {
                accepted: false,
                chain_id,
                reason: Some(reason.clone()),
                duplicate: false,
                fault: Some(GatewayFault::new(
                    ErrorKind::GateBlocked,
                    reason,
                    Some(chain_id),
                )),
            });
        }

        // All checks passed: admit downstream in per-profile FIFO order.
        self.audit.append(
            chain_id,
            NodeDraft::new(
                DecisionType::GatePassed,
                DecisionSource::SignalGate,
                json!({ "checks": ["idempotency", "rate_limit", "schema", "emergency", "profile"] }),
                json!({ "admitted": true }),
                "all gate checks passed",
            ),
        )?;
        self.store.increment_daily_signals(signal.profile_id);
        self.stats.admitted.fetch_add(1, Ordering::Relaxed);

        let admitted = AdmittedSignal {
            signal: signal.clone(),
            chain_id,
        };
        let sender = self
            .channels
            .get(&signal.profile_id)
            .map(|tx| tx.clone());
        match sender {
            Some(tx) => {
                if tx.send(admitted).await.is_err() {
                    // Worker is gone; the signal cannot proceed.
                    self.audit.seal(chain_id, ChainOutcome::Rejected)?;
                    return Err(GateError::ChannelClosed);
                }
            }
            None => {
                self.audit.seal(chain_id, ChainOutcome::Rejected)?;
                return Err(GateError::ChannelClosed);
            }
        }

        info!(signal = %signal.signal_id, profile = %signal.profile_id, chain = %chain_id,
            "signal admitted");
        Ok(SubmitOutcome {
            accepted: true,
            chain_id,
            reason: None,
            duplicate: false,
            fault: None,
        })
    }

    fn replay_duplicate(
        &self,
        signal: &Signal,
        prior_chain: ChainId,
    ) -> GateResult<SubmitOutcome> {
        self.stats.duplicates.fetch_add(1, Ordering::Relaxed);
        let chain = self.audit.chain(prior_chain);
        let was_admitted = chain
            .as_ref()
            .map(|c| c.node_types().contains(&"gate.passed"))
            .unwrap_or(false);
        let outcome = chain.map(|c| c.outcome).unwrap_or(ChainOutcome::Pending);

        // The replay itself is audit-worthy, but the original chain may be
        // sealed; record it as a standalone event referencing it.
        self.audit.record_event(
            NodeDraft::new(
                DecisionType::SignalDuplicate,
                DecisionSource::SignalGate,
                json!({
                    "profile_id": signal.profile_id,
                    "signal_id": signal.signal_id,
                    "original_chain": prior_chain,
                }),
                json!({ "outcome": outcome }),
                "idempotency key seen within retention window",
            ),
            ChainOutcome::Blocked,
        )?;

        debug!(signal = %signal.signal_id, chain = %prior_chain, "duplicate submission replayed");
        Ok(SubmitOutcome {
            accepted: was_admitted,
            chain_id: prior_chain,
            reason: (!was_admitted).then(|| format!("duplicate of {outcome} chain")),
            duplicate: true,
            fault: (!was_admitted).then(|| {
                GatewayFault::new(
                    ErrorKind::Duplicate,
                    format!("duplicate of {outcome} chain"),
                    Some(prior_chain),
                )
            }),
        })
    }

    fn reject_rate_limited(
        &self,
        signal: &Signal,
        chain_id: ChainId,
        rate: RateDecision,
    ) -> GateResult<SubmitOutcome> {
        self.stats.rate_limited.fetch_add(1, Ordering::Relaxed);
        let scope = match rate {
            RateDecision::ProfileLimited => "profile",
            RateDecision::GlobalLimited => "global",
            RateDecision::Admitted => unreachable!("admitted is not a rejection"),
        };
        let reason = format!("{scope} rate limit exceeded");
        self.audit.append(
            chain_id,
            NodeDraft::new(
                DecisionType::GateRateLimited,
                DecisionSource::SignalGate,
                json!({
                    "scope": scope,
                    "producer": signal.source,
                    "limit_per_minute": self.config.signal_rate_limit_per_minute,
                }),
                json!({ "admitted": false }),
                reason.clone(),
            ),
        )?;
        self.audit.seal(chain_id, ChainOutcome::Blocked)?;
        debug!(signal = %signal.signal_id, %scope, "signal rate limited");
        Ok(SubmitOutcome {
            accepted: false,
            chain_id,
            reason: Some(reason.clone()),
            duplicate: false,
            fault: Some(GatewayFault::new(
                ErrorKind::GateBlocked,
                reason,
                Some(chain_id),
            )),
        })
    }

    fn reject_daily_cap(
        &self,
        signal: &Signal,
        chain_id: ChainId,
        signals_today: u32,
    ) -> GateResult<SubmitOutcome> {
        self.stats.rate_limited.fetch_add(1, Ordering::Relaxed);
        let reason = format!(
            "daily signal cap reached ({signals_today}/{})",
            self.config.max_daily_signals
        );
        self.audit.append(
            chain_id,
            NodeDraft::new(
                DecisionType::GateRateLimited,
                DecisionSource::SignalGate,
                json!({
                    "scope": "daily",
                    "count": signals_today,
                    "max": self.config.max_daily_signals,
                }),
                json!({ "admitted": false }),
                reason.clone(),
            ),
        )?;
        self.audit.seal(chain_id, ChainOutcome::Blocked)?;
        Ok(SubmitOutcome {
            accepted: false,
            chain_id,
            reason: Some(reason.clone()),
            duplicate: false,
            fault: Some(GatewayFault::new(
                ErrorKind::GateBlocked,
                reason,
                Some(chain_id),
            )),
        })
    }

    fn profile_block_reason(&self, profile_id: ProfileId) -> Option<String> {
        let Some(snapshot) = self.store.snapshot(profile_id) else {
            return Some("unknown profile".to_string());
        };
        if !snapshot.trading_enabled {
            return Some("trading disabled on profile".to_string());
        }
        if !snapshot.connection.is_healthy() {
            return Some(format!(
                "broker connection {} for profile",
                snapshot.connection
            ));
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use exg_core::{
        ConnectionHealth, Direction, Price, ProducerId, ProducerTier, Profile, SignalId,
    };
    use exg_emergency::EmergencyState;
    use rust_decimal_macros::dec;

    struct Fixture {
        gate: SignalGate,
        audit: Arc<AuditLog>,
        store: Arc<StateStore>,
        emergency: Arc<EmergencyCell>,
        profile: Profile,
        _rx: mpsc::Receiver<AdmittedSignal>,
    }

    fn fixture() -> Fixture {
        let audit = Arc::new(AuditLog::in_memory());
        let store = Arc::new(StateStore::new());
        let emergency = Arc::new(EmergencyCell::new());
        let profile = Profile::new("alpha", "10001", "paper");
        store.upsert_profile(profile.clone(), dec!(10000));
        store.set_connection(profile.id, ConnectionHealth::Healthy);

        let gate = SignalGate::new(
            GatewayConfig::default(),
            HashSet::new(),
            Arc::clone(&audit),
            Arc::clone(&store),
            Arc::clone(&emergency),
        );
        let rx = gate.register_worker(profile.id);
        Fixture {
            gate,
            audit,
            store,
            emergency,
            profile,
            _rx: rx,
        }
    }

    fn signal(profile_id: ProfileId, id: &str) -> Signal {
        Signal {
            signal_id: SignalId::from(id),
            profile_id,
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

    #[tokio::test]
    async fn test_admission_writes_received_and_passed() {
        let mut f = fixture();
        let outcome = f.gate.submit(signal(f.profile.id, "s1")).await.unwrap();
        assert!(outcome.accepted);
        assert!(!outcome.duplicate);

        let chain = f.audit.chain(outcome.chain_id).unwrap();
        assert_eq!(chain.node_types(), vec!["signal.received", "gate.passed"]);
        assert!(!chain.is_sealed(), "chain stays open for downstream stages");

        let admitted = f._rx.recv().await.unwrap();
        assert_eq!(admitted.chain_id, outcome.chain_id);
    }

    #[tokio::test]
    async fn test_duplicate_replays_first_chain() {
        let f = fixture();
        let first = f.gate.submit(signal(f.profile.id, "s1")).await.unwrap();
        let second = f.gate.submit(signal(f.profile.id, "s1")).await.unwrap();

        assert!(second.duplicate);
        assert!(second.accepted, "original was admitted");
        assert_eq!(second.chain_id, first.chain_id);
        assert_eq!(f.gate.stats().duplicates.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_rate_limit_after_burst() {
        let f = fixture();
        for i in 0..10 {
            let outcome = f
                .gate
                .submit(signal(f.profile.id, &format!("s{i}")))
                .await
                .unwrap();
            assert!(outcome.accepted, "signal {i} should be admitted");
        }
        let eleventh = f.gate.submit(signal(f.profile.id, "s10")).await.unwrap();
        assert!(!eleventh.accepted);

        let chain = f.audit.chain(eleventh.chain_id).unwrap();
        assert_eq!(
            chain.node_types(),
            vec!["signal.received", "gate.rate_limited"]
        );
        assert_eq!(chain.outcome, ChainOutcome::Blocked);
    }

    #[tokio::test]
    async fn test_critical_tier_bypasses_rate_limit() {
        let f = fixture();
        for i in 0..15 {
            let mut s = signal(f.profile.id, &format!("c{i}"));
            s.tier = ProducerTier::Critical;
            let outcome = f.gate.submit(s).await.unwrap();
            assert!(outcome.accepted, "critical signal {i} should be admitted");
        }
    }

    #[tokio::test]
    async fn test_emergency_blocks_with_state_reason() {
        let f = fixture();
        f.emergency
            .escalate(
                EmergencyState::Halted,
                &exg_core::Actor::owner("ops"),
                "test",
            )
            .unwrap();

        let outcome = f.gate.submit(signal(f.profile.id, "s1")).await.unwrap();
        assert!(!outcome.accepted);
        assert!(outcome.reason.unwrap().contains("halted"));

        let chain = f.audit.chain(outcome.chain_id).unwrap();
        assert_eq!(chain.node_types(), vec!["signal.received", "gate.blocked"]);
        assert_eq!(chain.outcome, ChainOutcome::Blocked);
    }

    #[tokio::test]
    async fn test_disabled_profile_blocked() {
        let f = fixture();
        f.store.set_trading_enabled(f.profile.id, false);

        let outcome = f.gate.submit(signal(f.profile.id, "s1")).await.unwrap();
        assert!(!outcome.accepted);
        assert_eq!(outcome.reason.as_deref(), Some("trading disabled on profile"));
    }

    #[tokio::test]
    async fn test_unhealthy_connection_blocked() {
        let f = fixture();
        f.store
            .set_connection(f.profile.id, ConnectionHealth::Degraded);

        let outcome = f.gate.submit(signal(f.profile.id, "s1")).await.unwrap();
        assert!(!outcome.accepted);
        assert!(outcome.reason.unwrap().contains("degraded"));
    }

    #[tokio::test]
    async fn test_malformed_signal_no_chain() {
        let f = fixture();
        let mut s = signal(f.profile.id, "s1");
        s.confidence = dec!(2);

        let err = f.gate.submit(s).await;
        assert!(matches!(err, Err(GateError::Fault(_))));
        // No chain was allocated for the malformed submission.
        assert!(f
            .audit
            .chain_for_signal(f.profile.id, &SignalId::from("s1"))
            .is_none());
    }

    #[tokio::test]
    async fn test_fault_carries_stable_code_and_chain() {
        let f = fixture();
        f.emergency
            .escalate(
                EmergencyState::Halted,
                &exg_core::Actor::owner("ops"),
                "test",
            )
            .unwrap();

        let outcome = f.gate.submit(signal(f.profile.id, "s1")).await.unwrap();
        let fault = outcome.fault.unwrap();
        assert_eq!(fault.kind, ErrorKind::Emergency);
        assert_eq!(fault.code, "EXG-EMERGENCY");
        assert_eq!(fault.chain_id, Some(outcome.chain_id));
    }

    #[tokio::test]
    async fn test_low_confidence_rejected_with_chain() {
        let f = fixture();
        let mut s = signal(f.profile.id, "s1");
        s.confidence = dec!(0.30);

        let outcome = f.gate.submit(s).await.unwrap();
        assert!(!outcome.accepted);
        let chain = f.audit.chain(outcome.chain_id).unwrap();
        assert_eq!(
            chain.node_types(),
            vec!["signal.received", "signal.rejected"]
        );
        assert_eq!(chain.outcome, ChainOutcome::Rejected);
    }
}
