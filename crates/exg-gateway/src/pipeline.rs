//! Per-profile pipeline worker.
//!
//! Consumes the profile's admission FIFO and drives each signal through
//! sizing and execution under the global signal-to-execution budget.
//! Profile state stays single-writer because only this worker (and the
//! pool's reconciliation) touches it.

use exg_audit::{AuditLog, NodeDraft};
use exg_core::{Actor, ChainOutcome, DecisionSource, DecisionType, GatewayConfig};
use exg_emergency::EmergencyController;
use exg_executor::{ExecutionOutcome, Executor};
use exg_gate::AdmittedSignal;
use exg_risk::{RiskSizer, SizeDecision};
use exg_store::StateStore;
use exg_telemetry::metrics;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// One profile's worker: gate stream -> sizer -> executor, in order.
pub struct PipelineWorker {
    sizer: Arc<RiskSizer>,
    executor: Arc<Executor>,
    audit: Arc<AuditLog>,
    store: Arc<StateStore>,
    emergency: Arc<EmergencyController>,
    signal_budget: Duration,
}

impl PipelineWorker {
    pub fn new(
        sizer: Arc<RiskSizer>,
        executor: Arc<Executor>,
        audit: Arc<AuditLog>,
        store: Arc<StateStore>,
        emergency: Arc<EmergencyController>,
        config: &GatewayConfig,
    ) -> Self {
        Self {
            sizer,
            executor,
            audit,
            store,
            emergency,
            signal_budget: Duration::from_secs(config.signal_timeout_s),
        }
    }

    /// Spawn the worker task for one profile.
    pub fn spawn(
        self,
        mut rx: mpsc::Receiver<AdmittedSignal>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            metrics::ACTIVE_WORKERS.inc();
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    admitted = rx.recv() => match admitted {
                        Some(admitted) => self.process(admitted).await,
                        None => break,
                    },
                }
            }
            // Seal whatever was still queued: cancelled before execution
            // means the chain ends `rejected`.
            while let Ok(admitted) = rx.try_recv() {
                self.seal_cancelled(&admitted);
            }
            metrics::ACTIVE_WORKERS.dec();
            debug!("pipeline worker stopped");
        })
    }

    async fn process(&self, admitted: AdmittedSignal) {
        let chain_id = admitted.chain_id;
        let started = std::time::Instant::now();

        let outcome_label =
            match tokio::time::timeout(self.signal_budget, self.run_stages(&admitted)).await {
                Ok(label) => label,
                Err(_) => {
                    warn!(chain = %chain_id, budget_s = self.signal_budget.as_secs(),
                        "signal-to-execution budget exceeded");
                    let draft = NodeDraft::new(
                        DecisionType::PipelineTimeout,
                        DecisionSource::Pipeline,
                        json!({ "budget_s": self.signal_budget.as_secs() }),
                        json!({}),
                        "signal-to-execution budget exceeded",
                    );
                    if let Err(e) = self.audit.append(chain_id, draft) {
                        error!(?e, chain = %chain_id, "failed to record pipeline timeout");
                    }
                    if let Err(e) = self.audit.seal(chain_id, ChainOutcome::Rejected) {
                        error!(?e, chain = %chain_id, "failed to seal timed-out chain");
                    }
                    "timeout"
                }
            };

        metrics::PIPELINE_LATENCY_MS
            .with_label_values(&[outcome_label])
            .observe(started.elapsed().as_millis() as f64);
    }

    async fn run_stages(&self, admitted: &AdmittedSignal) -> &'static str {
        let signal = &admitted.signal;
        let chain_id = admitted.chain_id;

        // Sizing reads a snapshot taken at stage entry; updates made
        // while this signal is in flight affect the next one.
        let Some(snapshot) = self.store.snapshot(signal.profile_id) else {
            let _ = self.audit.append(
                chain_id,
                NodeDraft::new(
                    DecisionType::RiskRejected,
                    DecisionSource::RiskSizer,
                    json!({ "profile_id": signal.profile_id }),
                    json!({ "error": "profile state missing" }),
                    "profile state missing at sizing",
                ),
            );
            let _ = self.audit.seal(chain_id, ChainOutcome::Rejected);
            return "rejected";
        };

        match self.sizer.size(signal, &snapshot, chain_id) {
            SizeDecision::Approved { intent, report } => {
                metrics::SIZER_OUTCOMES_TOTAL
                    .with_label_values(&["approved"])
                    .inc();
                let draft = NodeDraft::new(
                    DecisionType::RiskApproved,
                    DecisionSource::RiskSizer,
                    json!({ "signal_id": signal.signal_id, "equity": snapshot.equity }),
                    serde_json::to_value(&report).unwrap_or_else(|_| json!({})),
                    format!("sized at {} by Kelly fraction {}", intent.volume, report.kelly_fraction),
                )
                .with_confidence(signal.confidence);
                if self.audit.append(chain_id, draft).is_err() {
                    return "rejected";
                }
                self.execute(intent).await
            }
            SizeDecision::Reduced {
                intent,
                original_volume,
                report,
            } => {
                metrics::SIZER_OUTCOMES_TOTAL
                    .with_label_values(&["reduced"])
                    .inc();
                let draft = NodeDraft::new(
                    DecisionType::RiskReduced,
                    DecisionSource::RiskSizer,
                    json!({
                        "signal_id": signal.signal_id,
                        "equity": snapshot.equity,
                        "requested_volume": original_volume,
                    }),
                    serde_json::to_value(&report).unwrap_or_else(|_| json!({})),
                    format!("volume reduced {} -> {}", original_volume, intent.volume),
                )
                .with_confidence(signal.confidence);
                if self.audit.append(chain_id, draft).is_err() {
                    return "rejected";
                }
                self.execute(intent).await
            }
            SizeDecision::Veto {
                reason,
                raise_halt,
                report,
            } => {
                metrics::SIZER_OUTCOMES_TOTAL
                    .with_label_values(&["rejected"])
                    .inc();
                info!(chain = %chain_id, %reason, "intent vetoed by risk sizer");
                let draft = NodeDraft::new(
                    DecisionType::RiskRejected,
                    DecisionSource::RiskSizer,
                    serde_json::to_value(&reason).unwrap_or_else(|_| json!({})),
                    serde_json::to_value(&report).unwrap_or_else(|_| json!({})),
                    reason.to_string(),
                );
                let _ = self.audit.append(chain_id, draft);
                let _ = self.audit.seal(chain_id, ChainOutcome::Rejected);

                if raise_halt {
                    let actor = Actor::new("risk-sizer", true);
                    metrics::EMERGENCY_ACTIVATIONS_TOTAL
                        .with_label_values(&["halted"])
                        .inc();
                    if let Err(e) = self
                        .emergency
                        .activate_halt(&format!("drawdown policy: {reason}"), &actor)
                        .await
                    {
                        error!(?e, "failed to raise drawdown halt");
                    }
                }
                "rejected"
            }
        }
    }

    async fn execute(&self, intent: exg_core::OrderIntent) -> &'static str {
        let profile_id = intent.profile_id;
        match self.executor.execute(intent).await {
            Ok(ExecutionOutcome::Opened(_)) => {
                metrics::BROKER_SUBMITS_TOTAL
                    .with_label_values(&["filled"])
                    .inc();
                let profile_label = profile_id.to_string();
                metrics::OPEN_POSITIONS
                    .with_label_values(&[profile_label.as_str()])
                    .set(self.store.open_position_count(profile_id) as f64);

                // Fresh drawdown reading feeds the kill-switch monitor.
                if let Some(snapshot) = self.store.snapshot(profile_id) {
                    let now_ms = chrono::Utc::now().timestamp_millis();
                    if let Err(e) = self
                        .emergency
                        .on_drawdown(profile_id, snapshot.drawdown, now_ms)
                        .await
                    {
                        error!(?e, "drawdown observation failed");
                    }
                }
                "executed"
            }
            Ok(ExecutionOutcome::Failed { node, .. }) => {
                let label = match node {
                    DecisionType::ExecutionRejected => "rejected",
                    DecisionType::ExecutionMarketClosed => "market_closed",
                    _ => "transient",
                };
                metrics::BROKER_SUBMITS_TOTAL.with_label_values(&[label]).inc();
                "rejected"
            }
            Err(e) => {
                // Audit or store failure: the chain may be unsealed, but
                // the pipeline must keep serving other signals.
                error!(?e, "executor internal error");
                "rejected"
            }
        }
    }

    fn seal_cancelled(&self, admitted: &AdmittedSignal) {
        let draft = NodeDraft::new(
            DecisionType::PipelineTimeout,
            DecisionSource::Pipeline,
            json!({ "cancelled": true }),
            json!({}),
            "pipeline shut down before execution",
        );
        let _ = self.audit.append(admitted.chain_id, draft);
        let _ = self.audit.seal(admitted.chain_id, ChainOutcome::Rejected);
    }
}
