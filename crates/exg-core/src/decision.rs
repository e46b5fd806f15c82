//! Decision-trail vocabulary.
//!
//! Every stage of the pipeline records its verdicts as typed decision
//! nodes; the audit crate links them into hash chains. The enumerations
//! here pin the node type strings that appear in persisted records.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Decision chain identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChainId(Uuid);

impl ChainId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for ChainId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "chain_{}", self.0.simple())
    }
}

/// Decision node identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(Uuid);

impl NodeId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node_{}", self.0.simple())
    }
}

/// Type of a decision node. The serialized form is the persisted string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DecisionType {
    // Gate
    #[serde(rename = "signal.received")]
    SignalReceived,
    #[serde(rename = "gate.passed")]
    GatePassed,
    #[serde(rename = "gate.blocked")]
    GateBlocked,
    #[serde(rename = "gate.rate_limited")]
    GateRateLimited,
    #[serde(rename = "signal.rejected")]
    SignalRejected,
    #[serde(rename = "signal.duplicate")]
    SignalDuplicate,

    // Risk
    #[serde(rename = "risk.approved")]
    RiskApproved,
    #[serde(rename = "risk.reduced")]
    RiskReduced,
    #[serde(rename = "risk.rejected")]
    RiskRejected,

    // Execution
    #[serde(rename = "position.opened")]
    PositionOpened,
    #[serde(rename = "position.closed")]
    PositionClosed,
    #[serde(rename = "position.reconciled")]
    PositionReconciled,
    #[serde(rename = "execution.failed")]
    ExecutionFailed,
    #[serde(rename = "execution.rejected")]
    ExecutionRejected,
    #[serde(rename = "execution.market_closed")]
    ExecutionMarketClosed,
    #[serde(rename = "execution.reconciled")]
    ExecutionReconciled,

    // Broker pool
    #[serde(rename = "broker.unreachable")]
    BrokerUnreachable,

    // Emergency
    #[serde(rename = "emergency.panic_hedge")]
    EmergencyPanicHedge,
    #[serde(rename = "emergency.halt")]
    EmergencyHalt,
    #[serde(rename = "emergency.kill_switch")]
    EmergencyKillSwitch,
    #[serde(rename = "emergency.restore")]
    EmergencyRestore,

    // Pipeline
    #[serde(rename = "pipeline.timeout")]
    PipelineTimeout,
}

impl DecisionType {
    /// The persisted type string, also the hash-preimage component.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SignalReceived => "signal.received",
            Self::GatePassed => "gate.passed",
            Self::GateBlocked => "gate.blocked",
            Self::GateRateLimited => "gate.rate_limited",
            Self::SignalRejected => "signal.rejected",
            Self::SignalDuplicate => "signal.duplicate",
            Self::RiskApproved => "risk.approved",
            Self::RiskReduced => "risk.reduced",
            Self::RiskRejected => "risk.rejected",
            Self::PositionOpened => "position.opened",
            Self::PositionClosed => "position.closed",
            Self::PositionReconciled => "position.reconciled",
            Self::ExecutionFailed => "execution.failed",
            Self::ExecutionRejected => "execution.rejected",
            Self::ExecutionMarketClosed => "execution.market_closed",
            Self::ExecutionReconciled => "execution.reconciled",
            Self::BrokerUnreachable => "broker.unreachable",
            Self::EmergencyPanicHedge => "emergency.panic_hedge",
            Self::EmergencyHalt => "emergency.halt",
            Self::EmergencyKillSwitch => "emergency.kill_switch",
            Self::EmergencyRestore => "emergency.restore",
            Self::PipelineTimeout => "pipeline.timeout",
        }
    }
}

impl fmt::Display for DecisionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Component that produced a decision node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionSource {
    SignalGate,
    RiskSizer,
    Executor,
    BrokerPool,
    Emergency,
    Pipeline,
}

impl DecisionSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SignalGate => "signal_gate",
            Self::RiskSizer => "risk_sizer",
            Self::Executor => "executor",
            Self::BrokerPool => "broker_pool",
            Self::Emergency => "emergency",
            Self::Pipeline => "pipeline",
        }
    }
}

impl fmt::Display for DecisionSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Terminal outcome of a decision chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainOutcome {
    /// Still in flight; never persisted as terminal.
    Pending,
    /// A position was opened.
    Executed,
    /// Vetoed, failed, cancelled, or timed out.
    Rejected,
    /// Stopped at the gate (rate limit, emergency, disabled profile).
    Blocked,
    /// Preempted by an emergency or operator action.
    Overridden,
}

impl ChainOutcome {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Executed => "executed",
            Self::Rejected => "rejected",
            Self::Blocked => "blocked",
            Self::Overridden => "overridden",
        }
    }
}

impl fmt::Display for ChainOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decision_type_strings() {
        assert_eq!(DecisionType::SignalReceived.as_str(), "signal.received");
        assert_eq!(DecisionType::GateRateLimited.as_str(), "gate.rate_limited");
        assert_eq!(
            DecisionType::EmergencyPanicHedge.as_str(),
            "emergency.panic_hedge"
        );
    }

    #[test]
    fn test_decision_type_serde_roundtrip() {
        let json = serde_json::to_string(&DecisionType::PositionOpened).unwrap();
        assert_eq!(json, "\"position.opened\"");
        let back: DecisionType = serde_json::from_str(&json).unwrap();
        assert_eq!(back, DecisionType::PositionOpened);
    }

    #[test]
    fn test_outcome_terminal() {
        assert!(!ChainOutcome::Pending.is_terminal());
        assert!(ChainOutcome::Executed.is_terminal());
        assert!(ChainOutcome::Blocked.is_terminal());
    }
}
