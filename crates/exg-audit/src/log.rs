//! Append-only audit log.
//!
//! Chains are built here: appends within one chain are serialized by a
//! per-chain lock, appends to distinct chains proceed in parallel, and a
//! sealed chain refuses further nodes. Every node and seal is written to
//! the JSON-lines sink and flushed before the call returns, so a caller
//! observing `Ok` knows the record is durable.

use crate::chain::{ChainVerification, DecisionChain};
use crate::error::{AuditError, AuditResult};
use crate::node::{compute_hash, DecisionNode};
use crate::query::ChainQuery;
use chrono::Utc;
use dashmap::DashMap;
use exg_core::{
    ChainId, ChainOutcome, DecisionSource, DecisionType, NodeId, ProfileId, SignalId,
};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::{json, Value};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::time::Instant;
use tracing::{debug, warn};

/// The fields a stage supplies when appending a node; ids, timestamps,
/// parent linkage, and the content hash are filled in by the log.
#[derive(Debug, Clone)]
pub struct NodeDraft {
    pub decision_type: DecisionType,
    pub source: DecisionSource,
    pub input: Value,
    pub output: Value,
    pub rationale: String,
    pub confidence: Option<Decimal>,
}

impl NodeDraft {
    pub fn new(
        decision_type: DecisionType,
        source: DecisionSource,
        input: Value,
        output: Value,
        rationale: impl Into<String>,
    ) -> Self {
        Self {
            decision_type,
            source,
            input,
            output,
            rationale: rationale.into(),
            confidence: None,
        }
    }

    pub fn with_confidence(mut self, confidence: Decimal) -> Self {
        self.confidence = Some(confidence);
        self
    }
}

struct ChainSlot {
    chain: DecisionChain,
    started: Instant,
}

/// JSON-lines append sink. Append mode, flushed per record: partial file
/// corruption only affects individual lines.
struct JsonLinesSink {
    writer: BufWriter<File>,
    records_written: usize,
}

#[derive(Serialize)]
#[serde(tag = "record", rename_all = "snake_case")]
enum SinkRecord<'a> {
    Node(&'a DecisionNode),
    Seal {
        chain_id: ChainId,
        outcome: ChainOutcome,
        sealed_at: chrono::DateTime<Utc>,
    },
}

impl JsonLinesSink {
    fn open(path: &Path) -> AuditResult<Self> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            records_written: 0,
        })
    }

    fn write(&mut self, record: &SinkRecord<'_>) -> AuditResult<()> {
        let line = serde_json::to_string(record)?;
        writeln!(self.writer, "{line}")?;
        self.writer.flush()?;
        self.records_written += 1;
        Ok(())
    }
}

/// Append-only, hash-chained audit log.
pub struct AuditLog {
    chains: DashMap<ChainId, Mutex<ChainSlot>>,
    by_signal: DashMap<(ProfileId, SignalId), ChainId>,
    /// Chain ids in seal order; the stable ordering for queries.
    sealed_order: Mutex<Vec<ChainId>>,
    sink: Option<Mutex<JsonLinesSink>>,
}

impl AuditLog {
    /// In-memory log without a durable sink (tests, dry runs).
    pub fn in_memory() -> Self {
        Self {
            chains: DashMap::new(),
            by_signal: DashMap::new(),
            sealed_order: Mutex::new(Vec::new()),
            sink: None,
        }
    }

    /// Log with a durable JSON-lines sink.
    pub fn with_sink(path: impl AsRef<Path>) -> AuditResult<Self> {
        let sink = JsonLinesSink::open(path.as_ref())?;
        Ok(Self {
            chains: DashMap::new(),
            by_signal: DashMap::new(),
            sealed_order: Mutex::new(Vec::new()),
            sink: Some(Mutex::new(sink)),
        })
    }

    /// Start a signal chain. The root node is always `signal.received`.
    pub fn begin_chain(
        &self,
        profile_id: ProfileId,
        signal_id: SignalId,
        input: Value,
        rationale: impl Into<String>,
    ) -> AuditResult<ChainId> {
        let chain_id = ChainId::new();
        let draft = NodeDraft::new(
            DecisionType::SignalReceived,
            DecisionSource::SignalGate,
            input,
            json!({}),
            rationale,
        );
        let started = Instant::now();
        let node = build_node(chain_id, None, "", &draft, 0);
        self.persist_node(&node)?;

        let chain = DecisionChain {
            id: chain_id,
            signal_id: Some(signal_id.clone()),
            profile_id: Some(profile_id),
            outcome: ChainOutcome::Pending,
            created_at: Utc::now(),
            sealed_at: None,
            nodes: vec![node],
        };
        self.chains
            .insert(chain_id, Mutex::new(ChainSlot { chain, started }));
        self.by_signal.insert((profile_id, signal_id), chain_id);
        debug!(chain = %chain_id, "decision chain started");
        Ok(chain_id)
    }

    /// Start a control chain for events not owned by any signal
    /// (emergency transitions, reconciliation). The first node is the
    /// event itself; the caller appends further nodes and seals.
    pub fn begin_control_chain(&self, draft: NodeDraft) -> AuditResult<ChainId> {
        let chain_id = ChainId::new();
        let node = build_node(chain_id, None, "", &draft, 0);
        self.persist_node(&node)?;

        let chain = DecisionChain {
            id: chain_id,
            signal_id: None,
            profile_id: None,
            outcome: ChainOutcome::Pending,
            created_at: Utc::now(),
            sealed_at: None,
            nodes: vec![node],
        };
        self.chains.insert(
            chain_id,
            Mutex::new(ChainSlot {
                chain,
                started: Instant::now(),
            }),
        );
        Ok(chain_id)
    }

    /// Record a single-node control event and seal it immediately.
    pub fn record_event(&self, draft: NodeDraft, outcome: ChainOutcome) -> AuditResult<ChainId> {
        let chain_id = self.begin_control_chain(draft)?;
        self.seal(chain_id, outcome)?;
        Ok(chain_id)
    }

    /// Append a node to an unsealed chain.
    pub fn append(&self, chain_id: ChainId, draft: NodeDraft) -> AuditResult<NodeId> {
        let slot = self
            .chains
            .get(&chain_id)
            .ok_or(AuditError::ChainNotFound(chain_id))?;
        let mut slot = slot.lock();
        if slot.chain.is_sealed() {
            return Err(AuditError::ChainSealed(chain_id));
        }

        let (parent_id, parent_hash) = {
            let last = slot
                .chain
                .nodes
                .last()
                .expect("chain always has a root node");
            (Some(last.id), last.hash.clone())
        };
        let monotonic_ns = slot.started.elapsed().as_nanos() as u64;
        let node = build_node(chain_id, parent_id, &parent_hash, &draft, monotonic_ns);
        self.persist_node(&node)?;

        let node_id = node.id;
        slot.chain.nodes.push(node);
        Ok(node_id)
    }

    /// Seal a chain with a terminal outcome. Idempotent sealing is an
    /// error: double-sealing indicates a pipeline bug.
    pub fn seal(&self, chain_id: ChainId, outcome: ChainOutcome) -> AuditResult<()> {
        if !outcome.is_terminal() {
            return Err(AuditError::NonTerminalOutcome);
        }
        let slot = self
            .chains
            .get(&chain_id)
            .ok_or(AuditError::ChainNotFound(chain_id))?;
        let mut slot = slot.lock();
        if slot.chain.is_sealed() {
            return Err(AuditError::ChainSealed(chain_id));
        }
        let sealed_at = Utc::now();
        slot.chain.outcome = outcome;
        slot.chain.sealed_at = Some(sealed_at);
        drop(slot);

        self.sealed_order.lock().push(chain_id);
        if let Some(sink) = &self.sink {
            sink.lock().write(&SinkRecord::Seal {
                chain_id,
                outcome,
                sealed_at,
            })?;
        }
        debug!(chain = %chain_id, outcome = %outcome, "decision chain sealed");
        Ok(())
    }

    /// Snapshot of a chain by id.
    pub fn chain(&self, chain_id: ChainId) -> Option<DecisionChain> {
        self.chains.get(&chain_id).map(|slot| slot.lock().chain.clone())
    }

    /// Snapshot of the chain owned by `(profile, signal)`.
    pub fn chain_for_signal(
        &self,
        profile_id: ProfileId,
        signal_id: &SignalId,
    ) -> Option<DecisionChain> {
        let chain_id = *self.by_signal.get(&(profile_id, signal_id.clone()))?;
        self.chain(chain_id)
    }

    /// The chain id and outcome for `(profile, signal)`, if known.
    pub fn outcome_for_signal(
        &self,
        profile_id: ProfileId,
        signal_id: &SignalId,
    ) -> Option<(ChainId, ChainOutcome)> {
        let chain_id = *self.by_signal.get(&(profile_id, signal_id.clone()))?;
        let slot = self.chains.get(&chain_id)?;
        let outcome = slot.lock().chain.outcome;
        Some((chain_id, outcome))
    }

    /// Sealed chains in seal order.
    pub fn sealed_chains(&self) -> Vec<DecisionChain> {
        let order = self.sealed_order.lock().clone();
        order.iter().filter_map(|id| self.chain(*id)).collect()
    }

    /// Query sealed chains; results are pageable and stable-ordered by
    /// seal time.
    pub fn query(&self, query: &ChainQuery) -> Vec<ChainId> {
        let chains = self.sealed_chains();
        let matched: Vec<ChainId> = chains
            .iter()
            .filter(|c| query.matches(c))
            .map(|c| c.id)
            .collect();
        query.page(&matched)
    }

    /// Verify every sealed chain.
    pub fn verify_all(&self) -> Vec<ChainVerification> {
        self.sealed_chains().iter().map(DecisionChain::verify).collect()
    }

    fn persist_node(&self, node: &DecisionNode) -> AuditResult<()> {
        if let Some(sink) = &self.sink {
            if let Err(e) = sink.lock().write(&SinkRecord::Node(node)) {
                warn!(?e, node = %node.id, "audit sink write failed");
                return Err(e);
            }
        }
        Ok(())
    }
}

fn build_node(
    chain_id: ChainId,
    parent_id: Option<NodeId>,
    parent_hash: &str,
    draft: &NodeDraft,
    monotonic_ns: u64,
) -> DecisionNode {
    // The parent hash is embedded in the input snapshot so that the chain
    // linkage is part of the signed content, not just adjacency.
    let mut input = match &draft.input {
        Value::Object(map) => Value::Object(map.clone()),
        other => json!({ "value": other }),
    };
    if !parent_hash.is_empty() {
        input["parent_hash"] = Value::String(parent_hash.to_string());
    }

    let now = Utc::now();
    let timestamp_ns = now.timestamp_nanos_opt().unwrap_or_default();
    let hash = compute_hash(
        draft.decision_type,
        parent_hash,
        &input,
        &draft.output,
        timestamp_ns,
    );

    DecisionNode {
        id: NodeId::new(),
        chain_id,
        parent_id,
        decision_type: draft.decision_type,
        source: draft.source,
        timestamp_ns,
        monotonic_ns,
        recorded_at: now,
        input,
        output: draft.output.clone(),
        rationale: draft.rationale.clone(),
        confidence: draft.confidence,
        hash,
    }
}
