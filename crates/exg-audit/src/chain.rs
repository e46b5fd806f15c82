//! Decision chains: ordered node lists with verifiable integrity.

use crate::node::DecisionNode;
use chrono::{DateTime, Utc};
use exg_core::{ChainId, ChainOutcome, NodeId, ProfileId, SignalId};
use serde::{Deserialize, Serialize};

/// The ordered list of decision nodes produced while processing one signal
/// (or one control event such as an emergency transition).
///
/// Created on admission, sealed on the terminal decision, then immutable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionChain {
    pub id: ChainId,
    /// Originating signal; `None` for control chains (emergency,
    /// reconciliation) which are not owned by any signal.
    pub signal_id: Option<SignalId>,
    pub profile_id: Option<ProfileId>,
    pub outcome: ChainOutcome,
    pub created_at: DateTime<Utc>,
    pub sealed_at: Option<DateTime<Utc>>,
    pub nodes: Vec<DecisionNode>,
}

impl DecisionChain {
    /// The chain's root hash: the hash of its last node.
    pub fn root_hash(&self) -> Option<&str> {
        self.nodes.last().map(|n| n.hash.as_str())
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed_at.is_some()
    }

    /// Total processing duration once sealed.
    pub fn duration(&self) -> Option<chrono::Duration> {
        self.sealed_at.map(|sealed| sealed - self.created_at)
    }

    /// Node types in append order.
    pub fn node_types(&self) -> Vec<&'static str> {
        self.nodes.iter().map(|n| n.decision_type.as_str()).collect()
    }

    /// Verify the chain: recompute every node hash and check every parent
    /// link. Missing or reordered nodes fail verification.
    pub fn verify(&self) -> ChainVerification {
        let mut parent_hash = String::new();
        let mut parent_id: Option<NodeId> = None;

        for node in &self.nodes {
            if node.parent_id != parent_id {
                return ChainVerification::invalid(self.id, node.id, "parent id mismatch");
            }
            if !parent_hash.is_empty() {
                match node.recorded_parent_hash() {
                    Some(recorded) if recorded == parent_hash => {}
                    _ => {
                        return ChainVerification::invalid(
                            self.id,
                            node.id,
                            "recorded parent_hash does not match parent node",
                        )
                    }
                }
            }
            let recomputed = node.recompute_hash(&parent_hash);
            if recomputed != node.hash {
                return ChainVerification::invalid(self.id, node.id, "content hash mismatch");
            }
            parent_hash = node.hash.clone();
            parent_id = Some(node.id);
        }

        ChainVerification {
            chain_id: self.id,
            valid: true,
            first_invalid_node: None,
            detail: None,
        }
    }
}

/// Result of verifying a chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainVerification {
    pub chain_id: ChainId,
    pub valid: bool,
    pub first_invalid_node: Option<NodeId>,
    pub detail: Option<String>,
}

impl ChainVerification {
    fn invalid(chain_id: ChainId, node: NodeId, detail: &str) -> Self {
        Self {
            chain_id,
            valid: false,
            first_invalid_node: Some(node),
            detail: Some(detail.to_string()),
        }
    }
}
