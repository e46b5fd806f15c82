//! Audit export bundles.
//!
//! A bundle is a set of chains plus a manifest: the chain count, a digest
//! over the concatenated root hashes in chronological seal order, and a
//! per-chain integrity report.

use crate::chain::DecisionChain;
use crate::log::AuditLog;
use crate::query::ChainQuery;
use exg_core::{ChainId, NodeId, PositionTicket};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Per-chain integrity verdict inside a bundle manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainIntegrity {
    pub chain_id: ChainId,
    pub valid: bool,
    pub first_invalid_node: Option<NodeId>,
}

/// Bundle manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundleManifest {
    /// Number of chains in the bundle.
    pub chain_count: usize,
    /// SHA-256 over the concatenated root hashes in seal order, hex.
    pub root_digest: String,
    /// Pass/fail per chain.
    pub integrity: Vec<ChainIntegrity>,
}

impl BundleManifest {
    pub fn all_valid(&self) -> bool {
        self.integrity.iter().all(|c| c.valid)
    }
}

/// A set of chains and the positions they opened, with an integrity
/// manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditBundle {
    pub chains: Vec<DecisionChain>,
    /// Tickets referenced by `position.opened` nodes in the bundle.
    pub positions: Vec<PositionTicket>,
    pub manifest: BundleManifest,
}

impl AuditBundle {
    /// Build a bundle from the sealed chains matching `query`.
    pub fn build(log: &AuditLog, query: &ChainQuery) -> Self {
        let chains: Vec<DecisionChain> = log
            .query(query)
            .into_iter()
            .filter_map(|id| log.chain(id))
            .collect();

        let mut hasher = Sha256::new();
        let mut integrity = Vec::with_capacity(chains.len());
        let mut positions = Vec::new();

        for chain in &chains {
            if let Some(root) = chain.root_hash() {
                hasher.update(root.as_bytes());
            }
            let verification = chain.verify();
            integrity.push(ChainIntegrity {
                chain_id: chain.id,
                valid: verification.valid,
                first_invalid_node: verification.first_invalid_node,
            });
            for node in &chain.nodes {
                if node.decision_type == exg_core::DecisionType::PositionOpened {
                    if let Some(ticket) = node.output.get("ticket").and_then(|v| v.as_u64()) {
                        positions.push(PositionTicket::new(ticket));
                    }
                }
            }
        }

        let manifest = BundleManifest {
            chain_count: chains.len(),
            root_digest: hex::encode(hasher.finalize()),
            integrity,
        };

        Self {
            chains,
            positions,
            manifest,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::NodeDraft;
    use exg_core::{ChainOutcome, DecisionSource, DecisionType, ProfileId, SignalId};
    use serde_json::json;

    #[test]
    fn test_bundle_manifest() {
        let log = AuditLog::in_memory();
        let profile = ProfileId::new();
        for i in 0..3 {
            let chain_id = log
                .begin_chain(
                    profile,
                    SignalId::new(format!("s{i}")),
                    json!({"i": i}),
                    "received",
                )
                .unwrap();
            log.append(
                chain_id,
                NodeDraft::new(
                    DecisionType::PositionOpened,
                    DecisionSource::Executor,
                    json!({}),
                    json!({"ticket": 100 + i}),
                    "filled",
                ),
            )
            .unwrap();
            log.seal(chain_id, ChainOutcome::Executed).unwrap();
        }

        let bundle = AuditBundle::build(&log, &ChainQuery::default());
        assert_eq!(bundle.manifest.chain_count, 3);
        assert_eq!(bundle.positions.len(), 3);
        assert!(bundle.manifest.all_valid());
        assert_eq!(bundle.manifest.root_digest.len(), 64);
    }

    #[test]
    fn test_bundle_digest_depends_on_order_and_content() {
        let log = AuditLog::in_memory();
        let profile = ProfileId::new();
        let chain_id = log
            .begin_chain(profile, SignalId::from("a"), json!({}), "received")
            .unwrap();
        log.seal(chain_id, ChainOutcome::Blocked).unwrap();

        let one = AuditBundle::build(&log, &ChainQuery::default());

        let chain_id = log
            .begin_chain(profile, SignalId::from("b"), json!({}), "received")
            .unwrap();
        log.seal(chain_id, ChainOutcome::Blocked).unwrap();

        let two = AuditBundle::build(&log, &ChainQuery::default());
        assert_ne!(one.manifest.root_digest, two.manifest.root_digest);
    }
}
