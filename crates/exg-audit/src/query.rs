//! Chain query surface.

use crate::chain::DecisionChain;
use chrono::{DateTime, Utc};
use exg_core::{ChainId, ChainOutcome, DecisionType, ProfileId};
use serde::{Deserialize, Serialize};

/// Filter over sealed chains. Results are stable-ordered by seal time and
/// pageable.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChainQuery {
    /// Inclusive lower bound on seal time.
    pub start: Option<DateTime<Utc>>,
    /// Exclusive upper bound on seal time.
    pub end: Option<DateTime<Utc>>,
    /// Match any of these outcomes.
    pub outcomes: Option<Vec<ChainOutcome>>,
    /// Match chains containing any of these node types.
    pub decision_types: Option<Vec<DecisionType>>,
    /// Restrict to one profile.
    pub profile_id: Option<ProfileId>,
    /// Zero-based page index.
    pub page: usize,
    /// Page size; 0 means unpaged.
    pub page_size: usize,
}

impl ChainQuery {
    pub fn matches(&self, chain: &DecisionChain) -> bool {
        let Some(sealed_at) = chain.sealed_at else {
            return false;
        };
        if let Some(start) = self.start {
            if sealed_at < start {
                return false;
            }
        }
        if let Some(end) = self.end {
            if sealed_at >= end {
                return false;
            }
        }
        if let Some(outcomes) = &self.outcomes {
            if !outcomes.contains(&chain.outcome) {
                return false;
            }
        }
        if let Some(profile) = self.profile_id {
            if chain.profile_id != Some(profile) {
                return false;
            }
        }
        if let Some(types) = &self.decision_types {
            let present = chain
                .nodes
                .iter()
                .any(|n| types.contains(&n.decision_type));
            if !present {
                return false;
            }
        }
        true
    }

    /// Apply paging to an already-filtered, seal-ordered id list.
    pub fn page(&self, ids: &[ChainId]) -> Vec<ChainId> {
        if self.page_size == 0 {
            return ids.to_vec();
        }
        ids.iter()
            .skip(self.page * self.page_size)
            .take(self.page_size)
            .copied()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::{AuditLog, NodeDraft};
    use exg_core::{DecisionSource, SignalId};
    use serde_json::json;

    fn seeded_log() -> (AuditLog, ProfileId) {
        let log = AuditLog::in_memory();
        let profile = ProfileId::new();
        for (i, outcome) in [
            ChainOutcome::Executed,
            ChainOutcome::Blocked,
            ChainOutcome::Executed,
            ChainOutcome::Rejected,
        ]
        .iter()
        .enumerate()
        {
            let chain_id = log
                .begin_chain(
                    profile,
                    SignalId::new(format!("s{i}")),
                    json!({"i": i}),
                    "received",
                )
                .unwrap();
            if *outcome == ChainOutcome::Executed {
                log.append(
                    chain_id,
                    NodeDraft::new(
                        DecisionType::PositionOpened,
                        DecisionSource::Executor,
                        json!({}),
                        json!({"ticket": i}),
                        "filled",
                    ),
                )
                .unwrap();
            }
            log.seal(chain_id, *outcome).unwrap();
        }
        (log, profile)
    }

    #[test]
    fn test_query_by_outcome() {
        let (log, _) = seeded_log();
        let query = ChainQuery {
            outcomes: Some(vec![ChainOutcome::Executed]),
            ..Default::default()
        };
        assert_eq!(log.query(&query).len(), 2);
    }

    #[test]
    fn test_query_by_decision_type() {
        let (log, _) = seeded_log();
        let query = ChainQuery {
            decision_types: Some(vec![DecisionType::PositionOpened]),
            ..Default::default()
        };
        assert_eq!(log.query(&query).len(), 2);
    }

    #[test]
    fn test_query_paging_is_stable() {
        let (log, _) = seeded_log();
        let all = log.query(&ChainQuery::default());
        assert_eq!(all.len(), 4);

        let page0 = log.query(&ChainQuery {
            page: 0,
            page_size: 3,
            ..Default::default()
        });
        let page1 = log.query(&ChainQuery {
            page: 1,
            page_size: 3,
            ..Default::default()
        });
        assert_eq!(page0.len(), 3);
        assert_eq!(page1.len(), 1);
        assert_eq!(page0[0], all[0]);
        assert_eq!(page1[0], all[3]);
    }

    #[test]
    fn test_query_by_profile() {
        let (log, profile) = seeded_log();
        let other = ProfileId::new();
        let query = ChainQuery {
            profile_id: Some(other),
            ..Default::default()
        };
        assert!(log.query(&query).is_empty());

        let query = ChainQuery {
            profile_id: Some(profile),
            ..Default::default()
        };
        assert_eq!(log.query(&query).len(), 4);
    }
}
