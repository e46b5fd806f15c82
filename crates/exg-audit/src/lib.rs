//! Hash-chained decision trail.
//!
//! Every signal owns exactly one decision chain; every stage appends typed
//! nodes whose content hashes link parent to child. Sealed chains are
//! immutable, verifiable, queryable, and exportable as integrity-checked
//! bundles. This crate answers the question "why did this trade happen?".

pub mod chain;
pub mod error;
pub mod export;
pub mod log;
pub mod node;
pub mod query;

pub use chain::{ChainVerification, DecisionChain};
pub use error::{AuditError, AuditResult};
pub use export::{AuditBundle, BundleManifest, ChainIntegrity};
pub use log::{AuditLog, NodeDraft};
pub use node::DecisionNode;
pub use query::ChainQuery;
