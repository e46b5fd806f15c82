//! Decision nodes and content hashing.
//!
//! A node's hash covers its type, its parent's hash, the canonical forms
//! of its input and output snapshots, and its wall-clock timestamp in
//! nanoseconds. The canonical form is a fixed length-prefixed encoding
//! with object fields ordered by name, so the hash preimage does not
//! depend on map iteration order.

use chrono::{DateTime, Utc};
use exg_core::{ChainId, DecisionSource, DecisionType, NodeId};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// A single step in a decision chain. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionNode {
    pub id: NodeId,
    pub chain_id: ChainId,
    pub parent_id: Option<NodeId>,
    #[serde(rename = "type")]
    pub decision_type: DecisionType,
    pub source: DecisionSource,
    /// Wall clock in nanoseconds since the Unix epoch; hash preimage component.
    pub timestamp_ns: i64,
    /// Monotonic offset from chain creation in nanoseconds.
    pub monotonic_ns: u64,
    pub recorded_at: DateTime<Utc>,
    /// Structured input snapshot. For every non-root node this contains a
    /// `parent_hash` field equal to the parent node's hash.
    pub input: Value,
    /// Structured output snapshot.
    pub output: Value,
    pub rationale: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<Decimal>,
    /// Hex-encoded SHA-256 content hash.
    pub hash: String,
}

impl DecisionNode {
    /// Recompute this node's hash from its stored fields.
    ///
    /// `parent_hash` must be the stored hash of the parent node, or the
    /// empty string for the root.
    pub fn recompute_hash(&self, parent_hash: &str) -> String {
        compute_hash(
            self.decision_type,
            parent_hash,
            &self.input,
            &self.output,
            self.timestamp_ns,
        )
    }

    /// The `parent_hash` recorded in this node's input snapshot, if any.
    pub fn recorded_parent_hash(&self) -> Option<&str> {
        self.input.get("parent_hash").and_then(Value::as_str)
    }
}

/// Compute the content hash:
/// `H(type ∥ parent_hash ∥ canonical(input) ∥ canonical(output) ∥ timestamp_ns)`.
pub fn compute_hash(
    decision_type: DecisionType,
    parent_hash: &str,
    input: &Value,
    output: &Value,
    timestamp_ns: i64,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(length_prefixed(decision_type.as_str().as_bytes()));
    hasher.update(length_prefixed(parent_hash.as_bytes()));
    hasher.update(canonical_bytes(input));
    hasher.update(canonical_bytes(output));
    hasher.update(timestamp_ns.to_be_bytes());
    hex::encode(hasher.finalize())
}

/// Canonical serialization: length-prefixed, object fields ordered by name.
pub fn canonical_bytes(value: &Value) -> Vec<u8> {
    let mut out = Vec::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Null => out.push(b'Z'),
        Value::Bool(b) => {
            out.push(b'B');
            out.push(u8::from(*b));
        }
        Value::Number(n) => {
            out.push(b'N');
            out.extend_from_slice(&length_prefixed(n.to_string().as_bytes()));
        }
        Value::String(s) => {
            out.push(b'S');
            out.extend_from_slice(&length_prefixed(s.as_bytes()));
        }
        Value::Array(items) => {
            out.push(b'A');
            out.extend_from_slice(&(items.len() as u32).to_be_bytes());
            for item in items {
                let mut buf = Vec::new();
                write_canonical(item, &mut buf);
                out.extend_from_slice(&length_prefixed(&buf));
            }
        }
        Value::Object(map) => {
            out.push(b'O');
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.extend_from_slice(&(keys.len() as u32).to_be_bytes());
            for key in keys {
                out.extend_from_slice(&length_prefixed(key.as_bytes()));
                let mut buf = Vec::new();
                write_canonical(&map[key], &mut buf);
                out.extend_from_slice(&length_prefixed(&buf));
            }
        }
    }
}

fn length_prefixed(bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + bytes.len());
    out.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    out.extend_from_slice(bytes);
    out
}
