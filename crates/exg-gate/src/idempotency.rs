//! Idempotency cache.
//!
//! `(profile_id, signal_id)` guarantees at-most-once acceptance: a
//! repeat inside the retention window returns the original chain instead
//! of creating a new one. Entries are evicted lazily after 24 hours.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use exg_core::{ChainId, ProfileId, SignalId};

/// Retention window for idempotency keys.
pub const RETENTION_HOURS: i64 = 24;

#[derive(Debug, Clone)]
struct Entry {
    chain_id: ChainId,
    cached_at: DateTime<Utc>,
}

/// 24-hour `(profile, signal)` -> chain cache.
pub struct IdempotencyCache {
    entries: DashMap<(ProfileId, SignalId), Entry>,
    retention: Duration,
}

impl Default for IdempotencyCache {
    fn default() -> Self {
        Self::new()
    }
}

impl IdempotencyCache {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            retention: Duration::hours(RETENTION_HOURS),
        }
    }

    #[cfg(test)]
    fn with_retention(retention: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            retention,
        }
    }

    /// The chain already owning this key, if seen within the window.
    /// Expired entries are dropped on probe.
    pub fn lookup(&self, profile_id: ProfileId, signal_id: &SignalId) -> Option<ChainId> {
        let key = (profile_id, signal_id.clone());
        let entry = self.entries.get(&key)?;
        if Utc::now() - entry.cached_at >= self.retention {
            drop(entry);
            self.entries.remove(&key);
            return None;
        }
        Some(entry.chain_id)
    }

    /// Claim the key for a new chain.
    pub fn insert(&self, profile_id: ProfileId, signal_id: SignalId, chain_id: ChainId) {
        self.entries.insert(
            (profile_id, signal_id),
            Entry {
                chain_id,
                cached_at: Utc::now(),
            },
        );
    }

    /// Drop every expired entry; called opportunistically.
    pub fn evict_expired(&self) {
        let cutoff = Utc::now() - self.retention;
        self.entries.retain(|_, entry| entry.cached_at > cutoff);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_roundtrip() {
        let cache = IdempotencyCache::new();
        let profile = ProfileId::new();
        let chain = ChainId::new();

        assert!(cache.lookup(profile, &SignalId::from("s1")).is_none());
        cache.insert(profile, SignalId::from("s1"), chain);
        assert_eq!(cache.lookup(profile, &SignalId::from("s1")), Some(chain));
    }

    #[test]
    fn test_same_signal_id_distinct_profiles() {
        let cache = IdempotencyCache::new();
        let p1 = ProfileId::new();
        let p2 = ProfileId::new();
        cache.insert(p1, SignalId::from("s1"), ChainId::new());

        assert!(cache.lookup(p2, &SignalId::from("s1")).is_none());
    }

    #[test]
    fn test_expired_entries_evicted() {
        let cache = IdempotencyCache::with_retention(Duration::zero());
        let profile = ProfileId::new();
        cache.insert(profile, SignalId::from("s1"), ChainId::new());

        assert!(cache.lookup(profile, &SignalId::from("s1")).is_none());
        cache.evict_expired();
        assert!(cache.is_empty());
    }
}
