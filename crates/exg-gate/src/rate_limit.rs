//! Token-bucket rate limiting.
//!
//! One bucket per `(profile, producer)` plus a global bucket shared by
//! every profile. Buckets refill continuously at their per-minute rate.
//! `critical`-tier producers bypass both buckets; they still face every
//! other gate check.

use dashmap::DashMap;
use exg_core::{ProducerId, ProducerTier, ProfileId};
use parking_lot::Mutex;
use std::time::Instant;
use tracing::trace;

/// Verdict of a rate-limit probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Admitted,
    /// The (profile, producer) bucket is empty.
    ProfileLimited,
    /// The global bucket is empty.
    GlobalLimited,
}

#[derive(Debug)]
struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(per_minute: u32, now: Instant) -> Self {
        let capacity = f64::from(per_minute);
        Self {
            capacity,
            tokens: capacity,
            refill_per_sec: capacity / 60.0,
            last_refill: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
    }

    fn try_take(&mut self, now: Instant) -> bool {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn put_back(&mut self) {
        self.tokens = (self.tokens + 1.0).min(self.capacity);
    }

    fn remaining(&mut self, now: Instant) -> u32 {
        self.refill(now);
        self.tokens as u32
    }
}

/// Gate-level rate limiter.
pub struct RateLimiter {
    buckets: DashMap<(ProfileId, ProducerId), Mutex<TokenBucket>>,
    global: Mutex<TokenBucket>,
    per_minute: u32,
}

impl RateLimiter {
    pub fn new(per_minute: u32, global_per_minute: u32) -> Self {
        Self {
            buckets: DashMap::new(),
            global: Mutex::new(TokenBucket::new(global_per_minute, Instant::now())),
            per_minute,
        }
    }

    /// Probe and consume one admission token.
    pub fn try_admit(
        &self,
        profile_id: ProfileId,
        producer: &ProducerId,
        tier: ProducerTier,
    ) -> RateDecision {
        self.try_admit_at(profile_id, producer, tier, Instant::now())
    }

    /// Clock-injected variant of `try_admit` for tests.
    pub fn try_admit_at(
        &self,
        profile_id: ProfileId,
        producer: &ProducerId,
        tier: ProducerTier,
        now: Instant,
    ) -> RateDecision {
        if tier.is_rate_limit_exempt() {
            trace!(%producer, "critical producer, rate limit bypassed");
            return RateDecision::Admitted;
        }

        let key = (profile_id, producer.clone());
        let bucket = self
            .buckets
            .entry(key)
            .or_insert_with(|| Mutex::new(TokenBucket::new(self.per_minute, now)));
        if !bucket.lock().try_take(now) {
            return RateDecision::ProfileLimited;
        }

        if !self.global.lock().try_take(now) {
            // Hand the profile token back so global pressure does not
            // starve this producer's own budget.
            bucket.lock().put_back();
            return RateDecision::GlobalLimited;
        }

        RateDecision::Admitted
    }

    /// Remaining tokens for a (profile, producer) pair.
    pub fn remaining(&self, profile_id: ProfileId, producer: &ProducerId) -> u32 {
        self.remaining_at(profile_id, producer, Instant::now())
    }

    pub fn remaining_at(&self, profile_id: ProfileId, producer: &ProducerId, now: Instant) -> u32 {
        self.buckets
            .get(&(profile_id, producer.clone()))
            .map(|b| b.lock().remaining(now))
            .unwrap_or(self.per_minute)
    }
}
