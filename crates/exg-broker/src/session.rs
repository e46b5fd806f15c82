//! Per-profile broker session state machine.
//!
//! ```text
//! Disconnected ──connect──► Connecting ──ok──► Healthy ──3 misses──► Degraded
//!      ▲                        │                 │                      │
//!      │                        │fail             │force_disconnect      │5 misses
//!      └────────backoff─────────┘                 ▼                      │
//!                                           Disconnected ◄──────────────-┘
//! ```
//!
//! Heartbeats run every `heartbeat_interval`; three consecutive misses
//! degrade the session, five (or an explicit broker error) disconnect it.
//! Reconnection backs off exponentially and gives up after the configured
//! attempt count, leaving the session disconnected pending admin action.

use crate::broker::Broker;
use crate::error::{BrokerError, BrokerResult};
use exg_core::{ConnectionHealth, Profile, ProfileId};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Heartbeat misses before the session is marked degraded.
pub const DEGRADE_AFTER_MISSES: u32 = 3;
/// Heartbeat misses before the session is torn down.
pub const DISCONNECT_AFTER_MISSES: u32 = 5;
/// Reconnect backoff cap.
pub const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(60);

/// Session connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Healthy,
    Degraded,
}

impl SessionState {
    /// Map to the profile-facing health value.
    pub fn health(&self) -> ConnectionHealth {
        match self {
            Self::Healthy => ConnectionHealth::Healthy,
            Self::Degraded => ConnectionHealth::Degraded,
            Self::Disconnected | Self::Connecting => ConnectionHealth::Disconnected,
        }
    }
}

/// Verdict of one heartbeat round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatVerdict {
    Alive,
    /// Misses crossed the degrade threshold.
    Degraded,
    /// Misses crossed the disconnect threshold or the broker returned a
    /// hard error; the session must reconnect.
    Lost,
}

/// A single profile's broker session.
///
/// The lease mutex serializes order traffic: a session is never shared
/// across concurrent calls, and tokio's mutex hands it out in FIFO order,
/// which is what makes `acquire` fair.
pub struct BrokerSession {
    profile: Profile,
    broker: Arc<dyn Broker>,
    state: RwLock<SessionState>,
    missed_heartbeats: AtomicU32,
    reconnect_attempts: AtomicU32,
    lease: Arc<tokio::sync::Mutex<()>>,
    max_reconnect_attempts: u32,
}

impl BrokerSession {
    pub fn new(profile: Profile, broker: Arc<dyn Broker>, max_reconnect_attempts: u32) -> Self {
        Self {
            profile,
            broker,
            state: RwLock::new(SessionState::Disconnected),
            missed_heartbeats: AtomicU32::new(0),
            reconnect_attempts: AtomicU32::new(0),
            lease: Arc::new(tokio::sync::Mutex::new(())),
            max_reconnect_attempts,
        }
    }

    pub fn profile_id(&self) -> ProfileId {
        self.profile.id
    }

    pub fn profile(&self) -> &Profile {
        &self.profile
    }

    pub fn state(&self) -> SessionState {
        *self.state.read()
    }

    pub fn lease_handle(&self) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(&self.lease)
    }

    /// Establish the initial connection.
    pub async fn connect(&self) -> BrokerResult<()> {
        *self.state.write() = SessionState::Connecting;
        match self.broker.connect(&self.profile).await {
            Ok(()) => {
                *self.state.write() = SessionState::Healthy;
                self.missed_heartbeats.store(0, Ordering::SeqCst);
                self.reconnect_attempts.store(0, Ordering::SeqCst);
                info!(profile = %self.profile.id, "broker session connected");
                Ok(())
            }
            Err(e) => {
                *self.state.write() = SessionState::Disconnected;
                warn!(profile = %self.profile.id, ?e, "broker connect failed");
                Err(e)
            }
        }
    }

    /// Tear the session down deliberately.
    pub async fn force_disconnect(&self) {
        let _ = self.broker.disconnect(self.profile.id).await;
        *self.state.write() = SessionState::Disconnected;
        info!(profile = %self.profile.id, "broker session force-disconnected");
    }

    /// Run one heartbeat round and update the state machine.
    pub async fn heartbeat_round(&self) -> HeartbeatVerdict {
        if self.state() == SessionState::Disconnected {
            return HeartbeatVerdict::Lost;
        }
        match self.broker.heartbeat(self.profile.id).await {
            Ok(()) => {
                let prev = self.missed_heartbeats.swap(0, Ordering::SeqCst);
                if prev > 0 {
                    debug!(profile = %self.profile.id, prev, "heartbeat recovered");
                }
                if self.state() == SessionState::Degraded {
                    *self.state.write() = SessionState::Healthy;
                }
                HeartbeatVerdict::Alive
            }
            Err(BrokerError::Timeout) | Err(BrokerError::ConnectionLost(_)) => {
                let misses = self.missed_heartbeats.fetch_add(1, Ordering::SeqCst) + 1;
                debug!(profile = %self.profile.id, misses, "heartbeat miss");
                if misses >= DISCONNECT_AFTER_MISSES {
                    *self.state.write() = SessionState::Disconnected;
                    HeartbeatVerdict::Lost
                } else if misses >= DEGRADE_AFTER_MISSES {
                    *self.state.write() = SessionState::Degraded;
                    HeartbeatVerdict::Degraded
                } else {
                    HeartbeatVerdict::Alive
                }
            }
            Err(e) => {
                // Explicit broker error: no grace period.
                warn!(profile = %self.profile.id, ?e, "heartbeat hard error");
                *self.state.write() = SessionState::Disconnected;
                HeartbeatVerdict::Lost
            }
        }
    }

    /// Reconnect with exponential backoff (1, 2, 4, 8, 16s, capped).
    ///
    /// On exhaustion the session stays `Disconnected` pending admin
    /// action and the error is returned for the pool to record.
    pub async fn reconnect_with_backoff(&self) -> BrokerResult<()> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            self.reconnect_attempts.store(attempt, Ordering::SeqCst);
            if attempt > self.max_reconnect_attempts {
                warn!(profile = %self.profile.id, attempts = attempt - 1,
                    "reconnect attempts exhausted");
                *self.state.write() = SessionState::Disconnected;
                return Err(BrokerError::ConnectionLost(format!(
                    "reconnect exhausted after {} attempts",
                    attempt - 1
                )));
            }

            let delay = backoff_delay(attempt);
            debug!(profile = %self.profile.id, attempt, delay_ms = delay.as_millis() as u64,
                "reconnect backoff");
            tokio::time::sleep(delay).await;

            if self.connect().await.is_ok() {
                return Ok(());
            }
        }
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts.load(Ordering::SeqCst)
    }
}

/// Exponential backoff: 1s, 2s, 4s, 8s, 16s, capped at 60s.
pub fn backoff_delay(attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(10);
    let secs = 1u64 << exponent;
    Duration::from_secs(secs).min(RECONNECT_MAX_DELAY)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_sequence() {
        assert_eq!(backoff_delay(1), Duration::from_secs(1));
        assert_eq!(backoff_delay(2), Duration::from_secs(2));
        assert_eq!(backoff_delay(3), Duration::from_secs(4));
        assert_eq!(backoff_delay(5), Duration::from_secs(16));
        assert_eq!(backoff_delay(8), Duration::from_secs(60));
        assert_eq!(backoff_delay(100), Duration::from_secs(60));
    }

    #[test]
    fn test_state_to_health() {
        assert_eq!(SessionState::Healthy.health(), ConnectionHealth::Healthy);
        assert_eq!(SessionState::Degraded.health(), ConnectionHealth::Degraded);
        assert_eq!(
            SessionState::Connecting.health(),
            ConnectionHealth::Disconnected
        );
    }
}
