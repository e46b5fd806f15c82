//! The emergency state cell.
//!
//! A global singleton holding one of `normal | hedged | halted | killed`.
//! Transitions are latched and serialized; severity only escalates until
//! an authorized restore. Readers see the latest committed state through
//! an atomic load. Auto-reset is prohibited: leaving `killed` takes two
//! distinct Owner-capable actors inside a five-minute window.

use crate::error::{EmergencyError, EmergencyResult};
use chrono::{DateTime, Utc};
use exg_core::Actor;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// Window within which both restore approvals must land.
pub const RESTORE_WINDOW: Duration = Duration::from_secs(300);

/// Global emergency state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmergencyState {
    Normal,
    Hedged,
    Halted,
    Killed,
}

impl EmergencyState {
    fn severity(&self) -> u8 {
        match self {
            Self::Normal => 0,
            Self::Hedged => 1,
            Self::Halted => 2,
            Self::Killed => 3,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Hedged,
            2 => Self::Halted,
            3 => Self::Killed,
            _ => Self::Normal,
        }
    }

    pub fn is_normal(&self) -> bool {
        matches!(self, Self::Normal)
    }
}

impl fmt::Display for EmergencyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Normal => write!(f, "normal"),
            Self::Hedged => write!(f, "hedged"),
            Self::Halted => write!(f, "halted"),
            Self::Killed => write!(f, "killed"),
        }
    }
}

/// Record of the transition that produced the current state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Activation {
    pub state: EmergencyState,
    pub actor: String,
    pub reason: String,
    pub at: DateTime<Utc>,
}

/// Progress of a two-actor restore.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreProgress {
    /// First approval recorded; a second distinct Owner must approve
    /// within the window.
    AwaitingSecond,
    /// Quorum reached; state is back to normal.
    Restored,
}

/// Atomic, latched emergency state cell.
pub struct EmergencyCell {
    state: AtomicU8,
    activation: RwLock<Option<Activation>>,
    pending_restore: RwLock<Option<(String, Instant)>>,
}

impl Default for EmergencyCell {
    fn default() -> Self {
        Self::new()
    }
}

impl EmergencyCell {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(EmergencyState::Normal.severity()),
            activation: RwLock::new(None),
            pending_restore: RwLock::new(None),
        }
    }

    pub fn state(&self) -> EmergencyState {
        EmergencyState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn activation(&self) -> Option<Activation> {
        self.activation.read().clone()
    }

    /// Escalate to a more severe state. Equal-severity re-activation is a
    /// no-op that keeps the original activation record; de-escalation is
    /// rejected (use `deactivate`/`restore`).
    pub fn escalate(
        &self,
        target: EmergencyState,
        actor: &Actor,
        reason: impl Into<String>,
    ) -> EmergencyResult<EmergencyState> {
        let reason = reason.into();
        loop {
            let current_raw = self.state.load(Ordering::SeqCst);
            let current = EmergencyState::from_u8(current_raw);
            if target.severity() < current.severity() {
                return Err(EmergencyError::InvalidTransition(format!(
                    "{current} -> {target} is a de-escalation"
                )));
            }
            if target.severity() == current.severity() {
                warn!(state = %current, actor = %actor, "emergency re-activation ignored");
                return Ok(current);
            }
            if self
                .state
                .compare_exchange(
                    current_raw,
                    target.severity(),
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                )
                .is_ok()
            {
                *self.activation.write() = Some(Activation {
                    state: target,
                    actor: actor.id.clone(),
                    reason: reason.clone(),
                    at: Utc::now(),
                });
                error!(from = %current, to = %target, actor = %actor, reason = %reason,
                    "EMERGENCY STATE ESCALATED");
                return Ok(current);
            }
        }
    }

    /// Revert `hedged` or `halted` to normal. Requires Owner capability;
    /// `killed` is excluded, only `restore` leaves it.
    pub fn deactivate(&self, actor: &Actor) -> EmergencyResult<EmergencyState> {
        if !actor.owner_capable {
            return Err(EmergencyError::NotOwnerCapable(actor.id.clone()));
        }
        let current = self.state();
        match current {
            EmergencyState::Normal => Ok(current),
            EmergencyState::Hedged | EmergencyState::Halted => {
                self.state
                    .store(EmergencyState::Normal.severity(), Ordering::SeqCst);
                *self.activation.write() = None;
                info!(from = %current, actor = %actor, "emergency state deactivated");
                Ok(current)
            }
            EmergencyState::Killed => Err(EmergencyError::InvalidTransition(
                "killed requires a two-actor restore".to_string(),
            )),
        }
    }

    /// One restore approval. Quorum is two distinct Owner-capable actors
    /// within `RESTORE_WINDOW`; a single actor is insufficient.
    pub fn approve_restore(&self, actor: &Actor) -> EmergencyResult<RestoreProgress> {
        self.approve_restore_at(actor, Instant::now())
    }

    /// Clock-injected variant of `approve_restore` for tests.
    pub fn approve_restore_at(
        &self,
        actor: &Actor,
        now: Instant,
    ) -> EmergencyResult<RestoreProgress> {
        if !actor.owner_capable {
            return Err(EmergencyError::NotOwnerCapable(actor.id.clone()));
        }
        if self.state() != EmergencyState::Killed {
            return Err(EmergencyError::InvalidTransition(format!(
                "restore from {} is meaningless",
                self.state()
            )));
        }

        let mut pending = self.pending_restore.write();
        match pending.take() {
            Some((first_actor, at)) if now.duration_since(at) <= RESTORE_WINDOW => {
                if first_actor == actor.id {
                    // Same actor twice keeps the original approval live.
                    *pending = Some((first_actor, at));
                    return Err(EmergencyError::SameActor);
                }
                self.state
                    .store(EmergencyState::Normal.severity(), Ordering::SeqCst);
                *self.activation.write() = None;
                info!(first = %first_actor, second = %actor, "kill switch restored by quorum");
                Ok(RestoreProgress::Restored)
            }
            _ => {
                // No pending approval, or the window expired: start over.
                *pending = Some((actor.id.clone(), now));
                info!(actor = %actor, "restore approval recorded, awaiting second owner");
                Ok(RestoreProgress::AwaitingSecond)
            }
        }
    }

    /// Single-call restore surface: validates the authorization code and
    /// applies both approvals atomically.
    pub fn restore(
        &self,
        authorization_code: &str,
        actor1: &Actor,
        actor2: &Actor,
    ) -> EmergencyResult<()> {
        if authorization_code.trim().is_empty() {
            return Err(EmergencyError::EmptyAuthorization);
        }
        if actor1.id == actor2.id {
            return Err(EmergencyError::SameActor);
        }
        let now = Instant::now();
        match self.approve_restore_at(actor1, now)? {
            RestoreProgress::Restored => Ok(()),
            RestoreProgress::AwaitingSecond => match self.approve_restore_at(actor2, now)? {
                RestoreProgress::Restored => Ok(()),
                RestoreProgress::AwaitingSecond => Err(EmergencyError::InvalidTransition(
                    "quorum not reached".to_string(),
                )),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owner(id: &str) -> Actor {
        Actor::owner(id)
    }

    #[test]
    fn test_initial_state_normal() {
        let cell = EmergencyCell::new();
        assert_eq!(cell.state(), EmergencyState::Normal);
        assert!(cell.activation().is_none());
    }

    #[test]
    fn test_escalation_and_latch() {
        let cell = EmergencyCell::new();
        cell.escalate(EmergencyState::Halted, &owner("ops"), "vol spike")
            .unwrap();
        assert_eq!(cell.state(), EmergencyState::Halted);

        // Re-activation at the same severity keeps the original record.
        cell.escalate(EmergencyState::Halted, &owner("other"), "again")
            .unwrap();
        assert_eq!(cell.activation().unwrap().actor, "ops");

        // De-escalation via escalate is rejected.
        let err = cell.escalate(EmergencyState::Hedged, &owner("ops"), "down");
        assert!(matches!(err, Err(EmergencyError::InvalidTransition(_))));
    }

    #[test]
    fn test_deactivate_requires_owner() {
        let cell = EmergencyCell::new();
        cell.escalate(EmergencyState::Hedged, &owner("ops"), "crash")
            .unwrap();

        let viewer = Actor::new("viewer", false);
        assert!(matches!(
            cell.deactivate(&viewer),
            Err(EmergencyError::NotOwnerCapable(_))
        ));
        cell.deactivate(&owner("ops")).unwrap();
        assert_eq!(cell.state(), EmergencyState::Normal);
    }

    #[test]
    fn test_killed_needs_two_distinct_owners() {
        let cell = EmergencyCell::new();
        cell.escalate(EmergencyState::Killed, &owner("ops"), "drawdown")
            .unwrap();

        // deactivate cannot leave killed
        assert!(cell.deactivate(&owner("ops")).is_err());

        // single actor twice is refused
        assert_eq!(
            cell.approve_restore(&owner("a")).unwrap(),
            RestoreProgress::AwaitingSecond
        );
        assert!(matches!(
            cell.approve_restore(&owner("a")),
            Err(EmergencyError::SameActor)
        ));
        assert_eq!(cell.state(), EmergencyState::Killed);

        // second distinct owner restores
        assert_eq!(
            cell.approve_restore(&owner("b")).unwrap(),
            RestoreProgress::Restored
        );
        assert_eq!(cell.state(), EmergencyState::Normal);
    }

    #[test]
    fn test_restore_window_expiry() {
        let cell = EmergencyCell::new();
        cell.escalate(EmergencyState::Killed, &owner("ops"), "manual")
            .unwrap();

        let t0 = Instant::now();
        cell.approve_restore_at(&owner("a"), t0).unwrap();
        // Second approval after the window restarts the quorum.
        let late = t0 + RESTORE_WINDOW + Duration::from_secs(1);
        assert_eq!(
            cell.approve_restore_at(&owner("b"), late).unwrap(),
            RestoreProgress::AwaitingSecond
        );
        assert_eq!(cell.state(), EmergencyState::Killed);
    }

    #[test]
    fn test_restore_single_call() {
        let cell = EmergencyCell::new();
        cell.escalate(EmergencyState::Killed, &owner("ops"), "manual")
            .unwrap();

        assert!(matches!(
            cell.restore("", &owner("a"), &owner("b")),
            Err(EmergencyError::EmptyAuthorization)
        ));
        assert!(matches!(
            cell.restore("code-7", &owner("a"), &owner("a")),
            Err(EmergencyError::SameActor)
        ));
        cell.restore("code-7", &owner("a"), &owner("b")).unwrap();
        assert_eq!(cell.state(), EmergencyState::Normal);
    }

    #[test]
    fn test_non_owner_cannot_approve() {
        let cell = EmergencyCell::new();
        cell.escalate(EmergencyState::Killed, &owner("ops"), "manual")
            .unwrap();
        let viewer = Actor::new("viewer", false);
        assert!(matches!(
            cell.approve_restore(&viewer),
            Err(EmergencyError::NotOwnerCapable(_))
        ));
    }
}
