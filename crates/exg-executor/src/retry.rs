//! Failure classification and the retry table.
//!
//! | Class | Retry | Attempts | Backoff |
//! |---|---|---|---|
//! | Transient (network/timeout) | yes | 3 | 1s, 2s, 4s |
//! | Broker rejected | no | - | - |
//! | Market closed | no | - | - |
//! | Duplicate ticket | no (success) | - | - |
//! | Connection lost mid-submit | once, after reconcile | 1 | 2s |
//!
//! Total submit attempts for one intent never exceed
//! `MAX_SUBMIT_ATTEMPTS`.

use exg_broker::BrokerError;
use exg_core::PositionTicket;
use std::time::Duration;

/// Hard ceiling on broker submit attempts per signal.
pub const MAX_SUBMIT_ATTEMPTS: u32 = 4;

/// Executor-facing classification of a broker failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureClass {
    /// Network failure or timeout; retry with backoff.
    Transient,
    /// Broker refused (margin, spread, invalid price); final.
    BrokerRejected,
    /// Market closed; final.
    MarketClosed,
    /// Token already used; the submit actually succeeded.
    DuplicateTicket(PositionTicket),
    /// Transport dropped mid-submit; reconcile by token, then at most
    /// one retry.
    ConnectionLost,
    /// Session-level problem the executor cannot recover from here.
    SessionDead,
}

/// Map a broker error onto the retry table.
pub fn classify(error: &BrokerError) -> FailureClass {
    match error {
        BrokerError::Timeout => FailureClass::Transient,
        BrokerError::ConnectionLost(_) => FailureClass::ConnectionLost,
        BrokerError::Rejected(_) => FailureClass::BrokerRejected,
        BrokerError::MarketClosed(_) => FailureClass::MarketClosed,
        BrokerError::DuplicateTicket(ticket) => FailureClass::DuplicateTicket(*ticket),
        BrokerError::NotConnected(_)
        | BrokerError::UnknownTicket(_)
        | BrokerError::AuthFailed(_) => FailureClass::SessionDead,
    }
}

/// Backoff schedule for transient failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_transient_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_transient_attempts: 3,
        }
    }
}

impl RetryPolicy {
    /// Delay before the given retry (1-based): 1s, 2s, 4s.
    pub fn transient_backoff(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(4);
        Duration::from_secs(1u64 << exponent)
    }

    /// Delay before the single reconnect retry.
    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_secs(2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert_eq!(classify(&BrokerError::Timeout), FailureClass::Transient);
        assert_eq!(
            classify(&BrokerError::Rejected("margin".into())),
            FailureClass::BrokerRejected
        );
        assert_eq!(
            classify(&BrokerError::MarketClosed("EURUSD".into())),
            FailureClass::MarketClosed
        );
        assert_eq!(
            classify(&BrokerError::ConnectionLost("reset".into())),
            FailureClass::ConnectionLost
        );
        assert_eq!(
            classify(&BrokerError::DuplicateTicket(PositionTicket::new(7))),
            FailureClass::DuplicateTicket(PositionTicket::new(7))
        );
    }

    #[test]
    fn test_transient_backoff_schedule() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.transient_backoff(1), Duration::from_secs(1));
        assert_eq!(policy.transient_backoff(2), Duration::from_secs(2));
        assert_eq!(policy.transient_backoff(3), Duration::from_secs(4));
    }
}
