//! Broker abstraction and pooled connection layer.
//!
//! One session per active profile, single-writer leases, heartbeat health
//! tracking with exponential-backoff reconnect, and position
//! reconciliation on every recovery. Broker identity is opaque to the
//! rest of the gateway: everything talks to the `Broker` trait.

pub mod broker;
pub mod error;
pub mod paper;
pub mod pool;
pub mod session;

pub use broker::{Broker, OrderAck, OrderRequest, Tick};
pub use error::{BrokerError, BrokerResult, PoolError, PoolResult};
pub use paper::{FailureMode, PaperBroker};
pub use pool::{BrokerPool, SessionLease};
pub use session::{BrokerSession, SessionState};
