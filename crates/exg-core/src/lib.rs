//! Core domain types for the signal execution gateway.
//!
//! This crate provides the fundamental types shared by every stage of the
//! pipeline:
//! - `Price`, `Volume`: precision-safe numeric types
//! - `Signal`, `Direction`, `ProducerTier`: trade proposals and their origin
//! - `Profile`, `ProfileSnapshot`: tenant broker bindings and their state
//! - `Position`, `OrderIntent`: market exposure and sized orders
//! - `DecisionType`, `ChainOutcome`: the decision-trail vocabulary
//! - `ErrorKind`: the stable error taxonomy surfaced to producers

pub mod config;
pub mod decimal;
pub mod decision;
pub mod error;
pub mod intent;
pub mod position;
pub mod profile;
pub mod signal;

pub use config::GatewayConfig;
pub use decimal::{Price, Volume};
pub use decision::{ChainId, ChainOutcome, DecisionSource, DecisionType, NodeId};
pub use error::{CoreError, ErrorKind, GatewayFault, Result};
pub use intent::OrderIntent;
pub use position::{Position, PositionTicket};
pub use profile::{Actor, ConnectionHealth, Profile, ProfileId, ProfileSnapshot};
pub use signal::{ClientToken, Direction, ProducerId, ProducerTier, Signal, SignalId, Symbol};
