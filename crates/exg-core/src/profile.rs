//! Tenant profiles and their observable state.
//!
//! A `Profile` binds a tenant to a broker account. It outlives any single
//! signal and is created/destroyed only by admin action. The pipeline reads
//! profile state through an immutable `ProfileSnapshot` taken at stage
//! entry; concurrent updates take effect on the next signal.

use crate::decimal::Price;
use crate::position::Position;
use crate::signal::Symbol;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

/// Profile identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProfileId(Uuid);

impl ProfileId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for ProfileId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ProfileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Health of a profile's broker connection as seen by the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionHealth {
    #[default]
    Unknown,
    Healthy,
    Degraded,
    Disconnected,
}

impl ConnectionHealth {
    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy)
    }
}

impl fmt::Display for ConnectionHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown => write!(f, "unknown"),
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded => write!(f, "degraded"),
            Self::Disconnected => write!(f, "disconnected"),
        }
    }
}

/// A tenant's broker account binding.
///
/// Credentials are stored encrypted and are opaque to the core; only the
/// broker adapter ever decrypts them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub id: ProfileId,
    /// Human-readable label, admin-chosen.
    pub name: String,
    /// Broker login reference (opaque).
    pub broker_login: String,
    /// Broker server reference (opaque).
    pub broker_server: String,
    /// Encrypted credential blob (opaque to the core).
    pub encrypted_credentials: String,
    /// Whether signal execution is enabled for this profile.
    pub trading_enabled: bool,
    pub created_at: DateTime<Utc>,
}

impl Profile {
    pub fn new(name: impl Into<String>, login: impl Into<String>, server: impl Into<String>) -> Self {
        Self {
            id: ProfileId::new(),
            name: name.into(),
            broker_login: login.into(),
            broker_server: server.into(),
            encrypted_credentials: String::new(),
            trading_enabled: true,
            created_at: Utc::now(),
        }
    }
}

/// Immutable view of a profile's state at a point in time.
///
/// The risk sizer is pure with respect to this snapshot: identical
/// `(signal, snapshot)` inputs must produce identical outputs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileSnapshot {
    pub profile_id: ProfileId,
    /// Whether the profile exists and trading is enabled.
    pub trading_enabled: bool,
    /// Broker connection health at snapshot time.
    pub connection: ConnectionHealth,
    /// Account equity.
    pub equity: Decimal,
    /// Highest equity observed (for drawdown).
    pub peak_equity: Decimal,
    /// Current peak-to-trough drawdown as a fraction in [0, 1].
    pub drawdown: Decimal,
    /// Open positions at snapshot time.
    pub open_positions: Vec<Position>,
    /// Rolling portfolio return series, oldest first.
    pub portfolio_returns: Vec<Decimal>,
    /// Rolling per-symbol return series, oldest first.
    pub symbol_returns: HashMap<Symbol, Vec<Decimal>>,
    /// Latest mark prices by symbol.
    pub marks: HashMap<Symbol, Price>,
    /// Signals admitted today (daily cap input).
    pub signals_today: u32,
    pub taken_at: DateTime<Utc>,
}

impl ProfileSnapshot {
    /// Sum of risk amounts over open positions (volume x stop distance).
    pub fn total_open_risk(&self) -> Decimal {
        self.open_positions.iter().map(|p| p.risk_amount()).sum()
    }

    /// Total open notional exposure at entry prices.
    pub fn total_notional(&self) -> Decimal {
        self.open_positions
            .iter()
            .map(|p| p.volume.notional(p.entry_price))
            .sum()
    }

    pub fn open_position_count(&self) -> usize {
        self.open_positions.len()
    }
}

/// An authenticated actor consumed by the emergency control surface.
///
/// Authentication and role management live outside the core; the gateway
/// only consumes the identity and the Owner capability bit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub id: String,
    pub owner_capable: bool,
}

impl Actor {
    pub fn new(id: impl Into<String>, owner_capable: bool) -> Self {
        Self {
            id: id.into(),
            owner_capable,
        }
    }

    pub fn owner(id: impl Into<String>) -> Self {
        Self::new(id, true)
    }
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id)
    }
}
