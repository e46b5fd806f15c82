//! Emergency controls.
//!
//! A single latched state cell (`normal | hedged | halted | killed`), a
//! market monitor that grades abnormal conditions into triggers, and a
//! controller that turns triggers into broker actions: counter-hedges,
//! order cancellation, full liquidation. The bot prioritizes stopping
//! over trading when in doubt.

pub mod controller;
pub mod error;
pub mod monitor;
pub mod state;

pub use controller::EmergencyController;
pub use error::{EmergencyError, EmergencyResult};
pub use monitor::{MarketMonitor, TriggerKind};
pub use state::{Activation, EmergencyCell, EmergencyState};
