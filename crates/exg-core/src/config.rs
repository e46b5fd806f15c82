//! Typed gateway configuration.
//!
//! The recognized options are a closed set; unknown keys are a
//! deserialization error so that a typo in a risk threshold cannot
//! silently fall back to a default.

use crate::error::CoreError;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Gateway configuration record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GatewayConfig {
    /// Maximum concurrent open positions per profile.
    #[serde(default = "default_max_positions")]
    pub max_positions: u32,
    /// Maximum risk per trade as a fraction of equity.
    #[serde(default = "default_max_risk_per_trade_fraction")]
    pub max_risk_per_trade_fraction: Decimal,
    /// Maximum summed open risk as a fraction of equity.
    #[serde(default = "default_max_total_risk_fraction")]
    pub max_total_risk_fraction: Decimal,
    /// Maximum portfolio CVaR as a fraction of equity.
    #[serde(default = "default_max_cvar_fraction")]
    pub max_cvar_fraction: Decimal,
    /// Drawdown fraction that only logs a warning.
    #[serde(default = "default_dd_caution_threshold")]
    pub dd_caution_threshold: Decimal,
    /// Drawdown fraction at which sizes are halved.
    #[serde(default = "default_dd_reduce_threshold")]
    pub dd_reduce_threshold: Decimal,
    /// Drawdown fraction at which new intents are vetoed and trading halts.
    #[serde(default = "default_dd_halt_threshold")]
    pub dd_halt_threshold: Decimal,
    /// Kelly scaling factor applied to the raw fraction.
    #[serde(default = "default_kelly_scale")]
    pub kelly_scale: Decimal,
    /// Minimum signal confidence admitted by the gate.
    #[serde(default = "default_kelly_min_confidence")]
    pub kelly_min_confidence: Decimal,
    /// Maximum absolute pairwise correlation against open positions.
    #[serde(default = "default_max_correlation")]
    pub max_correlation: Decimal,
    /// Admissions per minute per (profile, producer).
    #[serde(default = "default_signal_rate_limit_per_minute")]
    pub signal_rate_limit_per_minute: u32,
    /// Admissions per minute across all profiles.
    #[serde(default = "default_global_signal_rate_limit")]
    pub global_signal_rate_limit: u32,
    /// Admissions per profile per UTC day.
    #[serde(default = "default_max_daily_signals")]
    pub max_daily_signals: u32,
    /// Global signal-to-execution budget in seconds.
    #[serde(default = "default_signal_timeout_s")]
    pub signal_timeout_s: u64,
    /// Broker session heartbeat interval in seconds.
    #[serde(default = "default_broker_heartbeat_s")]
    pub broker_heartbeat_s: u64,
    /// Pool acquire timeout in seconds.
    #[serde(default = "default_broker_acquire_timeout_s")]
    pub broker_acquire_timeout_s: u64,
    /// Per-call broker RPC timeout in seconds.
    #[serde(default = "default_broker_call_timeout_s")]
    pub broker_call_timeout_s: u64,
    /// Reconnect attempts before a session is left disconnected.
    #[serde(default = "default_broker_reconnect_max_attempts")]
    pub broker_reconnect_max_attempts: u32,
    /// Flash-crash trigger: percent move within the window.
    #[serde(default = "default_emergency_flash_crash_pct")]
    pub emergency_flash_crash_pct: Decimal,
    /// Flash-crash observation window in seconds.
    #[serde(default = "default_emergency_flash_crash_window_s")]
    pub emergency_flash_crash_window_s: u64,
    /// Volatility spike trigger: realized vol vs 20-period ATR.
    #[serde(default = "default_emergency_vol_multiplier")]
    pub emergency_vol_multiplier: Decimal,
    /// Spread explosion trigger: spread vs 1-hour median.
    #[serde(default = "default_emergency_spread_multiplier")]
    pub emergency_spread_multiplier: Decimal,
    /// Suppression window after an automatic trigger, in seconds.
    #[serde(default = "default_emergency_cooldown_s")]
    pub emergency_cooldown_s: u64,
    /// Per-profile executor queue depth before backpressure.
    #[serde(default = "default_executor_queue_high_water")]
    pub executor_queue_high_water: usize,
    /// Broker volume step for order rounding.
    #[serde(default = "default_volume_step")]
    pub volume_step: Decimal,
    /// Minimum broker volume.
    #[serde(default = "default_min_volume")]
    pub min_volume: Decimal,
    /// Maximum broker volume per order.
    #[serde(default = "default_max_volume")]
    pub max_volume: Decimal,
}

fn default_max_positions() -> u32 {
    2
}

fn default_max_risk_per_trade_fraction() -> Decimal {
    Decimal::new(1, 2) // 0.01
}

fn default_max_total_risk_fraction() -> Decimal {
    Decimal::new(5, 2) // 0.05
}

fn default_max_cvar_fraction() -> Decimal {
    Decimal::new(2, 2) // 0.02
}

fn default_dd_caution_threshold() -> Decimal {
    Decimal::new(5, 2) // 0.05
}

fn default_dd_reduce_threshold() -> Decimal {
    Decimal::new(10, 2) // 0.10
}

fn default_dd_halt_threshold() -> Decimal {
    Decimal::new(15, 2) // 0.15
}

fn default_kelly_scale() -> Decimal {
    Decimal::new(15, 2) // 0.15
}

fn default_kelly_min_confidence() -> Decimal {
    Decimal::new(55, 2) // 0.55
}

fn default_max_correlation() -> Decimal {
    Decimal::new(7, 1) // 0.7
}

fn default_signal_rate_limit_per_minute() -> u32 {
    10
}

fn default_global_signal_rate_limit() -> u32 {
    120
}

fn default_max_daily_signals() -> u32 {
    50
}

fn default_signal_timeout_s() -> u64 {
    30
}

fn default_broker_heartbeat_s() -> u64 {
    15
}

fn default_broker_acquire_timeout_s() -> u64 {
    5
}

fn default_broker_call_timeout_s() -> u64 {
    3
}

fn default_broker_reconnect_max_attempts() -> u32 {
    5
}

fn default_emergency_flash_crash_pct() -> Decimal {
    Decimal::from(2)
}

fn default_emergency_flash_crash_window_s() -> u64 {
    60
}

fn default_emergency_vol_multiplier() -> Decimal {
    Decimal::from(3)
}

fn default_emergency_spread_multiplier() -> Decimal {
    Decimal::from(10)
}

fn default_emergency_cooldown_s() -> u64 {
    1800
}

fn default_executor_queue_high_water() -> usize {
    32
}

fn default_volume_step() -> Decimal {
    Decimal::new(1, 2) // 0.01
}

fn default_min_volume() -> Decimal {
    Decimal::new(1, 2) // 0.01
}

fn default_max_volume() -> Decimal {
    Decimal::from(1_000_000)
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            max_positions: default_max_positions(),
            max_risk_per_trade_fraction: default_max_risk_per_trade_fraction(),
            max_total_risk_fraction: default_max_total_risk_fraction(),
            max_cvar_fraction: default_max_cvar_fraction(),
            dd_caution_threshold: default_dd_caution_threshold(),
            dd_reduce_threshold: default_dd_reduce_threshold(),
            dd_halt_threshold: default_dd_halt_threshold(),
            kelly_scale: default_kelly_scale(),
            kelly_min_confidence: default_kelly_min_confidence(),
            max_correlation: default_max_correlation(),
            signal_rate_limit_per_minute: default_signal_rate_limit_per_minute(),
            global_signal_rate_limit: default_global_signal_rate_limit(),
            max_daily_signals: default_max_daily_signals(),
            signal_timeout_s: default_signal_timeout_s(),
            broker_heartbeat_s: default_broker_heartbeat_s(),
            broker_acquire_timeout_s: default_broker_acquire_timeout_s(),
            broker_call_timeout_s: default_broker_call_timeout_s(),
            broker_reconnect_max_attempts: default_broker_reconnect_max_attempts(),
            emergency_flash_crash_pct: default_emergency_flash_crash_pct(),
            emergency_flash_crash_window_s: default_emergency_flash_crash_window_s(),
            emergency_vol_multiplier: default_emergency_vol_multiplier(),
            emergency_spread_multiplier: default_emergency_spread_multiplier(),
            emergency_cooldown_s: default_emergency_cooldown_s(),
            executor_queue_high_water: default_executor_queue_high_water(),
            volume_step: default_volume_step(),
            min_volume: default_min_volume(),
            max_volume: default_max_volume(),
        }
    }
}

impl GatewayConfig {
    /// Validate cross-field constraints.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.max_positions == 0 {
            return Err(CoreError::InvalidConfig(
                "max_positions must be positive".to_string(),
            ));
        }
        if self.dd_reduce_threshold >= self.dd_halt_threshold {
            return Err(CoreError::InvalidConfig(format!(
                "dd_reduce_threshold {} must be below dd_halt_threshold {}",
                self.dd_reduce_threshold, self.dd_halt_threshold
            )));
        }
        if self.max_risk_per_trade_fraction <= Decimal::ZERO
            || self.max_risk_per_trade_fraction > Decimal::ONE
        {
            return Err(CoreError::InvalidConfig(
                "max_risk_per_trade_fraction must be in (0, 1]".to_string(),
            ));
        }
        if self.kelly_min_confidence < Decimal::ZERO || self.kelly_min_confidence > Decimal::ONE {
            return Err(CoreError::InvalidConfig(
                "kelly_min_confidence must be in [0, 1]".to_string(),
            ));
        }
        if self.min_volume > self.max_volume {
            return Err(CoreError::InvalidConfig(
                "min_volume must not exceed max_volume".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_defaults_valid() {
        let config = GatewayConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_positions, 2);
        assert_eq!(config.kelly_scale, dec!(0.15));
        assert_eq!(config.signal_rate_limit_per_minute, 10);
    }

    #[test]
    fn test_validate_rejects_inverted_drawdown_tiers() {
        let config = GatewayConfig {
            dd_reduce_threshold: dec!(0.20),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unknown_key_rejected() {
        let empty: Result<GatewayConfig, _> = serde_json::from_str("{}");
        assert!(empty.is_ok(), "all fields default");

        let unknown: Result<GatewayConfig, _> =
            serde_json::from_str(r#"{"max_positions": 3, "mystery_knob": 1}"#);
        assert!(unknown.is_err(), "unknown keys must be rejected");
    }

    #[test]
    fn test_partial_config_merges_defaults() {
        let config: GatewayConfig =
            serde_json::from_str(r#"{"max_positions": 4, "kelly_scale": "0.25"}"#).unwrap();
        assert_eq!(config.max_positions, 4);
        assert_eq!(config.kelly_scale, dec!(0.25));
        assert_eq!(config.dd_halt_threshold, dec!(0.15));
    }
}
