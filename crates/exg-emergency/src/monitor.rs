//! Market condition monitor.
//!
//! Consumes tick and equity observations and grades abnormal conditions
//! into triggers:
//!
//! | Trigger | Threshold |
//! |---|---|
//! | Flash crash | price drops >= `flash_crash_pct` within the window |
//! | Volatility spike | latest true range >= multiplier x 20-period ATR |
//! | Spread explosion | spread >= multiplier x 1-hour median |
//! | Drawdown breach | peak-to-trough >= halt threshold |
//!
//! After an automatic trigger fires the monitor goes quiet for the
//! cooldown window; the latched state itself stays until an authorized
//! restore.

use exg_core::{GatewayConfig, Price, ProfileId, Symbol};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use tracing::debug;

/// ATR lookback in observations.
const ATR_PERIOD: usize = 20;
/// Minimum spread observations before the median is trusted.
const MIN_SPREAD_SAMPLES: usize = 30;
/// Spread history horizon (1 hour).
const SPREAD_WINDOW_MS: i64 = 3_600_000;

/// A graded emergency trigger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "trigger", rename_all = "snake_case")]
pub enum TriggerKind {
    FlashCrash {
        symbol: Symbol,
        drop_pct: Decimal,
    },
    VolatilitySpike {
        symbol: Symbol,
        realized: Decimal,
        baseline: Decimal,
    },
    SpreadExplosion {
        symbol: Symbol,
        spread: Decimal,
        median: Decimal,
    },
    DrawdownBreach {
        profile_id: ProfileId,
        drawdown: Decimal,
    },
}

impl fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FlashCrash { symbol, drop_pct } => {
                write!(f, "flash crash on {symbol}: {drop_pct}% drop")
            }
            Self::VolatilitySpike {
                symbol,
                realized,
                baseline,
            } => write!(f, "volatility spike on {symbol}: {realized} vs ATR {baseline}"),
            Self::SpreadExplosion {
                symbol,
                spread,
                median,
            } => write!(f, "spread explosion on {symbol}: {spread} vs median {median}"),
            Self::DrawdownBreach {
                profile_id,
                drawdown,
            } => write!(f, "drawdown breach on {profile_id}: {drawdown}"),
        }
    }
}

struct SymbolHistory {
    /// (timestamp ms, mid price), bounded by the flash-crash window.
    prices: VecDeque<(i64, Price)>,
    /// (timestamp ms, spread), bounded by the 1-hour horizon.
    spreads: VecDeque<(i64, Decimal)>,
    /// Last `ATR_PERIOD` true ranges.
    true_ranges: VecDeque<Decimal>,
    last_mid: Option<Price>,
}

impl SymbolHistory {
    fn new() -> Self {
        Self {
            prices: VecDeque::new(),
            spreads: VecDeque::new(),
            true_ranges: VecDeque::new(),
            last_mid: None,
        }
    }
}

/// Stateful condition monitor. Single-writer: owned by the emergency
/// controller's worker.
pub struct MarketMonitor {
    flash_crash_pct: Decimal,
    flash_window_ms: i64,
    vol_multiplier: Decimal,
    spread_multiplier: Decimal,
    dd_kill_threshold: Decimal,
    cooldown_ms: i64,
    cooldown_until_ms: Option<i64>,
    histories: HashMap<Symbol, SymbolHistory>,
}

impl MarketMonitor {
    pub fn new(config: &GatewayConfig) -> Self {
        Self {
            flash_crash_pct: config.emergency_flash_crash_pct,
            flash_window_ms: (config.emergency_flash_crash_window_s * 1000) as i64,
            vol_multiplier: config.emergency_vol_multiplier,
            spread_multiplier: config.emergency_spread_multiplier,
            dd_kill_threshold: config.dd_halt_threshold,
            cooldown_ms: (config.emergency_cooldown_s * 1000) as i64,
            cooldown_until_ms: None,
            histories: HashMap::new(),
        }
    }

    fn in_cooldown(&self, now_ms: i64) -> bool {
        self.cooldown_until_ms.is_some_and(|until| now_ms < until)
    }

    /// Arm the cooldown after an automatic trigger fired.
    pub fn start_cooldown(&mut self, now_ms: i64) {
        self.cooldown_until_ms = Some(now_ms + self.cooldown_ms);
    }

    /// Feed one tick observation; returns a trigger when a threshold is
    /// breached and the monitor is not cooling down.
    pub fn observe_tick(
        &mut self,
        symbol: &Symbol,
        mid: Price,
        spread: Decimal,
        now_ms: i64,
    ) -> Option<TriggerKind> {
        let history = self
            .histories
            .entry(symbol.clone())
            .or_insert_with(SymbolHistory::new);

        // True range from the previous mid.
        if let Some(prev) = history.last_mid {
            let tr = mid.distance(prev);
            history.true_ranges.push_back(tr);
            while history.true_ranges.len() > ATR_PERIOD {
                history.true_ranges.pop_front();
            }
        }
        history.last_mid = Some(mid);

        // Price window for flash-crash detection.
        history.prices.push_back((now_ms, mid));
        let price_cutoff = now_ms - self.flash_window_ms;
        while history
            .prices
            .front()
            .is_some_and(|(ts, _)| *ts < price_cutoff)
        {
            history.prices.pop_front();
        }

        // Spread window for explosion detection.
        history.spreads.push_back((now_ms, spread));
        let spread_cutoff = now_ms - SPREAD_WINDOW_MS;
        while history
            .spreads
            .front()
            .is_some_and(|(ts, _)| *ts < spread_cutoff)
        {
            history.spreads.pop_front();
        }

        if self.cooldown_until_ms.is_some_and(|until| now_ms < until) {
            return None;
        }

        // 1. Flash crash: drop from the window high.
        let window_high = history
            .prices
            .iter()
            .map(|(_, p)| *p)
            .max()
            .unwrap_or(mid);
        if window_high.is_positive() {
            let drop_pct =
                (window_high.inner() - mid.inner()) / window_high.inner() * Decimal::from(100);
            if drop_pct >= self.flash_crash_pct {
                debug!(%symbol, %drop_pct, "flash crash threshold crossed");
                return Some(TriggerKind::FlashCrash {
                    symbol: symbol.clone(),
                    drop_pct,
                });
            }
        }

        // 2. Volatility spike: latest true range vs the ATR baseline.
        if history.true_ranges.len() >= ATR_PERIOD {
            let latest = *history.true_ranges.back().unwrap_or(&Decimal::ZERO);
            let sum: Decimal = history.true_ranges.iter().copied().sum();
            let baseline = sum / Decimal::from(history.true_ranges.len() as u64);
            if baseline > Decimal::ZERO && latest >= baseline * self.vol_multiplier {
                debug!(%symbol, %latest, %baseline, "volatility spike threshold crossed");
                return Some(TriggerKind::VolatilitySpike {
                    symbol: symbol.clone(),
                    realized: latest,
                    baseline,
                });
            }
        }

        // 3. Spread explosion vs the 1-hour median.
        if history.spreads.len() >= MIN_SPREAD_SAMPLES {
            let mut sorted: Vec<Decimal> = history.spreads.iter().map(|(_, s)| *s).collect();
            sorted.sort();
            let median = sorted[sorted.len() / 2];
            if median > Decimal::ZERO && spread >= median * self.spread_multiplier {
                debug!(%symbol, %spread, %median, "spread explosion threshold crossed");
                return Some(TriggerKind::SpreadExplosion {
                    symbol: symbol.clone(),
                    spread,
                    median,
                });
            }
        }

        None
    }

    /// Feed a drawdown observation for a profile.
    pub fn observe_drawdown(
        &mut self,
        profile_id: ProfileId,
        drawdown: Decimal,
        now_ms: i64,
    ) -> Option<TriggerKind> {
        if self.in_cooldown(now_ms) {
            return None;
        }
        if drawdown >= self.dd_kill_threshold {
            return Some(TriggerKind::DrawdownBreach {
                profile_id,
                drawdown,
            });
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn monitor() -> MarketMonitor {
        MarketMonitor::new(&GatewayConfig::default())
    }

    fn sym() -> Symbol {
        Symbol::from("EURUSD")
    }

    #[test]
    fn test_flash_crash_detected_within_window() {
        let mut m = monitor();
        let s = sym();
        m.observe_tick(&s, Price::new(dec!(100)), dec!(0.01), 0);
        m.observe_tick(&s, Price::new(dec!(99.5)), dec!(0.01), 10_000);
        // 2.5% below the window high at t=20s.
        let trigger = m.observe_tick(&s, Price::new(dec!(97.5)), dec!(0.01), 20_000);
        assert!(matches!(trigger, Some(TriggerKind::FlashCrash { .. })));
    }

    #[test]
    fn test_slow_decline_does_not_trigger() {
        let mut m = monitor();
        let s = sym();
        // 3% decline spread over 10 minutes: each 60s window sees < 2%.
        let mut price = dec!(100);
        for i in 0..40 {
            price -= dec!(0.075);
            let trigger = m.observe_tick(&s, Price::new(price), dec!(0.01), i * 15_000);
            assert!(trigger.is_none(), "tick {i} should not trigger");
        }
    }

    #[test]
    fn test_volatility_spike() {
        let mut m = monitor();
        let s = sym();
        // Alternate +-0.01 moves to build a calm ATR baseline.
        let mut price = dec!(100);
        for i in 0..25 {
            price = if i % 2 == 0 {
                price + dec!(0.01)
            } else {
                price - dec!(0.01)
            };
            m.observe_tick(&s, Price::new(price), dec!(0.001), i * 1000);
        }
        // A 1.9-point move is far beyond 3x the ~0.01 ATR, and stays under
        // the 2% flash threshold.
        let trigger = m.observe_tick(&s, Price::new(price - dec!(1.9)), dec!(0.001), 26_000);
        assert!(
            matches!(trigger, Some(TriggerKind::VolatilitySpike { .. })),
            "got {trigger:?}"
        );
    }

    #[test]
    fn test_spread_explosion() {
        let mut m = monitor();
        let s = sym();
        for i in 0..35 {
            m.observe_tick(&s, Price::new(dec!(100)), dec!(0.0002), i * 1000);
        }
        let trigger = m.observe_tick(&s, Price::new(dec!(100)), dec!(0.0030), 40_000);
        assert!(matches!(trigger, Some(TriggerKind::SpreadExplosion { .. })));
    }

    #[test]
    fn test_drawdown_breach() {
        let mut m = monitor();
        let profile = ProfileId::new();
        assert!(m.observe_drawdown(profile, dec!(0.10), 0).is_none());
        let trigger = m.observe_drawdown(profile, dec!(0.15), 0);
        assert!(matches!(trigger, Some(TriggerKind::DrawdownBreach { .. })));
    }

    #[test]
    fn test_cooldown_suppresses_retrigger() {
        let mut m = monitor();
        let s = sym();
        m.observe_tick(&s, Price::new(dec!(100)), dec!(0.01), 0);
        let trigger = m.observe_tick(&s, Price::new(dec!(97)), dec!(0.01), 1000);
        assert!(trigger.is_some());

        m.start_cooldown(1000);
        let again = m.observe_tick(&s, Price::new(dec!(94)), dec!(0.01), 2000);
        assert!(again.is_none(), "cooldown must suppress re-trigger");

        // After cooldown expires the monitor is live again.
        let t = 1000 + 1_800_000 + 1;
        m.observe_tick(&s, Price::new(dec!(100)), dec!(0.01), t);
        let late = m.observe_tick(&s, Price::new(dec!(95)), dec!(0.01), t + 1000);
        assert!(matches!(late, Some(TriggerKind::FlashCrash { .. })));
    }
}
