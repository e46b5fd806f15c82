//! The sizing pipeline.
//!
//! Steps run in a strict order; the first terminal failure vetoes.
//! Every decision carries a `SizingReport` with the inputs and the
//! per-step outcomes, which becomes the `risk.*` audit node payload.

use crate::correlation::pairwise_correlation;
use crate::cvar::CvarEngine;
use crate::drawdown::DrawdownLevel;
use crate::kelly::{kelly_fraction, volume_for_risk};
use exg_core::{ChainId, GatewayConfig, OrderIntent, ProfileSnapshot, Signal, Volume};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

/// Why the sizer vetoed a signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "predicate", rename_all = "snake_case")]
pub enum VetoReason {
    /// Non-positive Kelly edge.
    NoEdge,
    /// No positive size satisfies the CVaR bound.
    CvarBound,
    /// Per-trade or total risk headroom exhausted.
    RiskCap,
    /// Open position count at the profile cap.
    PositionCap { open: usize, max: u32 },
    /// Drawdown beyond the halt threshold; the pipeline raises the
    /// emergency state.
    DrawdownHalt { drawdown: Decimal },
    /// Candidate symbol too correlated with an open position.
    Correlated { symbol: String, rho: Decimal },
    /// Sized volume fell below the broker minimum.
    BelowMinimum,
}

impl fmt::Display for VetoReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoEdge => write!(f, "non-positive Kelly edge"),
            Self::CvarBound => write!(f, "no positive size within CVaR bound"),
            Self::RiskCap => write!(f, "risk headroom exhausted"),
            Self::PositionCap { open, max } => {
                write!(f, "position cap reached ({open}/{max})")
            }
            Self::DrawdownHalt { drawdown } => {
                write!(f, "drawdown {drawdown} beyond halt threshold")
            }
            Self::Correlated { symbol, rho } => {
                write!(f, "correlation with {symbol} is {rho}")
            }
            Self::BelowMinimum => write!(f, "sized volume below broker minimum"),
        }
    }
}

/// Structured account of one sizing run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SizingReport {
    pub kelly_fraction: Decimal,
    /// Volume implied by the Kelly risk amount before any reduction.
    pub requested_volume: Decimal,
    /// Volume after all reductions and caps.
    pub final_volume: Decimal,
    /// Amount at risk at the final volume.
    pub risk_amount: Decimal,
    pub drawdown_level: DrawdownLevel,
    /// Portfolio CVaR loss fraction when estimable.
    pub portfolio_cvar: Option<Decimal>,
    /// Human-readable step log.
    pub steps: Vec<String>,
}

/// Outcome of sizing one admitted signal.
#[derive(Debug, Clone)]
pub enum SizeDecision {
    /// Full Kelly-implied size survived every bound.
    Approved {
        intent: OrderIntent,
        report: SizingReport,
    },
    /// A bound reduced the size; the intent carries the final volume.
    Reduced {
        intent: OrderIntent,
        original_volume: Volume,
        report: SizingReport,
    },
    /// Vetoed. `raise_halt` asks the pipeline to escalate the emergency
    /// state (drawdown halt tier).
    Veto {
        reason: VetoReason,
        raise_halt: bool,
        report: SizingReport,
    },
}

/// Pure sizing engine: `(signal, snapshot) -> SizeDecision`.
pub struct RiskSizer {
    config: GatewayConfig,
    cvar: CvarEngine,
}

impl RiskSizer {
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            config,
            cvar: CvarEngine::default(),
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Size an admitted signal against a profile snapshot.
    pub fn size(&self, signal: &Signal, snapshot: &ProfileSnapshot, chain_id: ChainId) -> SizeDecision {
        let mut steps = Vec::new();
        let equity = snapshot.equity;
        let stop_distance = signal.stop_distance();
        let drawdown_level = DrawdownLevel::assess(snapshot.drawdown, &self.config);

        // Step 1: Kelly fraction from confidence and payoff ratio.
        let payoff = signal.payoff_ratio().unwrap_or(Decimal::ZERO);
        let fraction = kelly_fraction(signal.confidence, payoff, self.config.kelly_scale);
        steps.push(format!(
            "kelly: p={} b={} f={}",
            signal.confidence, payoff, fraction
        ));
        if fraction.is_zero() {
            return self.veto(VetoReason::NoEdge, false, fraction, Volume::ZERO, Volume::ZERO,
                drawdown_level, None, steps, stop_distance);
        }

        let kelly_risk = fraction * equity;
        let requested = volume_for_risk(
            kelly_risk,
            stop_distance,
            self.config.volume_step,
            self.config.min_volume,
            self.config.max_volume,
        );
        if requested.is_zero() {
            steps.push("kelly volume below broker minimum".to_string());
            return self.veto(VetoReason::BelowMinimum, false, fraction, requested, Volume::ZERO,
                drawdown_level, None, steps, stop_distance);
        }
        let mut volume = requested;

        // Step 2: CVaR bound on the portfolio with the proposed addition.
        let portfolio_cvar = self.cvar.cvar(&snapshot.portfolio_returns);
        if let Some(cvar) = portfolio_cvar {
            if !cvar.is_zero() {
                let budget = self.config.max_cvar_fraction * equity;
                let allowed_total = budget / cvar;
                let headroom = allowed_total - snapshot.total_notional();
                let candidate_notional = volume.notional(signal.entry_price);
                if candidate_notional > headroom {
                    if headroom <= Decimal::ZERO {
                        steps.push(format!("cvar: no headroom (cvar={cvar}, budget={budget})"));
                        return self.veto(VetoReason::CvarBound, false, fraction, requested,
                            Volume::ZERO, drawdown_level, portfolio_cvar, steps, stop_distance);
                    }
                    let reduced = Volume::new(headroom / signal.entry_price.inner())
                        .round_to_step(Volume::new(self.config.volume_step));
                    steps.push(format!(
                        "cvar: reduced volume {} -> {} (cvar={cvar})",
                        volume, reduced
                    ));
                    if reduced.inner() < self.config.min_volume {
                        return self.veto(VetoReason::CvarBound, false, fraction, requested,
                            Volume::ZERO, drawdown_level, portfolio_cvar, steps, stop_distance);
                    }
                    volume = reduced;
                } else {
                    steps.push(format!("cvar: within bound (cvar={cvar})"));
                }
            }
        } else {
            steps.push("cvar: insufficient history, bound not applied".to_string());
        }

        // Step 3: hard caps.
        if snapshot.open_position_count() >= self.config.max_positions as usize {
            steps.push("cap: position count at limit".to_string());
            return self.veto(
                VetoReason::PositionCap {
                    open: snapshot.open_position_count(),
                    max: self.config.max_positions,
                },
                false, fraction, requested, Volume::ZERO, drawdown_level, portfolio_cvar,
                steps, stop_distance,
            );
        }
        let per_trade_cap = self.config.max_risk_per_trade_fraction * equity;
        let total_cap = self.config.max_total_risk_fraction * equity;
        let total_headroom = total_cap - snapshot.total_open_risk();
        let risk_budget = per_trade_cap.min(total_headroom);
        if risk_budget <= Decimal::ZERO {
            steps.push("cap: no total-risk headroom".to_string());
            return self.veto(VetoReason::RiskCap, false, fraction, requested, Volume::ZERO,
                drawdown_level, portfolio_cvar, steps, stop_distance);
        }
        if volume.inner() * stop_distance > risk_budget {
            let capped = volume_for_risk(
                risk_budget,
                stop_distance,
                self.config.volume_step,
                self.config.min_volume,
                self.config.max_volume,
            );
            steps.push(format!("cap: risk-capped volume {} -> {}", volume, capped));
            if capped.is_zero() {
                return self.veto(VetoReason::RiskCap, false, fraction, requested, Volume::ZERO,
                    drawdown_level, portfolio_cvar, steps, stop_distance);
            }
            volume = capped;
        }

        // Step 4: drawdown policy.
        match drawdown_level {
            DrawdownLevel::Halt => {
                steps.push(format!("drawdown: {} >= halt threshold", snapshot.drawdown));
                return self.veto(
                    VetoReason::DrawdownHalt {
                        drawdown: snapshot.drawdown,
                    },
                    true, fraction, requested, Volume::ZERO, drawdown_level, portfolio_cvar,
                    steps, stop_distance,
                );
            }
            DrawdownLevel::Reduce => {
                let halved = Volume::new(volume.inner() / Decimal::from(2))
                    .round_to_step(Volume::new(self.config.volume_step));
                steps.push(format!("drawdown: halved volume {} -> {}", volume, halved));
                if halved.inner() < self.config.min_volume {
                    return self.veto(VetoReason::BelowMinimum, false, fraction, requested,
                        Volume::ZERO, drawdown_level, portfolio_cvar, steps, stop_distance);
                }
                volume = halved;
            }
            DrawdownLevel::Caution => {
                debug!(profile = %snapshot.profile_id, drawdown = %snapshot.drawdown,
                    "drawdown caution tier");
                steps.push(format!("drawdown: caution at {}", snapshot.drawdown));
            }
            DrawdownLevel::Normal => {}
        }

        // Step 5: correlation policy against each open position.
        let candidate_series = snapshot.symbol_returns.get(&signal.symbol);
        for position in &snapshot.open_positions {
            if position.symbol == signal.symbol {
                steps.push(format!("correlation: already exposed to {}", signal.symbol));
                return self.veto(
                    VetoReason::Correlated {
                        symbol: signal.symbol.to_string(),
                        rho: Decimal::ONE,
                    },
                    false, fraction, requested, Volume::ZERO, drawdown_level, portfolio_cvar,
                    steps, stop_distance,
                );
            }
            let Some(candidate) = candidate_series else {
                continue;
            };
            let Some(existing) = snapshot.symbol_returns.get(&position.symbol) else {
                continue;
            };
            if let Some(rho) = pairwise_correlation(candidate, existing) {
                if rho.abs() > self.config.max_correlation {
                    steps.push(format!(
                        "correlation: |rho({}, {})| = {} > {}",
                        signal.symbol,
                        position.symbol,
                        rho.abs(),
                        self.config.max_correlation
                    ));
                    return self.veto(
                        VetoReason::Correlated {
                            symbol: position.symbol.to_string(),
                            rho,
                        },
                        false, fraction, requested, Volume::ZERO, drawdown_level,
                        portfolio_cvar, steps, stop_distance,
                    );
                }
            }
        }

        // Step 6: exactly one of approved / reduced.
        let report = SizingReport {
            kelly_fraction: fraction,
            requested_volume: requested.inner(),
            final_volume: volume.inner(),
            risk_amount: volume.inner() * stop_distance,
            drawdown_level,
            portfolio_cvar,
            steps,
        };
        let intent = OrderIntent::from_signal(signal, volume, chain_id);
        if volume == requested {
            SizeDecision::Approved { intent, report }
        } else {
            SizeDecision::Reduced {
                intent,
                original_volume: requested,
                report,
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn veto(
        &self,
        reason: VetoReason,
        raise_halt: bool,
        kelly_fraction: Decimal,
        requested: Volume,
        final_volume: Volume,
        drawdown_level: DrawdownLevel,
        portfolio_cvar: Option<Decimal>,
        steps: Vec<String>,
        stop_distance: Decimal,
    ) -> SizeDecision {
        SizeDecision::Veto {
            reason,
            raise_halt,
            report: SizingReport {
                kelly_fraction,
                requested_volume: requested.inner(),
                final_volume: final_volume.inner(),
                risk_amount: final_volume.inner() * stop_distance,
                drawdown_level,
                portfolio_cvar,
                steps,
            },
        }
    }
}
