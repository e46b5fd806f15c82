//! Prometheus metrics for the gateway.
//!
//! # Panics
//!
//! Metric registration uses `unwrap()` intentionally. A registration
//! failure means duplicate metric names, a fatal configuration error
//! that should crash at startup rather than fail silently. These panics
//! only occur during static initialization, never at runtime.

use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_gauge_vec, register_histogram_vec, register_int_gauge,
    CounterVec, GaugeVec, HistogramVec, IntGauge,
};

/// Signals by gate decision.
/// Labels: decision (admitted/duplicate/rate_limited/rejected/blocked)
pub static SIGNALS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "exg_signals_total",
        "Signals by gate decision",
        &["decision"]
    )
    .unwrap()
});

/// Risk sizer outcomes.
/// Labels: outcome (approved/reduced/rejected)
pub static SIZER_OUTCOMES_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "exg_sizer_outcomes_total",
        "Risk sizer outcomes",
        &["outcome"]
    )
    .unwrap()
});

/// Broker submit attempts by result.
/// Labels: result (filled/transient/rejected/market_closed/reconciled)
pub static BROKER_SUBMITS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "exg_broker_submits_total",
        "Broker submit attempts by result",
        &["result"]
    )
    .unwrap()
});

/// Emergency activations by resulting state.
pub static EMERGENCY_ACTIVATIONS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "exg_emergency_activations_total",
        "Emergency activations by resulting state",
        &["state"]
    )
    .unwrap()
});

/// Signal-to-terminal latency in milliseconds.
pub static PIPELINE_LATENCY_MS: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "exg_pipeline_latency_ms",
        "Signal-to-terminal-decision latency in milliseconds",
        &["outcome"],
        vec![1.0, 5.0, 10.0, 50.0, 100.0, 500.0, 1000.0, 5000.0, 30000.0]
    )
    .unwrap()
});

/// Open positions per profile.
pub static OPEN_POSITIONS: Lazy<GaugeVec> = Lazy::new(|| {
    register_gauge_vec!(
        "exg_open_positions",
        "Open positions per profile",
        &["profile"]
    )
    .unwrap()
});

/// Registered profile workers.
pub static ACTIVE_WORKERS: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!("exg_active_workers", "Registered profile workers").unwrap()
});

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_register_once() {
        SIGNALS_TOTAL.with_label_values(&["admitted"]).inc();
        SIZER_OUTCOMES_TOTAL.with_label_values(&["approved"]).inc();
        PIPELINE_LATENCY_MS
            .with_label_values(&["executed"])
            .observe(12.0);
        ACTIVE_WORKERS.set(1);
        assert!(SIGNALS_TOTAL.with_label_values(&["admitted"]).get() >= 1.0);
    }
}
