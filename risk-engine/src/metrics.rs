//! Metrics collection for observability
//!
//! Each engine owns its own registry, so several engines (or tests) can live
//! in one process.
//!
//! # Metrics
//!
//! - `risk_evaluations_total{tier}` - Decisions returned, by tier
//! - `risk_degraded_signals_total{signal}` - Signals replaced by defaults
//! - `risk_evaluation_duration_seconds` - Histogram of evaluation latencies
//! - `risk_store_errors_total` - Evaluations failed by the profile/fingerprint store
//! - `risk_input_rejections_total` - Events rejected by validation

use crate::types::{RiskTier, SignalSource};
use crate::{Error, Result};
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};
use std::sync::Arc;

/// Metrics collector
#[derive(Clone)]
pub struct EngineMetrics {
    /// Decisions by tier
    pub evaluations_total: IntCounterVec,

    /// Degraded signals by source
    pub degraded_signals_total: IntCounterVec,

    /// Evaluation duration histogram
    pub evaluation_duration: Histogram,

    /// Store failures
    pub store_errors_total: IntCounter,

    /// Validation rejections
    pub input_rejections_total: IntCounter,

    /// Prometheus registry
    pub registry: Arc<Registry>,
}

impl EngineMetrics {
    /// Create new metrics collector
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let evaluations_total = IntCounterVec::new(
            Opts::new("risk_evaluations_total", "Decisions returned, by tier"),
            &["tier"],
        )?;
        registry.register(Box::new(evaluations_total.clone()))?;

        let degraded_signals_total = IntCounterVec::new(
            Opts::new(
                "risk_degraded_signals_total",
                "Signals replaced by their default contribution",
            ),
            &["signal"],
        )?;
        registry.register(Box::new(degraded_signals_total.clone()))?;

        let evaluation_duration = Histogram::with_opts(
            HistogramOpts::new(
                "risk_evaluation_duration_seconds",
                "Histogram of evaluation latencies",
            )
            .buckets(vec![0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.0]),
        )?;
        registry.register(Box::new(evaluation_duration.clone()))?;

        let store_errors_total = IntCounter::new(
            "risk_store_errors_total",
            "Evaluations failed by the profile or fingerprint store",
        )?;
        registry.register(Box::new(store_errors_total.clone()))?;

        let input_rejections_total = IntCounter::new(
            "risk_input_rejections_total",
            "Events rejected by validation",
        )?;
        registry.register(Box::new(input_rejections_total.clone()))?;

        Ok(Self {
            evaluations_total,
            degraded_signals_total,
            evaluation_duration,
            store_errors_total,
            input_rejections_total,
            registry,
        })
    }

    /// Record a returned decision
    pub fn record_decision(&self, tier: RiskTier, duration_secs: f64) {
        self.evaluations_total.with_label_values(&[tier.as_str()]).inc();
        self.evaluation_duration.observe(duration_secs);
    }

    /// Record a degraded signal
    pub fn record_degraded(&self, source: SignalSource) {
        self.degraded_signals_total
            .with_label_values(&[source.as_str()])
            .inc();
    }

    /// Render all series in the Prometheus text format
    pub fn render(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| Error::Serialization(format!("metrics encoding failed: {}", e)))?;
        String::from_utf8(buffer).map_err(|e| Error::Serialization(e.to_string()))
    }
}
