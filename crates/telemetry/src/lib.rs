// SPDX-License-Identifier: Apache-2.0

//! Self-metrics for the Phoenix control loop and pipelines.
//!
//! One [`Metrics`] instance is created at startup and shared by handle
//! everywhere. The `/metrics` admin endpoint renders the registry in
//! Prometheus text format. All metric names carry the `phoenix_` prefix.

use prometheus::{
    Encoder, Gauge, GaugeVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
    TextEncoder,
};
use std::sync::Arc;

/// A shared handle to the self-metrics registry.
pub type MetricsHandle = Arc<Metrics>;

/// Errors raised while building or rendering the registry.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A collector could not be registered or rendered.
    #[error("telemetry registry error: {0}")]
    Registry(#[from] prometheus::Error),
}

/// The Phoenix self-metrics registry.
pub struct Metrics {
    registry: Registry,

    /// Datapoints entering each pipeline variant.
    pub pipeline_input_points: IntCounterVec,
    /// Datapoints emitted by each pipeline variant.
    pub pipeline_output_points: IntCounterVec,
    /// Datapoints dropped by each pipeline variant, by reason.
    pub pipeline_dropped_points: IntCounterVec,
    /// Aggregated output datapoints per variant.
    pub pipeline_aggregated_points: IntCounterVec,
    /// HLL cardinality estimate per variant.
    pub cardinality_estimate: IntGaugeVec,
    /// Critical datapoints a variant would have dropped (fail-open events).
    pub critical_retention_violations: IntCounterVec,

    /// Ingested batches.
    pub intake_batches: IntCounter,
    /// Batches refused at intake, by reason.
    pub intake_rejected: IntCounterVec,
    /// Batches dropped on variant queue overflow, per variant.
    pub queue_overflow_drops: IntCounterVec,

    /// PID terms of the last controller decision (`p`, `i`, `d`, `u`).
    pub pid_terms: GaugeVec,
    /// Current optimization mode (0 conservative, 1 balanced, 2 aggressive).
    pub controller_mode: IntGauge,
    /// Mode transitions since start.
    pub mode_transitions: IntCounter,
    /// Ratio of stable cycles to total cycles over the last hour.
    pub stability_score: Gauge,
    /// Min over critical fingerprints of optimized/full emission ratio.
    pub signal_preservation_score: Gauge,
    /// 1 while the controller is blind (no fresh KPI samples).
    pub controller_blind: IntGauge,
    /// Control-file writes since start.
    pub control_file_writes: IntCounter,
    /// Control-file documents that failed to parse on read.
    pub control_file_read_failures: IntCounter,

    /// Batches currently queued for the sink.
    pub sink_queue_depth: IntGauge,
    /// Batches dropped on sink queue overflow.
    pub sink_queue_drops: IntCounter,
    /// Batches delivered to the sink.
    pub sink_sent_batches: IntCounter,
    /// Sink send failures, by kind (`transient`, `permanent`, `exhausted`).
    pub sink_send_failures: IntCounterVec,

    /// Accepted anomaly webhooks.
    pub webhook_accepted: IntCounter,
    /// Rate-limited anomaly webhooks.
    pub webhook_rate_limited: IntCounter,
}

fn counter(name: &str, help: &str) -> Result<IntCounter, prometheus::Error> {
    IntCounter::with_opts(Opts::new(name, help))
}

fn counter_vec(name: &str, help: &str, labels: &[&str]) -> Result<IntCounterVec, prometheus::Error> {
    IntCounterVec::new(Opts::new(name, help), labels)
}

fn gauge_vec(name: &str, help: &str, labels: &[&str]) -> Result<IntGaugeVec, prometheus::Error> {
    IntGaugeVec::new(Opts::new(name, help), labels)
}

impl Metrics {
    /// Builds the registry with every collector registered.
    pub fn new() -> Result<MetricsHandle, Error> {
        let registry = Registry::new();

        let pipeline_input_points = counter_vec(
            "phoenix_pipeline_input_points_total",
            "Datapoints entering each pipeline variant",
            &["pipeline"],
        )?;
        let pipeline_output_points = counter_vec(
            "phoenix_pipeline_output_points_total",
            "Datapoints emitted by each pipeline variant",
            &["pipeline"],
        )?;
        let pipeline_dropped_points = counter_vec(
            "phoenix_pipeline_dropped_points_total",
            "Datapoints dropped by each pipeline variant",
            &["pipeline", "reason"],
        )?;
        let pipeline_aggregated_points = counter_vec(
            "phoenix_pipeline_aggregated_points_total",
            "Aggregated output datapoints per pipeline variant",
            &["pipeline"],
        )?;
        let cardinality_estimate = gauge_vec(
            "phoenix_cardinality_estimate",
            "HLL output cardinality estimate per pipeline variant",
            &["pipeline"],
        )?;
        let critical_retention_violations = counter_vec(
            "phoenix_critical_retention_violations_total",
            "Critical datapoints a variant would have dropped",
            &["pipeline"],
        )?;
        let intake_batches = counter("phoenix_intake_batches_total", "Ingested OTLP batches")?;
        let intake_rejected = counter_vec(
            "phoenix_intake_rejected_total",
            "Batches refused at intake",
            &["reason"],
        )?;
        let queue_overflow_drops = counter_vec(
            "phoenix_queue_overflow_drops_total",
            "Batches dropped on variant queue overflow",
            &["pipeline"],
        )?;
        let pid_terms = GaugeVec::new(
            Opts::new("phoenix_pid_term", "PID terms of the last decision"),
            &["term"],
        )?;
        let controller_mode = IntGauge::with_opts(Opts::new(
            "phoenix_controller_mode",
            "Current optimization mode (0 conservative, 1 balanced, 2 aggressive)",
        ))?;
        let mode_transitions = counter(
            "phoenix_mode_transitions_total",
            "Optimization mode transitions",
        )?;
        let stability_score = Gauge::with_opts(Opts::new(
            "phoenix_stability_score",
            "Stable cycles over total cycles, one-hour window",
        ))?;
        let signal_preservation_score = Gauge::with_opts(Opts::new(
            "phoenix_signal_preservation_score",
            "Min over critical fingerprints of optimized/full emission ratio",
        ))?;
        let controller_blind = IntGauge::with_opts(Opts::new(
            "phoenix_controller_blind",
            "1 while the controller has no fresh KPI samples",
        ))?;
        let control_file_writes = counter(
            "phoenix_control_file_writes_total",
            "Control-file writes",
        )?;
        let control_file_read_failures = counter(
            "phoenix_control_file_read_failures_total",
            "Control-file read/parse failures",
        )?;
        let sink_queue_depth = IntGauge::with_opts(Opts::new(
            "phoenix_sink_queue_depth",
            "Batches queued for the sink",
        ))?;
        let sink_queue_drops = counter(
            "phoenix_sink_queue_drops_total",
            "Batches dropped on sink queue overflow",
        )?;
        let sink_sent_batches = counter(
            "phoenix_sink_sent_batches_total",
            "Batches delivered to the sink",
        )?;
        let sink_send_failures = counter_vec(
            "phoenix_sink_send_failures_total",
            "Sink send failures",
            &["kind"],
        )?;
        let webhook_accepted = counter(
            "phoenix_webhook_accepted_total",
            "Accepted anomaly webhooks",
        )?;
        let webhook_rate_limited = counter(
            "phoenix_webhook_rate_limited_total",
            "Rate-limited anomaly webhooks",
        )?;

        let metrics = Metrics {
            registry,
            pipeline_input_points,
            pipeline_output_points,
            pipeline_dropped_points,
            pipeline_aggregated_points,
            cardinality_estimate,
            critical_retention_violations,
            intake_batches,
            intake_rejected,
            queue_overflow_drops,
            pid_terms,
            controller_mode,
            mode_transitions,
            stability_score,
            signal_preservation_score,
            controller_blind,
            control_file_writes,
            control_file_read_failures,
            sink_queue_depth,
            sink_queue_drops,
            sink_sent_batches,
            sink_send_failures,
            webhook_accepted,
            webhook_rate_limited,
        };
        metrics.register_all()?;
        Ok(Arc::new(metrics))
    }

    fn register_all(&self) -> Result<(), prometheus::Error> {
        let r = &self.registry;
        r.register(Box::new(self.pipeline_input_points.clone()))?;
        r.register(Box::new(self.pipeline_output_points.clone()))?;
        r.register(Box::new(self.pipeline_dropped_points.clone()))?;
        r.register(Box::new(self.pipeline_aggregated_points.clone()))?;
        r.register(Box::new(self.cardinality_estimate.clone()))?;
        r.register(Box::new(self.critical_retention_violations.clone()))?;
        r.register(Box::new(self.intake_batches.clone()))?;
        r.register(Box::new(self.intake_rejected.clone()))?;
        r.register(Box::new(self.queue_overflow_drops.clone()))?;
        r.register(Box::new(self.pid_terms.clone()))?;
        r.register(Box::new(self.controller_mode.clone()))?;
        r.register(Box::new(self.mode_transitions.clone()))?;
        r.register(Box::new(self.stability_score.clone()))?;
        r.register(Box::new(self.signal_preservation_score.clone()))?;
        r.register(Box::new(self.controller_blind.clone()))?;
        r.register(Box::new(self.control_file_writes.clone()))?;
        r.register(Box::new(self.control_file_read_failures.clone()))?;
        r.register(Box::new(self.sink_queue_depth.clone()))?;
        r.register(Box::new(self.sink_queue_drops.clone()))?;
        r.register(Box::new(self.sink_sent_batches.clone()))?;
        r.register(Box::new(self.sink_send_failures.clone()))?;
        r.register(Box::new(self.webhook_accepted.clone()))?;
        r.register(Box::new(self.webhook_rate_limited.clone()))?;
        Ok(())
    }

    /// Renders the registry in Prometheus text exposition format.
    pub fn encode(&self) -> Result<String, Error> {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}
