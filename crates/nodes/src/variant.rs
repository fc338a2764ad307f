// SPDX-License-Identifier: Apache-2.0

//! The variant consumer loops.
//!
//! Each variant owns a single consumer task over its bounded input queue,
//! so every piece of hot-path state (steps, sketches, window counters) is
//! lock-free. A batch flows through the variant's ordered step chain; the
//! aggregation buckets are flushed at batch boundaries so aggregated
//! outputs inherit the batch resource. Window boundaries arrive as
//! `TimerTick` control messages: the variant publishes its KPI snapshot
//! (writer-side synchronization with the Observer) and rotates its HLL.
//!
//! The critical-retention invariant is enforced fail-open: a critical
//! datapoint missing from a batch's output is logged, counted, and emitted
//! unmodified.

use crate::steps::{GroupAggregator, ProfileCell, RollingMedianFilter, TopKGate};
use arc_swap::ArcSwap;
use phoenix_config::PipelineSettings;
use phoenix_controller::{ControlHandle, KpiRegistry, VariantKpi};
use phoenix_engine::step::{flush_steps, run_steps};
use phoenix_engine::{EffectHandler, Error, Message, MessageChannel, NodeControlMsg, Step};
use phoenix_pdata::{fingerprint_of, keys, MetricBatch, MetricPoint, PipelineLabel, Priority};
use phoenix_sketch::SlidingHyperLogLog;
use phoenix_telemetry::MetricsHandle;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// A processed batch stamped with its variant label, bound for the sink.
#[derive(Debug, Clone)]
pub struct LabeledBatch {
    /// The emitting pipeline.
    pub label: PipelineLabel,
    /// The processed points, sharing the input batch's resource.
    pub batch: MetricBatch,
}

/// One pipeline variant: an ordered step chain plus its accounting.
pub struct VariantPipeline {
    label: PipelineLabel,
    steps: Vec<Box<dyn Step<MetricPoint>>>,
    // One sliding sketch per emitted metric name. Fingerprints embed the
    // metric name, so the per-pipeline cardinality is the sum of the
    // per-metric estimates.
    hlls: HashMap<Arc<str>, SlidingHyperLogLog>,
    hll_precision: u8,
    control: ControlHandle,
    profile_cell: ProfileCell,
    reread_interval: u64,
    emissions_since_reread: u64,
    kpis: Arc<KpiRegistry>,
    metrics: MetricsHandle,
    sink: EffectHandler<LabeledBatch>,

    // Window state, reset at each observation boundary.
    critical_required: u64,
    critical_retained: u64,
    critical_emitted: HashMap<u64, u64>,
    input_processes: HashSet<u64>,

    scratch: Vec<MetricPoint>,
    outputs: Vec<MetricPoint>,
}

impl VariantPipeline {
    fn new(
        label: PipelineLabel,
        steps: Vec<Box<dyn Step<MetricPoint>>>,
        profile_cell: ProfileCell,
        settings: &PipelineSettings,
        control: ControlHandle,
        kpis: Arc<KpiRegistry>,
        metrics: MetricsHandle,
        sink: EffectHandler<LabeledBatch>,
    ) -> Self {
        Self {
            label,
            steps,
            hlls: HashMap::new(),
            hll_precision: settings.hll_precision,
            control,
            profile_cell,
            reread_interval: settings.control_reread_interval.max(1),
            emissions_since_reread: 0,
            kpis,
            metrics,
            sink,
            critical_required: 0,
            critical_retained: 0,
            critical_emitted: HashMap::new(),
            input_processes: HashSet::new(),
            scratch: Vec::new(),
            outputs: Vec::new(),
        }
    }

    /// The ground-truth variant: no filtering, no aggregation.
    #[must_use]
    pub fn full_fidelity(
        settings: &PipelineSettings,
        control: ControlHandle,
        kpis: Arc<KpiRegistry>,
        metrics: MetricsHandle,
        sink: EffectHandler<LabeledBatch>,
    ) -> Self {
        let profile_cell = profile_cell_from(&control);
        Self::new(
            PipelineLabel::FullFidelity,
            Vec::new(),
            profile_cell,
            settings,
            control,
            kpis,
            metrics,
            sink,
        )
    }

    /// Median filtering of low-priority points plus group aggregation.
    #[must_use]
    pub fn optimized(
        settings: &PipelineSettings,
        control: ControlHandle,
        kpis: Arc<KpiRegistry>,
        metrics: MetricsHandle,
        sink: EffectHandler<LabeledBatch>,
    ) -> Self {
        let label = PipelineLabel::Optimized;
        let profile_cell = profile_cell_from(&control);
        let steps: Vec<Box<dyn Step<MetricPoint>>> = vec![
            Box::new(RollingMedianFilter::new(
                settings.low_filter_window,
                label,
                metrics.clone(),
            )),
            Box::new(GroupAggregator::new(label, metrics.clone())),
        ];
        Self::new(
            label,
            steps,
            profile_cell,
            settings,
            control,
            kpis,
            metrics,
            sink,
        )
    }

    /// The optimized chain plus a profile-driven Top-K gate.
    #[must_use]
    pub fn experimental(
        settings: &PipelineSettings,
        control: ControlHandle,
        kpis: Arc<KpiRegistry>,
        metrics: MetricsHandle,
        sink: EffectHandler<LabeledBatch>,
    ) -> Self {
        let label = PipelineLabel::Experimental;
        let profile_cell = profile_cell_from(&control);
        let steps: Vec<Box<dyn Step<MetricPoint>>> = vec![
            Box::new(RollingMedianFilter::new(
                settings.low_filter_window,
                label,
                metrics.clone(),
            )),
            Box::new(TopKGate::new(
                settings.topk,
                profile_cell.clone(),
                label,
                metrics.clone(),
            )),
            Box::new(GroupAggregator::new(label, metrics.clone())),
        ];
        Self::new(
            label,
            steps,
            profile_cell,
            settings,
            control,
            kpis,
            metrics,
            sink,
        )
    }

    /// Runs the consumer loop until shutdown.
    pub async fn run(mut self, mut chan: MessageChannel<Arc<MetricBatch>>) -> Result<(), Error> {
        loop {
            match chan.recv().await? {
                Message::PData(batch) => self.process_batch(&batch).await?,
                Message::Control(NodeControlMsg::TimerTick {}) => self.on_window().await?,
                Message::Control(NodeControlMsg::Shutdown { deadline, reason }) => {
                    tracing::debug!(pipeline = %self.label, reason = %reason, "variant draining");
                    let (rest, left_behind) = chan.drain_pdata(deadline).await;
                    for batch in &rest {
                        self.process_batch(batch).await?;
                    }
                    if left_behind > 0 {
                        tracing::warn!(
                            pipeline = %self.label,
                            dropped_batches = left_behind,
                            "shutdown deadline reached with batches still queued"
                        );
                    }
                    self.on_window().await?;
                    break;
                }
            }
        }
        Ok(())
    }

    async fn process_batch(&mut self, batch: &MetricBatch) -> Result<(), Error> {
        self.metrics
            .pipeline_input_points
            .with_label_values(&[self.label.as_str()])
            .inc_by(batch.points.len() as u64);

        let snapshot = self.control.load();
        if self.label == PipelineLabel::Experimental && !snapshot.pipelines.experimental_enabled {
            self.metrics
                .pipeline_dropped_points
                .with_label_values(&[self.label.as_str(), "disabled"])
                .inc_by(batch.points.len() as u64);
            return Ok(());
        }
        drop(snapshot);

        // Input accounting and the critical set for the retention guard.
        let mut critical_inputs: Vec<MetricPoint> = Vec::new();
        for point in &batch.points {
            let _ = self.input_processes.insert(process_identity(point, batch));
            if point.priority == Priority::Critical {
                self.critical_required += 1;
                critical_inputs.push(point.clone());
            }
        }

        let mut emitted: Vec<MetricPoint> = Vec::with_capacity(batch.points.len());
        for point in &batch.points {
            run_steps(
                &mut self.steps,
                point.clone(),
                &mut self.scratch,
                &mut self.outputs,
            );
            emitted.append(&mut self.outputs);
        }
        // Batch boundary: flush aggregation buckets so the outputs inherit
        // this batch's resource.
        flush_steps(&mut self.steps, &mut self.scratch, &mut self.outputs);
        emitted.append(&mut self.outputs);

        for point in &mut emitted {
            if point.fingerprint == 0 {
                point.fingerprint =
                    fingerprint_of(&point.metric, &batch.resource, &point.attributes);
            }
        }

        self.enforce_critical_retention(&critical_inputs, &mut emitted);
        self.account_emissions(&emitted);

        if !emitted.is_empty() {
            self.sink
                .send_message(LabeledBatch {
                    label: self.label,
                    batch: MetricBatch {
                        resource: batch.resource.clone(),
                        points: emitted,
                    },
                })
                .await?;
        }
        self.maybe_reread_control();
        Ok(())
    }

    /// Fail-open guard: every critical input fingerprint must appear in the
    /// output. A missing one is logged, counted, and emitted unmodified.
    fn enforce_critical_retention(
        &mut self,
        critical_inputs: &[MetricPoint],
        emitted: &mut Vec<MetricPoint>,
    ) {
        if critical_inputs.is_empty() {
            return;
        }
        let emitted_fingerprints: HashSet<u64> = emitted
            .iter()
            .filter(|p| p.priority == Priority::Critical)
            .map(|p| p.fingerprint)
            .collect();
        for critical in critical_inputs {
            if !emitted_fingerprints.contains(&critical.fingerprint) {
                tracing::error!(
                    pipeline = %self.label,
                    metric = %critical.metric,
                    fingerprint = critical.fingerprint,
                    "critical datapoint would have been dropped, emitting unmodified"
                );
                self.metrics
                    .critical_retention_violations
                    .with_label_values(&[self.label.as_str()])
                    .inc();
                emitted.push(critical.clone());
            }
        }
    }

    fn account_emissions(&mut self, emitted: &[MetricPoint]) {
        self.metrics
            .pipeline_output_points
            .with_label_values(&[self.label.as_str()])
            .inc_by(emitted.len() as u64);
        let precision = self.hll_precision;
        for point in emitted {
            self.hlls
                .entry(point.metric.clone())
                .or_insert_with(|| SlidingHyperLogLog::new(precision))
                .insert(point.fingerprint);
            if point.priority == Priority::Critical {
                self.critical_retained += 1;
                *self.critical_emitted.entry(point.fingerprint).or_insert(0) += 1;
            }
        }
        self.emissions_since_reread += emitted.len() as u64;
    }

    /// Picks up profile changes without per-datapoint overhead: the control
    /// snapshot is re-read once every `reread_interval` emissions.
    fn maybe_reread_control(&mut self) {
        if self.emissions_since_reread < self.reread_interval {
            return;
        }
        self.emissions_since_reread = 0;
        let snapshot = self.control.load();
        let profile = snapshot.optimization_profile;
        if **self.profile_cell.load() != profile {
            tracing::info!(pipeline = %self.label, profile = %profile, "profile changed");
            self.profile_cell.store(Arc::new(profile));
        }
    }

    /// Observation-window boundary: flush, publish KPIs, rotate the HLL.
    async fn on_window(&mut self) -> Result<(), Error> {
        flush_steps(&mut self.steps, &mut self.scratch, &mut self.outputs);
        if !self.outputs.is_empty() {
            let mut points: Vec<MetricPoint> = self.outputs.drain(..).collect();
            let no_resource = phoenix_pdata::AttributeMap::new();
            for point in &mut points {
                if point.fingerprint == 0 {
                    point.fingerprint =
                        fingerprint_of(&point.metric, &no_resource, &point.attributes);
                }
            }
            self.account_emissions(&points);
            self.sink
                .send_message(LabeledBatch {
                    label: self.label,
                    batch: MetricBatch {
                        resource: Default::default(),
                        points,
                    },
                })
                .await?;
        }

        let cardinality_estimate: u64 = self.hlls.values().map(SlidingHyperLogLog::estimate).sum();
        self.kpis.publish(
            self.label,
            VariantKpi {
                cardinality_estimate,
                critical_retained: self.critical_retained,
                critical_required: self.critical_required,
                input_process_count: self.input_processes.len() as u64,
                critical_emitted: std::mem::take(&mut self.critical_emitted),
            },
        );

        self.critical_required = 0;
        self.critical_retained = 0;
        self.input_processes.clear();
        for hll in self.hlls.values_mut() {
            hll.rotate();
        }
        // The latest profile applies from the next window even under low
        // emission volume.
        self.emissions_since_reread = self.reread_interval;
        self.maybe_reread_control();
        Ok(())
    }
}

fn profile_cell_from(control: &ControlHandle) -> ProfileCell {
    Arc::new(ArcSwap::from_pointee(control.load().optimization_profile))
}

/// A cheap identity hash for "distinct input processes": host id plus pid.
fn process_identity(point: &MetricPoint, batch: &MetricBatch) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    batch.resource.get_str(keys::HOST_ID).hash(&mut hasher);
    match point
        .attributes
        .get(keys::PROCESS_PID)
        .or_else(|| batch.resource.get(keys::PROCESS_PID))
    {
        Some(pid) => format!("{pid:?}").hash(&mut hasher),
        None => point
            .attributes
            .get_str(keys::PROCESS_EXECUTABLE_NAME)
            .hash(&mut hasher),
    }
    hasher.finish()
}
