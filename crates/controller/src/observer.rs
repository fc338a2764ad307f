// SPDX-License-Identifier: Apache-2.0

//! The Observer: per-pipeline KPI aggregation.
//!
//! Variants publish a [`VariantKpi`] snapshot at every observation-window
//! boundary (writer-side synchronization: the variant's consumer loop is
//! the only writer of its slot). The Observer samples the slots on its own
//! cadence, augments them with process CPU/RSS, and appends a
//! [`KpiSample`] per pipeline to a bounded history. The Controller pulls
//! from that history; the Observer never holds a Controller reference.

use parking_lot::Mutex;
use phoenix_pdata::PipelineLabel;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::SystemTime;
use tokio_util::sync::CancellationToken;

/// KPI snapshot a variant publishes at the observation boundary.
#[derive(Debug, Clone, Default)]
pub struct VariantKpi {
    /// Output cardinality estimate from the variant's HLL.
    pub cardinality_estimate: u64,
    /// Critical datapoints emitted in the window.
    pub critical_retained: u64,
    /// Critical datapoints that entered the variant in the window.
    pub critical_required: u64,
    /// Distinct input processes seen in the window.
    pub input_process_count: u64,
    /// Per-fingerprint critical emission counts for the window; feeds the
    /// signal preservation score.
    pub critical_emitted: HashMap<u64, u64>,
}

/// One Observer output sample.
#[derive(Debug, Clone, Serialize)]
pub struct KpiSample {
    /// The pipeline this sample describes.
    pub pipeline_label: PipelineLabel,
    /// Output cardinality estimate.
    pub cardinality_estimate: u64,
    /// Critical datapoints retained in the window.
    pub critical_retained_count: u64,
    /// Critical datapoints required in the window.
    pub critical_required_count: u64,
    /// Distinct input processes in the window.
    pub input_process_count: u64,
    /// Process CPU consumption, milliseconds per second.
    pub cpu_ms_per_sec: f64,
    /// Process resident set size in bytes.
    pub rss_bytes: u64,
    /// Sample wall-clock time, nanoseconds since the Unix epoch.
    pub sample_time_unix_nano: u64,
}

/// Slots the variants publish into. One writer per slot.
#[derive(Default)]
pub struct KpiRegistry {
    slots: [Mutex<Option<VariantKpi>>; 3],
}

fn slot_index(label: PipelineLabel) -> usize {
    match label {
        PipelineLabel::FullFidelity => 0,
        PipelineLabel::Optimized => 1,
        PipelineLabel::Experimental => 2,
    }
}

impl KpiRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Publishes a variant's window snapshot, replacing the previous one.
    pub fn publish(&self, label: PipelineLabel, kpi: VariantKpi) {
        *self.slots[slot_index(label)].lock() = Some(kpi);
    }

    /// Takes the latest snapshot for a pipeline, leaving the slot empty so
    /// a stalled variant is observable as a missing sample.
    #[must_use]
    pub fn take(&self, label: PipelineLabel) -> Option<VariantKpi> {
        self.slots[slot_index(label)].lock().take()
    }
}

/// Bounded per-pipeline KPI history plus derived signals.
#[derive(Default)]
pub struct ObserverState {
    histories: HashMap<PipelineLabel, VecDeque<KpiSample>>,
    history_len: usize,
    /// Monotonic count of observation ticks that produced fresh samples.
    /// The controller uses this to detect blindness.
    pub sample_seq: u64,
    /// Wall-clock time of the last observation tick, fresh or not. Health
    /// probes use this as the event-loop liveness signal.
    pub last_tick_unix_nano: u64,
    /// Latest signal preservation score, if computable.
    pub signal_preservation_score: Option<f64>,
}

/// Shared handle to the Observer's state.
pub type ObserverHandle = Arc<Mutex<ObserverState>>;

impl ObserverState {
    /// Creates state with the given bounded history length.
    #[must_use]
    pub fn new(history_len: usize) -> ObserverHandle {
        Arc::new(Mutex::new(Self {
            histories: HashMap::new(),
            history_len: history_len.max(1),
            sample_seq: 0,
            last_tick_unix_nano: 0,
            signal_preservation_score: None,
        }))
    }

    /// Appends a sample, evicting the oldest beyond the bound.
    pub fn push(&mut self, sample: KpiSample) {
        let history = self.histories.entry(sample.pipeline_label).or_default();
        if history.len() >= self.history_len {
            let _ = history.pop_front();
        }
        history.push_back(sample);
    }

    /// The most recent sample for a pipeline.
    #[must_use]
    pub fn latest(&self, label: PipelineLabel) -> Option<&KpiSample> {
        self.histories.get(&label).and_then(|h| h.back())
    }

    /// The full bounded history for a pipeline, oldest first.
    #[must_use]
    pub fn history(&self, label: PipelineLabel) -> Vec<KpiSample> {
        self.histories
            .get(&label)
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Cardinality growth rate in series/sec over the last `k` samples of a
    /// pipeline. Needs at least two samples spanning nonzero time.
    #[must_use]
    pub fn growth_rate(&self, label: PipelineLabel, k: usize) -> Option<f64> {
        let history = self.histories.get(&label)?;
        if history.len() < 2 {
            return None;
        }
        let take = k.max(2).min(history.len());
        let first = &history[history.len() - take];
        let last = history.back()?;
        let dt_nanos = last.sample_time_unix_nano.checked_sub(first.sample_time_unix_nano)?;
        if dt_nanos == 0 {
            return None;
        }
        let dc = last.cardinality_estimate as f64 - first.cardinality_estimate as f64;
        Some(dc / (dt_nanos as f64 / 1e9))
    }
}

fn unix_nanos_now() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

/// Computes the signal preservation score: the minimum, over critical
/// fingerprints required by the full pipeline, of the optimized/full
/// emission ratio. `None` when the full pipeline saw no critical points.
#[must_use]
pub fn signal_preservation_score(
    full: &HashMap<u64, u64>,
    optimized: &HashMap<u64, u64>,
) -> Option<f64> {
    if full.is_empty() {
        return None;
    }
    full.iter()
        .map(|(fingerprint, &full_count)| {
            let opt_count = optimized.get(fingerprint).copied().unwrap_or(0);
            if full_count == 0 {
                1.0
            } else {
                (opt_count as f64 / full_count as f64).min(1.0)
            }
        })
        .min_by(f64::total_cmp)
}

/// Runs the Observer until cancellation.
pub async fn run_observer(
    registry: Arc<KpiRegistry>,
    handle: ObserverHandle,
    settings: phoenix_config::ObserverSettings,
    metrics: phoenix_telemetry::MetricsHandle,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(settings.window);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let _ = interval.tick().await;

    let mut system = sysinfo::System::new();
    let pid = sysinfo::get_current_pid().ok();

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }

        let (cpu_ms_per_sec, rss_bytes) = sample_process(&mut system, pid);
        observe_once(&registry, &handle, &metrics, cpu_ms_per_sec, rss_bytes);
    }
}

fn sample_process(system: &mut sysinfo::System, pid: Option<sysinfo::Pid>) -> (f64, u64) {
    let rss_bytes = memory_stats::memory_stats()
        .map(|m| m.physical_mem as u64)
        .unwrap_or(0);
    let cpu_ms_per_sec = pid
        .map(|pid| {
            let _ = system.refresh_processes(sysinfo::ProcessesToUpdate::Some(&[pid]), true);
            system
                .process(pid)
                // cpu_usage() is a percentage of one core; 100% = 1000 ms/s.
                .map(|p| f64::from(p.cpu_usage()) * 10.0)
                .unwrap_or(0.0)
        })
        .unwrap_or(0.0);
    (cpu_ms_per_sec, rss_bytes)
}

/// One observation pass over the registry; factored out for tests.
pub fn observe_once(
    registry: &KpiRegistry,
    handle: &ObserverHandle,
    metrics: &phoenix_telemetry::MetricsHandle,
    cpu_ms_per_sec: f64,
    rss_bytes: u64,
) {
    let now = unix_nanos_now();
    let mut critical_maps: HashMap<PipelineLabel, HashMap<u64, u64>> = HashMap::new();
    let mut fresh = false;

    let mut state = handle.lock();
    state.last_tick_unix_nano = now;
    for label in PipelineLabel::ALL {
        let Some(kpi) = registry.take(label) else {
            continue;
        };
        fresh = true;
        metrics
            .cardinality_estimate
            .with_label_values(&[label.as_str()])
            .set(kpi.cardinality_estimate as i64);
        let _ = critical_maps.insert(label, kpi.critical_emitted.clone());
        state.push(KpiSample {
            pipeline_label: label,
            cardinality_estimate: kpi.cardinality_estimate,
            critical_retained_count: kpi.critical_retained,
            critical_required_count: kpi.critical_required,
            input_process_count: kpi.input_process_count,
            cpu_ms_per_sec,
            rss_bytes,
            sample_time_unix_nano: now,
        });
    }

    if fresh {
        state.sample_seq += 1;
    }

    if let (Some(full), Some(optimized)) = (
        critical_maps.get(&PipelineLabel::FullFidelity),
        critical_maps.get(&PipelineLabel::Optimized),
    ) {
        if let Some(score) = signal_preservation_score(full, optimized) {
            state.signal_preservation_score = Some(score);
            metrics.signal_preservation_score.set(score);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(label: PipelineLabel, cardinality: u64, t_secs: u64) -> KpiSample {
        KpiSample {
            pipeline_label: label,
            cardinality_estimate: cardinality,
            critical_retained_count: 0,
            critical_required_count: 0,
            input_process_count: 0,
            cpu_ms_per_sec: 0.0,
            rss_bytes: 0,
            sample_time_unix_nano: t_secs * 1_000_000_000,
        }
    }

    #[test]
    fn history_is_bounded() {
        let handle = ObserverState::new(3);
        let mut state = handle.lock();
        for i in 0..10 {
            state.push(sample(PipelineLabel::Optimized, i, i));
        }
        let history = state.history(PipelineLabel::Optimized);
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].cardinality_estimate, 7);
    }

    #[test]
    fn growth_rate_over_last_k_samples() {
        let handle = ObserverState::new(20);
        let mut state = handle.lock();
        // 1000 series added every 10 seconds: 100 series/sec.
        for i in 0..5u64 {
            state.push(sample(PipelineLabel::Optimized, 10_000 + i * 1_000, i * 10));
        }
        let rate = state
            .growth_rate(PipelineLabel::Optimized, 5)
            .expect("rate");
        assert!((rate - 100.0).abs() < 1e-9);
    }

    #[test]
    fn growth_rate_needs_two_samples() {
        let handle = ObserverState::new(20);
        let mut state = handle.lock();
        state.push(sample(PipelineLabel::Optimized, 10_000, 0));
        assert!(state.growth_rate(PipelineLabel::Optimized, 5).is_none());
    }

    #[test]
    fn preservation_score_is_min_ratio() {
        let full = HashMap::from([(1u64, 10u64), (2, 10), (3, 10)]);
        let optimized = HashMap::from([(1u64, 10u64), (2, 5), (3, 10)]);
        let score = signal_preservation_score(&full, &optimized).expect("score");
        assert!((score - 0.5).abs() < 1e-9);
    }

    #[test]
    fn preservation_score_missing_fingerprint_is_zero() {
        let full = HashMap::from([(1u64, 4u64)]);
        let optimized = HashMap::new();
        assert_eq!(signal_preservation_score(&full, &optimized), Some(0.0));
    }

    #[test]
    fn registry_take_leaves_slot_empty() {
        let registry = KpiRegistry::new();
        registry.publish(PipelineLabel::Optimized, VariantKpi::default());
        assert!(registry.take(PipelineLabel::Optimized).is_some());
        assert!(registry.take(PipelineLabel::Optimized).is_none());
    }
}
