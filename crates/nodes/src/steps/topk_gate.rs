// SPDX-License-Identifier: Apache-2.0

//! The Top-K gate of the experimental variant.
//!
//! Tracks the heaviest high/low series with a Space-Saving sketch and
//! passes only the current Top-K; other datapoints are dropped unless
//! their classifier group is set, in which case they continue downstream
//! for aggregation. `Critical` datapoints always pass. `k` follows the
//! active optimization profile and the sketch keeps its state across small
//! `k` adjustments (a change above 20% resets it).

use arc_swap::ArcSwap;
use phoenix_engine::Step;
use phoenix_pdata::{MetricPoint, PipelineLabel, Priority};
use phoenix_sketch::SpaceSaving;
use phoenix_telemetry::MetricsHandle;
use phoenix_controller::OptimizationProfile;
use phoenix_config::TopKSettings;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;

/// Shared cell carrying the active profile into the hot path.
pub type ProfileCell = Arc<ArcSwap<OptimizationProfile>>;

// Cached Top-K set staleness, in observations.
const SET_REFRESH_EVERY: u64 = 64;

/// The Top-K gating step.
pub struct TopKGate {
    settings: TopKSettings,
    profile_cell: ProfileCell,
    active_profile: OptimizationProfile,
    sketch: SpaceSaving,
    cached_set: HashSet<u64>,
    observations_since_refresh: u64,
    label: PipelineLabel,
    metrics: MetricsHandle,
}

impl TopKGate {
    /// Creates the gate for the profile currently in the cell.
    #[must_use]
    pub fn new(
        settings: TopKSettings,
        profile_cell: ProfileCell,
        label: PipelineLabel,
        metrics: MetricsHandle,
    ) -> Self {
        let active_profile = **profile_cell.load();
        let k = k_for(&settings, active_profile);
        Self {
            settings,
            profile_cell,
            active_profile,
            sketch: SpaceSaving::with_capacity(k, k * settings.monitor_ratio),
            cached_set: HashSet::new(),
            observations_since_refresh: 0,
            label,
            metrics,
        }
    }

    /// The `k` currently in force.
    #[must_use]
    pub fn k(&self) -> usize {
        self.sketch.k()
    }

    fn sync_profile(&mut self) {
        let profile = **self.profile_cell.load();
        if profile != self.active_profile {
            self.active_profile = profile;
            let reset = self.sketch.resize(k_for(&self.settings, profile));
            if reset {
                tracing::debug!(
                    pipeline = %self.label,
                    k = self.sketch.k(),
                    "top-k sketch reset after profile change"
                );
            }
            self.refresh_set();
        }
    }

    fn refresh_set(&mut self) {
        self.cached_set = self.sketch.top_k_set();
        self.observations_since_refresh = 0;
    }
}

fn k_for(settings: &TopKSettings, profile: OptimizationProfile) -> usize {
    match profile {
        OptimizationProfile::Conservative => settings.conservative_k,
        OptimizationProfile::Balanced => settings.balanced_k,
        OptimizationProfile::Aggressive => settings.aggressive_k,
    }
}

impl Step<MetricPoint> for TopKGate {
    fn name(&self) -> &'static str {
        "topk_gate"
    }

    fn process(&mut self, mut input: MetricPoint, out: &mut Vec<MetricPoint>) {
        if input.priority == Priority::Critical {
            out.push(input);
            return;
        }
        self.sync_profile();

        self.sketch
            .observe(input.fingerprint, input.value.magnitude());
        self.observations_since_refresh += 1;
        if self.observations_since_refresh >= SET_REFRESH_EVERY {
            self.refresh_set();
        }

        if self.cached_set.contains(&input.fingerprint) {
            // A Top-K survivor is retained as an individual series.
            input.group = None;
            out.push(input);
        } else if input.group.is_some() {
            // Not a heavy hitter, but groupable: leave it for aggregation.
            out.push(input);
        } else {
            self.metrics
                .pipeline_dropped_points
                .with_label_values(&[self.label.as_str(), "not_topk"])
                .inc();
        }
    }

    fn flush(&mut self, _out: &mut Vec<MetricPoint>) {
        // Window boundary: refresh the survivor set so the next window
        // starts from the latest weights.
        self.refresh_set();
    }

    fn snapshot_state(&self) -> Value {
        json!({
            "k": self.sketch.k(),
            "profile": self.active_profile.as_str(),
            "total_weight": self.sketch.total_weight(),
            "error_bound": self.sketch.error_bound(),
        })
    }

    fn reset_state(&mut self) {
        self.sketch.reset();
        self.cached_set.clear();
        self.observations_since_refresh = 0;
    }
}
