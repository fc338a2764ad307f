// SPDX-License-Identifier: Apache-2.0

//! Rolling-median filter for low-priority datapoints.
//!
//! Keeps a per-metric rolling window of low-priority magnitudes and drops
//! a `Low` datapoint whose value sits below the window's median. `Critical`
//! and `High` datapoints always pass. The filter stays open until a metric
//! has collected a minimum number of samples, so sparse metrics are not
//! filtered on startup noise.

use phoenix_engine::Step;
use phoenix_pdata::{MetricPoint, PipelineLabel, Priority};
use phoenix_telemetry::MetricsHandle;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

// Below this many window samples the filter passes everything.
const MIN_SAMPLES: usize = 10;
// Cached median staleness, in inserts.
const MEDIAN_REFRESH_EVERY: u32 = 32;

#[derive(Default)]
struct MetricWindow {
    samples: VecDeque<(Instant, f64)>,
    cached_median: f64,
    inserts_since_refresh: u32,
}

impl MetricWindow {
    fn observe(&mut self, now: Instant, window: Duration, magnitude: f64) {
        while let Some((t, _)) = self.samples.front() {
            if now.duration_since(*t) > window {
                let _ = self.samples.pop_front();
            } else {
                break;
            }
        }
        self.samples.push_back((now, magnitude));
        self.inserts_since_refresh += 1;
        if self.inserts_since_refresh >= MEDIAN_REFRESH_EVERY || self.samples.len() <= MIN_SAMPLES
        {
            self.refresh_median();
        }
    }

    fn refresh_median(&mut self) {
        self.inserts_since_refresh = 0;
        if self.samples.is_empty() {
            self.cached_median = 0.0;
            return;
        }
        let mut sorted: Vec<f64> = self.samples.iter().map(|(_, m)| *m).collect();
        sorted.sort_by(f64::total_cmp);
        let mid = sorted.len() / 2;
        self.cached_median = if sorted.len() % 2 == 0 {
            (sorted[mid - 1] + sorted[mid]) / 2.0
        } else {
            sorted[mid]
        };
    }
}

/// The rolling-median low-priority filter.
pub struct RollingMedianFilter {
    window: Duration,
    label: PipelineLabel,
    metrics: MetricsHandle,
    windows: HashMap<Arc<str>, MetricWindow>,
}

impl RollingMedianFilter {
    /// Creates the filter with the given rolling window.
    #[must_use]
    pub fn new(window: Duration, label: PipelineLabel, metrics: MetricsHandle) -> Self {
        Self {
            window,
            label,
            metrics,
            windows: HashMap::new(),
        }
    }

    fn should_drop(&mut self, point: &MetricPoint, now: Instant) -> bool {
        let magnitude = point.value.magnitude();
        let window = self
            .windows
            .entry(point.metric.clone())
            .or_default();
        window.observe(now, self.window, magnitude);
        window.samples.len() >= MIN_SAMPLES && magnitude < window.cached_median
    }
}

impl Step<MetricPoint> for RollingMedianFilter {
    fn name(&self) -> &'static str {
        "low_median_filter"
    }

    fn process(&mut self, input: MetricPoint, out: &mut Vec<MetricPoint>) {
        if input.priority != Priority::Low {
            out.push(input);
            return;
        }
        if self.should_drop(&input, Instant::now()) {
            self.metrics
                .pipeline_dropped_points
                .with_label_values(&[self.label.as_str(), "below_median"])
                .inc();
        } else {
            out.push(input);
        }
    }

    fn snapshot_state(&self) -> Value {
        json!({
            "tracked_metrics": self.windows.len(),
            "window_secs": self.window.as_secs(),
        })
    }

    fn reset_state(&mut self) {
        self.windows.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use phoenix_pdata::{AttributeMap, PointValue};

    fn low_point(metric: &str, value: f64) -> MetricPoint {
        MetricPoint {
            metric: Arc::from(metric),
            timestamp_unix_nano: 0,
            value: PointValue::Gauge(value),
            attributes: AttributeMap::new(),
            fingerprint: value.to_bits(),
            priority: Priority::Low,
            group: None,
        }
    }

    fn filter() -> RollingMedianFilter {
        RollingMedianFilter::new(
            Duration::from_secs(60),
            PipelineLabel::Optimized,
            phoenix_telemetry::Metrics::new().expect("metrics"),
        )
    }

    #[test]
    fn passes_everything_until_warm() {
        let mut f = filter();
        let mut out = Vec::new();
        for i in 0..MIN_SAMPLES - 1 {
            f.process(low_point("m", i as f64), &mut out);
        }
        assert_eq!(out.len(), MIN_SAMPLES - 1);
    }

    #[test]
    fn drops_below_median_once_warm() {
        let mut f = filter();
        let mut out = Vec::new();
        // Warm the window with values 0..20.
        for i in 0..20 {
            f.process(low_point("m", f64::from(i)), &mut out);
        }
        out.clear();

        // A value far below the window median is dropped...
        f.process(low_point("m", 0.1), &mut out);
        assert!(out.is_empty(), "below-median value must be dropped");

        // ...and a large one passes.
        f.process(low_point("m", 50.0), &mut out);
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn high_and_critical_always_pass() {
        let mut f = filter();
        let mut out = Vec::new();
        for i in 0..30 {
            f.process(low_point("m", f64::from(i)), &mut out);
        }
        out.clear();

        let mut p = low_point("m", 0.0);
        p.priority = Priority::Critical;
        f.process(p, &mut out);
        let mut p = low_point("m", 0.0);
        p.priority = Priority::High;
        f.process(p, &mut out);
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn windows_are_per_metric() {
        let mut f = filter();
        let mut out = Vec::new();
        for i in 0..20 {
            f.process(low_point("busy", f64::from(i) + 100.0), &mut out);
        }
        out.clear();

        // A fresh metric is unwarmed; small values still pass.
        f.process(low_point("fresh", 0.01), &mut out);
        assert_eq!(out.len(), 1);
    }
}
