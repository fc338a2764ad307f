// SPDX-License-Identifier: Apache-2.0

//! Metric points, batches, priorities, and pipeline labels.

use crate::attributes::AttributeMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Priority assigned to a datapoint by the classifier.
///
/// `Critical` datapoints are never dropped by any variant; they may be
/// aggregated only with other critical datapoints of the same fingerprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Must be retained by every variant.
    Critical,
    /// Retained by the optimized variant, Top-K gated by the experimental one.
    High,
    /// First candidate for filtering and aggregation.
    Low,
}

/// The pipeline variant that emitted a datapoint.
///
/// Exported as the resource attribute `phoenix.pipeline` on every outgoing
/// datapoint; each emitted point carries exactly one label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineLabel {
    /// Ground truth: no filtering, no aggregation.
    FullFidelity,
    /// Median filtering of low-priority points plus group aggregation.
    Optimized,
    /// Optimized plus a Top-K gate over high/low points.
    Experimental,
}

impl PipelineLabel {
    /// All labels, in fan-out order.
    pub const ALL: [PipelineLabel; 3] = [
        PipelineLabel::FullFidelity,
        PipelineLabel::Optimized,
        PipelineLabel::Experimental,
    ];

    /// The wire representation used for the `phoenix.pipeline` attribute.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            PipelineLabel::FullFidelity => "full_fidelity",
            PipelineLabel::Optimized => "optimized",
            PipelineLabel::Experimental => "experimental",
        }
    }
}

impl std::fmt::Display for PipelineLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The value payload of a metric point.
#[derive(Debug, Clone, PartialEq)]
pub enum PointValue {
    /// An instantaneous measurement.
    Gauge(f64),
    /// A sum, possibly monotonic and possibly cumulative.
    Sum {
        /// The sum value.
        value: f64,
        /// True when the sum only ever increases.
        monotonic: bool,
        /// True for cumulative temporality, false for delta.
        cumulative: bool,
    },
    /// A histogram, carried through without interpretation.
    Histogram {
        /// Total count of observations.
        count: u64,
        /// Sum of observations, when provided by the producer.
        sum: Option<f64>,
        /// Per-bucket observation counts (len = bounds.len() + 1).
        bucket_counts: Vec<u64>,
        /// Explicit bucket bounds.
        bounds: Vec<f64>,
    },
}

impl PointValue {
    /// A scalar magnitude used as the Top-K weight and for threshold
    /// comparisons. Histograms weigh by observation count.
    #[must_use]
    pub fn magnitude(&self) -> f64 {
        match self {
            PointValue::Gauge(v) => v.abs(),
            PointValue::Sum { value, .. } => value.abs(),
            PointValue::Histogram { count, .. } => *count as f64,
        }
    }
}

/// A single metric datapoint flowing through the pipelines.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricPoint {
    /// The metric name.
    pub metric: Arc<str>,
    /// Event time in nanoseconds since the Unix epoch.
    pub timestamp_unix_nano: u64,
    /// The value payload.
    pub value: PointValue,
    /// Datapoint-level attributes.
    pub attributes: AttributeMap,
    /// Stable 64-bit hash of metric name and attribute set, computed at intake.
    pub fingerprint: u64,
    /// Priority tag, recomputed at ingest by the classifier.
    pub priority: Priority,
    /// Aggregation group assigned by the classifier, if any.
    pub group: Option<Arc<str>>,
}

/// A batch of points sharing one set of resource attributes.
///
/// Intake owns the batch until fan-out; variants receive it behind an `Arc`
/// and must not mutate it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricBatch {
    /// Resource attributes common to every point in the batch.
    pub resource: AttributeMap,
    /// The datapoints.
    pub points: Vec<MetricPoint>,
}

impl MetricBatch {
    /// Creates an empty batch with the given resource attributes.
    #[must_use]
    pub fn new(resource: AttributeMap) -> Self {
        Self {
            resource,
            points: Vec::new(),
        }
    }

    /// Number of points in the batch.
    #[must_use]
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// Whether the batch carries no points.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}
