// SPDX-License-Identifier: Apache-2.0

//! Metric data model shared by every Phoenix pipeline.
//!
//! The model is deliberately flat: an OTLP request is converted once at the
//! intake boundary into a [`MetricBatch`] of [`MetricPoint`]s, each carrying a
//! pre-computed 64-bit fingerprint, a priority tag, and an optional
//! aggregation group. Everything downstream (classifier, variant steps,
//! sketches, sink) operates on this representation; the OTLP wire types only
//! reappear at the sink boundary.
//!
//! Within a single pipeline's output namespace the fingerprint uniquely
//! identifies a time series.

pub mod attributes;
pub mod fingerprint;
pub mod otlp;
pub mod point;

pub use attributes::{AttributeMap, AttributeValue};
pub use fingerprint::fingerprint_of;
pub use otlp::ConversionError;
pub use point::{MetricBatch, MetricPoint, PipelineLabel, PointValue, Priority};

/// Resource attribute holding the pipeline label on every emitted datapoint.
pub const PIPELINE_ATTR: &str = "phoenix.pipeline";

/// Attribute carrying the number of contributors folded into an aggregated point.
pub const AGG_COUNT_ATTR: &str = "phoenix.agg.count";

/// Attribute annotating a datapoint whose resource enrichment failed.
pub const RESOURCE_DETECTION_ERROR_ATTR: &str = "resource_detection_error";

/// Well-known resource attribute keys used by the classifier and enrichment.
pub mod keys {
    /// Stable host identifier.
    pub const HOST_ID: &str = "host.id";
    /// Process identifier.
    pub const PROCESS_PID: &str = "process.pid";
    /// Short executable name of the process.
    pub const PROCESS_EXECUTABLE_NAME: &str = "process.executable.name";
    /// Full command line of the process.
    pub const PROCESS_COMMAND_LINE: &str = "process.command_line";
}
