// SPDX-License-Identifier: Apache-2.0

//! The Phoenix pipeline nodes.
//!
//! Intake (OTLP gRPC receiver with memory guard, resource enrichment, and
//! cumulative-to-delta), the classifier, the three variant consumer loops
//! with their transform steps, and the OTLP sink exporter. Wiring lives in
//! [`pipeline`].

pub mod classifier;
pub mod delta;
pub mod enrich;
pub mod otlp_exporter;
pub mod otlp_receiver;
pub mod pipeline;
pub mod steps;
pub mod variant;

pub use classifier::Classifier;
pub use otlp_exporter::OtlpExporter;
pub use otlp_receiver::OtlpReceiver;
pub use variant::{LabeledBatch, VariantPipeline};
