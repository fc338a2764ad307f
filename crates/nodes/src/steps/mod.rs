// SPDX-License-Identifier: Apache-2.0

//! Transform steps composed into the variant pipelines.
//!
//! Each step implements [`phoenix_engine::Step`] over [`MetricPoint`] and
//! owns its state exclusively; the variant consumer loop is the only
//! caller.

pub mod group_aggregate;
pub mod low_filter;
pub mod topk_gate;

pub use group_aggregate::GroupAggregator;
pub use low_filter::RollingMedianFilter;
pub use topk_gate::{ProfileCell, TopKGate};
