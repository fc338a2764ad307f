// SPDX-License-Identifier: Apache-2.0

//! Streaming sketches for the Phoenix pipelines.
//!
//! Both sketches are owned exclusively by their pipeline's consumer loop, so
//! none of the types here carry any synchronization. They are plain state
//! machines over `(fingerprint, weight)` and fingerprint streams.

pub mod hll;
pub mod space_saving;

pub use hll::{HyperLogLog, SlidingHyperLogLog};
pub use space_saving::{SpaceSaving, TopEntry};
