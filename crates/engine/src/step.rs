// SPDX-License-Identifier: Apache-2.0

//! The synchronous transform step.
//!
//! Variant pipelines are ordered lists of steps. A step receives one item
//! and appends zero or more outputs; it may keep state between calls
//! (rolling windows, sketches) and must expose that state for observation
//! and reset. Steps run on the variant's consumer loop and never yield.

use serde_json::Value;

/// One stage of a variant pipeline.
pub trait Step<P>: Send {
    /// A short stable name used in logs and state snapshots.
    fn name(&self) -> &'static str;

    /// Processes one item, appending outputs to `out`. Filtering emits
    /// nothing; aggregation may emit on a later call or on `flush`.
    fn process(&mut self, input: P, out: &mut Vec<P>);

    /// Called at the observation-window boundary; emits anything the step
    /// was holding back (e.g. aggregation buckets).
    fn flush(&mut self, _out: &mut Vec<P>) {}

    /// A JSON snapshot of internal state for diagnostics.
    fn snapshot_state(&self) -> Value {
        Value::Null
    }

    /// Discards accumulated state, keeping configuration.
    fn reset_state(&mut self) {}
}

/// Runs `input` through `steps` in order, fanning intermediate outputs into
/// the next step. `scratch` and `out` are caller-provided to keep the hot
/// path allocation-free; `out` holds the final outputs.
pub fn run_steps<P>(steps: &mut [Box<dyn Step<P>>], input: P, scratch: &mut Vec<P>, out: &mut Vec<P>) {
    out.clear();
    out.push(input);
    for step in steps.iter_mut() {
        scratch.clear();
        for item in out.drain(..) {
            step.process(item, scratch);
        }
        std::mem::swap(scratch, out);
    }
}

/// Flushes every step in order, running later steps over the flushed output
/// of earlier ones.
pub fn flush_steps<P>(steps: &mut [Box<dyn Step<P>>], scratch: &mut Vec<P>, out: &mut Vec<P>) {
    out.clear();
    for idx in 0..steps.len() {
        // Output flushed from step `idx` still traverses steps `idx+1..`.
        scratch.clear();
        steps[idx].flush(scratch);
        let mut carried: Vec<P> = scratch.drain(..).collect();
        for later in steps.iter_mut().skip(idx + 1) {
            let mut next = Vec::new();
            for item in carried.drain(..) {
                later.process(item, &mut next);
            }
            carried = next;
        }
        out.append(&mut carried);
    }
}
