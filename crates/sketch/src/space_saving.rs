// SPDX-License-Identifier: Apache-2.0

//! Weighted Space-Saving heavy-hitter sketch.
//!
//! Tracks at most `m` monitored fingerprints (`m >= k`, default `m = 10k`)
//! and answers "which `k` fingerprints carry the largest aggregate weight".
//! Every reported weight overestimates the true weight by at most the entry's
//! recorded `error`, itself bounded by `N / m` where `N` is the total
//! observed weight.
//!
//! Ties are broken by fingerprint order so that two runs over the same
//! stream always report the same Top-K set.

use std::collections::BTreeSet;
use std::collections::HashMap;

/// Default ratio between monitor capacity and `k`.
pub const DEFAULT_MONITOR_RATIO: usize = 10;

// Relative change of `k` above which accumulated state is discarded.
const RESET_RATIO: f64 = 0.2;

/// A reported heavy hitter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TopEntry {
    /// The series fingerprint.
    pub fingerprint: u64,
    /// Estimated aggregate weight (an overestimate).
    pub weight: f64,
    /// Maximum overestimation of `weight` for this entry.
    pub error: f64,
}

// f64 weights are non-negative here; total_cmp gives the required total order.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Weight(f64);

impl Eq for Weight {}

impl Ord for Weight {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.total_cmp(&other.0)
    }
}

impl PartialOrd for Weight {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Clone, Copy)]
struct Counter {
    weight: f64,
    error: f64,
}

/// The Space-Saving sketch.
#[derive(Debug)]
pub struct SpaceSaving {
    k: usize,
    capacity: usize,
    counters: HashMap<u64, Counter>,
    // Orders monitored entries by (weight, fingerprint) for O(log m) eviction.
    order: BTreeSet<(Weight, u64)>,
    total_weight: f64,
}

impl SpaceSaving {
    /// Creates a sketch reporting `k` entries with the default `10k` monitor
    /// capacity.
    #[must_use]
    pub fn new(k: usize) -> Self {
        Self::with_capacity(k, k.saturating_mul(DEFAULT_MONITOR_RATIO))
    }

    /// Creates a sketch reporting `k` entries out of `capacity` monitored
    /// ones. `capacity` is clamped to at least `k`.
    #[must_use]
    pub fn with_capacity(k: usize, capacity: usize) -> Self {
        let capacity = capacity.max(k).max(1);
        Self {
            k,
            capacity,
            counters: HashMap::with_capacity(capacity),
            order: BTreeSet::new(),
            total_weight: 0.0,
        }
    }

    /// Records `weight` for `fingerprint`.
    pub fn observe(&mut self, fingerprint: u64, weight: f64) {
        if !weight.is_finite() || weight < 0.0 {
            return;
        }
        self.total_weight += weight;

        if let Some(counter) = self.counters.get_mut(&fingerprint) {
            let _ = self.order.remove(&(Weight(counter.weight), fingerprint));
            counter.weight += weight;
            let _ = self.order.insert((Weight(counter.weight), fingerprint));
            return;
        }

        if self.counters.len() < self.capacity {
            let _ = self.counters.insert(
                fingerprint,
                Counter {
                    weight,
                    error: 0.0,
                },
            );
            let _ = self.order.insert((Weight(weight), fingerprint));
            return;
        }

        // Monitor full: replace the minimum-weight entry, charging its weight
        // as the new entry's error. The BTreeSet yields the smallest
        // fingerprint among equal weights, keeping eviction deterministic.
        let &(Weight(min_weight), evicted) = self
            .order
            .iter()
            .next()
            .expect("monitor is full, order cannot be empty");
        let _ = self.order.remove(&(Weight(min_weight), evicted));
        let _ = self.counters.remove(&evicted);

        let counter = Counter {
            weight: min_weight + weight,
            error: min_weight,
        };
        let _ = self.counters.insert(fingerprint, counter);
        let _ = self.order.insert((Weight(counter.weight), fingerprint));
    }

    /// Returns the current Top-K, heaviest first; ties by ascending
    /// fingerprint.
    #[must_use]
    pub fn top_k(&self) -> Vec<TopEntry> {
        let mut out: Vec<TopEntry> = self
            .order
            .iter()
            .rev()
            .take(self.k)
            .map(|&(Weight(weight), fingerprint)| {
                let error = self.counters[&fingerprint].error;
                TopEntry {
                    fingerprint,
                    weight,
                    error,
                }
            })
            .collect();
        // The reverse BTreeSet walk yields descending fingerprints within a
        // weight class; flip that to the documented ascending order.
        out.sort_by(|a, b| {
            b.weight
                .total_cmp(&a.weight)
                .then(a.fingerprint.cmp(&b.fingerprint))
        });
        out
    }

    /// Returns the fingerprints of the current Top-K.
    #[must_use]
    pub fn top_k_set(&self) -> std::collections::HashSet<u64> {
        self.top_k().into_iter().map(|e| e.fingerprint).collect()
    }

    /// True when `fingerprint` is currently monitored.
    #[must_use]
    pub fn is_monitored(&self, fingerprint: u64) -> bool {
        self.counters.contains_key(&fingerprint)
    }

    /// Guaranteed error bound `N / m` over everything observed so far.
    #[must_use]
    pub fn error_bound(&self) -> f64 {
        self.total_weight / self.capacity as f64
    }

    /// Total weight observed.
    #[must_use]
    pub fn total_weight(&self) -> f64 {
        self.total_weight
    }

    /// The configured `k`.
    #[must_use]
    pub fn k(&self) -> usize {
        self.k
    }

    /// Discards all accumulated state, keeping the configuration.
    pub fn reset(&mut self) {
        self.counters.clear();
        self.order.clear();
        self.total_weight = 0.0;
    }

    /// Adjusts `k`. State is kept across small adjustments and discarded
    /// (with a fresh `10k` monitor) when `k` moves by more than 20%.
    /// Returns true when the state was reset.
    pub fn resize(&mut self, k: usize) -> bool {
        if k == self.k {
            return false;
        }
        let relative = (k as f64 - self.k as f64).abs() / self.k.max(1) as f64;
        self.k = k;
        if relative > RESET_RATIO {
            self.capacity = k.saturating_mul(DEFAULT_MONITOR_RATIO).max(1);
            self.reset();
            true
        } else {
            false
        }
    }
}
