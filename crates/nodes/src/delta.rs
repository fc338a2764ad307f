// SPDX-License-Identifier: Apache-2.0

//! Cumulative-to-delta conversion for monotonic sums.
//!
//! Keeps a per-fingerprint last-value map. The first observation of a
//! series establishes the baseline and emits nothing; a value below the
//! baseline means the counter reset, which re-baselines and also emits
//! nothing. Entries idle past the staleness timeout expire without
//! emission.

use phoenix_pdata::{MetricPoint, PointValue};
use std::collections::HashMap;
use std::time::{Duration, Instant};

struct LastValue {
    value: f64,
    last_seen: Instant,
}

/// The cumulative-to-delta converter.
pub struct DeltaConverter {
    staleness: Duration,
    last_values: HashMap<u64, LastValue>,
    last_sweep: Instant,
}

impl DeltaConverter {
    /// Creates a converter with the given staleness timeout.
    #[must_use]
    pub fn new(staleness: Duration) -> Self {
        Self {
            staleness,
            last_values: HashMap::new(),
            last_sweep: Instant::now(),
        }
    }

    /// Converts `point` in place when it is a monotonic cumulative sum.
    /// Returns false when the point must not be emitted (baseline or
    /// reset).
    pub fn convert(&mut self, point: &mut MetricPoint, now: Instant) -> bool {
        self.maybe_sweep(now);

        let PointValue::Sum {
            value,
            monotonic: true,
            cumulative: true,
        } = point.value
        else {
            return true;
        };

        let entry = self.last_values.entry(point.fingerprint);
        let emit = match entry {
            std::collections::hash_map::Entry::Occupied(mut occupied) => {
                let last = occupied.get_mut();
                let previous = last.value;
                last.last_seen = now;
                last.value = value;
                if value >= previous {
                    point.value = PointValue::Sum {
                        value: value - previous,
                        monotonic: true,
                        cumulative: false,
                    };
                    true
                } else {
                    // Counter reset: re-baseline silently.
                    false
                }
            }
            std::collections::hash_map::Entry::Vacant(vacant) => {
                let _ = vacant.insert(LastValue {
                    value,
                    last_seen: now,
                });
                false
            }
        };
        emit
    }

    /// Number of tracked series.
    #[must_use]
    pub fn tracked_series(&self) -> usize {
        self.last_values.len()
    }

    fn maybe_sweep(&mut self, now: Instant) {
        // Sweeping on every call would be quadratic over the map; once per
        // staleness period is enough to honor the timeout.
        if now.duration_since(self.last_sweep) < self.staleness {
            return;
        }
        self.last_sweep = now;
        let staleness = self.staleness;
        self.last_values
            .retain(|_, last| now.duration_since(last.last_seen) < staleness);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use phoenix_pdata::{AttributeMap, Priority};
    use std::sync::Arc;

    fn sum_point(fingerprint: u64, value: f64) -> MetricPoint {
        MetricPoint {
            metric: Arc::from("process.cpu.time"),
            timestamp_unix_nano: 0,
            value: PointValue::Sum {
                value,
                monotonic: true,
                cumulative: true,
            },
            attributes: AttributeMap::new(),
            fingerprint,
            priority: Priority::Low,
            group: None,
        }
    }

    #[test]
    fn first_observation_is_baseline_only() {
        let mut converter = DeltaConverter::new(Duration::from_secs(600));
        let now = Instant::now();
        let mut p = sum_point(1, 100.0);
        assert!(!converter.convert(&mut p, now));
        assert_eq!(converter.tracked_series(), 1);
    }

    #[test]
    fn subsequent_observations_emit_deltas() {
        let mut converter = DeltaConverter::new(Duration::from_secs(600));
        let now = Instant::now();
        let _ = converter.convert(&mut sum_point(1, 100.0), now);

        let mut p = sum_point(1, 130.0);
        assert!(converter.convert(&mut p, now));
        assert_eq!(
            p.value,
            PointValue::Sum {
                value: 30.0,
                monotonic: true,
                cumulative: false,
            }
        );
    }

    #[test]
    fn counter_reset_rebaselines_silently() {
        let mut converter = DeltaConverter::new(Duration::from_secs(600));
        let now = Instant::now();
        let _ = converter.convert(&mut sum_point(1, 100.0), now);

        let mut p = sum_point(1, 10.0);
        assert!(!converter.convert(&mut p, now), "reset must not emit");

        let mut p = sum_point(1, 25.0);
        assert!(converter.convert(&mut p, now));
        assert_eq!(
            p.value,
            PointValue::Sum {
                value: 15.0,
                monotonic: true,
                cumulative: false,
            }
        );
    }

    #[test]
    fn stale_entries_expire_without_emission() {
        let mut converter = DeltaConverter::new(Duration::from_millis(10));
        let start = Instant::now();
        let _ = converter.convert(&mut sum_point(1, 100.0), start);

        // Well past staleness: the sweep drops the entry and the next
        // observation is a fresh baseline.
        let later = start + Duration::from_millis(50);
        let mut p = sum_point(1, 500.0);
        assert!(!converter.convert(&mut p, later));
    }

    #[test]
    fn gauges_pass_through_untouched() {
        let mut converter = DeltaConverter::new(Duration::from_secs(600));
        let mut p = sum_point(1, 100.0);
        p.value = PointValue::Gauge(0.7);
        assert!(converter.convert(&mut p, Instant::now()));
        assert_eq!(p.value, PointValue::Gauge(0.7));
    }

    #[test]
    fn delta_sums_pass_through_untouched() {
        let mut converter = DeltaConverter::new(Duration::from_secs(600));
        let mut p = sum_point(1, 100.0);
        p.value = PointValue::Sum {
            value: 5.0,
            monotonic: true,
            cumulative: false,
        };
        assert!(converter.convert(&mut p, Instant::now()));
    }
}
