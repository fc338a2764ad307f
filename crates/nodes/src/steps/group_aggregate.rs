// SPDX-License-Identifier: Apache-2.0

//! Group aggregation.
//!
//! Datapoints whose classifier group is set (e.g. browsers ->
//! `user_browser`) are folded into one output point per `(group, metric)`
//! bucket: numeric fields are summed and the contributor count is recorded
//! in `phoenix.agg.count`. The group name replaces the process identity in
//! the output attributes. `Critical` datapoints are never aggregated, and
//! histograms pass through unaggregated (summing buckets across unrelated
//! bound sets is not meaningful).
//!
//! Buckets are flushed at batch boundaries by the variant loop, which also
//! assigns the output fingerprint from the batch resource.

use phoenix_engine::Step;
use phoenix_pdata::{
    keys, AttributeMap, AttributeValue, MetricPoint, PipelineLabel, PointValue, Priority,
    AGG_COUNT_ATTR,
};
use phoenix_telemetry::MetricsHandle;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;

struct Bucket {
    sum: f64,
    count: u64,
    latest_timestamp: u64,
    priority: Priority,
    // Shape of the folded values; taken from the first contributor.
    shape: ValueShape,
}

#[derive(Clone, Copy)]
enum ValueShape {
    Gauge,
    Sum { monotonic: bool, cumulative: bool },
}

/// The group aggregation step.
pub struct GroupAggregator {
    label: PipelineLabel,
    metrics: MetricsHandle,
    buckets: HashMap<(Arc<str>, Arc<str>), Bucket>,
}

impl GroupAggregator {
    /// Creates an empty aggregator.
    #[must_use]
    pub fn new(label: PipelineLabel, metrics: MetricsHandle) -> Self {
        Self {
            label,
            metrics,
            buckets: HashMap::new(),
        }
    }
}

impl Step<MetricPoint> for GroupAggregator {
    fn name(&self) -> &'static str {
        "group_aggregate"
    }

    fn process(&mut self, input: MetricPoint, out: &mut Vec<MetricPoint>) {
        let Some(group) = input.group.clone() else {
            out.push(input);
            return;
        };
        if input.priority == Priority::Critical {
            out.push(input);
            return;
        }
        let (value, shape) = match input.value {
            PointValue::Gauge(v) => (v, ValueShape::Gauge),
            PointValue::Sum {
                value,
                monotonic,
                cumulative,
            } => (
                value,
                ValueShape::Sum {
                    monotonic,
                    cumulative,
                },
            ),
            PointValue::Histogram { .. } => {
                out.push(input);
                return;
            }
        };

        let bucket = self
            .buckets
            .entry((group, input.metric.clone()))
            .or_insert(Bucket {
                sum: 0.0,
                count: 0,
                latest_timestamp: 0,
                priority: Priority::Low,
                shape,
            });
        bucket.sum += value;
        bucket.count += 1;
        bucket.latest_timestamp = bucket.latest_timestamp.max(input.timestamp_unix_nano);
        bucket.priority = bucket.priority.min(input.priority);
    }

    fn flush(&mut self, out: &mut Vec<MetricPoint>) {
        for ((group, metric), bucket) in self.buckets.drain() {
            let mut attributes = AttributeMap::new();
            attributes.insert(
                keys::PROCESS_EXECUTABLE_NAME,
                AttributeValue::Str(group.clone()),
            );
            attributes.insert(AGG_COUNT_ATTR, AttributeValue::Int(bucket.count as i64));
            let value = match bucket.shape {
                ValueShape::Gauge => PointValue::Gauge(bucket.sum),
                ValueShape::Sum {
                    monotonic,
                    cumulative,
                } => PointValue::Sum {
                    value: bucket.sum,
                    monotonic,
                    cumulative,
                },
            };
            self.metrics
                .pipeline_aggregated_points
                .with_label_values(&[self.label.as_str()])
                .inc();
            out.push(MetricPoint {
                metric,
                timestamp_unix_nano: bucket.latest_timestamp,
                value,
                attributes,
                // Assigned by the variant loop, which has the batch resource.
                fingerprint: 0,
                priority: bucket.priority,
                group: None,
            });
        }
    }

    fn snapshot_state(&self) -> Value {
        json!({ "open_buckets": self.buckets.len() })
    }

    fn reset_state(&mut self) {
        self.buckets.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grouped_point(metric: &str, group: &str, value: f64, priority: Priority) -> MetricPoint {
        MetricPoint {
            metric: Arc::from(metric),
            timestamp_unix_nano: 7,
            value: PointValue::Gauge(value),
            attributes: AttributeMap::new(),
            fingerprint: 1,
            priority,
            group: Some(Arc::from(group)),
        }
    }

    fn aggregator() -> GroupAggregator {
        GroupAggregator::new(
            PipelineLabel::Optimized,
            phoenix_telemetry::Metrics::new().expect("metrics"),
        )
    }

    #[test]
    fn grouped_points_fold_into_one_output() {
        let mut agg = aggregator();
        let mut out = Vec::new();
        agg.process(grouped_point("cpu", "user_browser", 1.0, Priority::High), &mut out);
        agg.process(grouped_point("cpu", "user_browser", 2.5, Priority::High), &mut out);
        agg.process(grouped_point("cpu", "user_browser", 0.5, Priority::Low), &mut out);
        assert!(out.is_empty(), "grouped points are held until flush");

        agg.flush(&mut out);
        assert_eq!(out.len(), 1);
        let point = &out[0];
        assert_eq!(point.value, PointValue::Gauge(4.0));
        assert_eq!(
            point.attributes.get(AGG_COUNT_ATTR),
            Some(&AttributeValue::Int(3))
        );
        assert_eq!(
            point.attributes.get_str(keys::PROCESS_EXECUTABLE_NAME),
            Some("user_browser")
        );
        // Highest contributor priority survives.
        assert_eq!(point.priority, Priority::High);
        assert_eq!(point.group, None);
    }

    #[test]
    fn ungrouped_and_critical_pass_through() {
        let mut agg = aggregator();
        let mut out = Vec::new();

        let mut ungrouped = grouped_point("cpu", "g", 1.0, Priority::Low);
        ungrouped.group = None;
        agg.process(ungrouped, &mut out);
        agg.process(grouped_point("cpu", "g", 1.0, Priority::Critical), &mut out);
        assert_eq!(out.len(), 2);

        out.clear();
        agg.flush(&mut out);
        assert!(out.is_empty());
    }

    #[test]
    fn buckets_are_per_group_and_metric() {
        let mut agg = aggregator();
        let mut out = Vec::new();
        agg.process(grouped_point("cpu", "a", 1.0, Priority::Low), &mut out);
        agg.process(grouped_point("cpu", "b", 1.0, Priority::Low), &mut out);
        agg.process(grouped_point("mem", "a", 1.0, Priority::Low), &mut out);
        agg.flush(&mut out);
        assert_eq!(out.len(), 3);
    }
}
