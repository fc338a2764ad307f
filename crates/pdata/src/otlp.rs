// SPDX-License-Identifier: Apache-2.0

//! Conversion between the internal model and the OTLP protobuf types.
//!
//! Supported metric kinds: gauge (double/int), sum (monotonic or not,
//! cumulative or delta), histogram (carried as is). Exponential histograms
//! and summaries are rejected as invalid arguments, matching the ingest
//! contract. Attribute values outside the string/int/double/bool set
//! (bytes, arrays, kvlists) do not occur in process telemetry and are
//! skipped.

use crate::attributes::{AttributeMap, AttributeValue};
use crate::fingerprint::fingerprint_of;
use crate::point::{MetricBatch, MetricPoint, PipelineLabel, PointValue, Priority};
use crate::PIPELINE_ATTR;
use opentelemetry_proto::tonic::collector::metrics::v1::ExportMetricsServiceRequest;
use opentelemetry_proto::tonic::common::v1::{any_value, AnyValue, KeyValue};
use opentelemetry_proto::tonic::metrics::v1::{
    metric, number_data_point, AggregationTemporality, Gauge, Histogram, HistogramDataPoint,
    Metric, NumberDataPoint, ResourceMetrics, ScopeMetrics, Sum,
};
use opentelemetry_proto::tonic::resource::v1::Resource;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Errors raised while converting OTLP payloads to the internal model.
#[derive(thiserror::Error, Debug)]
pub enum ConversionError {
    /// The metric carried no data payload at all.
    #[error("metric `{metric}` has no data payload")]
    EmptyMetricData {
        /// Name of the offending metric.
        metric: String,
    },

    /// The metric kind is not accepted by the ingest contract.
    #[error("metric `{metric}` has unsupported kind `{kind}`")]
    UnsupportedMetricKind {
        /// Name of the offending metric.
        metric: String,
        /// Wire name of the rejected kind.
        kind: &'static str,
    },
}

fn attribute_from_any(value: AnyValue) -> Option<AttributeValue> {
    match value.value? {
        any_value::Value::StringValue(s) => Some(AttributeValue::Str(Arc::from(s.as_str()))),
        any_value::Value::IntValue(i) => Some(AttributeValue::Int(i)),
        any_value::Value::DoubleValue(d) => Some(AttributeValue::Double(d)),
        any_value::Value::BoolValue(b) => Some(AttributeValue::Bool(b)),
        // Bytes, arrays and kvlists have no counterpart in the internal model.
        _ => None,
    }
}

fn attribute_to_any(value: &AttributeValue) -> AnyValue {
    let value = match value {
        AttributeValue::Str(s) => any_value::Value::StringValue(s.to_string()),
        AttributeValue::Int(i) => any_value::Value::IntValue(*i),
        AttributeValue::Double(d) => any_value::Value::DoubleValue(*d),
        AttributeValue::Bool(b) => any_value::Value::BoolValue(*b),
    };
    AnyValue { value: Some(value) }
}

/// Converts a list of OTLP key-values into a sorted attribute map.
#[must_use]
pub fn attribute_map_from_key_values(kvs: Vec<KeyValue>) -> AttributeMap {
    let mut map = AttributeMap::with_capacity(kvs.len());
    for kv in kvs {
        if let Some(value) = kv.value.and_then(attribute_from_any) {
            map.insert(kv.key.as_str(), value);
        }
    }
    map
}

fn key_values_from_attribute_map(map: &AttributeMap) -> Vec<KeyValue> {
    map.iter()
        .map(|(key, value)| KeyValue {
            key: key.to_owned(),
            value: Some(attribute_to_any(value)),
        })
        .collect()
}

fn number_value(point: &NumberDataPoint) -> f64 {
    match point.value {
        Some(number_data_point::Value::AsDouble(d)) => d,
        Some(number_data_point::Value::AsInt(i)) => i as f64,
        // An absent value decodes as zero, per the OTLP spec.
        None => 0.0,
    }
}

fn push_number_points(
    out: &mut Vec<MetricPoint>,
    metric_name: &Arc<str>,
    resource: &AttributeMap,
    data_points: Vec<NumberDataPoint>,
    make_value: impl Fn(f64) -> PointValue,
) {
    for dp in data_points {
        let value = make_value(number_value(&dp));
        let attributes = attribute_map_from_key_values(dp.attributes);
        let fingerprint = fingerprint_of(metric_name, resource, &attributes);
        out.push(MetricPoint {
            metric: metric_name.clone(),
            timestamp_unix_nano: dp.time_unix_nano,
            value,
            attributes,
            fingerprint,
            priority: Priority::Low,
            group: None,
        });
    }
}

/// Converts an OTLP export request into internal batches, one per
/// `ResourceMetrics` entry. Scope boundaries are flattened; the scope has no
/// role in the Phoenix model.
pub fn batches_from_request(
    request: ExportMetricsServiceRequest,
) -> Result<Vec<MetricBatch>, ConversionError> {
    let mut batches = Vec::with_capacity(request.resource_metrics.len());
    for rm in request.resource_metrics {
        let resource = attribute_map_from_key_values(
            rm.resource.map(|r| r.attributes).unwrap_or_default(),
        );
        let mut batch = MetricBatch::new(resource);
        for sm in rm.scope_metrics {
            for m in sm.metrics {
                append_metric(&mut batch, m)?;
            }
        }
        batches.push(batch);
    }
    Ok(batches)
}

fn append_metric(batch: &mut MetricBatch, m: Metric) -> Result<(), ConversionError> {
    let metric_name: Arc<str> = Arc::from(m.name.as_str());
    let data = m.data.ok_or_else(|| ConversionError::EmptyMetricData {
        metric: m.name.clone(),
    })?;
    match data {
        metric::Data::Gauge(g) => {
            push_number_points(
                &mut batch.points,
                &metric_name,
                &batch.resource,
                g.data_points,
                PointValue::Gauge,
            );
        }
        metric::Data::Sum(s) => {
            let monotonic = s.is_monotonic;
            let cumulative =
                s.aggregation_temporality == AggregationTemporality::Cumulative as i32;
            push_number_points(
                &mut batch.points,
                &metric_name,
                &batch.resource,
                s.data_points,
                move |value| PointValue::Sum {
                    value,
                    monotonic,
                    cumulative,
                },
            );
        }
        metric::Data::Histogram(h) => {
            for dp in h.data_points {
                let attributes = attribute_map_from_key_values(dp.attributes);
                let fingerprint = fingerprint_of(&metric_name, &batch.resource, &attributes);
                batch.points.push(MetricPoint {
                    metric: metric_name.clone(),
                    timestamp_unix_nano: dp.time_unix_nano,
                    value: PointValue::Histogram {
                        count: dp.count,
                        sum: dp.sum,
                        bucket_counts: dp.bucket_counts,
                        bounds: dp.explicit_bounds,
                    },
                    attributes,
                    fingerprint,
                    priority: Priority::Low,
                    group: None,
                });
            }
        }
        metric::Data::ExponentialHistogram(_) => {
            return Err(ConversionError::UnsupportedMetricKind {
                metric: m.name,
                kind: "exponential_histogram",
            });
        }
        metric::Data::Summary(_) => {
            return Err(ConversionError::UnsupportedMetricKind {
                metric: m.name,
                kind: "summary",
            });
        }
    }
    Ok(())
}

/// Builds an OTLP export request from a labeled batch. Points are grouped by
/// metric name; the pipeline label is stamped on the resource.
#[must_use]
pub fn request_from_batch(label: PipelineLabel, batch: &MetricBatch) -> ExportMetricsServiceRequest {
    let mut resource = batch.resource.clone();
    resource.insert(PIPELINE_ATTR, AttributeValue::from(label.as_str()));

    // BTreeMap keeps metric order deterministic for tests and diffing.
    let mut by_metric: BTreeMap<&str, Vec<&MetricPoint>> = BTreeMap::new();
    for point in &batch.points {
        by_metric.entry(point.metric.as_ref()).or_default().push(point);
    }

    let metrics = by_metric
        .into_iter()
        .map(|(name, points)| metric_from_points(name, &points))
        .collect();

    ExportMetricsServiceRequest {
        resource_metrics: vec![ResourceMetrics {
            resource: Some(Resource {
                attributes: key_values_from_attribute_map(&resource),
                ..Default::default()
            }),
            scope_metrics: vec![ScopeMetrics {
                scope: None,
                metrics,
                schema_url: String::new(),
            }],
            schema_url: String::new(),
        }],
    }
}

fn metric_from_points(name: &str, points: &[&MetricPoint]) -> Metric {
    // The batch was built from a single metric kind per name; the first point
    // decides the payload shape.
    let data = match &points[0].value {
        PointValue::Gauge(_) => metric::Data::Gauge(Gauge {
            data_points: points.iter().map(|p| number_point(p)).collect(),
        }),
        PointValue::Sum {
            monotonic,
            cumulative,
            ..
        } => metric::Data::Sum(Sum {
            data_points: points.iter().map(|p| number_point(p)).collect(),
            aggregation_temporality: if *cumulative {
                AggregationTemporality::Cumulative as i32
            } else {
                AggregationTemporality::Delta as i32
            },
            is_monotonic: *monotonic,
        }),
        PointValue::Histogram { .. } => metric::Data::Histogram(Histogram {
            data_points: points.iter().map(|p| histogram_point(p)).collect(),
            aggregation_temporality: AggregationTemporality::Delta as i32,
        }),
    };

    Metric {
        name: name.to_owned(),
        data: Some(data),
        ..Default::default()
    }
}

fn number_point(point: &MetricPoint) -> NumberDataPoint {
    let value = match &point.value {
        PointValue::Gauge(v) | PointValue::Sum { value: v, .. } => *v,
        PointValue::Histogram { .. } => 0.0,
    };
    NumberDataPoint {
        attributes: key_values_from_attribute_map(&point.attributes),
        time_unix_nano: point.timestamp_unix_nano,
        value: Some(number_data_point::Value::AsDouble(value)),
        ..Default::default()
    }
}

fn histogram_point(point: &MetricPoint) -> HistogramDataPoint {
    let (count, sum, bucket_counts, bounds) = match &point.value {
        PointValue::Histogram {
            count,
            sum,
            bucket_counts,
            bounds,
        } => (*count, *sum, bucket_counts.clone(), bounds.clone()),
        _ => (0, None, Vec::new(), Vec::new()),
    };
    HistogramDataPoint {
        attributes: key_values_from_attribute_map(&point.attributes),
        time_unix_nano: point.timestamp_unix_nano,
        count,
        sum,
        bucket_counts,
        explicit_bounds: bounds,
        ..Default::default()
    }
}
