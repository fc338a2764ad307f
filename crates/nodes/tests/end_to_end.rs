// SPDX-License-Identifier: Apache-2.0

//! End-to-end data-plane test: OTLP in, three labeled pipelines out.
//!
//! Spawns the full wiring (intake, variants, timers, sink exporters)
//! against a mock OTLP sink, pushes metrics through the real gRPC
//! surface, and checks labeling, critical retention, and per-fingerprint
//! ordering on the way out.

use opentelemetry_proto::tonic::collector::metrics::v1::metrics_service_client::MetricsServiceClient;
use opentelemetry_proto::tonic::collector::metrics::v1::metrics_service_server::{
    MetricsService, MetricsServiceServer,
};
use opentelemetry_proto::tonic::collector::metrics::v1::{
    ExportMetricsServiceRequest, ExportMetricsServiceResponse,
};
use opentelemetry_proto::tonic::common::v1::{any_value, AnyValue, KeyValue};
use opentelemetry_proto::tonic::metrics::v1::{
    metric, number_data_point, Gauge, Metric, NumberDataPoint, ResourceMetrics, ScopeMetrics,
};
use phoenix_config::{RuleConfig, RulePriority, Settings};
use phoenix_controller::control_file::control_handle;
use phoenix_controller::KpiRegistry;
use phoenix_nodes::pipeline::spawn_pipelines;
use std::time::Duration;
use tokio::sync::mpsc;
use tonic::{Request, Response, Status};

struct SinkMock {
    received: mpsc::Sender<ExportMetricsServiceRequest>,
}

#[tonic::async_trait]
impl MetricsService for SinkMock {
    async fn export(
        &self,
        request: Request<ExportMetricsServiceRequest>,
    ) -> Result<Response<ExportMetricsServiceResponse>, Status> {
        let _ = self.received.send(request.into_inner()).await;
        Ok(Response::new(ExportMetricsServiceResponse {
            partial_success: None,
        }))
    }
}

fn gauge_request(executable: &str, value: f64) -> ExportMetricsServiceRequest {
    ExportMetricsServiceRequest {
        resource_metrics: vec![ResourceMetrics {
            resource: None,
            scope_metrics: vec![ScopeMetrics {
                scope: None,
                metrics: vec![Metric {
                    name: "process.cpu.utilization".to_owned(),
                    data: Some(metric::Data::Gauge(Gauge {
                        data_points: vec![NumberDataPoint {
                            attributes: vec![KeyValue {
                                key: "process.executable.name".to_owned(),
                                value: Some(AnyValue {
                                    value: Some(any_value::Value::StringValue(
                                        executable.to_owned(),
                                    )),
                                }),
                            }],
                            time_unix_nano: 1,
                            value: Some(number_data_point::Value::AsDouble(value)),
                            ..Default::default()
                        }],
                    })),
                    ..Default::default()
                }],
                schema_url: String::new(),
            }],
            schema_url: String::new(),
        }],
    }
}

fn pipeline_attr(request: &ExportMetricsServiceRequest) -> Option<String> {
    request.resource_metrics.first()?.resource.as_ref().and_then(|r| {
        r.attributes.iter().find_map(|kv| {
            if kv.key != "phoenix.pipeline" {
                return None;
            }
            match kv.value.as_ref()?.value.as_ref()? {
                any_value::Value::StringValue(s) => Some(s.clone()),
                _ => None,
            }
        })
    })
}

fn gauge_values(request: &ExportMetricsServiceRequest) -> Vec<f64> {
    request
        .resource_metrics
        .iter()
        .flat_map(|rm| &rm.scope_metrics)
        .flat_map(|sm| &sm.metrics)
        .filter_map(|m| match &m.data {
            Some(metric::Data::Gauge(g)) => Some(&g.data_points),
            _ => None,
        })
        .flatten()
        .filter_map(|dp| match dp.value {
            Some(number_data_point::Value::AsDouble(v)) => Some(v),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn metrics_flow_through_all_three_labeled_pipelines() {
    // Mock downstream sink.
    let (sink_tx, mut sink_rx) = mpsc::channel(256);
    let sink_port = portpicker::pick_unused_port().expect("free port");
    let sink_addr: std::net::SocketAddr =
        format!("127.0.0.1:{sink_port}").parse().expect("addr");
    let _sink = tokio::spawn(async move {
        let _ = tonic::transport::Server::builder()
            .add_service(MetricsServiceServer::new(SinkMock { received: sink_tx }))
            .serve(sink_addr)
            .await;
    });

    let intake_port = portpicker::pick_unused_port().expect("free port");
    let mut settings = Settings::default();
    settings.intake.grpc_bind = format!("127.0.0.1:{intake_port}");
    settings.sink.endpoint = format!("http://127.0.0.1:{sink_port}");
    settings.sink.backoff_initial = Duration::from_millis(100);
    settings.classifier.rules = vec![RuleConfig {
        pattern: "^systemd$".to_owned(),
        priority: RulePriority::Critical,
        group: None,
    }];
    settings.finish().expect("valid settings");

    let control = control_handle();
    let kpis = KpiRegistry::new();
    let metrics = phoenix_telemetry::Metrics::new().expect("metrics");
    let runtime =
        spawn_pipelines(&settings, control, kpis, metrics.clone()).expect("spawn pipelines");
    tokio::time::sleep(Duration::from_millis(200)).await;

    // Three exports of the same series, strictly increasing values, plus a
    // critical process in each.
    let endpoint = format!("http://127.0.0.1:{intake_port}");
    let mut client = MetricsServiceClient::connect(endpoint).await.expect("connect");
    for value in [1.0, 2.0, 3.0] {
        let _ = client
            .export(gauge_request("systemd", value))
            .await
            .expect("export");
    }

    tokio::time::sleep(Duration::from_millis(300)).await;
    runtime.shutdown("test complete").await;

    let mut by_pipeline: std::collections::HashMap<String, Vec<f64>> =
        std::collections::HashMap::new();
    while let Ok(request) = sink_rx.try_recv() {
        let label = pipeline_attr(&request).expect("pipeline label present");
        by_pipeline
            .entry(label)
            .or_default()
            .extend(gauge_values(&request));
    }

    // Every variant emitted the critical series, labeled.
    for label in ["full_fidelity", "optimized", "experimental"] {
        let values = by_pipeline
            .get(label)
            .unwrap_or_else(|| panic!("no output for pipeline {label}"));
        assert_eq!(
            values,
            &vec![1.0, 2.0, 3.0],
            "per-fingerprint order must be preserved in {label}"
        );
    }

    assert_eq!(
        metrics
            .critical_retention_violations
            .with_label_values(&["experimental"])
            .get(),
        0
    );
}
