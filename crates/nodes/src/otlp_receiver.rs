// SPDX-License-Identifier: Apache-2.0

//! The OTLP metrics intake.
//!
//! A tonic `MetricsService` accepting OTLP export requests. Each request
//! passes, in order: the memory guard (a tripped soft RSS limit returns
//! `RESOURCE_EXHAUSTED`, a retryable transient), resource enrichment
//! (never drops, annotates on failure), cumulative-to-delta conversion,
//! classification, and finally zero-copy fan-out of the batch into the
//! three variant queues behind an `Arc`.
//!
//! Non-metric and unsupported payloads are rejected with
//! `INVALID_ARGUMENT`. The intake is the sole producer into each variant
//! queue, so per-fingerprint ordering is fixed here for the whole system.

use crate::classifier::Classifier;
use crate::delta::DeltaConverter;
use crate::enrich::Enricher;
use opentelemetry_proto::tonic::collector::metrics::v1::metrics_service_server::{
    MetricsService, MetricsServiceServer,
};
use opentelemetry_proto::tonic::collector::metrics::v1::{
    ExportMetricsServiceRequest, ExportMetricsServiceResponse,
};
use phoenix_config::{IntakeSettings, OverflowPolicy};
use phoenix_engine::{EffectHandler, Error, NodeControlMsg, TrySendError};
use phoenix_pdata::otlp::batches_from_request;
use phoenix_pdata::{MetricBatch, PipelineLabel};
use phoenix_telemetry::MetricsHandle;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tonic::{Request, Response, Status};

/// Soft resident-set guard. A zero limit disables the guard.
pub struct MemoryLimiter {
    limit_bytes: u64,
}

impl MemoryLimiter {
    /// Creates a guard with a limit in MiB.
    #[must_use]
    pub fn new(limit_mib: u64) -> Self {
        Self {
            limit_bytes: limit_mib * 1024 * 1024,
        }
    }

    /// Returns the current RSS when the limit is exceeded.
    pub fn check(&self) -> Result<(), u64> {
        if self.limit_bytes == 0 {
            return Ok(());
        }
        let rss = memory_stats::memory_stats()
            .map(|m| m.physical_mem as u64)
            .unwrap_or(0);
        if rss > self.limit_bytes {
            Err(rss)
        } else {
            Ok(())
        }
    }
}

/// Fans batches out to the variant queues.
pub struct Fanout {
    handlers: Vec<(PipelineLabel, EffectHandler<Arc<MetricBatch>>)>,
    policy: OverflowPolicy,
    metrics: MetricsHandle,
}

impl Fanout {
    /// Creates a fanout over the given per-variant effect handlers.
    #[must_use]
    pub fn new(
        handlers: Vec<(PipelineLabel, EffectHandler<Arc<MetricBatch>>)>,
        policy: OverflowPolicy,
        metrics: MetricsHandle,
    ) -> Self {
        Self {
            handlers,
            policy,
            metrics,
        }
    }

    /// Sends the batch to every variant queue, applying the overflow
    /// policy per queue.
    pub async fn send(&self, batch: Arc<MetricBatch>) {
        for (label, handler) in &self.handlers {
            match self.policy {
                OverflowPolicy::Block => {
                    if handler.send_message(batch.clone()).await.is_err() {
                        tracing::warn!(pipeline = %label, "variant queue closed, batch dropped");
                    }
                }
                OverflowPolicy::Drop => {
                    if let Err(TrySendError::Full(_)) = handler.try_send_message(batch.clone()) {
                        self.metrics
                            .queue_overflow_drops
                            .with_label_values(&[label.as_str()])
                            .inc();
                    }
                }
            }
        }
    }
}

struct IntakeState {
    limiter: MemoryLimiter,
    enricher: Enricher,
    classifier: Classifier,
    delta: parking_lot::Mutex<DeltaConverter>,
    fanout: Fanout,
    metrics: MetricsHandle,
}

/// The tonic service handler.
#[derive(Clone)]
pub struct MetricsServiceHandler {
    state: Arc<IntakeState>,
}

#[tonic::async_trait]
impl MetricsService for MetricsServiceHandler {
    async fn export(
        &self,
        request: Request<ExportMetricsServiceRequest>,
    ) -> Result<Response<ExportMetricsServiceResponse>, Status> {
        let state = &self.state;
        state.metrics.intake_batches.inc();

        if let Err(rss) = state.limiter.check() {
            state
                .metrics
                .intake_rejected
                .with_label_values(&["memory_limit"])
                .inc();
            return Err(Status::resource_exhausted(format!(
                "memory soft limit exceeded (rss {rss} bytes), retry later"
            )));
        }

        let batches = batches_from_request(request.into_inner()).map_err(|e| {
            state
                .metrics
                .intake_rejected
                .with_label_values(&["invalid_payload"])
                .inc();
            Status::invalid_argument(e.to_string())
        })?;

        let now = Instant::now();
        for mut batch in batches {
            state.enricher.enrich(&mut batch.resource);
            {
                let mut delta = state.delta.lock();
                batch.points.retain_mut(|point| delta.convert(point, now));
            }
            for point in &mut batch.points {
                state.classifier.classify(point, &batch.resource);
            }
            if batch.points.is_empty() {
                continue;
            }
            state.fanout.send(Arc::new(batch)).await;
        }

        Ok(Response::new(ExportMetricsServiceResponse {
            partial_success: None,
        }))
    }
}

/// The intake node: a gRPC server plus the shared intake stages.
pub struct OtlpReceiver {
    settings: IntakeSettings,
    state: Arc<IntakeState>,
}

impl OtlpReceiver {
    /// Builds the intake from validated settings and a compiled classifier.
    #[must_use]
    pub fn new(
        settings: IntakeSettings,
        classifier: Classifier,
        fanout: Fanout,
        metrics: MetricsHandle,
    ) -> Self {
        let state = Arc::new(IntakeState {
            limiter: MemoryLimiter::new(settings.memory_limit_mib),
            enricher: Enricher::new(),
            classifier,
            delta: parking_lot::Mutex::new(DeltaConverter::new(settings.delta_staleness_timeout)),
            fanout,
            metrics,
        });
        Self { settings, state }
    }

    /// Serves the gRPC endpoint until a shutdown control message arrives.
    pub async fn run(self, mut ctrl_rx: mpsc::Receiver<NodeControlMsg>) -> Result<(), Error> {
        let addr: std::net::SocketAddr =
            self.settings
                .grpc_bind
                .parse()
                .map_err(|e| Error::ReceiverError {
                    receiver: "otlp_intake".into(),
                    error: format!("invalid bind address `{}`: {e}", self.settings.grpc_bind),
                })?;
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|error| Error::IoError {
                node: "otlp_intake".into(),
                error,
            })?;
        tracing::info!(endpoint = %addr, "OTLP intake listening");
        let incoming = tokio_stream::wrappers::TcpListenerStream::new(listener);

        let service = MetricsServiceServer::new(MetricsServiceHandler {
            state: self.state.clone(),
        });
        let shutdown = async move {
            loop {
                match ctrl_rx.recv().await {
                    Some(NodeControlMsg::Shutdown { reason, .. }) => {
                        tracing::info!(reason = %reason, "OTLP intake stopping");
                        break;
                    }
                    Some(_) => {}
                    None => break,
                }
            }
        };

        tonic::transport::Server::builder()
            .add_service(service)
            .serve_with_incoming_shutdown(incoming, shutdown)
            .await
            .map_err(|e| Error::ReceiverError {
                receiver: "otlp_intake".into(),
                error: e.to_string(),
            })
    }
}
