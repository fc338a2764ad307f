// SPDX-License-Identifier: Apache-2.0

//! The sink adapter: an OTLP gRPC exporter.
//!
//! Labeled batches are split into wire requests of at most the configured
//! batch size and pushed through a bounded in-memory queue. Transient
//! failures (unavailable, resource-exhausted, deadline-exceeded, request
//! timeout) retry with jittered exponential backoff up to a total elapsed
//! budget; permanent failures drop the batch with a structured log. A full
//! queue drops the oldest entry. Nothing here ever halts the upstream
//! variants.

use crate::variant::LabeledBatch;
use opentelemetry_proto::tonic::collector::metrics::v1::metrics_service_client::MetricsServiceClient;
use opentelemetry_proto::tonic::collector::metrics::v1::ExportMetricsServiceRequest;
use phoenix_config::SinkSettings;
use phoenix_engine::{Error, Exporter, Message, MessageChannel, NodeControlMsg};
use phoenix_pdata::otlp::request_from_batch;
use phoenix_pdata::MetricBatch;
use phoenix_telemetry::MetricsHandle;
use rand::RngExt;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tonic::transport::Channel;

struct PendingBatch {
    request: ExportMetricsServiceRequest,
    attempts: u32,
    first_attempt: Instant,
    next_attempt: Instant,
}

/// The OTLP sink exporter node.
pub struct OtlpExporter {
    settings: SinkSettings,
    metrics: MetricsHandle,
}

enum SendResult {
    Delivered,
    Transient(String),
    Permanent(String),
}

impl OtlpExporter {
    /// Creates the exporter.
    #[must_use]
    pub fn new(settings: SinkSettings, metrics: MetricsHandle) -> Self {
        Self { settings, metrics }
    }

    fn enqueue(&self, queue: &mut VecDeque<PendingBatch>, labeled: LabeledBatch) {
        let now = Instant::now();
        for chunk in labeled.batch.points.chunks(self.settings.batch_size.max(1)) {
            let piece = MetricBatch {
                resource: labeled.batch.resource.clone(),
                points: chunk.to_vec(),
            };
            let request = request_from_batch(labeled.label, &piece);
            if queue.len() >= self.settings.queue_capacity {
                let _ = queue.pop_front();
                self.metrics.sink_queue_drops.inc();
            }
            queue.push_back(PendingBatch {
                request,
                attempts: 0,
                first_attempt: now,
                next_attempt: now,
            });
        }
        self.metrics.sink_queue_depth.set(queue.len() as i64);
    }

    fn backoff_delay(&self, attempts: u32) -> Duration {
        let exp = self
            .settings
            .backoff_initial
            .as_secs_f64()
            * self
                .settings
                .backoff_multiplier
                .powi(attempts.saturating_sub(1) as i32);
        let capped = exp.min(self.settings.backoff_max.as_secs_f64());
        let jitter = rand::rng().random_range(0.8..1.2);
        Duration::from_secs_f64(capped * jitter)
    }

    async fn send_once(
        &self,
        client: &mut MetricsServiceClient<Channel>,
        request: ExportMetricsServiceRequest,
    ) -> SendResult {
        let attempt = client.export(request);
        match tokio::time::timeout(self.settings.request_timeout, attempt).await {
            Ok(Ok(_)) => SendResult::Delivered,
            Ok(Err(status)) => match status.code() {
                tonic::Code::Unavailable
                | tonic::Code::ResourceExhausted
                | tonic::Code::DeadlineExceeded => SendResult::Transient(status.to_string()),
                _ => SendResult::Permanent(status.to_string()),
            },
            Err(_) => SendResult::Transient("request timeout".to_owned()),
        }
    }

    /// Attempts the queue head once it is due. Returns true when the queue
    /// head was consumed (delivered or dropped).
    async fn pump(
        &self,
        client: &mut MetricsServiceClient<Channel>,
        queue: &mut VecDeque<PendingBatch>,
    ) -> bool {
        let now = Instant::now();
        let due = queue
            .front()
            .is_some_and(|pending| pending.next_attempt <= now);
        if !due {
            return false;
        }
        let Some(mut pending) = queue.pop_front() else {
            return false;
        };

        let consumed = match self.send_once(client, pending.request.clone()).await {
            SendResult::Delivered => {
                self.metrics.sink_sent_batches.inc();
                true
            }
            SendResult::Transient(reason) => {
                pending.attempts += 1;
                let elapsed = pending.first_attempt.elapsed();
                if elapsed >= self.settings.backoff_max_elapsed {
                    self.metrics
                        .sink_send_failures
                        .with_label_values(&["exhausted"])
                        .inc();
                    tracing::error!(
                        reason = %reason,
                        attempts = pending.attempts,
                        elapsed_secs = elapsed.as_secs(),
                        "sink batch dropped after exhausting the retry budget"
                    );
                    true
                } else {
                    self.metrics
                        .sink_send_failures
                        .with_label_values(&["transient"])
                        .inc();
                    pending.next_attempt = Instant::now() + self.backoff_delay(pending.attempts);
                    queue.push_front(pending);
                    false
                }
            }
            SendResult::Permanent(reason) => {
                self.metrics
                    .sink_send_failures
                    .with_label_values(&["permanent"])
                    .inc();
                tracing::error!(reason = %reason, "sink batch dropped on permanent failure");
                true
            }
        };
        self.metrics.sink_queue_depth.set(queue.len() as i64);
        consumed
    }

    async fn flush(
        &self,
        client: &mut MetricsServiceClient<Channel>,
        queue: &mut VecDeque<PendingBatch>,
        deadline: Duration,
    ) {
        let flush_deadline = Instant::now() + deadline;
        while !queue.is_empty() && Instant::now() < flush_deadline {
            if let Some(front) = queue.front_mut() {
                // During the final flush, backoff waits are capped by the
                // remaining deadline.
                if front.next_attempt > flush_deadline {
                    break;
                }
                let wait = front.next_attempt.saturating_duration_since(Instant::now());
                tokio::time::sleep(wait).await;
            }
            let _ = self.pump(client, queue).await;
        }
        if !queue.is_empty() {
            self.metrics.sink_queue_drops.inc_by(queue.len() as u64);
            tracing::warn!(
                dropped_batches = queue.len(),
                "sink flush deadline reached with batches still queued"
            );
            queue.clear();
        }
        self.metrics.sink_queue_depth.set(0);
    }
}

#[async_trait::async_trait]
impl Exporter<LabeledBatch> for OtlpExporter {
    async fn start(
        self: Box<Self>,
        mut msg_chan: MessageChannel<LabeledBatch>,
    ) -> Result<(), Error> {
        let endpoint = Channel::from_shared(self.settings.endpoint.clone()).map_err(|e| {
            Error::ExporterError {
                exporter: "otlp_sink".into(),
                error: format!("invalid sink endpoint `{}`: {e}", self.settings.endpoint),
            }
        })?;
        // Lazy connect: the sink may come up after us, and transient
        // connection failures surface as Unavailable on export.
        let mut client = MetricsServiceClient::new(endpoint.connect_lazy());
        let mut queue: VecDeque<PendingBatch> = VecDeque::new();

        loop {
            let next_due = queue.front().map(|pending| pending.next_attempt);
            tokio::select! {
                biased;

                msg = msg_chan.recv() => match msg? {
                    Message::PData(labeled) => self.enqueue(&mut queue, labeled),
                    Message::Control(NodeControlMsg::TimerTick {}) => {}
                    Message::Control(NodeControlMsg::Shutdown { deadline, reason }) => {
                        tracing::debug!(reason = %reason, "sink flushing before shutdown");
                        let (rest, left_behind) = msg_chan
                            .drain_pdata(Duration::from_millis(100))
                            .await;
                        for labeled in rest {
                            self.enqueue(&mut queue, labeled);
                        }
                        if left_behind > 0 {
                            tracing::warn!(dropped_batches = left_behind,
                                "sink shutdown with upstream batches still queued");
                        }
                        self.flush(&mut client, &mut queue, deadline).await;
                        break;
                    }
                },
                () = async {
                    let due = next_due.unwrap_or_else(Instant::now);
                    let wait = due.saturating_duration_since(Instant::now());
                    tokio::time::sleep(wait).await;
                }, if next_due.is_some() => {
                    let _ = self.pump(&mut client, &mut queue).await;
                }
            }
        }
        Ok(())
    }
}
