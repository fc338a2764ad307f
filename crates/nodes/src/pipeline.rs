// SPDX-License-Identifier: Apache-2.0

//! Pipeline wiring.
//!
//! Builds the full data plane: one OTLP intake, three variant consumer
//! loops with their observation-window timers, and one sink exporter per
//! variant so a slow downstream never blocks CPU-bound variant work except
//! through its own bounded queue.
//!
//! Shutdown is staged: the intake stops accepting first, then the variants
//! drain (30 s), then the sinks flush (60 s).

use crate::classifier::Classifier;
use crate::otlp_exporter::OtlpExporter;
use crate::otlp_receiver::{Fanout, OtlpReceiver};
use crate::variant::{LabeledBatch, VariantPipeline};
use phoenix_config::Settings;
use phoenix_controller::{ControlHandle, KpiRegistry};
use phoenix_engine::{EffectHandler, MessageChannel, TaskSet};
use phoenix_pdata::{MetricBatch, PipelineLabel};
use phoenix_telemetry::MetricsHandle;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

const INTAKE_SHUTDOWN_DEADLINE: Duration = Duration::from_secs(5);
const VARIANT_DRAIN_DEADLINE: Duration = Duration::from_secs(30);
const SINK_FLUSH_DEADLINE: Duration = Duration::from_secs(60);

// Exporter input channels are small; the exporter's own bounded queue is
// the real buffer.
const SINK_CHANNEL_CAPACITY: usize = 128;

/// The running data plane.
pub struct PipelineRuntime {
    tasks: TaskSet,
}

/// Builds and spawns the full data plane.
pub fn spawn_pipelines(
    settings: &Settings,
    control: ControlHandle,
    kpis: Arc<KpiRegistry>,
    metrics: MetricsHandle,
) -> Result<PipelineRuntime, phoenix_config::Error> {
    let mut tasks = TaskSet::new();
    let mut variant_senders: Vec<(PipelineLabel, EffectHandler<Arc<MetricBatch>>)> = Vec::new();

    for label in PipelineLabel::ALL {
        let (sink_tx, sink_rx) = mpsc::channel::<LabeledBatch>(SINK_CHANNEL_CAPACITY);
        let exporter = OtlpExporter::new(settings.sink.clone(), metrics.clone());
        let _ = tasks.spawn_exporter(format!("sink:{label}"), exporter, sink_rx);

        let sink_handler = EffectHandler::new(format!("variant:{label}"), sink_tx);
        let variant = match label {
            PipelineLabel::FullFidelity => VariantPipeline::full_fidelity(
                &settings.pipelines,
                control.clone(),
                kpis.clone(),
                metrics.clone(),
                sink_handler,
            ),
            PipelineLabel::Optimized => VariantPipeline::optimized(
                &settings.pipelines,
                control.clone(),
                kpis.clone(),
                metrics.clone(),
                sink_handler,
            ),
            PipelineLabel::Experimental => VariantPipeline::experimental(
                &settings.pipelines,
                control.clone(),
                kpis.clone(),
                metrics.clone(),
                sink_handler,
            ),
        };

        let (pdata_tx, pdata_rx) = mpsc::channel(settings.intake.queue_capacity.max(1));
        let name = format!("variant:{label}");
        let chan_name = name.clone();
        let handle = tasks.spawn_node(name.clone(), 8, move |ctrl_rx| {
            variant.run(MessageChannel::new(chan_name, ctrl_rx, pdata_rx))
        });
        tasks.start_timer(handle.control, settings.observer.window);
        variant_senders.push((label, EffectHandler::new(name, pdata_tx)));
    }

    let classifier = Classifier::new(&settings.classifier)?;
    let fanout = Fanout::new(variant_senders, settings.intake.overflow, metrics.clone());
    let receiver = OtlpReceiver::new(settings.intake.clone(), classifier, fanout, metrics);
    let _ = tasks.spawn_node("otlp_intake", 8, move |ctrl_rx| receiver.run(ctrl_rx));

    Ok(PipelineRuntime { tasks })
}

impl PipelineRuntime {
    /// Staged shutdown of the whole data plane. Errors are logged per
    /// node; draining continues regardless.
    pub async fn shutdown(mut self, reason: &str) {
        if let Err(e) = self
            .tasks
            .shutdown_node("otlp_intake", INTAKE_SHUTDOWN_DEADLINE, reason)
            .await
        {
            tracing::warn!(error = %e, "intake shutdown incomplete");
        }

        // No new window ticks while the variants drain.
        self.tasks.stop_timers();

        for label in PipelineLabel::ALL {
            let name = format!("variant:{label}");
            if let Err(e) = self
                .tasks
                .shutdown_node(&name, VARIANT_DRAIN_DEADLINE, reason)
                .await
            {
                tracing::warn!(node = %name, error = %e, "variant shutdown incomplete");
            }
        }
        for label in PipelineLabel::ALL {
            let name = format!("sink:{label}");
            if let Err(e) = self
                .tasks
                .shutdown_node(&name, SINK_FLUSH_DEADLINE, reason)
                .await
            {
                tracing::warn!(node = %name, error = %e, "sink shutdown incomplete");
            }
        }
    }
}
