// SPDX-License-Identifier: Apache-2.0

//! The Phoenix service binary.
//!
//! Wires the data plane (intake, variants, sinks), the Observer, the
//! controller with its control-file reader, and the admin HTTP plane, then
//! runs until SIGINT/SIGTERM and drives the staged shutdown: intake stops
//! accepting, variants drain, sinks flush, and the controller writes the
//! final control document.

use clap::Parser;
use phoenix_config::Settings;
use phoenix_controller::control_file::{control_handle, ControlFileReader};
use phoenix_controller::{Controller, KpiRegistry, ObserverState, WebhookState};
use std::path::PathBuf;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "phoenix", about = "Adaptive cardinality-optimization pipeline")]
struct Cli {
    /// Path to the YAML settings file; environment variables overlay it.
    #[arg(long, short)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    match run(Cli::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "phoenix exited with an error");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let settings = Settings::load(cli.config.as_deref())?;
    tracing::info!(
        target = settings.controller.target_ts_count,
        conservative_max_ts = settings.controller.conservative_max_ts,
        aggressive_min_ts = settings.controller.aggressive_min_ts,
        "phoenix starting"
    );

    let metrics = phoenix_telemetry::Metrics::new()?;
    let control = control_handle();
    let kpis = KpiRegistry::new();
    let observer = ObserverState::new(settings.observer.history_len);
    let webhook = WebhookState::new();
    let cancel = CancellationToken::new();

    // Data plane.
    let pipelines = phoenix_nodes::pipeline::spawn_pipelines(
        &settings,
        control.clone(),
        kpis.clone(),
        metrics.clone(),
    )?;

    // Observer.
    let observer_task = tokio::spawn(phoenix_controller::observer::run_observer(
        kpis.clone(),
        observer.clone(),
        settings.observer.clone(),
        metrics.clone(),
        cancel.child_token(),
    ));

    // Control-file reader: picks up out-of-band (manual) edits; the
    // controller's own writes land in the same handle directly.
    let reader = ControlFileReader::new(
        &settings.control_file.path,
        control.clone(),
        Some(metrics.clone()),
    );
    let reader_task = tokio::spawn(phoenix_controller::control_file::run_reader(
        reader,
        settings.control_file.poll_interval,
        cancel.child_token(),
    ));

    // Controller: sole owner of the control-file write side.
    let controller = Controller::new(
        settings.controller.clone(),
        &settings.control_file.path,
        control.clone(),
        observer.clone(),
        webhook.clone(),
        metrics.clone(),
        settings.pipelines.experimental_enabled,
    )?;
    let controller_cancel = CancellationToken::new();
    let controller_task = tokio::spawn(controller.run(controller_cancel.clone()));

    // Admin plane.
    let admin_state = phoenix_admin::AppState {
        control: control.clone(),
        observer: observer.clone(),
        webhook: webhook.clone(),
        metrics: metrics.clone(),
        settings: settings.controller.clone(),
        settings_sink_queue_capacity: settings.sink.queue_capacity,
    };
    let admin_bind = settings.admin.bind.clone();
    let admin_task = tokio::spawn({
        let cancel = cancel.child_token();
        async move { phoenix_admin::run(&admin_bind, admin_state, cancel).await }
    });

    wait_for_shutdown_signal().await;
    tracing::info!("shutdown signal received, draining");

    // Staged shutdown: intake first, then variants, then sinks.
    pipelines.shutdown("shutdown signal").await;

    // Stop the ancillary tasks, then let the controller write its final
    // document before exiting.
    cancel.cancel();
    controller_cancel.cancel();
    if let Err(e) = controller_task.await? {
        tracing::warn!(error = %e, "final control-file write failed");
    }
    let _ = observer_task.await;
    let _ = reader_task.await;
    let _ = admin_task.await;

    tracing::info!("phoenix stopped");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            tracing::warn!(error = %e, "SIGTERM handler unavailable, using ctrl-c only");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
