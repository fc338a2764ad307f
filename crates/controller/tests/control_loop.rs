// SPDX-License-Identifier: Apache-2.0

//! Loop-level tests of the controller task: initial emission, version
//! gating across blind refreshes, profile-change timestamps, and the final
//! shutdown document. Time is driven by the paused tokio clock.

use phoenix_config::ControllerSettings;
use phoenix_controller::control_file::{control_handle, ControlFile};
use phoenix_controller::observer::{KpiSample, ObserverHandle, ObserverState};
use phoenix_controller::webhook::WebhookState;
use phoenix_controller::{Controller, OptimizationProfile, TriggerReason};
use phoenix_pdata::PipelineLabel;
use std::path::Path;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn seed_sample(observer: &ObserverHandle, cardinality: u64, t_secs: u64) {
    let mut state = observer.lock();
    for label in PipelineLabel::ALL {
        state.push(KpiSample {
            pipeline_label: label,
            cardinality_estimate: cardinality,
            critical_retained_count: 5,
            critical_required_count: 5,
            input_process_count: 120,
            cpu_ms_per_sec: 12.0,
            rss_bytes: 64 << 20,
            sample_time_unix_nano: t_secs * 1_000_000_000,
        });
    }
    state.sample_seq += 1;
}

fn read_doc(path: &Path) -> ControlFile {
    let text = std::fs::read_to_string(path).expect("control file must exist");
    serde_yaml::from_str(&text).expect("control file must parse")
}

struct Fixture {
    path: std::path::PathBuf,
    observer: ObserverHandle,
    cancel: CancellationToken,
    task: tokio::task::JoinHandle<Result<(), phoenix_controller::Error>>,
    _dir: tempfile::TempDir,
}

fn start_controller(settings: ControllerSettings) -> Fixture {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("optimization_mode.yaml");
    let handle = control_handle();
    let observer = ObserverState::new(20);
    let webhook = WebhookState::new();
    let metrics = phoenix_telemetry::Metrics::new().expect("metrics");
    let controller = Controller::new(
        settings,
        &path,
        handle,
        observer.clone(),
        webhook,
        metrics,
        true,
    )
    .expect("controller");

    let cancel = CancellationToken::new();
    let task = tokio::spawn(controller.run(cancel.clone()));
    Fixture {
        path,
        observer,
        cancel,
        task,
        _dir: dir,
    }
}

async fn step_one_cycle() {
    tokio::time::sleep(Duration::from_secs(61)).await;
    // Let the controller task run its cycle body.
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

#[tokio::test(start_paused = true)]
async fn initial_document_is_written_before_the_first_cycle() {
    let fx = start_controller(ControllerSettings::default());
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }

    let doc = read_doc(&fx.path);
    assert_eq!(doc.config_version, 1);
    assert_eq!(doc.trigger_reason, TriggerReason::Initial);
    assert_eq!(doc.optimization_profile, OptimizationProfile::Conservative);
    assert!(!doc.correlation_id.is_empty());

    fx.cancel.cancel();
    fx.task.await.expect("join").expect("clean run");
}

#[tokio::test(start_paused = true)]
async fn blind_cycles_refresh_without_advancing_the_version() {
    let fx = start_controller(ControllerSettings::default());
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
    let initial = read_doc(&fx.path);
    assert_eq!(initial.config_version, 1);

    // Three cycles with no Observer samples at all: the controller is
    // blind, rewrites the document each cycle, and never bumps the version
    // or the profile.
    let mut last_updated = initial.last_updated.clone();
    for _ in 0..3 {
        step_one_cycle().await;
        let doc = read_doc(&fx.path);
        assert_eq!(doc.config_version, 1);
        assert_eq!(doc.optimization_profile, initial.optimization_profile);
        assert_ne!(doc.last_updated, last_updated, "last_updated must refresh");
        last_updated = doc.last_updated;
    }

    fx.cancel.cancel();
    fx.task.await.expect("join").expect("clean run");
}

#[tokio::test(start_paused = true)]
async fn profile_change_updates_timestamp_and_version() {
    let fx = start_controller(ControllerSettings::default());
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }

    // A cardinality above the hysteresis band upgrades to Balanced.
    seed_sample(&fx.observer, 17_000, 10);
    step_one_cycle().await;

    let doc = read_doc(&fx.path);
    assert_eq!(doc.config_version, 2);
    assert_eq!(doc.optimization_profile, OptimizationProfile::Balanced);
    assert_eq!(doc.trigger_reason, TriggerReason::Pid);
    assert_eq!(
        doc.last_profile_change_timestamp, doc.last_updated,
        "a profile change pins the change timestamp to this write"
    );
    assert_eq!(doc.current_metrics.optimized_cardinality, 17_000);

    // In-band samples afterwards: no new version, stable document.
    seed_sample(&fx.observer, 16_000, 20);
    step_one_cycle().await;
    let unchanged = read_doc(&fx.path);
    assert_eq!(unchanged.config_version, 2);
    assert_eq!(
        unchanged.last_profile_change_timestamp,
        doc.last_profile_change_timestamp
    );

    fx.cancel.cancel();
    fx.task.await.expect("join").expect("clean run");
}

#[tokio::test(start_paused = true)]
async fn shutdown_writes_a_final_versioned_document() {
    let fx = start_controller(ControllerSettings::default());
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
    let initial = read_doc(&fx.path);

    fx.cancel.cancel();
    fx.task.await.expect("join").expect("clean run");

    let final_doc = read_doc(&fx.path);
    assert_eq!(final_doc.trigger_reason, TriggerReason::Shutdown);
    assert_eq!(final_doc.config_version, initial.config_version + 1);
}
