// SPDX-License-Identifier: Apache-2.0

//! The Phoenix optimization controller.
//!
//! A single periodic task owns the [`decision::DecisionEngine`], the write
//! side of the control file, and the published [`control_file::ControlHandle`].
//! Each cycle it pulls a KPI snapshot from the Observer (the Observer never
//! holds a controller reference), evaluates the decision engine, and — only
//! when something changed — writes a new versioned control document and
//! swaps the in-process snapshot pointer.
//!
//! The cycle has a soft time budget; a decision that overruns it is
//! discarded without a partial write and retried on the next cycle.

pub mod control_file;
pub mod decision;
pub mod error;
pub mod mode;
pub mod observer;
pub mod pid;
pub mod webhook;

pub use control_file::{control_handle, ControlFile, ControlFileReader, ControlFileWriter, ControlHandle};
pub use decision::{ControllerState, CycleInputs, CycleOutcome, DecisionEngine};
pub use error::Error;
pub use mode::{OptimizationProfile, TriggerReason};
pub use observer::{KpiRegistry, KpiSample, ObserverHandle, ObserverState, VariantKpi};
pub use pid::{Pid, PidTerms};
pub use webhook::{AnomalyEvent, Severity, WebhookOutcome, WebhookState};

use control_file::{CurrentMetrics, PipelineFlags, Thresholds};
use phoenix_config::ControllerSettings;
use phoenix_pdata::PipelineLabel;
use phoenix_telemetry::MetricsHandle;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

/// The controller task.
pub struct Controller {
    settings: ControllerSettings,
    engine: DecisionEngine,
    writer: ControlFileWriter,
    handle: ControlHandle,
    observer: ObserverHandle,
    webhook: Arc<WebhookState>,
    metrics: MetricsHandle,
    experimental_enabled: bool,
    last_written: Option<ControlFile>,
    last_profile_change_timestamp: String,
}

impl Controller {
    /// Creates the controller. The control-file writer resumes the version
    /// sequence from any existing document.
    pub fn new(
        settings: ControllerSettings,
        control_path: &std::path::Path,
        handle: ControlHandle,
        observer: ObserverHandle,
        webhook: Arc<WebhookState>,
        metrics: MetricsHandle,
        experimental_enabled: bool,
    ) -> Result<Self, Error> {
        let writer = ControlFileWriter::new(control_path)?;
        let engine = DecisionEngine::new(settings.clone());
        Ok(Self {
            settings,
            engine,
            writer,
            handle,
            observer,
            webhook,
            metrics,
            experimental_enabled,
            last_written: None,
            last_profile_change_timestamp: String::new(),
        })
    }

    /// Runs the controller until cancellation, then writes the final
    /// shutdown document.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<(), Error> {
        self.emit(
            self.engine.state().current_mode,
            TriggerReason::Initial,
            CurrentMetrics::default(),
            None,
            true,
        )?;

        let mut interval = tokio::time::interval(self.settings.cycle_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let _ = interval.tick().await;

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }
            let started = Instant::now();
            if let Err(e) = self.run_cycle_once(started) {
                tracing::warn!(error = %e, "controller cycle failed, retrying next cycle");
            }
        }

        self.emit_shutdown()
    }

    fn run_cycle_once(&mut self, now: Instant) -> Result<(), Error> {
        let inputs = self.gather_inputs(now);
        let current_metrics = inputs.current_metrics;
        let outcome = self.engine.run_cycle(inputs);

        // The soft budget: a decision that overran is dropped before any
        // file write so readers never see a late, stale document.
        if now.elapsed() > self.settings.decision_budget {
            return Err(Error::DecisionBudgetExceeded {
                budget_ms: self.settings.decision_budget.as_millis(),
            });
        }

        self.publish_cycle_metrics(now, &outcome);

        match outcome {
            CycleOutcome::Emit {
                profile,
                trigger,
                pid_terms,
                mode_changed,
            } => {
                self.publish_pid_terms(pid_terms);
                self.emit(profile, trigger, current_metrics, pid_terms, mode_changed)
            }
            CycleOutcome::Refresh => self.refresh(),
            CycleOutcome::Hold { pid_terms } => {
                self.publish_pid_terms(pid_terms);
                // A threshold or pipeline-flag change is emitted even when
                // the profile held steady.
                if self.drifted_from_last_written() {
                    self.emit(
                        self.engine.state().current_mode,
                        TriggerReason::Threshold,
                        current_metrics,
                        pid_terms,
                        false,
                    )
                } else {
                    Ok(())
                }
            }
        }
    }

    fn gather_inputs(&mut self, now: Instant) -> CycleInputs {
        let observer = self.observer.lock();
        let latest = observer.latest(PipelineLabel::Optimized);
        let c_opt = latest.map(|s| s.cardinality_estimate);
        let growth_rate = observer
            .growth_rate(PipelineLabel::Optimized, self.settings.growth_samples)
            .unwrap_or(0.0);
        let current_metrics = CurrentMetrics {
            optimized_cardinality: c_opt.unwrap_or(0),
            growth_rate_per_sec: growth_rate,
            input_process_count: latest.map(|s| s.input_process_count).unwrap_or(0),
            critical_retained: latest.map(|s| s.critical_retained_count).unwrap_or(0),
            critical_required: latest.map(|s| s.critical_required_count).unwrap_or(0),
        };
        let sample_seq = observer.sample_seq;
        drop(observer);

        CycleInputs {
            now,
            c_opt,
            growth_rate,
            sample_seq,
            forced: self.webhook.take_pending(),
            current_metrics,
        }
    }

    fn publish_cycle_metrics(&self, now: Instant, outcome: &CycleOutcome) {
        let state = self.engine.state();
        self.metrics
            .controller_mode
            .set(state.current_mode.as_index());
        self.metrics
            .stability_score
            .set(state.stability_score(now));
        let blind = state.stale_cycles > self.settings.blind_cycle_limit;
        self.metrics.controller_blind.set(i64::from(blind));
        if matches!(
            outcome,
            CycleOutcome::Emit {
                mode_changed: true,
                ..
            }
        ) {
            self.metrics.mode_transitions.inc();
        }
    }

    fn publish_pid_terms(&self, terms: Option<PidTerms>) {
        if let Some(terms) = terms {
            self.metrics.pid_terms.with_label_values(&["p"]).set(terms.p);
            self.metrics.pid_terms.with_label_values(&["i"]).set(terms.i);
            self.metrics.pid_terms.with_label_values(&["d"]).set(terms.d);
            self.metrics.pid_terms.with_label_values(&["u"]).set(terms.u);
        }
    }

    fn thresholds(&self) -> Thresholds {
        Thresholds {
            conservative_max_ts: self.settings.conservative_max_ts,
            aggressive_min_ts: self.settings.aggressive_min_ts,
            explosion_rate: self.settings.explosion_rate_threshold,
            explosion_absolute: self.settings.explosion_absolute_threshold,
        }
    }

    fn drifted_from_last_written(&self) -> bool {
        match &self.last_written {
            Some(doc) => {
                doc.thresholds != self.thresholds()
                    || doc.pipelines.experimental_enabled != self.experimental_enabled
            }
            None => false,
        }
    }

    fn emit(
        &mut self,
        profile: OptimizationProfile,
        trigger: TriggerReason,
        current_metrics: CurrentMetrics,
        _pid_terms: Option<PidTerms>,
        mode_changed: bool,
    ) -> Result<(), Error> {
        let last_updated = chrono::Utc::now().to_rfc3339();
        if mode_changed || self.last_profile_change_timestamp.is_empty() {
            self.last_profile_change_timestamp = last_updated.clone();
        }
        let mut doc = ControlFile {
            optimization_profile: profile,
            config_version: 0, // assigned by the writer
            correlation_id: uuid::Uuid::new_v4().to_string(),
            last_updated,
            trigger_reason: trigger,
            thresholds: self.thresholds(),
            pipelines: PipelineFlags {
                experimental_enabled: self.experimental_enabled,
            },
            current_metrics,
            last_profile_change_timestamp: self.last_profile_change_timestamp.clone(),
        };
        let version = self.writer.write(&mut doc)?;
        self.metrics.control_file_writes.inc();
        self.handle.store(Arc::new(doc.clone()));
        tracing::info!(
            profile = %profile,
            trigger = ?trigger,
            config_version = version,
            correlation_id = %doc.correlation_id,
            "control file emitted"
        );
        self.last_written = Some(doc);
        Ok(())
    }

    /// Blind refresh: rewrite the last document with a fresh `last_updated`
    /// only. The version does not advance, so readers are not re-triggered.
    fn refresh(&mut self) -> Result<(), Error> {
        let Some(doc) = self.last_written.as_mut() else {
            return Ok(());
        };
        doc.last_updated = chrono::Utc::now().to_rfc3339();
        self.writer.write_refresh(doc)?;
        self.metrics.control_file_writes.inc();
        tracing::debug!(
            config_version = doc.config_version,
            "controller blind, refreshed last_updated only"
        );
        Ok(())
    }

    fn emit_shutdown(&mut self) -> Result<(), Error> {
        let current_metrics = self
            .last_written
            .as_ref()
            .map(|d| d.current_metrics)
            .unwrap_or_default();
        self.emit(
            self.engine.state().current_mode,
            TriggerReason::Shutdown,
            current_metrics,
            None,
            false,
        )
    }
}
