// SPDX-License-Identifier: Apache-2.0

//! Typed settings for every Phoenix subsystem.
//!
//! Settings are loaded from an optional YAML file, then overlaid with the
//! environment contract (see [`crate::env`]), then validated. Validation is
//! all-or-nothing: any malformed value refuses startup.

use crate::classify::ClassifierSettings;
use crate::error::Error;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Behavior of an intake fan-out queue when it is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Suspend the producer until space is available (back-pressure).
    Block,
    /// Drop the incoming batch and count it.
    Drop,
}

/// Intake settings: ingest endpoint, memory guard, fan-out queues.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IntakeSettings {
    /// OTLP gRPC bind address.
    pub grpc_bind: String,
    /// OTLP HTTP bind address (reserved; not served by this build).
    pub http_bind: String,
    /// Soft resident-set limit; batches are refused above it.
    pub memory_limit_mib: u64,
    /// Capacity of each variant's input queue, in batches.
    pub queue_capacity: usize,
    /// What to do when a variant queue is full.
    pub overflow: OverflowPolicy,
    /// Staleness timeout for the cumulative-to-delta last-value map.
    #[serde(with = "humantime_serde")]
    pub delta_staleness_timeout: Duration,
}

impl Default for IntakeSettings {
    fn default() -> Self {
        Self {
            grpc_bind: "0.0.0.0:4317".to_owned(),
            http_bind: "0.0.0.0:4318".to_owned(),
            memory_limit_mib: 512,
            queue_capacity: 4096,
            overflow: OverflowPolicy::Block,
            delta_staleness_timeout: Duration::from_secs(600),
        }
    }
}

/// Per-profile Top-K sizes for the experimental variant.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct TopKSettings {
    /// `k` under the conservative profile.
    pub conservative_k: usize,
    /// `k` under the balanced profile.
    pub balanced_k: usize,
    /// `k` under the aggressive profile.
    pub aggressive_k: usize,
    /// Monitor capacity as a multiple of `k`.
    pub monitor_ratio: usize,
}

impl Default for TopKSettings {
    fn default() -> Self {
        Self {
            conservative_k: 50,
            balanced_k: 30,
            aggressive_k: 15,
            monitor_ratio: 10,
        }
    }
}

/// Settings shared by the three pipeline variants.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    /// Whether the experimental variant runs at all.
    pub experimental_enabled: bool,
    /// Emissions between control-snapshot re-reads in the variant hot loop.
    pub control_reread_interval: u64,
    /// Rolling window for the optimized variant's low-priority median filter.
    #[serde(with = "humantime_serde")]
    pub low_filter_window: Duration,
    /// Top-K sizes per profile.
    pub topk: TopKSettings,
    /// HyperLogLog precision (`p`).
    pub hll_precision: u8,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            experimental_enabled: true,
            control_reread_interval: 1024,
            low_filter_window: Duration::from_secs(60),
            topk: TopKSettings::default(),
            hll_precision: 14,
        }
    }
}

/// Observer cadence and history.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObserverSettings {
    /// Observation window length.
    #[serde(with = "humantime_serde")]
    pub window: Duration,
    /// Bounded KPI history length, in samples.
    pub history_len: usize,
}

impl Default for ObserverSettings {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(10),
            history_len: 20,
        }
    }
}

/// PID gains, interpreted per second of wall time between decisions.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct PidGains {
    /// Proportional gain.
    pub kp: f64,
    /// Integral gain.
    pub ki: f64,
    /// Derivative gain.
    pub kd: f64,
}

impl Default for PidGains {
    fn default() -> Self {
        Self {
            kp: 0.5,
            ki: 0.1,
            kd: 0.05,
        }
    }
}

/// Controller decision-loop settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerSettings {
    /// Interval between controller decision cycles.
    #[serde(with = "humantime_serde")]
    pub cycle_interval: Duration,
    /// Soft budget for one decision; exceeding it aborts the cycle.
    #[serde(with = "humantime_serde")]
    pub decision_budget: Duration,
    /// PID setpoint: the optimized pipeline's target time-series count.
    pub target_ts_count: u64,
    /// Fractional hysteresis band around thresholds, in `[0, 1)`.
    pub hysteresis_factor: f64,
    /// Minimum interval between mode changes.
    #[serde(with = "humantime_serde")]
    pub stability_period: Duration,
    /// Upper cardinality bound for the conservative profile.
    pub conservative_max_ts: u64,
    /// Lower cardinality bound for the aggressive profile.
    pub aggressive_min_ts: u64,
    /// Cardinality growth rate (series/sec) that triggers explosion handling.
    pub explosion_rate_threshold: f64,
    /// Absolute cardinality that triggers explosion handling.
    pub explosion_absolute_threshold: u64,
    /// Sticky lockout after an explosion.
    #[serde(with = "humantime_serde")]
    pub explosion_sticky: Duration,
    /// PID gains.
    pub pid_gains: PidGains,
    /// Anti-windup clamp on the PID integral term (absolute value).
    pub integral_limit: f64,
    /// Samples used for the cardinality growth-rate computation.
    pub growth_samples: usize,
    /// Window over which mode changes are counted for oscillation detection.
    #[serde(with = "humantime_serde")]
    pub oscillation_window: Duration,
    /// Mode changes within the window that arm the oscillation guard.
    pub oscillation_change_limit: usize,
    /// Cycles without fresh KPI samples before the controller goes blind.
    pub blind_cycle_limit: u32,
    /// Critical process patterns; single source of truth with the classifier.
    pub critical_process_regex: Vec<String>,
    /// Minimum webhook confidence to force a transition.
    pub webhook_min_confidence: f64,
    /// Whether `medium` severity webhooks may force a (Balanced) transition.
    pub anomaly_webhook_medium_enabled: bool,
    /// Minimum interval between webhook-forced transitions.
    #[serde(with = "humantime_serde")]
    pub webhook_rate_limit: Duration,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            cycle_interval: Duration::from_secs(60),
            decision_budget: Duration::from_secs(5),
            target_ts_count: 20_000,
            hysteresis_factor: 0.1,
            stability_period: Duration::from_secs(120),
            conservative_max_ts: 15_000,
            aggressive_min_ts: 25_000,
            explosion_rate_threshold: 10_000.0,
            explosion_absolute_threshold: 1_000_000,
            explosion_sticky: Duration::from_secs(600),
            pid_gains: PidGains::default(),
            integral_limit: 1_000_000.0,
            growth_samples: 5,
            oscillation_window: Duration::from_secs(600),
            oscillation_change_limit: 3,
            blind_cycle_limit: 2,
            critical_process_regex: vec![
                "^(systemd|kubelet|containerd|dockerd|sshd)$".to_owned(),
            ],
            webhook_min_confidence: 0.9,
            anomaly_webhook_medium_enabled: false,
            webhook_rate_limit: Duration::from_secs(300),
        }
    }
}

/// Control-file location and reader cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlFileSettings {
    /// Path of the on-disk control document.
    pub path: PathBuf,
    /// Reader poll interval; a floor even when directory watching works.
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
}

impl Default for ControlFileSettings {
    fn default() -> Self {
        Self {
            path: PathBuf::from("control/optimization_mode.yaml"),
            poll_interval: Duration::from_secs(30),
        }
    }
}

/// Sink adapter settings: endpoint, batching, queueing, retry policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SinkSettings {
    /// OTLP gRPC endpoint of the downstream sink.
    pub endpoint: String,
    /// Maximum datapoints per outbound batch.
    pub batch_size: usize,
    /// Bounded outbound queue capacity, in batches.
    pub queue_capacity: usize,
    /// Per-batch send timeout.
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Initial retry backoff.
    #[serde(with = "humantime_serde")]
    pub backoff_initial: Duration,
    /// Backoff multiplier.
    pub backoff_multiplier: f64,
    /// Backoff ceiling.
    #[serde(with = "humantime_serde")]
    pub backoff_max: Duration,
    /// Total elapsed retry budget per batch.
    #[serde(with = "humantime_serde")]
    pub backoff_max_elapsed: Duration,
}

impl Default for SinkSettings {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:4320".to_owned(),
            batch_size: 10_000,
            queue_capacity: 1_000,
            request_timeout: Duration::from_secs(30),
            backoff_initial: Duration::from_secs(5),
            backoff_multiplier: 2.0,
            backoff_max: Duration::from_secs(30),
            backoff_max_elapsed: Duration::from_secs(300),
        }
    }
}

/// Admin plane (health, self-metrics, anomaly webhook) settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdminSettings {
    /// HTTP bind address for `/livez`, `/readyz`, `/status`, `/metrics`
    /// and the anomaly webhook.
    pub bind: String,
}

impl Default for AdminSettings {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:13133".to_owned(),
        }
    }
}

/// Root settings document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Intake settings.
    pub intake: IntakeSettings,
    /// Classifier rule set.
    pub classifier: ClassifierSettings,
    /// Variant pipeline settings.
    pub pipelines: PipelineSettings,
    /// Observer cadence.
    pub observer: ObserverSettings,
    /// Controller decision loop.
    pub controller: ControllerSettings,
    /// Control-file protocol.
    pub control_file: ControlFileSettings,
    /// Sink adapter.
    pub sink: SinkSettings,
    /// Admin plane.
    pub admin: AdminSettings,
}

impl Settings {
    /// Loads settings from an optional YAML file, applies the environment
    /// contract from the process environment, and validates.
    pub fn load(path: Option<&std::path::Path>) -> Result<Self, Error> {
        let mut settings = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path).map_err(|e| Error::FileReadError {
                    path: path.display().to_string(),
                    details: e.to_string(),
                })?;
                serde_yaml::from_str(&text).map_err(|e| Error::DeserializationError {
                    path: path.display().to_string(),
                    details: e.to_string(),
                })?
            }
            None => Settings::default(),
        };
        crate::env::apply_env_overrides(&mut settings, std::env::vars())?;
        settings.finish()?;
        Ok(settings)
    }

    /// Normalizes derived values and validates the whole document.
    pub fn finish(&mut self) -> Result<(), Error> {
        self.classifier
            .ensure_critical_patterns(&self.controller.critical_process_regex);
        self.validate()
    }

    /// Validates every subsystem's settings.
    pub fn validate(&self) -> Result<(), Error> {
        self.classifier.validate()?;

        for pattern in &self.controller.critical_process_regex {
            let _ = regex::Regex::new(pattern).map_err(|e| Error::InvalidRegex {
                pattern: pattern.clone(),
                context: "critical process list",
                details: e.to_string(),
            })?;
        }

        let h = self.controller.hysteresis_factor;
        if !(0.0..1.0).contains(&h) {
            return Err(Error::InvalidSetting {
                setting: "controller.hysteresis_factor",
                details: format!("must be in [0, 1), got {h}"),
            });
        }
        if self.controller.conservative_max_ts >= self.controller.aggressive_min_ts {
            return Err(Error::InvalidSetting {
                setting: "controller.conservative_max_ts",
                details: format!(
                    "must be below aggressive_min_ts ({} >= {})",
                    self.controller.conservative_max_ts, self.controller.aggressive_min_ts
                ),
            });
        }
        if self.controller.growth_samples < 2 {
            return Err(Error::InvalidSetting {
                setting: "controller.growth_samples",
                details: "at least two samples are needed for a rate".to_owned(),
            });
        }
        if !(4..=18).contains(&self.pipelines.hll_precision) {
            return Err(Error::InvalidSetting {
                setting: "pipelines.hll_precision",
                details: format!("must be in [4, 18], got {}", self.pipelines.hll_precision),
            });
        }
        if self.pipelines.topk.monitor_ratio == 0 {
            return Err(Error::InvalidSetting {
                setting: "pipelines.topk.monitor_ratio",
                details: "monitor capacity must be at least k".to_owned(),
            });
        }
        if self.sink.batch_size == 0 || self.sink.queue_capacity == 0 {
            return Err(Error::InvalidSetting {
                setting: "sink.batch_size",
                details: "batch size and queue capacity must be positive".to_owned(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let mut settings = Settings::default();
        settings.finish().expect("defaults must be valid");
    }

    #[test]
    fn critical_patterns_injected_into_classifier() {
        let mut settings = Settings::default();
        settings.controller.critical_process_regex = vec!["^postgres$".to_owned()];
        settings.finish().expect("valid");
        assert!(settings
            .classifier
            .rules
            .iter()
            .any(|r| r.pattern == "^postgres$"));
    }

    #[test]
    fn hysteresis_domain_enforced() {
        let mut settings = Settings::default();
        settings.controller.hysteresis_factor = 1.0;
        assert!(matches!(
            settings.validate(),
            Err(Error::InvalidSetting {
                setting: "controller.hysteresis_factor",
                ..
            })
        ));
    }

    #[test]
    fn threshold_ordering_enforced() {
        let mut settings = Settings::default();
        settings.controller.conservative_max_ts = 30_000;
        settings.controller.aggressive_min_ts = 25_000;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn yaml_round_trip() {
        let settings = Settings::default();
        let text = serde_yaml::to_string(&settings).expect("serialize");
        let back: Settings = serde_yaml::from_str(&text).expect("parse");
        assert_eq!(back.controller.target_ts_count, 20_000);
        assert_eq!(back.observer.history_len, 20);
    }
}
