// SPDX-License-Identifier: Apache-2.0

//! The environment contract.
//!
//! Deployment tooling configures Phoenix through a closed set of environment
//! variables layered over the settings file. Unknown variables are ignored;
//! a variable that is present but unparseable is a fatal configuration
//! error.

use crate::error::Error;
use crate::settings::Settings;
use std::time::Duration;

/// PID setpoint for the optimized pipeline's time-series count.
pub const TARGET_OPTIMIZED_PIPELINE_TS_COUNT: &str = "TARGET_OPTIMIZED_PIPELINE_TS_COUNT";
/// Fractional hysteresis band, `[0, 1)`.
pub const HYSTERESIS_FACTOR: &str = "HYSTERESIS_FACTOR";
/// Minimum seconds between mode changes.
pub const STABILITY_PERIOD_SECONDS: &str = "STABILITY_PERIOD_SECONDS";
/// Conservative profile's upper cardinality bound.
pub const THRESHOLD_OPTIMIZATION_CONSERVATIVE_MAX_TS: &str =
    "THRESHOLD_OPTIMIZATION_CONSERVATIVE_MAX_TS";
/// Aggressive profile's lower cardinality bound.
pub const THRESHOLD_OPTIMIZATION_AGGRESSIVE_MIN_TS: &str =
    "THRESHOLD_OPTIMIZATION_AGGRESSIVE_MIN_TS";
/// Explosion growth-rate threshold, series/sec.
pub const EXPLOSION_RATE_THRESHOLD: &str = "EXPLOSION_RATE_THRESHOLD";
/// Explosion absolute cardinality threshold.
pub const EXPLOSION_ABSOLUTE_THRESHOLD: &str = "EXPLOSION_ABSOLUTE_THRESHOLD";
/// Comma-separated critical process regex list.
pub const CRITICAL_PROCESS_REGEX_LIST: &str = "CRITICAL_PROCESS_REGEX_LIST";
/// Comma-separated `kp,ki,kd` gains.
pub const PID_GAINS: &str = "PID_GAINS";
/// Observation window length in seconds.
pub const OBSERVATION_WINDOW_SECONDS: &str = "OBSERVATION_WINDOW_SECONDS";
/// Maximum datapoints per outbound sink batch.
pub const SINK_BATCH_SIZE: &str = "SINK_BATCH_SIZE";
/// Outbound sink queue capacity, in batches.
pub const SINK_QUEUE_CAPACITY: &str = "SINK_QUEUE_CAPACITY";
/// Soft resident-set limit in MiB.
pub const MEMORY_LIMIT_MIB: &str = "MEMORY_LIMIT_MIB";

fn parse<T: std::str::FromStr>(var: &'static str, value: &str) -> Result<T, Error>
where
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| Error::InvalidEnvValue {
        var,
        details: e.to_string(),
    })
}

/// Applies the environment contract onto `settings`. `vars` is the process
/// environment (injected for tests).
pub fn apply_env_overrides(
    settings: &mut Settings,
    vars: impl Iterator<Item = (String, String)>,
) -> Result<(), Error> {
    for (key, value) in vars {
        match key.as_str() {
            TARGET_OPTIMIZED_PIPELINE_TS_COUNT => {
                settings.controller.target_ts_count =
                    parse(TARGET_OPTIMIZED_PIPELINE_TS_COUNT, &value)?;
            }
            HYSTERESIS_FACTOR => {
                settings.controller.hysteresis_factor = parse(HYSTERESIS_FACTOR, &value)?;
            }
            STABILITY_PERIOD_SECONDS => {
                let secs: u64 = parse(STABILITY_PERIOD_SECONDS, &value)?;
                settings.controller.stability_period = Duration::from_secs(secs);
            }
            THRESHOLD_OPTIMIZATION_CONSERVATIVE_MAX_TS => {
                settings.controller.conservative_max_ts =
                    parse(THRESHOLD_OPTIMIZATION_CONSERVATIVE_MAX_TS, &value)?;
            }
            THRESHOLD_OPTIMIZATION_AGGRESSIVE_MIN_TS => {
                settings.controller.aggressive_min_ts =
                    parse(THRESHOLD_OPTIMIZATION_AGGRESSIVE_MIN_TS, &value)?;
            }
            EXPLOSION_RATE_THRESHOLD => {
                settings.controller.explosion_rate_threshold =
                    parse(EXPLOSION_RATE_THRESHOLD, &value)?;
            }
            EXPLOSION_ABSOLUTE_THRESHOLD => {
                settings.controller.explosion_absolute_threshold =
                    parse(EXPLOSION_ABSOLUTE_THRESHOLD, &value)?;
            }
            CRITICAL_PROCESS_REGEX_LIST => {
                settings.controller.critical_process_regex = value
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_owned)
                    .collect();
            }
            PID_GAINS => {
                let parts: Vec<&str> = value.split(',').map(str::trim).collect();
                if parts.len() != 3 {
                    return Err(Error::InvalidEnvValue {
                        var: PID_GAINS,
                        details: format!("expected `kp,ki,kd`, got `{value}`"),
                    });
                }
                settings.controller.pid_gains.kp = parse(PID_GAINS, parts[0])?;
                settings.controller.pid_gains.ki = parse(PID_GAINS, parts[1])?;
                settings.controller.pid_gains.kd = parse(PID_GAINS, parts[2])?;
            }
            OBSERVATION_WINDOW_SECONDS => {
                let secs: u64 = parse(OBSERVATION_WINDOW_SECONDS, &value)?;
                settings.observer.window = Duration::from_secs(secs);
            }
            SINK_BATCH_SIZE => {
                settings.sink.batch_size = parse(SINK_BATCH_SIZE, &value)?;
            }
            SINK_QUEUE_CAPACITY => {
                settings.sink.queue_capacity = parse(SINK_QUEUE_CAPACITY, &value)?;
            }
            MEMORY_LIMIT_MIB => {
                settings.intake.memory_limit_mib = parse(MEMORY_LIMIT_MIB, &value)?;
            }
            _ => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars<'a>(pairs: &'a [(&'a str, &'a str)]) -> impl Iterator<Item = (String, String)> + 'a {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
    }

    #[test]
    fn overrides_apply() {
        let mut settings = Settings::default();
        apply_env_overrides(
            &mut settings,
            vars(&[
                (TARGET_OPTIMIZED_PIPELINE_TS_COUNT, "30000"),
                (HYSTERESIS_FACTOR, "0.15"),
                (STABILITY_PERIOD_SECONDS, "240"),
                (PID_GAINS, "1.0, 0.2, 0.01"),
                (CRITICAL_PROCESS_REGEX_LIST, "^sshd$, ^kubelet$"),
                (MEMORY_LIMIT_MIB, "1024"),
            ]),
        )
        .expect("overrides must parse");

        assert_eq!(settings.controller.target_ts_count, 30_000);
        assert_eq!(settings.controller.hysteresis_factor, 0.15);
        assert_eq!(
            settings.controller.stability_period,
            Duration::from_secs(240)
        );
        assert_eq!(settings.controller.pid_gains.kp, 1.0);
        assert_eq!(settings.controller.pid_gains.ki, 0.2);
        assert_eq!(
            settings.controller.critical_process_regex,
            vec!["^sshd$".to_owned(), "^kubelet$".to_owned()]
        );
        assert_eq!(settings.intake.memory_limit_mib, 1024);
    }

    #[test]
    fn unparseable_value_is_fatal() {
        let mut settings = Settings::default();
        let err = apply_env_overrides(
            &mut settings,
            vars(&[(TARGET_OPTIMIZED_PIPELINE_TS_COUNT, "not-a-number")]),
        )
        .expect_err("must fail");
        assert!(matches!(err, Error::InvalidEnvValue { .. }));
    }

    #[test]
    fn pid_gains_require_three_parts() {
        let mut settings = Settings::default();
        assert!(apply_env_overrides(&mut settings, vars(&[(PID_GAINS, "0.5,0.1")])).is_err());
    }

    #[test]
    fn unknown_variables_are_ignored() {
        let mut settings = Settings::default();
        apply_env_overrides(&mut settings, vars(&[("PATH", "/usr/bin")]))
            .expect("unknown vars are fine");
    }
}
