// SPDX-License-Identifier: Apache-2.0

//! Optimization profiles and decision trigger reasons.

use serde::{Deserialize, Serialize};

/// The optimization profile selected by the controller.
///
/// The profile drives each variant's knobs; in particular the experimental
/// variant's Top-K size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptimizationProfile {
    /// Largest retention, smallest reduction.
    Conservative,
    /// The middle ground.
    Balanced,
    /// Smallest retention, largest reduction.
    Aggressive,
}

impl OptimizationProfile {
    /// Stable wire name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            OptimizationProfile::Conservative => "conservative",
            OptimizationProfile::Balanced => "balanced",
            OptimizationProfile::Aggressive => "aggressive",
        }
    }

    /// Numeric value exported as the mode gauge.
    #[must_use]
    pub const fn as_index(&self) -> i64 {
        match self {
            OptimizationProfile::Conservative => 0,
            OptimizationProfile::Balanced => 1,
            OptimizationProfile::Aggressive => 2,
        }
    }
}

impl std::fmt::Display for OptimizationProfile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a control file was emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TriggerReason {
    /// First emission after startup.
    #[serde(rename = "initial")]
    Initial,
    /// A threshold or pipeline flag changed without a profile change.
    #[serde(rename = "threshold")]
    Threshold,
    /// The periodic PID decision cycle changed the profile.
    #[serde(rename = "pid")]
    Pid,
    /// A PID decision taken while the oscillation guard is armed.
    #[serde(rename = "pid+oscillation_guard")]
    PidOscillationGuard,
    /// The explosion hard override fired.
    #[serde(rename = "explosion")]
    Explosion,
    /// An operator wrote the file by hand.
    #[serde(rename = "manual")]
    Manual,
    /// An anomaly webhook forced the transition.
    #[serde(rename = "anomaly_webhook")]
    AnomalyWebhook,
    /// The final file written during process shutdown.
    #[serde(rename = "shutdown")]
    Shutdown,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profile_wire_names() {
        let yaml = serde_yaml::to_string(&OptimizationProfile::Aggressive).expect("serialize");
        assert_eq!(yaml.trim(), "aggressive");
    }

    #[test]
    fn oscillation_guard_reason_round_trips() {
        let yaml = serde_yaml::to_string(&TriggerReason::PidOscillationGuard).expect("serialize");
        assert_eq!(yaml.trim(), "pid+oscillation_guard");
        let back: TriggerReason = serde_yaml::from_str(&yaml).expect("parse");
        assert_eq!(back, TriggerReason::PidOscillationGuard);
    }
}
