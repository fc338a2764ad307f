// SPDX-License-Identifier: Apache-2.0

//! Anomaly webhook ingress state.
//!
//! An external anomaly detector may force the next decision to a more
//! aggressive profile. The admin plane validates and offers events here;
//! the controller consumes at most one pending forced transition per
//! decision cycle. Accepted forces are rate limited.

use crate::mode::OptimizationProfile;
use parking_lot::Mutex;
use phoenix_config::ControllerSettings;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;

/// Webhook severity ladder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Informational; never forces a transition.
    Low,
    /// Forces a `Balanced` transition only when explicitly enabled.
    Medium,
    /// Forces an `Aggressive` transition.
    High,
    /// Forces an `Aggressive` transition.
    Critical,
}

/// The webhook payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnomalyEvent {
    /// Detector-assigned id.
    pub anomaly_id: String,
    /// Severity ladder value.
    pub severity: Severity,
    /// The metric the detector flagged.
    pub metric_name: String,
    /// Observed value.
    pub current_value: f64,
    /// Expected value.
    pub expected_value: f64,
    /// Detector confidence in `[0, 1]`.
    pub confidence: f64,
}

/// A transition the next decision cycle must apply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForcedTransition {
    /// The profile to force.
    pub profile: OptimizationProfile,
    /// The anomaly that caused it.
    pub anomaly_id: String,
}

/// Outcome of offering an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookOutcome {
    /// The event will force the next decision.
    Accepted,
    /// A forced transition was accepted within the rate-limit window.
    RateLimited,
    /// The event does not meet the severity/confidence bar.
    Ignored,
}

#[derive(Default)]
struct WebhookInner {
    pending: Option<ForcedTransition>,
    last_accepted_at: Option<Instant>,
}

/// Shared webhook ingress state.
#[derive(Default)]
pub struct WebhookState {
    inner: Mutex<WebhookInner>,
}

impl WebhookState {
    /// Creates empty state.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Offers an event, applying the severity ladder, the confidence bar,
    /// and the rate limit.
    pub fn offer(
        &self,
        event: &AnomalyEvent,
        settings: &ControllerSettings,
        now: Instant,
    ) -> WebhookOutcome {
        if event.confidence < settings.webhook_min_confidence {
            return WebhookOutcome::Ignored;
        }
        let profile = match event.severity {
            Severity::High | Severity::Critical => OptimizationProfile::Aggressive,
            Severity::Medium if settings.anomaly_webhook_medium_enabled => {
                OptimizationProfile::Balanced
            }
            _ => return WebhookOutcome::Ignored,
        };

        let mut inner = self.inner.lock();
        if let Some(last) = inner.last_accepted_at {
            if now.duration_since(last) < settings.webhook_rate_limit {
                return WebhookOutcome::RateLimited;
            }
        }
        inner.last_accepted_at = Some(now);
        inner.pending = Some(ForcedTransition {
            profile,
            anomaly_id: event.anomaly_id.clone(),
        });
        WebhookOutcome::Accepted
    }

    /// Takes the pending forced transition, if any.
    #[must_use]
    pub fn take_pending(&self) -> Option<ForcedTransition> {
        self.inner.lock().pending.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn event(severity: Severity, confidence: f64) -> AnomalyEvent {
        AnomalyEvent {
            anomaly_id: "a-1".to_owned(),
            severity,
            metric_name: "process.cpu.utilization".to_owned(),
            current_value: 9.0,
            expected_value: 1.0,
            confidence,
        }
    }

    #[test]
    fn high_severity_with_confidence_forces_aggressive() {
        let state = WebhookState::new();
        let settings = ControllerSettings::default();
        let now = Instant::now();
        assert_eq!(
            state.offer(&event(Severity::High, 0.95), &settings, now),
            WebhookOutcome::Accepted
        );
        let forced = state.take_pending().expect("pending transition");
        assert_eq!(forced.profile, OptimizationProfile::Aggressive);
    }

    #[test]
    fn low_confidence_is_ignored() {
        let state = WebhookState::new();
        let settings = ControllerSettings::default();
        assert_eq!(
            state.offer(&event(Severity::High, 0.5), &settings, Instant::now()),
            WebhookOutcome::Ignored
        );
        assert!(state.take_pending().is_none());
    }

    #[test]
    fn second_force_within_window_is_rate_limited() {
        let state = WebhookState::new();
        let settings = ControllerSettings::default();
        let now = Instant::now();
        assert_eq!(
            state.offer(&event(Severity::High, 0.95), &settings, now),
            WebhookOutcome::Accepted
        );
        assert_eq!(
            state.offer(
                &event(Severity::Critical, 0.99),
                &settings,
                now + Duration::from_secs(60)
            ),
            WebhookOutcome::RateLimited
        );
        // Past the window, forces are accepted again.
        assert_eq!(
            state.offer(
                &event(Severity::High, 0.95),
                &settings,
                now + settings.webhook_rate_limit + Duration::from_secs(1)
            ),
            WebhookOutcome::Accepted
        );
    }

    #[test]
    fn medium_severity_respects_the_flag() {
        let state = WebhookState::new();
        let mut settings = ControllerSettings::default();
        assert_eq!(
            state.offer(&event(Severity::Medium, 0.95), &settings, Instant::now()),
            WebhookOutcome::Ignored
        );

        settings.anomaly_webhook_medium_enabled = true;
        assert_eq!(
            state.offer(&event(Severity::Medium, 0.95), &settings, Instant::now()),
            WebhookOutcome::Accepted
        );
        let forced = state.take_pending().expect("pending");
        assert_eq!(forced.profile, OptimizationProfile::Balanced);
    }
}
