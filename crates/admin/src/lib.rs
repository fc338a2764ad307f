// SPDX-License-Identifier: Apache-2.0

//! HTTP server for the Phoenix admin plane.
//!
//! Exposes liveness/readiness probes, the status summary, the Prometheus
//! `/metrics` endpoint, and the anomaly webhook ingress.

pub mod error;

mod anomaly;
mod health;
mod telemetry;

pub use error::Error;
pub use health::HealthVerdict;

use axum::Router;
use phoenix_config::ControllerSettings;
use phoenix_controller::{ControlHandle, ObserverHandle, WebhookState};
use phoenix_telemetry::MetricsHandle;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Shared state for the admin HTTP server.
#[derive(Clone)]
pub struct AppState {
    /// The latest applied control document.
    pub control: ControlHandle,
    /// The Observer's KPI state.
    pub observer: ObserverHandle,
    /// The webhook ingress state consumed by the controller.
    pub webhook: Arc<WebhookState>,
    /// The self-metrics registry.
    pub metrics: MetricsHandle,
    /// Controller settings (webhook ladder, cycle interval).
    pub settings: ControllerSettings,
    /// Sink queue capacity, for the degradation threshold.
    pub settings_sink_queue_capacity: usize,
}

/// Runs the admin HTTP server until cancellation.
pub async fn run(
    bind_address: &str,
    state: AppState,
    cancel: CancellationToken,
) -> Result<(), Error> {
    let app = Router::new()
        .merge(health::routes())
        .merge(telemetry::routes())
        .merge(anomaly::routes())
        .with_state(state);

    let addr = bind_address
        .parse::<SocketAddr>()
        .map_err(|e| Error::InvalidBindAddress {
            bind_address: bind_address.to_owned(),
            details: e.to_string(),
        })?;

    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| Error::BindFailed {
            addr: addr.to_string(),
            details: e.to_string(),
        })?;

    tracing::info!(endpoint = %addr, "admin HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            cancel.cancelled().await;
        })
        .await
        .map_err(|e| Error::ServerError {
            addr: addr.to_string(),
            details: e.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use phoenix_controller::control_file::control_handle;
    use phoenix_controller::ObserverState;

    fn app_state() -> AppState {
        AppState {
            control: control_handle(),
            observer: ObserverState::new(20),
            webhook: WebhookState::new(),
            metrics: phoenix_telemetry::Metrics::new().expect("metrics"),
            settings: ControllerSettings::default(),
            settings_sink_queue_capacity: 1_000,
        }
    }

    #[test]
    fn readiness_requires_control_file_and_window() {
        let state = app_state();
        assert!(health::evaluate_readiness(&state).is_err());

        // Control file applied, but no window yet.
        {
            let mut doc = (**state.control.load()).clone();
            doc.config_version = 1;
            state.control.store(Arc::new(doc));
        }
        assert!(health::evaluate_readiness(&state).is_err());

        state.observer.lock().sample_seq = 1;
        assert!(health::evaluate_readiness(&state).is_ok());
    }

    #[test]
    fn startup_counts_as_live() {
        let state = app_state();
        assert!(health::evaluate_liveness(&state).is_ok());
    }

    #[test]
    fn stale_observation_loop_fails_liveness() {
        let state = app_state();
        // A tick far in the past (but nonzero) trips the 2x budget.
        state.observer.lock().last_tick_unix_nano = 1;
        assert!(health::evaluate_liveness(&state).is_err());
    }

    #[test]
    fn blind_controller_degrades() {
        let state = app_state();
        assert!(health::evaluate_degradation(&state).is_none());
        state.metrics.controller_blind.set(1);
        assert!(health::evaluate_degradation(&state).is_some());
    }

    #[test]
    fn sink_queue_pressure_degrades() {
        let state = app_state();
        state.metrics.sink_queue_depth.set(801);
        let reason = health::evaluate_degradation(&state).expect("degraded");
        assert!(reason.contains("sink queue"));
    }
}
