// SPDX-License-Identifier: Apache-2.0

//! Health and status endpoints.
//!
//! - GET `/livez` - liveness probe (observation loop responsive)
//! - GET `/readyz` - readiness probe (control file applied, first window done)
//! - GET `/status` - current mode, KPIs, and health summary

use crate::AppState;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;
use phoenix_controller::KpiSample;
use phoenix_pdata::PipelineLabel;
use serde::Serialize;
use std::collections::HashMap;
use std::time::SystemTime;

pub(crate) fn routes() -> Router<AppState> {
    Router::new()
        .route("/livez", get(livez))
        .route("/readyz", get(readyz))
        .route("/status", get(show_status))
}

/// Overall health classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthVerdict {
    /// Fully operational.
    Ready,
    /// Operational but impaired (controller blind or sink queue pressure).
    Degraded,
    /// Not yet serving decisions.
    Starting,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ProbeResponse {
    probe: &'static str,
    status: &'static str,
    generated_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<String>,
}

impl ProbeResponse {
    fn ok(probe: &'static str) -> Self {
        Self {
            probe,
            status: "ok",
            generated_at: Utc::now().to_rfc3339(),
            detail: None,
        }
    }

    fn fail(probe: &'static str, detail: String) -> Self {
        Self {
            probe,
            status: "failed",
            generated_at: Utc::now().to_rfc3339(),
            detail: Some(detail),
        }
    }
}

fn unix_nanos_now() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

pub(crate) fn evaluate_liveness(state: &AppState) -> Result<(), String> {
    let last_tick = state.observer.lock().last_tick_unix_nano;
    if last_tick == 0 {
        // The observation loop has not ticked yet; treat startup as live
        // so orchestrators do not kill a booting process.
        return Ok(());
    }
    let budget = state.settings.cycle_interval.as_nanos() as u64 * 2;
    let age = unix_nanos_now().saturating_sub(last_tick);
    if age > budget {
        Err(format!(
            "observation loop silent for {} s (budget {} s)",
            age / 1_000_000_000,
            budget / 1_000_000_000
        ))
    } else {
        Ok(())
    }
}

pub(crate) fn evaluate_readiness(state: &AppState) -> Result<(), String> {
    if state.control.load().config_version == 0 {
        return Err("no control file applied yet".to_owned());
    }
    if state.observer.lock().sample_seq == 0 {
        return Err("no observation window completed yet".to_owned());
    }
    Ok(())
}

pub(crate) fn evaluate_degradation(state: &AppState) -> Option<String> {
    if state.metrics.controller_blind.get() == 1 {
        return Some("controller blind: no fresh KPI samples".to_owned());
    }
    let depth = state.metrics.sink_queue_depth.get();
    let capacity = state.settings_sink_queue_capacity as i64;
    if capacity > 0 && depth > capacity * 8 / 10 {
        return Some(format!("sink queue {depth}/{capacity} over 80% full"));
    }
    None
}

async fn livez(State(state): State<AppState>) -> (StatusCode, Json<ProbeResponse>) {
    match evaluate_liveness(&state) {
        Ok(()) => (StatusCode::OK, Json(ProbeResponse::ok("livez"))),
        Err(detail) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ProbeResponse::fail("livez", detail)),
        ),
    }
}

async fn readyz(State(state): State<AppState>) -> (StatusCode, Json<ProbeResponse>) {
    match evaluate_readiness(&state) {
        Ok(()) => (StatusCode::OK, Json(ProbeResponse::ok("readyz"))),
        Err(detail) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ProbeResponse::fail("readyz", detail)),
        ),
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusResponse {
    generated_at: String,
    health: HealthVerdict,
    #[serde(skip_serializing_if = "Option::is_none")]
    degraded_reason: Option<String>,
    optimization_profile: String,
    config_version: u64,
    correlation_id: String,
    pipelines: HashMap<String, Option<KpiSample>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    signal_preservation_score: Option<f64>,
}

async fn show_status(State(state): State<AppState>) -> Json<StatusResponse> {
    let control = state.control.load();
    let degraded_reason = evaluate_degradation(&state);
    let health = if evaluate_readiness(&state).is_err() {
        HealthVerdict::Starting
    } else if degraded_reason.is_some() {
        HealthVerdict::Degraded
    } else {
        HealthVerdict::Ready
    };

    let observer = state.observer.lock();
    let pipelines = PipelineLabel::ALL
        .iter()
        .map(|label| {
            (
                label.as_str().to_owned(),
                observer.latest(*label).cloned(),
            )
        })
        .collect();
    let signal_preservation_score = observer.signal_preservation_score;
    drop(observer);

    Json(StatusResponse {
        generated_at: Utc::now().to_rfc3339(),
        health,
        degraded_reason,
        optimization_profile: control.optimization_profile.to_string(),
        config_version: control.config_version,
        correlation_id: control.correlation_id.clone(),
        pipelines,
        signal_preservation_score,
    })
}
