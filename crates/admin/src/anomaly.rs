// SPDX-License-Identifier: Apache-2.0

//! The anomaly webhook ingress.
//!
//! POST `/anomaly` with the detector payload. Returns 202 when accepted
//! (or ignored below the severity/confidence bar) and 429 when an accepted
//! forced transition already happened inside the rate-limit window.

use crate::AppState;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use phoenix_controller::{AnomalyEvent, WebhookOutcome};
use serde::Serialize;
use std::time::Instant;

pub(crate) fn routes() -> Router<AppState> {
    Router::new().route("/anomaly", post(accept_anomaly))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AnomalyResponse {
    outcome: &'static str,
}

async fn accept_anomaly(
    State(state): State<AppState>,
    Json(event): Json<AnomalyEvent>,
) -> (StatusCode, Json<AnomalyResponse>) {
    let outcome = state
        .webhook
        .offer(&event, &state.settings, Instant::now());
    match outcome {
        WebhookOutcome::Accepted => {
            state.metrics.webhook_accepted.inc();
            tracing::info!(
                anomaly_id = %event.anomaly_id,
                metric = %event.metric_name,
                confidence = event.confidence,
                "anomaly webhook accepted, forcing next decision"
            );
            (
                StatusCode::ACCEPTED,
                Json(AnomalyResponse { outcome: "accepted" }),
            )
        }
        WebhookOutcome::RateLimited => {
            state.metrics.webhook_rate_limited.inc();
            (
                StatusCode::TOO_MANY_REQUESTS,
                Json(AnomalyResponse {
                    outcome: "rate_limited",
                }),
            )
        }
        WebhookOutcome::Ignored => (
            StatusCode::ACCEPTED,
            Json(AnomalyResponse { outcome: "ignored" }),
        ),
    }
}
