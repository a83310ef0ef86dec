//! Liveness/readiness endpoints. Unauthenticated.
//! Modeled on the leaner liveness/readiness split this service needs,
//! distilled from the richer `HealthResponse`/`checks` shape of the
//! original `api_models.py`.

use crate::http::AppState;
use crate::model::KeyGenerationMetrics;
use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;
use std::sync::Arc;

#[derive(Serialize)]
pub struct LiveResponse {
    status: &'static str,
}

pub async fn live() -> Json<LiveResponse> {
    Json(LiveResponse { status: "live" })
}

#[derive(Serialize)]
pub struct CheckResult {
    name: &'static str,
    ok: bool,
}

#[derive(Serialize)]
pub struct ReadyResponse {
    status: &'static str,
    checks: Vec<CheckResult>,
    key_generation: Option<KeyGenerationMetrics>,
}

pub async fn ready(State(state): State<Arc<AppState>>) -> (StatusCode, Json<ReadyResponse>) {
    let metrics = state
        .key_pool
        .generation_metrics(&state.config.general.kme_id, &state.config.general.target_kme_id)
        .await
        .ok();

    let checks = vec![CheckResult {
        name: "key_pool",
        ok: metrics.is_some(),
    }];
    let all_ok = checks.iter().all(|c| c.ok);

    let status = if all_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(ReadyResponse {
            status: if all_ok { "ready" } else { "not_ready" },
            checks,
            key_generation: metrics,
        }),
    )
}
