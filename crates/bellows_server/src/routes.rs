//! HTTP/WebSocket route wiring.

use crate::metrics::{MetricsSnapshot, METRICS};
use crate::state::AppState;
use crate::{log_fanout, relay, session};
use axum::extract::State;
use axum::routing::{any, get};
use axum::{Json, Router};
use serde::Serialize;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/ws/worker", get(session::worker_ws))
        .route("/ws/relay", get(relay::relay_ws))
        .route("/ws/logs/:job_id", get(log_fanout::logs_ws))
        .route("/relay/:relay_id/*rest", any(relay::relay_ingress))
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    workers: usize,
    relays: usize,
    queued: usize,
    inflight: usize,
    metrics: MetricsSnapshot,
}

async fn healthz(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        workers: state.hub.worker_count(),
        relays: state.relays.relay_count(),
        queued: state.dispatcher.queued_len(),
        inflight: state.dispatcher.inflight_len(),
        metrics: METRICS.snapshot(),
    })
}
