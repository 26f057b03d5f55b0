//! Liveness, metrics, and alert endpoints.

use axum::extract::State;
use axum::response::Json;
use serde_json::Value;

use crate::state::AppState;

pub async fn healthz() -> Json<Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

pub async fn metrics(State(state): State<AppState>) -> Json<Value> {
    let metrics = state.store.runtime_metrics(state.scheduler.queue_depth());
    Json(serde_json::json!(metrics))
}

pub async fn alerts(State(state): State<AppState>) -> Json<Value> {
    let items = state.store.alerts(state.scheduler.queue_depth());
    Json(serde_json::json!({ "items": items }))
}
