//! Operational settings endpoints.
//!
//! - `GET  /settings/provider-policy` — retry + fallback chain config
//! - `POST /settings/cleanup`         — trigger one cleanup pass

use axum::extract::State;
use axum::response::Json;
use serde_json::Value;

use crate::runtime::cleanup::CleanupReport;
use crate::state::AppState;

use super::ApiResult;

pub async fn provider_policy(State(state): State<AppState>) -> Json<Value> {
    Json(state.config.provider_policy())
}

pub async fn run_cleanup(State(state): State<AppState>) -> ApiResult<Json<CleanupReport>> {
    let report = state.store.cleanup_expired_resources().await?;
    Ok(Json(report))
}
