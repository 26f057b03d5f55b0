//! Approval endpoints — the human side of the tool-call gate.
//!
//! - `GET  /sessions/:sid/approvals`               — pending, oldest first
//! - `POST /sessions/:sid/approvals/:aid/approve`  — `{apply_to_future?}`
//! - `POST /sessions/:sid/approvals/:aid/reject`

use axum::extract::{Extension, Path, State};
use axum::response::Json;
use serde::Deserialize;
use serde_json::Value;

use crate::runtime::store::ApprovalRecord;
use crate::state::AppState;

use super::auth::Tenant;
use super::ApiResult;

pub(crate) fn approval_json(approval: &ApprovalRecord) -> Value {
    serde_json::json!({
        "approval_id": approval.approval_id,
        "session_id": approval.session_id,
        "run_id": approval.run_id,
        "tool_name": approval.tool_name,
        "args": approval.args,
        "created_at": approval.created_at,
        "status": approval.status,
        "decided_at": approval.decided_at,
    })
}

pub async fn list_pending(
    State(state): State<AppState>,
    Extension(tenant): Extension<Tenant>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<Value>> {
    let items = state
        .store
        .list_pending_approvals(&session_id, Some(&tenant.0))?;
    let items: Vec<Value> = items.iter().map(approval_json).collect();
    Ok(Json(serde_json::json!({ "items": items })))
}

#[derive(Debug, Default, Deserialize)]
pub struct ApproveBody {
    #[serde(default)]
    pub apply_to_future: bool,
}

pub async fn approve(
    State(state): State<AppState>,
    Extension(tenant): Extension<Tenant>,
    Path((session_id, approval_id)): Path<(String, String)>,
    body: Option<Json<ApproveBody>>,
) -> ApiResult<Json<Value>> {
    let body = body.map(|Json(b)| b).unwrap_or_default();
    let approval = state.store.approve_approval(
        &session_id,
        &approval_id,
        body.apply_to_future,
        Some(&tenant.0),
    )?;
    tracing::info!(%session_id, %approval_id, "approval granted");
    Ok(Json(approval_json(&approval)))
}

pub async fn reject(
    State(state): State<AppState>,
    Extension(tenant): Extension<Tenant>,
    Path((session_id, approval_id)): Path<(String, String)>,
) -> ApiResult<Json<Value>> {
    let approval = state
        .store
        .reject_approval(&session_id, &approval_id, Some(&tenant.0))?;
    tracing::info!(%session_id, %approval_id, "approval rejected");
    Ok(Json(approval_json(&approval)))
}
