//! Session management endpoints.
//!
//! - `POST /sessions`                         — create a session
//! - `GET  /sessions/:sid`                    — session record
//! - `POST /sessions/:sid/auto-approve`       — toggle auto-approve
//! - `POST /sessions/:sid/resume`             — multipart resume upload
//! - `POST /sessions/:sid/jd`                 — job-description submit
//! - `POST /sessions/:sid/export`             — materialize an export
//! - `GET  /sessions/:sid/usage`              — token/cost aggregates

use axum::extract::{Extension, Multipart, Path, State};
use axum::response::Json;
use serde::Deserialize;
use serde_json::Value;

use ra_domain::ApiError;

use crate::runtime::store::SessionRecord;
use crate::state::AppState;

use super::auth::Tenant;
use super::files::file_json;
use super::ApiResult;

pub(crate) fn session_json(session: &SessionRecord) -> Value {
    serde_json::json!({
        "session_id": session.session_id,
        "tenant_id": session.tenant_id,
        "workspace_name": session.workspace_name,
        "created_at": session.created_at,
        "workflow_state": session.workflow_state,
        "settings": session.settings,
        "active_run_id": session.active_run_id,
        "pending_approvals_count": session.pending_approvals_count,
        "resume_path": session.resume_path,
        "jd_text": session.jd_text,
        "jd_url": session.jd_url,
        "latest_export_path": session.latest_export_path,
        "run_count": session.runs.len(),
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /sessions
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Default, Deserialize)]
pub struct CreateSessionBody {
    #[serde(default)]
    pub workspace_name: Option<String>,
    #[serde(default)]
    pub auto_approve: Option<bool>,
}

pub async fn create_session(
    State(state): State<AppState>,
    Extension(tenant): Extension<Tenant>,
    body: Option<Json<CreateSessionBody>>,
) -> ApiResult<Json<Value>> {
    let body = body.map(|Json(b)| b).unwrap_or_default();
    let workspace_name = body
        .workspace_name
        .as_deref()
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .unwrap_or("workspace");

    let session = state
        .store
        .create_session(workspace_name, body.auto_approve.unwrap_or(false), &tenant.0)
        .await?;
    tracing::info!(session_id = %session.session_id, tenant = %tenant.0, "session created");
    Ok(Json(session_json(&session)))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GET /sessions/:sid
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn get_session(
    State(state): State<AppState>,
    Extension(tenant): Extension<Tenant>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<Value>> {
    let session = state.store.get_session(&session_id, Some(&tenant.0))?;
    Ok(Json(session_json(&session)))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /sessions/:sid/auto-approve
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
pub struct AutoApproveBody {
    pub enabled: bool,
}

pub async fn set_auto_approve(
    State(state): State<AppState>,
    Extension(tenant): Extension<Tenant>,
    Path(session_id): Path<String>,
    body: Option<Json<AutoApproveBody>>,
) -> ApiResult<Json<Value>> {
    let Some(Json(body)) = body else {
        return Err(ApiError::bad_request("enabled is required").into());
    };
    let enabled = state
        .store
        .set_auto_approve(&session_id, body.enabled, Some(&tenant.0))?;
    Ok(Json(serde_json::json!({ "enabled": enabled })))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /sessions/:sid/resume (multipart)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn upload_resume(
    State(state): State<AppState>,
    Extension(tenant): Extension<Tenant>,
    Path(session_id): Path<String>,
    mut multipart: Multipart,
) -> ApiResult<Json<Value>> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| ApiError::bad_request(format!("Malformed multipart body: {err}")))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let filename = field.file_name().unwrap_or("resume.md").to_owned();
        let mime_type = field.content_type().map(str::to_owned);
        let content = field
            .bytes()
            .await
            .map_err(|err| ApiError::bad_request(format!("Malformed multipart body: {err}")))?;

        let meta = state
            .store
            .upload_resume(
                &session_id,
                &filename,
                &content,
                mime_type.as_deref(),
                Some(&tenant.0),
            )
            .await?;
        let session = state.store.get_session(&session_id, Some(&tenant.0))?;
        return Ok(Json(serde_json::json!({
            "file": file_json(&meta),
            "workflow_state": session.workflow_state,
        })));
    }

    Err(ApiError::bad_request("Multipart field 'file' is required").into())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /sessions/:sid/jd
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Default, Deserialize)]
pub struct SubmitJdBody {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
}

pub async fn submit_jd(
    State(state): State<AppState>,
    Extension(tenant): Extension<Tenant>,
    Path(session_id): Path<String>,
    body: Option<Json<SubmitJdBody>>,
) -> ApiResult<Json<Value>> {
    let body = body.map(|Json(b)| b).unwrap_or_default();
    let session = state.store.submit_jd(
        &session_id,
        body.text.as_deref(),
        body.url.as_deref(),
        Some(&tenant.0),
    )?;
    Ok(Json(serde_json::json!({
        "workflow_state": session.workflow_state,
        "jd_text": session.jd_text,
        "jd_url": session.jd_url,
    })))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /sessions/:sid/export
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn export_session(
    State(state): State<AppState>,
    Extension(tenant): Extension<Tenant>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<Value>> {
    let meta = state.store.export_session(&session_id, Some(&tenant.0)).await?;
    let session = state.store.get_session(&session_id, Some(&tenant.0))?;
    Ok(Json(serde_json::json!({
        "file": file_json(&meta),
        "latest_export_path": session.latest_export_path,
        "workflow_state": session.workflow_state,
    })))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GET /sessions/:sid/usage
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn get_usage(
    State(state): State<AppState>,
    Extension(tenant): Extension<Tenant>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<Value>> {
    Ok(Json(
        state.store.get_session_usage(&session_id, Some(&tenant.0))?,
    ))
}
