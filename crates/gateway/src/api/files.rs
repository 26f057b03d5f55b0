//! File inspection endpoints.
//!
//! - `GET /sessions/:sid/files`        — merged workspace + artifact listing
//! - `GET /sessions/:sid/files/*path`  — file content (artifact fallback)

use axum::extract::{Extension, Path, State};
use axum::response::Json;
use serde_json::Value;

use ra_workspace::FileMeta;

use crate::state::AppState;

use super::auth::Tenant;
use super::ApiResult;

pub(crate) fn file_json(meta: &FileMeta) -> Value {
    serde_json::json!({
        "path": meta.path,
        "size_bytes": meta.size_bytes,
        "modified_at": meta.modified_at,
    })
}

pub async fn list_files(
    State(state): State<AppState>,
    Extension(tenant): Extension<Tenant>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<Value>> {
    let files = state
        .store
        .list_session_files(&session_id, Some(&tenant.0))
        .await?;
    let items: Vec<Value> = files.iter().map(file_json).collect();
    Ok(Json(serde_json::json!({ "files": items })))
}

pub async fn read_file(
    State(state): State<AppState>,
    Extension(tenant): Extension<Tenant>,
    Path((session_id, file_path)): Path<(String, String)>,
) -> ApiResult<Json<Value>> {
    let content = state
        .store
        .read_session_file(&session_id, &file_path, Some(&tenant.0))
        .await?;
    Ok(Json(serde_json::json!({
        "path": content.path,
        "size_bytes": content.content.len(),
        "content": String::from_utf8_lossy(&content.content),
    })))
}
