//! HTTP surface — `/api/v1` routes plus the `/healthz` probe.
//!
//! Every `/api/v1` request passes the tenant/auth middleware; failures
//! anywhere map to the uniform `{code, message, details?}` envelope.

pub mod admin;
pub mod approvals;
pub mod auth;
pub mod files;
pub mod runs;
pub mod sessions;
pub mod settings;

use axum::extract::DefaultBodyLimit;
use axum::http::StatusCode;
use axum::middleware;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;

use ra_domain::ApiError;

use crate::state::AppState;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Error envelope
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Axum-facing wrapper for [`ApiError`] so handlers can use `?`.
pub struct ApiFailure(pub ApiError);

pub type ApiResult<T> = std::result::Result<T, ApiFailure>;

impl From<ApiError> for ApiFailure {
    fn from(err: ApiError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiFailure {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(self.0.to_envelope())).into_response()
    }
}

pub(crate) fn error_response(err: ApiError) -> Response {
    ApiFailure(err).into_response()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Router
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Build the full application router. `state` is needed up front to
/// wire the tenant/auth middleware.
pub fn router(state: AppState) -> Router {
    let api_v1 = Router::new()
        // Sessions & workflow
        .route("/sessions", post(sessions::create_session))
        .route("/sessions/:session_id", get(sessions::get_session))
        .route(
            "/sessions/:session_id/auto-approve",
            post(sessions::set_auto_approve),
        )
        .route("/sessions/:session_id/resume", post(sessions::upload_resume))
        .route("/sessions/:session_id/jd", post(sessions::submit_jd))
        .route("/sessions/:session_id/export", post(sessions::export_session))
        .route("/sessions/:session_id/usage", get(sessions::get_usage))
        // Runs
        .route("/sessions/:session_id/messages", post(runs::create_message))
        .route("/sessions/:session_id/runs/:run_id", get(runs::get_run))
        .route(
            "/sessions/:session_id/runs/:run_id/interrupt",
            post(runs::interrupt_run),
        )
        .route(
            "/sessions/:session_id/runs/:run_id/stream",
            get(runs::stream_run),
        )
        // Approvals
        .route("/sessions/:session_id/approvals", get(approvals::list_pending))
        .route(
            "/sessions/:session_id/approvals/:approval_id/approve",
            post(approvals::approve),
        )
        .route(
            "/sessions/:session_id/approvals/:approval_id/reject",
            post(approvals::reject),
        )
        // Files
        .route("/sessions/:session_id/files", get(files::list_files))
        .route("/sessions/:session_id/files/*file_path", get(files::read_file))
        // Operational
        .route("/settings/provider-policy", get(settings::provider_policy))
        .route("/settings/cleanup", post(settings::run_cleanup))
        .route("/metrics", get(admin::metrics))
        .route("/alerts", get(admin::alerts))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::tenant_middleware,
        ))
        // The store enforces `max_upload_bytes` with a typed 422; give
        // the framing layer enough headroom to let oversized uploads
        // reach that check instead of dying at the transport.
        .layer(DefaultBodyLimit::max(
            state.config.max_upload_bytes as usize + 64 * 1024,
        ));

    Router::new()
        .route("/healthz", get(admin::healthz))
        .nest("/api/v1", api_v1)
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}
