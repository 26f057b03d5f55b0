//! Uniform API error envelope.
//!
//! Every failure surfaced by the HTTP API is an `ApiError` carrying a
//! stable machine-readable `code`, the HTTP status it maps to, and an
//! optional `details` object. Cross-tenant reads deliberately reuse
//! `SESSION_NOT_FOUND` so existence is never leaked.

use serde_json::Value;

/// Shared error type for the gateway. The `code` → HTTP status mapping
/// is fixed; constructors below keep call sites from getting it wrong.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{code}: {message}")]
pub struct ApiError {
    pub status: u16,
    pub code: &'static str,
    pub message: String,
    pub details: Option<Value>,
}

pub type Result<T> = std::result::Result<T, ApiError>;

impl ApiError {
    pub fn new(status: u16, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    // ── 4xx ─────────────────────────────────────────────────────────

    pub fn session_not_found(session_id: &str) -> Self {
        Self::new(404, "SESSION_NOT_FOUND", format!("Session '{session_id}' not found"))
    }

    pub fn run_not_found(run_id: &str) -> Self {
        Self::new(404, "RUN_NOT_FOUND", format!("Run '{run_id}' not found"))
    }

    pub fn approval_not_found(approval_id: &str) -> Self {
        Self::new(
            404,
            "APPROVAL_NOT_FOUND",
            format!("Approval '{approval_id}' not found"),
        )
    }

    pub fn file_not_found(path: &str) -> Self {
        Self::new(404, "FILE_NOT_FOUND", format!("File '{path}' not found"))
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(400, "BAD_REQUEST", message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(401, "UNAUTHORIZED", message)
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::new(409, "INVALID_STATE", message)
    }

    pub fn active_run_exists(run_id: &str, status: &str) -> Self {
        Self::new(409, "ACTIVE_RUN_EXISTS", "Session already has an active run")
            .with_details(serde_json::json!({ "run_id": run_id, "status": status }))
    }

    pub fn idempotency_conflict() -> Self {
        Self::new(
            409,
            "IDEMPOTENCY_CONFLICT",
            "Idempotency key already used with different payload",
        )
    }

    pub fn approval_already_processed() -> Self {
        Self::new(409, "APPROVAL_ALREADY_PROCESSED", "Approval is already processed")
    }

    pub fn upload_too_large(max_upload_bytes: u64) -> Self {
        Self::new(422, "UPLOAD_TOO_LARGE", "Uploaded file exceeds size limit")
            .with_details(serde_json::json!({ "max_upload_bytes": max_upload_bytes }))
    }

    pub fn unsupported_file_type(mime_type: &str, allowed: &[String]) -> Self {
        Self::new(422, "UNSUPPORTED_FILE_TYPE", "Uploaded file type is not allowed")
            .with_details(serde_json::json!({ "mime_type": mime_type, "allowed": allowed }))
    }

    pub fn run_quota_exceeded(limit: usize) -> Self {
        Self::new(429, "SESSION_RUN_QUOTA_EXCEEDED", "Per-session run quota exceeded")
            .with_details(serde_json::json!({ "limit": limit }))
    }

    pub fn rate_limited(limit_per_minute: u32) -> Self {
        Self::new(429, "RATE_LIMITED", "Request rate limit exceeded")
            .with_details(serde_json::json!({ "limit_per_minute": limit_per_minute }))
    }

    // ── 5xx ─────────────────────────────────────────────────────────

    pub fn server_misconfigured(message: impl Into<String>) -> Self {
        Self::new(500, "SERVER_MISCONFIGURED", message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(500, "INTERNAL_ERROR", message)
    }

    /// JSON envelope body: `{code, message, details?}`.
    pub fn to_envelope(&self) -> Value {
        let mut body = serde_json::json!({
            "code": self.code,
            "message": self.message,
        });
        if let Some(details) = &self.details {
            body["details"] = details.clone();
        }
        body
    }
}

impl From<std::io::Error> for ApiError {
    fn from(err: std::io::Error) -> Self {
        ApiError::internal(format!("IO: {err}"))
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        ApiError::internal(format!("JSON: {err}"))
    }
}
