//! Tenant resolution, bearer-token auth, and per-tenant rate limiting.
//!
//! The bearer token is never compared directly: both sides are hashed to
//! a fixed-length SHA-256 digest and compared in constant time, so
//! neither the token bytes nor its length leak through timing.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::extract::State;
use axum::http::Request;
use axum::middleware::Next;
use axum::response::Response;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use ra_domain::config::AuthMode;
use ra_domain::ApiError;

use crate::state::AppState;

use super::error_response;

/// Tenant resolved by the middleware, carried as a request extension.
#[derive(Debug, Clone)]
pub struct Tenant(pub String);

const DEFAULT_TENANT: &str = "local-dev";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Rate limiter
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Fixed-window limiter keyed by tenant id (60 s sliding window).
pub struct RateLimiter {
    max_per_minute: u32,
    events: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl RateLimiter {
    pub fn new(max_per_minute: u32) -> Self {
        Self {
            max_per_minute,
            events: Mutex::new(HashMap::new()),
        }
    }

    pub fn max_per_minute(&self) -> u32 {
        self.max_per_minute
    }

    pub fn allow(&self, tenant_id: &str) -> bool {
        let now = Instant::now();
        let window = Duration::from_secs(60);
        let mut events = self.events.lock();
        let queue = events.entry(tenant_id.to_owned()).or_default();

        while queue
            .front()
            .map(|t| now.duration_since(*t) >= window)
            .unwrap_or(false)
        {
            queue.pop_front();
        }
        if queue.len() >= self.max_per_minute as usize {
            return false;
        }
        queue.push_back(now);
        true
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Middleware
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Resolves the tenant for every `/api/v1` request, enforcing bearer
/// auth in token mode and the per-tenant rate limit in all modes.
pub async fn tenant_middleware(
    State(state): State<AppState>,
    mut req: Request<Body>,
    next: Next,
) -> Response {
    let mut tenant_id = req
        .headers()
        .get("x-tenant-id")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .trim()
        .to_owned();

    match state.config.auth_mode {
        AuthMode::Token => {
            let Some(expected_hash) = &state.api_token_hash else {
                return error_response(ApiError::server_misconfigured(
                    "API token auth is enabled but token is missing",
                ));
            };

            let provided = req
                .headers()
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("Bearer "))
                .map(str::trim)
                .unwrap_or("");
            if provided.is_empty() {
                return error_response(ApiError::unauthorized("Missing bearer token"));
            }

            let provided_hash = Sha256::digest(provided.as_bytes());
            if !bool::from(provided_hash.ct_eq(expected_hash.as_slice())) {
                return error_response(ApiError::unauthorized("Invalid bearer token"));
            }

            if tenant_id.is_empty() {
                return error_response(ApiError::bad_request("X-Tenant-ID header is required"));
            }
        }
        AuthMode::Off => {
            if tenant_id.is_empty() {
                tenant_id = DEFAULT_TENANT.to_owned();
            }
        }
    }

    if !state.rate_limiter.allow(&tenant_id) {
        return error_response(ApiError::rate_limited(state.rate_limiter.max_per_minute()));
    }

    req.extensions_mut().insert(Tenant(tenant_id));
    next.run(req).await
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
