//! Shared application state passed to all API handlers.

use std::sync::Arc;

use ra_domain::config::Config;

use crate::api::auth::RateLimiter;
use crate::runtime::scheduler::Scheduler;
use crate::runtime::store::RuntimeStore;

/// Everything a handler needs, grouped by concern:
/// - **Config** — env-derived knobs, read-only after startup
/// - **Runtime** — the durable store and the run scheduler
/// - **Security** — startup-computed token hash, per-tenant limiter
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,

    pub store: Arc<RuntimeStore>,
    pub scheduler: Arc<Scheduler>,

    /// SHA-256 of the API bearer token (token auth mode only).
    pub api_token_hash: Option<Arc<Vec<u8>>>,
    pub rate_limiter: Arc<RateLimiter>,
}

impl AppState {
    pub fn new(
        config: Arc<Config>,
        store: Arc<RuntimeStore>,
        scheduler: Arc<Scheduler>,
    ) -> Self {
        let api_token_hash = (!config.api_token.is_empty()).then(|| {
            use sha2::{Digest, Sha256};
            Arc::new(Sha256::digest(config.api_token.as_bytes()).to_vec())
        });
        let rate_limiter = Arc::new(RateLimiter::new(config.rate_limit_rpm));

        Self {
            config,
            store,
            scheduler,
            api_token_hash,
            rate_limiter,
        }
    }
}
