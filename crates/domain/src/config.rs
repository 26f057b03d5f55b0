//! Env-driven gateway configuration.
//!
//! All knobs are read from `RA_`-prefixed environment variables with the
//! defaults below. Values are clamped to sane floors instead of failing
//! startup (a negative TTL means "disabled", not "crash").

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::runtime::{DEFAULT_ALLOWED_UPLOAD_MIME_TYPES, DEFAULT_COST_PER_MILLION_TOKENS};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Modes
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutorMode {
    Stub,
    Real,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    Off,
    Token,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Provider policy
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_seconds: f64,
    pub max_delay_seconds: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_seconds: 1.0,
            max_delay_seconds: 30.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FallbackModel {
    pub provider: String,
    pub model: String,
}

/// Parse a `provider:model,provider:model` chain, skipping malformed
/// entries the way the original config loader does.
pub fn parse_fallback_chain(value: &str) -> Vec<FallbackModel> {
    value
        .split(',')
        .filter_map(|item| {
            let raw = item.trim();
            let (provider, model) = raw.split_once(':')?;
            let provider = provider.trim();
            let model = model.trim();
            if provider.is_empty() || model.is_empty() {
                return None;
            }
            Some(FallbackModel {
                provider: provider.to_string(),
                model: model.to_string(),
            })
        })
        .collect()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Alert thresholds
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertThresholds {
    pub max_error_rate: f64,
    pub max_p95_latency_ms: f64,
    pub max_total_cost_usd: f64,
    pub max_queue_depth: f64,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            max_error_rate: 0.2,
            max_p95_latency_ms: 15_000.0,
            max_total_cost_usd: 10.0,
            max_queue_depth: 50.0,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub executor_mode: ExecutorMode,
    pub auth_mode: AuthMode,
    /// Bearer token for `AuthMode::Token`; only its SHA-256 digest is
    /// kept in server state after startup.
    pub api_token: String,
    pub rate_limit_rpm: u32,
    pub max_runs_per_session: usize,
    pub max_upload_bytes: u64,
    pub allowed_upload_mime_types: Vec<String>,
    pub cost_per_million_tokens: f64,
    pub session_ttl_seconds: u64,
    pub artifact_ttl_seconds: u64,
    pub cleanup_interval_seconds: u64,
    pub retry: RetryPolicy,
    pub fallback_chain: Vec<FallbackModel>,
    pub alerts: AlertThresholds,
    pub workspace_root: PathBuf,
    pub artifact_root: PathBuf,
    /// Durable state file. `None` means volatile (in-memory only).
    pub state_file: Option<PathBuf>,
    pub provider_name: String,
    pub model_name: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 8000,
            executor_mode: ExecutorMode::Stub,
            auth_mode: AuthMode::Off,
            api_token: String::new(),
            rate_limit_rpm: 300,
            max_runs_per_session: 100,
            max_upload_bytes: 5 * 1024 * 1024,
            allowed_upload_mime_types: DEFAULT_ALLOWED_UPLOAD_MIME_TYPES
                .iter()
                .map(|s| s.to_string())
                .collect(),
            cost_per_million_tokens: DEFAULT_COST_PER_MILLION_TOKENS,
            session_ttl_seconds: 0,
            artifact_ttl_seconds: 0,
            cleanup_interval_seconds: 300,
            retry: RetryPolicy::default(),
            fallback_chain: Vec::new(),
            alerts: AlertThresholds::default(),
            workspace_root: PathBuf::from("workspace/web_sessions"),
            artifact_root: PathBuf::from("workspace/web_artifacts"),
            state_file: Some(PathBuf::from("data/runtime_state.json")),
            provider_name: "stub".into(),
            model_name: "stub-model".into(),
        }
    }
}

impl Config {
    /// Build the configuration from process environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary lookup function (tests pass a map).
    pub fn from_lookup(get_raw: impl Fn(&str) -> Option<String>) -> Self {
        let d = Config::default();
        let get =
            |key: &str| get_raw(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let executor_mode = match get("RA_EXECUTOR_MODE").as_deref() {
            Some("real") => ExecutorMode::Real,
            _ => ExecutorMode::Stub,
        };
        let auth_mode = match get("RA_AUTH_MODE").as_deref() {
            Some("token") => AuthMode::Token,
            _ => AuthMode::Off,
        };

        let allowed_upload_mime_types = get("RA_ALLOWED_UPLOAD_MIME_TYPES")
            .map(|raw| {
                raw.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect::<Vec<_>>()
            })
            .filter(|list| !list.is_empty())
            .unwrap_or(d.allowed_upload_mime_types);

        // An explicitly empty RA_STATE_FILE disables durability.
        let state_file = match get_raw("RA_STATE_FILE") {
            Some(raw) if raw.trim().is_empty() => None,
            Some(raw) => Some(PathBuf::from(raw.trim())),
            None => d.state_file.clone(),
        };

        Self {
            host: get("RA_HOST").unwrap_or(d.host),
            port: parse_or(get("RA_PORT"), d.port),
            executor_mode,
            auth_mode,
            api_token: get("RA_API_TOKEN").unwrap_or_default(),
            rate_limit_rpm: parse_or(get("RA_RATE_LIMIT_RPM"), d.rate_limit_rpm).max(1),
            max_runs_per_session: parse_or(get("RA_MAX_RUNS_PER_SESSION"), d.max_runs_per_session)
                .max(1),
            max_upload_bytes: parse_or(get("RA_MAX_UPLOAD_BYTES"), d.max_upload_bytes).max(1),
            allowed_upload_mime_types,
            cost_per_million_tokens: parse_or(
                get("RA_COST_PER_MILLION_TOKENS"),
                d.cost_per_million_tokens,
            )
            .max(0.0),
            session_ttl_seconds: parse_or(get("RA_SESSION_TTL_SECONDS"), d.session_ttl_seconds),
            artifact_ttl_seconds: parse_or(get("RA_ARTIFACT_TTL_SECONDS"), d.artifact_ttl_seconds),
            cleanup_interval_seconds: parse_or(
                get("RA_CLEANUP_INTERVAL_SECONDS"),
                d.cleanup_interval_seconds,
            )
            .max(1),
            retry: RetryPolicy {
                max_attempts: parse_or(
                    get("RA_PROVIDER_RETRY_MAX_ATTEMPTS"),
                    d.retry.max_attempts,
                )
                .max(1),
                base_delay_seconds: parse_or(
                    get("RA_PROVIDER_RETRY_BASE_DELAY_SECONDS"),
                    d.retry.base_delay_seconds,
                )
                .max(0.0),
                max_delay_seconds: parse_or(
                    get("RA_PROVIDER_RETRY_MAX_DELAY_SECONDS"),
                    d.retry.max_delay_seconds,
                )
                .max(0.0),
            },
            fallback_chain: get("RA_PROVIDER_FALLBACK_CHAIN")
                .map(|raw| parse_fallback_chain(&raw))
                .unwrap_or_default(),
            alerts: AlertThresholds {
                max_error_rate: parse_or(get("RA_ALERT_MAX_ERROR_RATE"), d.alerts.max_error_rate)
                    .max(0.0),
                max_p95_latency_ms: parse_or(
                    get("RA_ALERT_MAX_P95_LATENCY_MS"),
                    d.alerts.max_p95_latency_ms,
                )
                .max(0.0),
                max_total_cost_usd: parse_or(
                    get("RA_ALERT_MAX_TOTAL_COST_USD"),
                    d.alerts.max_total_cost_usd,
                )
                .max(0.0),
                max_queue_depth: parse_or(
                    get("RA_ALERT_MAX_QUEUE_DEPTH"),
                    d.alerts.max_queue_depth,
                )
                .max(0.0),
            },
            workspace_root: get("RA_WORKSPACE_ROOT").map(PathBuf::from).unwrap_or(d.workspace_root),
            artifact_root: get("RA_ARTIFACT_ROOT").map(PathBuf::from).unwrap_or(d.artifact_root),
            state_file,
            provider_name: get("RA_DEFAULT_PROVIDER").unwrap_or(d.provider_name),
            model_name: get("RA_DEFAULT_MODEL").unwrap_or(d.model_name),
        }
    }

    /// Effective provider policy as served by `/settings/provider-policy`.
    pub fn provider_policy(&self) -> serde_json::Value {
        serde_json::json!({
            "retry": {
                "max_attempts": self.retry.max_attempts,
                "base_delay_seconds": self.retry.base_delay_seconds,
                "max_delay_seconds": self.retry.max_delay_seconds,
            },
            "fallback_chain": self.fallback_chain,
        })
    }
}

fn parse_or<T: std::str::FromStr>(value: Option<String>, default: T) -> T {
    value.and_then(|v| v.parse().ok()).unwrap_or(default)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
