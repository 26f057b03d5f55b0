//! TTL-based cleanup — reaps idle, expired sessions and aged artifacts.
//!
//! A session is removable when it is older than `session_ttl_seconds`
//! and has no active run. Removal cascades: approvals, runs, and the
//! session row go first, then the workspace and artifact providers
//! delete their files. The worker loop only spawns when a TTL is
//! configured; `POST /settings/cleanup` triggers a single pass manually.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use ra_domain::runtime::utc_now;
use ra_domain::Result;

use super::store::RuntimeStore;

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CleanupReport {
    pub removed_sessions: usize,
    pub removed_workspace_files: usize,
    pub removed_artifact_files: usize,
}

impl RuntimeStore {
    /// One cleanup pass. Safe to call concurrently with normal traffic;
    /// sessions with an active run are always skipped.
    pub async fn cleanup_expired_resources(&self) -> Result<CleanupReport> {
        let mut report = CleanupReport::default();

        let removed_sessions: Vec<String> = if self.config.session_ttl_seconds > 0 {
            let now = utc_now();
            let ttl = chrono::Duration::seconds(self.config.session_ttl_seconds as i64);

            let expired: Vec<String> = {
                let inner = self.inner.lock();
                inner
                    .sessions
                    .values()
                    .filter(|session| {
                        let idle = match &session.active_run_id {
                            Some(run_id) => session
                                .runs
                                .get(run_id)
                                .map(|run| run.is_terminal())
                                .unwrap_or(true),
                            None => true,
                        };
                        idle && now - session.created_at >= ttl
                    })
                    .map(|session| session.session_id.clone())
                    .collect()
            };

            for session_id in &expired {
                self.delete_session(session_id);
            }
            expired
        } else {
            Vec::new()
        };

        for session_id in &removed_sessions {
            report.removed_workspace_files += self.workspace.delete_workspace(session_id).await?;
            if let Some(artifacts) = &self.artifacts {
                report.removed_artifact_files +=
                    artifacts.delete_artifacts_for_session(session_id).await?;
            }
        }
        report.removed_sessions = removed_sessions.len();

        if self.config.artifact_ttl_seconds > 0 {
            if let Some(artifacts) = &self.artifacts {
                report.removed_artifact_files += artifacts
                    .cleanup_expired(self.config.artifact_ttl_seconds)
                    .await?;
            }
        }

        if report.removed_sessions > 0 || report.removed_artifact_files > 0 {
            tracing::info!(
                removed_sessions = report.removed_sessions,
                removed_workspace_files = report.removed_workspace_files,
                removed_artifact_files = report.removed_artifact_files,
                "cleanup pass finished"
            );
        }
        Ok(report)
    }
}

/// Spawn the periodic reaper. Callers abort the handle on shutdown.
pub fn spawn_cleanup_worker(store: Arc<RuntimeStore>) -> tokio::task::JoinHandle<()> {
    let interval = Duration::from_secs(store.config.cleanup_interval_seconds);
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;
            if let Err(err) = store.cleanup_expired_resources().await {
                tracing::warn!(error = %err, "cleanup pass failed");
            }
        }
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
