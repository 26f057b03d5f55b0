//! Scoped file storage consumed by the gateway runtime.
//!
//! Two capability sets, both behind traits so the runtime can run against
//! a test fake: [`WorkspaceProvider`] for per-session workspace files and
//! [`ArtifactStorageProvider`] for the separate artifact namespace
//! (exports, generated files) with TTL-based expiry.

pub mod artifacts;
pub mod local;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use ra_domain::Result;

pub use artifacts::LocalArtifactStorage;
pub use local::LocalWorkspaceProvider;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// File records
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Metadata for one stored file, as returned by listing and writes.
#[derive(Debug, Clone, Serialize)]
pub struct FileMeta {
    /// Path relative to the session's namespace root.
    pub path: String,
    pub size_bytes: u64,
    pub modified_at: DateTime<Utc>,
}

/// A file's content, paired with the resolved relative path.
#[derive(Debug, Clone)]
pub struct FileContent {
    pub path: String,
    pub content: Vec<u8>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Provider traits
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Per-session workspace storage. All paths are relative to the
/// session's workspace; implementations must refuse escapes.
#[async_trait]
pub trait WorkspaceProvider: Send + Sync {
    async fn create_workspace(&self, session_id: &str, workspace_name: &str) -> Result<()>;

    async fn save_uploaded_file(
        &self,
        session_id: &str,
        filename: &str,
        content: &[u8],
    ) -> Result<FileMeta>;

    async fn list_files(&self, session_id: &str) -> Result<Vec<FileMeta>>;

    async fn read_file(&self, session_id: &str, relative_path: &str) -> Result<FileContent>;

    async fn write_file(
        &self,
        session_id: &str,
        relative_path: &str,
        content: &[u8],
    ) -> Result<FileMeta>;

    /// Delete the whole workspace. Returns the number of files removed.
    async fn delete_workspace(&self, session_id: &str) -> Result<usize>;
}

/// Optional artifact namespace. Same shape as the workspace, plus a
/// TTL-based reaper used by the cleanup worker.
#[async_trait]
pub trait ArtifactStorageProvider: Send + Sync {
    async fn write_artifact(
        &self,
        session_id: &str,
        artifact_path: &str,
        content: &[u8],
    ) -> Result<FileMeta>;

    async fn list_artifacts(&self, session_id: &str) -> Result<Vec<FileMeta>>;

    async fn read_artifact(&self, session_id: &str, artifact_path: &str) -> Result<FileContent>;

    /// Delete all artifacts for a session. Returns the number removed.
    async fn delete_artifacts_for_session(&self, session_id: &str) -> Result<usize>;

    /// Delete artifacts older than `ttl_seconds` across all sessions.
    /// Returns the number removed.
    async fn cleanup_expired(&self, ttl_seconds: u64) -> Result<usize>;
}

/// Merge workspace and artifact listings keyed by path. Artifact
/// entries win on collision; the result is sorted by path.
pub fn merge_listings(workspace: Vec<FileMeta>, artifacts: Vec<FileMeta>) -> Vec<FileMeta> {
    let mut merged: std::collections::BTreeMap<String, FileMeta> = workspace
        .into_iter()
        .map(|item| (item.path.clone(), item))
        .collect();
    for item in artifacts {
        merged.insert(item.path.clone(), item);
    }
    merged.into_values().collect()
}
