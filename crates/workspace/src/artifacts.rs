//! Local-filesystem artifact storage.
//!
//! Artifacts live in a namespace separate from the workspace
//! (`<root>/<session_id>/…`) and carry a TTL: `cleanup_expired` removes
//! files whose mtime is older than the configured age, pruning any
//! directories it empties along the way.

use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;

use ra_domain::{ApiError, Result};

use crate::local::{remove_tree, sanitize_relative_path, walk_files};
use crate::{ArtifactStorageProvider, FileContent, FileMeta};

pub struct LocalArtifactStorage {
    root: PathBuf,
}

impl LocalArtifactStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn session_dir(&self, session_id: &str) -> PathBuf {
        self.root.join(session_id)
    }
}

#[async_trait]
impl ArtifactStorageProvider for LocalArtifactStorage {
    async fn write_artifact(
        &self,
        session_id: &str,
        artifact_path: &str,
        content: &[u8],
    ) -> Result<FileMeta> {
        let rel = sanitize_relative_path(artifact_path)?;
        let fs_path = self.session_dir(session_id).join(&rel);
        if let Some(parent) = fs_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&fs_path, content)?;
        crate::local::file_meta(rel, &fs_path)
    }

    async fn list_artifacts(&self, session_id: &str) -> Result<Vec<FileMeta>> {
        walk_files(&self.session_dir(session_id))
    }

    async fn read_artifact(&self, session_id: &str, artifact_path: &str) -> Result<FileContent> {
        let rel = sanitize_relative_path(artifact_path)?;
        let fs_path = self.session_dir(session_id).join(&rel);
        if !fs_path.is_file() {
            return Err(ApiError::file_not_found(&rel));
        }
        let content = std::fs::read(&fs_path)?;
        Ok(FileContent { path: rel, content })
    }

    async fn delete_artifacts_for_session(&self, session_id: &str) -> Result<usize> {
        remove_tree(&self.session_dir(session_id))
    }

    async fn cleanup_expired(&self, ttl_seconds: u64) -> Result<usize> {
        if !self.root.exists() {
            return Ok(0);
        }
        let cutoff = SystemTime::now()
            .checked_sub(Duration::from_secs(ttl_seconds))
            .unwrap_or(SystemTime::UNIX_EPOCH);

        let mut removed = 0;
        for entry in std::fs::read_dir(&self.root)? {
            let session_dir = entry?.path();
            if !session_dir.is_dir() {
                continue;
            }
            for file in walk_files(&session_dir)? {
                let fs_path = session_dir.join(&file.path);
                let expired = std::fs::metadata(&fs_path)
                    .and_then(|m| m.modified())
                    .map(|mtime| mtime <= cutoff)
                    .unwrap_or(false);
                if expired {
                    std::fs::remove_file(&fs_path)?;
                    removed += 1;
                }
            }
            // Prune the session dir when the reaper emptied it.
            if walk_files(&session_dir)?.is_empty() {
                let _ = std::fs::remove_dir_all(&session_dir);
            }
        }

        if removed > 0 {
            tracing::info!(removed, ttl_seconds, "expired artifacts removed");
        }
        Ok(removed)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    fn storage() -> (tempfile::TempDir, LocalArtifactStorage) {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalArtifactStorage::new(dir.path());
        (dir, storage)
    }

    #[tokio::test]
    async fn write_list_read() {
        let (_dir, storage) = storage();
        let meta = storage
            .write_artifact("sess_1", "exports/out.md", b"exported")
            .await
            .unwrap();
        assert_eq!(meta.path, "exports/out.md");

        let listed = storage.list_artifacts("sess_1").await.unwrap();
        assert_eq!(listed.len(), 1);

        let content = storage.read_artifact("sess_1", "exports/out.md").await.unwrap();
        assert_eq!(content.content, b"exported");
    }

    #[tokio::test]
    async fn read_missing_artifact_is_not_found() {
        let (_dir, storage) = storage();
        let err = storage.read_artifact("sess_1", "nope.md").await.unwrap_err();
        assert_eq!(err.code, "FILE_NOT_FOUND");
    }

    #[tokio::test]
    async fn traversal_is_rejected() {
        let (_dir, storage) = storage();
        let err = storage
            .write_artifact("sess_1", "../evil.md", b"x")
            .await
            .unwrap_err();
        assert_eq!(err.code, "BAD_REQUEST");
    }

    #[tokio::test]
    async fn delete_for_session_counts() {
        let (_dir, storage) = storage();
        storage.write_artifact("s", "a.md", b"1").await.unwrap();
        storage.write_artifact("s", "deep/b.md", b"2").await.unwrap();

        assert_eq!(storage.delete_artifacts_for_session("s").await.unwrap(), 2);
        assert_eq!(storage.delete_artifacts_for_session("s").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn cleanup_expired_removes_only_old_files() {
        let (_dir, storage) = storage();
        storage.write_artifact("s", "old.md", b"old").await.unwrap();

        // Let the first file age past a 1-second TTL.
        tokio::time::sleep(std::time::Duration::from_millis(1500)).await;
        storage.write_artifact("s", "new.md", b"new").await.unwrap();

        let removed = storage.cleanup_expired(1).await.unwrap();
        assert_eq!(removed, 1);

        let remaining = storage.list_artifacts("s").await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].path, "new.md");
    }

    #[tokio::test]
    async fn cleanup_with_zero_ttl_removes_everything() {
        let (_dir, storage) = storage();
        storage.write_artifact("s", "a.md", b"1").await.unwrap();

        let removed = storage.cleanup_expired(0).await.unwrap();
        assert_eq!(removed, 1);
        assert!(storage.list_artifacts("s").await.unwrap().is_empty());
    }
}
