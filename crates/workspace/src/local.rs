//! Local-filesystem workspace provider.
//!
//! Each session gets a directory `<root>/<session_id>`. Relative paths
//! are sanitised before every access: absolute paths, drive prefixes and
//! `..` components are rejected so a session can never touch files
//! outside its own directory.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use ra_domain::{ApiError, Result};

use crate::{FileContent, FileMeta, WorkspaceProvider};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Path sanitisation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Normalise a caller-supplied relative path, rejecting escapes.
/// Returns the cleaned relative path in `/`-separated form.
pub(crate) fn sanitize_relative_path(raw: &str) -> Result<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ApiError::bad_request("File path must not be empty"));
    }

    let mut parts: Vec<&str> = Vec::new();
    for component in Path::new(trimmed).components() {
        match component {
            Component::Normal(part) => {
                let part = part
                    .to_str()
                    .ok_or_else(|| ApiError::bad_request("File path must be valid UTF-8"))?;
                parts.push(part);
            }
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(ApiError::bad_request(format!(
                    "File path '{trimmed}' escapes the workspace"
                )));
            }
        }
    }

    if parts.is_empty() {
        return Err(ApiError::bad_request("File path must not be empty"));
    }
    Ok(parts.join("/"))
}

/// Keep only the final component of an uploaded filename.
pub(crate) fn sanitize_filename(raw: &str) -> Result<String> {
    let name = Path::new(raw.trim())
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("")
        .to_string();
    if name.is_empty() || name == "." || name == ".." {
        return Err(ApiError::bad_request("Upload filename is not usable"));
    }
    Ok(name)
}

pub(crate) fn file_meta(path: String, fs_path: &Path) -> Result<FileMeta> {
    let metadata = std::fs::metadata(fs_path)?;
    let modified_at: DateTime<Utc> = metadata.modified().map(DateTime::from).unwrap_or_else(|_| {
        ra_domain::runtime::utc_now()
    });
    Ok(FileMeta {
        path,
        size_bytes: metadata.len(),
        modified_at,
    })
}

/// Collect all regular files under `dir`, with paths relative to `dir`.
pub(crate) fn walk_files(dir: &Path) -> Result<Vec<FileMeta>> {
    let mut out = Vec::new();
    if !dir.exists() {
        return Ok(out);
    }
    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        for entry in std::fs::read_dir(&current)? {
            let entry = entry?;
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else if let Ok(rel) = path.strip_prefix(dir) {
                let rel = rel.to_string_lossy().replace('\\', "/");
                out.push(file_meta(rel, &path)?);
            }
        }
    }
    out.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(out)
}

pub(crate) fn remove_tree(dir: &Path) -> Result<usize> {
    if !dir.exists() {
        return Ok(0);
    }
    let count = walk_files(dir)?.len();
    std::fs::remove_dir_all(dir)?;
    Ok(count)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Provider
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct LocalWorkspaceProvider {
    root: PathBuf,
}

impl LocalWorkspaceProvider {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn session_dir(&self, session_id: &str) -> PathBuf {
        self.root.join(session_id)
    }

    fn resolve(&self, session_id: &str, relative_path: &str) -> Result<(String, PathBuf)> {
        let rel = sanitize_relative_path(relative_path)?;
        let fs_path = self.session_dir(session_id).join(&rel);
        Ok((rel, fs_path))
    }
}

#[async_trait]
impl WorkspaceProvider for LocalWorkspaceProvider {
    async fn create_workspace(&self, session_id: &str, workspace_name: &str) -> Result<()> {
        let dir = self.session_dir(session_id);
        std::fs::create_dir_all(&dir)?;
        tracing::debug!(session_id, workspace_name, path = %dir.display(), "workspace created");
        Ok(())
    }

    async fn save_uploaded_file(
        &self,
        session_id: &str,
        filename: &str,
        content: &[u8],
    ) -> Result<FileMeta> {
        let name = sanitize_filename(filename)?;
        self.write_file(session_id, &name, content).await
    }

    async fn list_files(&self, session_id: &str) -> Result<Vec<FileMeta>> {
        walk_files(&self.session_dir(session_id))
    }

    async fn read_file(&self, session_id: &str, relative_path: &str) -> Result<FileContent> {
        let (rel, fs_path) = self.resolve(session_id, relative_path)?;
        if !fs_path.is_file() {
            return Err(ApiError::file_not_found(&rel));
        }
        let content = std::fs::read(&fs_path)?;
        Ok(FileContent { path: rel, content })
    }

    async fn write_file(
        &self,
        session_id: &str,
        relative_path: &str,
        content: &[u8],
    ) -> Result<FileMeta> {
        let (rel, fs_path) = self.resolve(session_id, relative_path)?;
        if let Some(parent) = fs_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&fs_path, content)?;
        file_meta(rel, &fs_path)
    }

    async fn delete_workspace(&self, session_id: &str) -> Result<usize> {
        let removed = remove_tree(&self.session_dir(session_id))?;
        if removed > 0 {
            tracing::debug!(session_id, removed, "workspace deleted");
        }
        Ok(removed)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
