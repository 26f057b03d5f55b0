//! Durable runtime store — sessions, runs, approvals, and the per-run
//! event journal.
//!
//! All composite state lives behind one lock (`StoreInner`); every
//! mutating operation rewrites the JSON state file atomically before the
//! lock is released, so a cold restart reconstructs exactly what the
//! last write observed. Wait latches and stream signal channels are
//! in-memory only and are rebuilt empty on load.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

use ra_domain::config::Config;
use ra_domain::runtime::{
    make_id, round_cost, utc_now, ApprovalStatus, EventType, RunState, WorkflowState,
};
use ra_domain::{ApiError, Result};
use ra_workspace::{
    merge_listings, ArtifactStorageProvider, FileContent, FileMeta, WorkspaceProvider,
};

use super::latch::LatchMap;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Records
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub event_id: String,
    pub session_id: String,
    pub run_id: String,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub ts: DateTime<Utc>,
    pub payload: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: String,
    pub session_id: String,
    pub message: String,
    pub status: RunState,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub error: Option<Value>,
    #[serde(default)]
    pub events: Vec<EventRecord>,
    #[serde(default)]
    pub event_seq: u32,
    #[serde(default)]
    pub interrupt_requested: bool,
    pub pending_approval_id: Option<String>,
    #[serde(default)]
    pub usage_tokens: u64,
    #[serde(default)]
    pub estimated_cost_usd: f64,
    #[serde(default)]
    pub usage_finalized: bool,
}

impl RunRecord {
    pub fn new(run_id: String, session_id: String, message: String) -> Self {
        Self {
            run_id,
            session_id,
            message,
            status: RunState::Queued,
            created_at: utc_now(),
            started_at: None,
            ended_at: None,
            error: None,
            events: Vec::new(),
            event_seq: 0,
            interrupt_requested: false,
            pending_approval_id: None,
            usage_tokens: 0,
            estimated_cost_usd: 0.0,
            usage_finalized: false,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRecord {
    pub approval_id: String,
    pub session_id: String,
    pub run_id: String,
    pub tool_name: String,
    pub args: Value,
    pub created_at: DateTime<Utc>,
    pub status: ApprovalStatus,
    pub decided_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionSettings {
    #[serde(default)]
    pub auto_approve: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: String,
    pub tenant_id: String,
    pub workspace_name: String,
    pub created_at: DateTime<Utc>,
    pub workflow_state: WorkflowState,
    #[serde(default)]
    pub settings: SessionSettings,
    pub active_run_id: Option<String>,
    #[serde(default)]
    pub pending_approvals_count: u32,
    pub resume_path: Option<String>,
    pub jd_text: Option<String>,
    pub jd_url: Option<String>,
    pub latest_export_path: Option<String>,
    #[serde(default, with = "keyed_seq")]
    pub runs: HashMap<String, RunRecord>,
    #[serde(default, with = "keyed_seq")]
    pub approvals: HashMap<String, ApprovalRecord>,
    /// idempotency key → (message fingerprint, run_id).
    #[serde(default)]
    pub idempotency_keys: HashMap<String, (String, String)>,
    /// Executor-owned conversation blob; opaque to the store.
    #[serde(default)]
    pub conversation: Option<Value>,
}

/// Serialize the id-keyed maps as creation-ordered sequences — the state
/// file layout is a list of nested records, and legacy files load the
/// same way.
mod keyed_seq {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub trait Keyed {
        fn key(&self) -> &str;
        fn created(&self) -> DateTime<Utc>;
    }

    impl Keyed for RunRecord {
        fn key(&self) -> &str {
            &self.run_id
        }
        fn created(&self) -> DateTime<Utc> {
            self.created_at
        }
    }

    impl Keyed for ApprovalRecord {
        fn key(&self) -> &str {
            &self.approval_id
        }
        fn created(&self) -> DateTime<Utc> {
            self.created_at
        }
    }

    pub fn serialize<T, S>(map: &HashMap<String, T>, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        T: Keyed + Serialize,
        S: Serializer,
    {
        let mut items: Vec<&T> = map.values().collect();
        items.sort_by(|a, b| a.created().cmp(&b.created()).then(a.key().cmp(b.key())));
        serializer.collect_seq(items)
    }

    pub fn deserialize<'de, T, D>(deserializer: D) -> std::result::Result<HashMap<String, T>, D::Error>
    where
        T: Keyed + Deserialize<'de>,
        D: Deserializer<'de>,
    {
        let items = Vec::<T>::deserialize(deserializer)?;
        Ok(items
            .into_iter()
            .map(|item| (item.key().to_owned(), item))
            .collect())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Persisted layout
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

const STATE_SCHEMA_VERSION: u32 = 1;

/// On-disk layout. `schema_version` defaults to 0 so legacy files
/// (written before the version field existed) still load.
#[derive(Serialize, Deserialize)]
struct PersistedState {
    #[serde(default)]
    schema_version: u32,
    #[serde(default)]
    sessions: Vec<SessionRecord>,
}

pub(crate) struct StoreInner {
    pub(crate) sessions: HashMap<String, SessionRecord>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct RuntimeStore {
    pub(crate) config: Arc<Config>,
    pub(crate) workspace: Arc<dyn WorkspaceProvider>,
    pub(crate) artifacts: Option<Arc<dyn ArtifactStorageProvider>>,
    pub(crate) inner: Mutex<StoreInner>,
    pub(crate) latches: LatchMap,
    /// Per-run signal channels waking stream subscribers (payload =
    /// latest event seq). Closed when the run goes terminal.
    channels: RwLock<HashMap<String, broadcast::Sender<u32>>>,
}

impl RuntimeStore {
    /// Load (or initialise) the store and normalize any state left
    /// behind by a crash. Runs before the scheduler accepts work.
    pub fn open(
        config: Arc<Config>,
        workspace: Arc<dyn WorkspaceProvider>,
        artifacts: Option<Arc<dyn ArtifactStorageProvider>>,
    ) -> Result<Arc<Self>> {
        let sessions = match &config.state_file {
            Some(path) if path.exists() => {
                let raw = std::fs::read_to_string(path)?;
                let state: PersistedState = serde_json::from_str(&raw)?;
                tracing::info!(
                    sessions = state.sessions.len(),
                    schema_version = state.schema_version,
                    path = %path.display(),
                    "runtime state loaded"
                );
                state
                    .sessions
                    .into_iter()
                    .map(|s| (s.session_id.clone(), s))
                    .collect()
            }
            _ => HashMap::new(),
        };

        let store = Arc::new(Self {
            config,
            workspace,
            artifacts,
            inner: Mutex::new(StoreInner { sessions }),
            latches: LatchMap::new(),
            channels: RwLock::new(HashMap::new()),
        });

        let normalized = store.normalize_active_runs()?;
        if normalized > 0 {
            tracing::warn!(runs = normalized, "interrupted runs left over from previous process");
        }
        Ok(store)
    }

    /// Rewrite the state file atomically (tmp + rename). Called with the
    /// store lock held so the file always reflects a consistent view.
    pub(crate) fn save_locked(&self, inner: &StoreInner) -> Result<()> {
        let Some(path) = &self.config.state_file else {
            return Ok(());
        };

        let mut sessions: Vec<&SessionRecord> = inner.sessions.values().collect();
        sessions.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then(a.session_id.cmp(&b.session_id))
        });
        let state = serde_json::json!({
            "schema_version": STATE_SCHEMA_VERSION,
            "sessions": sessions,
        });

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec(&state)?)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    pub(crate) fn session_for_tenant<'a>(
        inner: &'a mut StoreInner,
        session_id: &str,
        tenant_id: Option<&str>,
    ) -> Result<&'a mut SessionRecord> {
        let session = inner
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| ApiError::session_not_found(session_id))?;
        // Hide cross-tenant existence.
        if let Some(tenant) = tenant_id {
            if session.tenant_id != tenant {
                return Err(ApiError::session_not_found(session_id));
            }
        }
        Ok(session)
    }

    // ── Sessions ─────────────────────────────────────────────────────

    pub async fn create_session(
        &self,
        workspace_name: &str,
        auto_approve: bool,
        tenant_id: &str,
    ) -> Result<SessionRecord> {
        let session_id = make_id("sess");
        self.workspace
            .create_workspace(&session_id, workspace_name)
            .await?;

        let session = SessionRecord {
            session_id: session_id.clone(),
            tenant_id: tenant_id.to_owned(),
            workspace_name: workspace_name.to_owned(),
            created_at: utc_now(),
            workflow_state: WorkflowState::Draft,
            settings: SessionSettings { auto_approve },
            active_run_id: None,
            pending_approvals_count: 0,
            resume_path: None,
            jd_text: None,
            jd_url: None,
            latest_export_path: None,
            runs: HashMap::new(),
            approvals: HashMap::new(),
            idempotency_keys: HashMap::new(),
            conversation: None,
        };

        let mut inner = self.inner.lock();
        inner.sessions.insert(session_id, session.clone());
        self.save_locked(&inner)?;
        Ok(session)
    }

    pub fn get_session(&self, session_id: &str, tenant_id: Option<&str>) -> Result<SessionRecord> {
        let mut inner = self.inner.lock();
        Ok(Self::session_for_tenant(&mut inner, session_id, tenant_id)?.clone())
    }

    pub fn set_auto_approve(
        &self,
        session_id: &str,
        enabled: bool,
        tenant_id: Option<&str>,
    ) -> Result<bool> {
        let mut inner = self.inner.lock();
        let session = Self::session_for_tenant(&mut inner, session_id, tenant_id)?;
        session.settings.auto_approve = enabled;
        self.save_locked(&inner)?;
        Ok(enabled)
    }

    pub(crate) fn delete_session(&self, session_id: &str) -> Option<SessionRecord> {
        let mut inner = self.inner.lock();
        let removed = inner.sessions.remove(session_id);
        if removed.is_some() {
            let _ = self.save_locked(&inner);
        }
        removed
    }

    /// Monotonic workflow promotion. Silently ignores missing sessions —
    /// the executor may race session cleanup.
    pub fn promote_workflow(&self, session_id: &str, target: WorkflowState) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Some(session) = inner.sessions.get_mut(session_id) {
            session.workflow_state = session.workflow_state.promote(target);
            self.save_locked(&inner)?;
        }
        Ok(())
    }

    pub fn session_auto_approve(&self, session_id: &str) -> Result<bool> {
        Ok(self.get_session(session_id, None)?.settings.auto_approve)
    }

    /// The executor-owned conversation blob. Opaque to the store.
    pub fn conversation(&self, session_id: &str) -> Result<Option<Value>> {
        Ok(self.get_session(session_id, None)?.conversation)
    }

    pub fn set_conversation(&self, session_id: &str, conversation: Value) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Some(session) = inner.sessions.get_mut(session_id) {
            session.conversation = Some(conversation);
            self.save_locked(&inner)?;
        }
        Ok(())
    }

    // ── Uploads / JD / export ────────────────────────────────────────

    fn validate_upload(&self, content_len: usize, mime_type: Option<&str>) -> Result<()> {
        if content_len as u64 > self.config.max_upload_bytes {
            return Err(ApiError::upload_too_large(self.config.max_upload_bytes));
        }
        let normalized = mime_type.unwrap_or("").trim().to_lowercase();
        if !normalized.is_empty()
            && !self
                .config
                .allowed_upload_mime_types
                .iter()
                .any(|allowed| allowed.eq_ignore_ascii_case(&normalized))
        {
            let mut allowed = self.config.allowed_upload_mime_types.clone();
            allowed.sort();
            return Err(ApiError::unsupported_file_type(&normalized, &allowed));
        }
        Ok(())
    }

    pub async fn upload_session_file(
        &self,
        session_id: &str,
        filename: &str,
        content: &[u8],
        mime_type: Option<&str>,
        tenant_id: Option<&str>,
    ) -> Result<FileMeta> {
        self.get_session(session_id, tenant_id)?;
        self.validate_upload(content.len(), mime_type)?;
        self.workspace
            .save_uploaded_file(session_id, filename, content)
            .await
    }

    pub async fn upload_resume(
        &self,
        session_id: &str,
        filename: &str,
        content: &[u8],
        mime_type: Option<&str>,
        tenant_id: Option<&str>,
    ) -> Result<FileMeta> {
        let meta = self
            .upload_session_file(session_id, filename, content, mime_type, tenant_id)
            .await?;

        let mut inner = self.inner.lock();
        let session = Self::session_for_tenant(&mut inner, session_id, tenant_id)?;
        session.resume_path = Some(meta.path.clone());
        session.workflow_state = session.workflow_state.promote(WorkflowState::ResumeUploaded);
        self.save_locked(&inner)?;
        Ok(meta)
    }

    pub fn submit_jd(
        &self,
        session_id: &str,
        text: Option<&str>,
        url: Option<&str>,
        tenant_id: Option<&str>,
    ) -> Result<SessionRecord> {
        let text = text.unwrap_or("").trim().to_owned();
        let url = url.unwrap_or("").trim().to_owned();
        if text.is_empty() && url.is_empty() {
            return Err(ApiError::bad_request("Either jd text or jd url is required"));
        }

        let mut inner = self.inner.lock();
        let session = Self::session_for_tenant(&mut inner, session_id, tenant_id)?;
        if session.resume_path.is_none() {
            return Err(ApiError::invalid_state(
                "Resume must be uploaded before submitting JD",
            ));
        }
        session.jd_text = (!text.is_empty()).then_some(text);
        session.jd_url = (!url.is_empty()).then_some(url);
        session.workflow_state = session.workflow_state.promote(WorkflowState::JdProvided);
        let snapshot = session.clone();
        self.save_locked(&inner)?;
        Ok(snapshot)
    }

    pub async fn export_session(
        &self,
        session_id: &str,
        tenant_id: Option<&str>,
    ) -> Result<FileMeta> {
        let session = self.get_session(session_id, tenant_id)?;
        let source_path = match session.resume_path {
            Some(path) => path,
            None => {
                let files = self.list_session_files(session_id, tenant_id).await?;
                files
                    .first()
                    .map(|f| f.path.clone())
                    .ok_or_else(|| ApiError::invalid_state("No files available to export"))?
            }
        };

        let source = self
            .read_session_file(session_id, &source_path, tenant_id)
            .await?;
        let stem = Path::new(&source_path)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "resume".to_owned());
        let export_name = format!(
            "exports/{stem}-export-{}.md",
            Utc::now().format("%Y%m%d-%H%M%S")
        );
        let export_content = build_export_content(&source.content);

        let meta = match &self.artifacts {
            Some(artifacts) => {
                artifacts
                    .write_artifact(session_id, &export_name, &export_content)
                    .await?
            }
            None => {
                self.workspace
                    .write_file(session_id, &export_name, &export_content)
                    .await?
            }
        };

        let mut inner = self.inner.lock();
        let session = Self::session_for_tenant(&mut inner, session_id, tenant_id)?;
        session.latest_export_path = Some(meta.path.clone());
        session.workflow_state = session.workflow_state.promote(WorkflowState::Exported);
        self.save_locked(&inner)?;
        Ok(meta)
    }

    // ── Files ────────────────────────────────────────────────────────

    pub async fn list_session_files(
        &self,
        session_id: &str,
        tenant_id: Option<&str>,
    ) -> Result<Vec<FileMeta>> {
        self.get_session(session_id, tenant_id)?;
        let workspace_files = self.workspace.list_files(session_id).await?;
        match &self.artifacts {
            Some(artifacts) => {
                let artifact_files = artifacts.list_artifacts(session_id).await?;
                Ok(merge_listings(workspace_files, artifact_files))
            }
            None => Ok(workspace_files),
        }
    }

    /// Read from the workspace, transparently falling back to the
    /// artifact namespace when the workspace misses.
    pub async fn read_session_file(
        &self,
        session_id: &str,
        file_path: &str,
        tenant_id: Option<&str>,
    ) -> Result<FileContent> {
        self.get_session(session_id, tenant_id)?;
        match self.workspace.read_file(session_id, file_path).await {
            Ok(content) => Ok(content),
            Err(err) if err.code == "FILE_NOT_FOUND" => match &self.artifacts {
                Some(artifacts) => artifacts.read_artifact(session_id, file_path).await,
                None => Err(err),
            },
            Err(err) => Err(err),
        }
    }

    /// Record a workspace write performed by the executor; adopts the
    /// path as the session's resume when none (or the same one) is set.
    pub fn note_file_written(&self, session_id: &str, path: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Some(session) = inner.sessions.get_mut(session_id) {
            if session.resume_path.is_none() || session.resume_path.as_deref() == Some(path) {
                session.resume_path = Some(path.to_owned());
                self.save_locked(&inner)?;
            }
        }
        Ok(())
    }

    // ── Runs ─────────────────────────────────────────────────────────

    /// Admission control + run row creation. The caller enqueues the
    /// returned run when `reused` is false.
    pub fn create_run(
        &self,
        session_id: &str,
        message: &str,
        idempotency_key: Option<&str>,
        tenant_id: Option<&str>,
    ) -> Result<(RunRecord, bool)> {
        let fingerprint = message.trim().to_owned();

        let run = {
            let mut inner = self.inner.lock();
            let session = Self::session_for_tenant(&mut inner, session_id, tenant_id)?;

            if let Some(key) = idempotency_key {
                if let Some((existing_fp, existing_run_id)) = session.idempotency_keys.get(key) {
                    if *existing_fp != fingerprint {
                        return Err(ApiError::idempotency_conflict());
                    }
                    let run = session
                        .runs
                        .get(existing_run_id)
                        .cloned()
                        .ok_or_else(|| ApiError::run_not_found(existing_run_id))?;
                    return Ok((run, true));
                }
            }

            if let Some(active_id) = session.active_run_id.clone() {
                if let Some(active) = session.runs.get(&active_id) {
                    if active.status.is_active() {
                        return Err(ApiError::active_run_exists(
                            &active.run_id,
                            active.status.as_str(),
                        ));
                    }
                }
            }

            if session.runs.len() >= self.config.max_runs_per_session {
                return Err(ApiError::run_quota_exceeded(self.config.max_runs_per_session));
            }

            let run_id = make_id("run");
            let run = RunRecord::new(run_id.clone(), session_id.to_owned(), message.to_owned());
            session.runs.insert(run_id.clone(), run.clone());
            session.active_run_id = Some(run_id.clone());
            if let Some(key) = idempotency_key {
                session
                    .idempotency_keys
                    .insert(key.to_owned(), (fingerprint, run_id));
            }
            self.save_locked(&inner)?;
            run
        };

        self.latches.register(&run.run_id);
        Ok((run, false))
    }

    pub fn get_run(
        &self,
        session_id: &str,
        run_id: &str,
        tenant_id: Option<&str>,
    ) -> Result<RunRecord> {
        let mut inner = self.inner.lock();
        let session = Self::session_for_tenant(&mut inner, session_id, tenant_id)?;
        session
            .runs
            .get(run_id)
            .cloned()
            .ok_or_else(|| ApiError::run_not_found(run_id))
    }

    pub fn run_message(&self, session_id: &str, run_id: &str) -> Result<String> {
        Ok(self.get_run(session_id, run_id, None)?.message)
    }

    /// Request cooperative cancellation. Idempotent on terminal runs.
    pub fn interrupt_run(
        &self,
        session_id: &str,
        run_id: &str,
        tenant_id: Option<&str>,
    ) -> Result<RunRecord> {
        let snapshot = {
            let mut inner = self.inner.lock();
            let session = Self::session_for_tenant(&mut inner, session_id, tenant_id)?;
            let run = session
                .runs
                .get_mut(run_id)
                .ok_or_else(|| ApiError::run_not_found(run_id))?;

            if run.is_terminal() {
                return Ok(run.clone());
            }

            run.interrupt_requested = true;
            run.status = RunState::Interrupting;
            let snapshot = run.clone();
            self.save_locked(&inner)?;
            snapshot
        };

        self.latches.signal(run_id);
        self.signal_subscribers(run_id, snapshot.event_seq);
        Ok(snapshot)
    }

    /// Status transition plus the terminal bookkeeping: auto-reject
    /// pending approvals, stamp `ended_at`, finalize usage, release the
    /// session's active-run pointer. No-ops when the session or run has
    /// been cleaned up underneath the worker.
    pub fn set_run_status(
        &self,
        session_id: &str,
        run_id: &str,
        status: RunState,
        error: Option<Value>,
    ) -> Result<()> {
        let signal = {
            let mut inner = self.inner.lock();
            let Some(session) = inner.sessions.get_mut(session_id) else {
                return Ok(());
            };
            let Some(run) = session.runs.get_mut(run_id) else {
                return Ok(());
            };

            run.status = status;
            if status == RunState::Running && run.started_at.is_none() {
                run.started_at = Some(utc_now());
            }

            let terminal = status.is_terminal();
            if terminal {
                let now = utc_now();

                // Auto-reject every still-pending approval of this run.
                for approval in session.approvals.values_mut() {
                    if approval.run_id == run_id && approval.status == ApprovalStatus::Pending {
                        approval.status = ApprovalStatus::Rejected;
                        approval.decided_at = Some(now);
                        session.pending_approvals_count =
                            session.pending_approvals_count.saturating_sub(1);
                    }
                }

                if let Some(run) = session.runs.get_mut(run_id) {
                    run.ended_at = Some(now);
                    run.error = error;
                    if !run.usage_finalized {
                        finalize_usage(run, self.config.cost_per_million_tokens);
                    }
                    run.pending_approval_id = None;
                }
                if session.active_run_id.as_deref() == Some(run_id) {
                    session.active_run_id = None;
                }
            }

            let seq = session.runs.get(run_id).map(|r| r.event_seq).unwrap_or(0);
            self.save_locked(&inner)?;
            (terminal, seq)
        };

        let (terminal, seq) = signal;
        self.signal_subscribers(run_id, seq);
        if terminal {
            self.latches.remove(run_id);
            self.close_subscribers(run_id);
        }
        Ok(())
    }

    /// Provider-reported usage overrides the stub estimate.
    pub fn set_run_usage(&self, session_id: &str, run_id: &str, tokens: u64, cost: f64) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Some(session) = inner.sessions.get_mut(session_id) {
            if let Some(run) = session.runs.get_mut(run_id) {
                run.usage_tokens = tokens;
                run.estimated_cost_usd = round_cost(cost);
                run.usage_finalized = true;
                self.save_locked(&inner)?;
            }
        }
        Ok(())
    }

    pub fn get_session_usage(&self, session_id: &str, tenant_id: Option<&str>) -> Result<Value> {
        let session = self.get_session(session_id, tenant_id)?;
        let runs: Vec<&RunRecord> = session.runs.values().collect();
        let total_tokens: u64 = runs.iter().map(|r| r.usage_tokens).sum();
        let total_cost: f64 = runs.iter().map(|r| r.estimated_cost_usd.max(0.0)).sum();
        let completed = runs.iter().filter(|r| r.is_terminal()).count();
        Ok(serde_json::json!({
            "run_count": runs.len(),
            "completed_run_count": completed,
            "total_tokens": total_tokens,
            "total_estimated_cost_usd": round_cost(total_cost),
        }))
    }

    // ── Event journal ────────────────────────────────────────────────

    /// Append a typed event, assigning the next `seq` and the
    /// `evt_<run>_<seq:04>` id atomically with the run row. Silently
    /// no-ops when the run is gone (executor racing cleanup).
    pub fn append_event(
        &self,
        session_id: &str,
        run_id: &str,
        event_type: EventType,
        payload: Value,
    ) -> Result<()> {
        let seq = {
            let mut inner = self.inner.lock();
            let Some(session) = inner.sessions.get_mut(session_id) else {
                return Ok(());
            };
            let Some(run) = session.runs.get_mut(run_id) else {
                return Ok(());
            };

            run.event_seq += 1;
            let seq = run.event_seq;
            run.events.push(EventRecord {
                event_id: format!("evt_{run_id}_{seq:04}"),
                session_id: session_id.to_owned(),
                run_id: run_id.to_owned(),
                event_type,
                ts: utc_now(),
                payload,
            });
            self.save_locked(&inner)?;
            seq
        };

        self.signal_subscribers(run_id, seq);
        Ok(())
    }

    /// Copy of the journal plus the run status, for stream snapshots.
    pub fn snapshot_events(
        &self,
        session_id: &str,
        run_id: &str,
        tenant_id: Option<&str>,
    ) -> Result<(Vec<EventRecord>, RunState)> {
        let run = self.get_run(session_id, run_id, tenant_id)?;
        Ok((run.events, run.status))
    }

    /// Resume index for `Last-Event-ID`: position just after the given
    /// event, or 0 when absent/unknown.
    pub fn event_index_after(
        &self,
        session_id: &str,
        run_id: &str,
        last_event_id: Option<&str>,
        tenant_id: Option<&str>,
    ) -> Result<usize> {
        let Some(last_event_id) = last_event_id else {
            return Ok(0);
        };
        let run = self.get_run(session_id, run_id, tenant_id)?;
        Ok(run
            .events
            .iter()
            .position(|e| e.event_id == last_event_id)
            .map(|idx| idx + 1)
            .unwrap_or(0))
    }

    /// Subscribe to append/status signals for a run.
    pub fn subscribe_events(&self, run_id: &str) -> broadcast::Receiver<u32> {
        let mut channels = self.channels.write();
        channels
            .entry(run_id.to_owned())
            .or_insert_with(|| broadcast::channel(128).0)
            .subscribe()
    }

    pub(crate) fn signal_subscribers(&self, run_id: &str, seq: u32) {
        let channels = self.channels.read();
        if let Some(tx) = channels.get(run_id) {
            let _ = tx.send(seq);
        }
    }

    /// Drop the signal channel; pending receivers observe `Closed` and
    /// re-check the journal, which now shows a terminal run.
    fn close_subscribers(&self, run_id: &str) {
        self.channels.write().remove(run_id);
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Stub-fallback token estimate: message plus event type/payload text,
/// four characters per token, at least one.
pub(crate) fn finalize_usage(run: &mut RunRecord, cost_per_million_tokens: f64) {
    let mut text_size = run.message.len();
    for event in &run.events {
        text_size += event.event_type.as_str().len();
        text_size += event.payload.to_string().len();
    }
    let tokens = ((text_size / 4) as u64).max(1);
    run.usage_tokens = tokens;
    run.estimated_cost_usd = round_cost(tokens as f64 / 1_000_000.0 * cost_per_million_tokens);
    run.usage_finalized = true;
}

pub(crate) fn build_export_content(source: &[u8]) -> Vec<u8> {
    let text = String::from_utf8_lossy(source);
    format!("# Exported Resume\n\nGenerated by Resume Agent Web UI.\n\n---\n\n{text}").into_bytes()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::test_support::open_store;

    #[tokio::test]
    async fn create_and_get_session() {
        let (_dir, store) = open_store(None);
        let session = store.create_session("ws", false, "local-dev").await.unwrap();
        assert!(session.session_id.starts_with("sess_"));
        assert_eq!(session.workflow_state, WorkflowState::Draft);

        let fetched = store.get_session(&session.session_id, Some("local-dev")).unwrap();
        assert_eq!(fetched.workspace_name, "ws");
    }

    #[tokio::test]
    async fn cross_tenant_reads_are_hidden() {
        let (_dir, store) = open_store(None);
        let session = store.create_session("ws", false, "tenant-a").await.unwrap();

        let err = store
            .get_session(&session.session_id, Some("tenant-b"))
            .unwrap_err();
        assert_eq!(err.code, "SESSION_NOT_FOUND");

        // No tenant restriction = internal access.
        assert!(store.get_session(&session.session_id, None).is_ok());
    }

    #[tokio::test]
    async fn create_run_sets_active_pointer() {
        let (_dir, store) = open_store(None);
        let session = store.create_session("ws", false, "local-dev").await.unwrap();

        let (run, reused) = store
            .create_run(&session.session_id, "hello", None, None)
            .unwrap();
        assert!(!reused);
        assert_eq!(run.status, RunState::Queued);

        let refreshed = store.get_session(&session.session_id, None).unwrap();
        assert_eq!(refreshed.active_run_id.as_deref(), Some(run.run_id.as_str()));
        assert!(store.latches.get(&run.run_id).is_some());
    }

    #[tokio::test]
    async fn second_run_conflicts_while_first_is_active() {
        let (_dir, store) = open_store(None);
        let session = store.create_session("ws", false, "local-dev").await.unwrap();
        let (run, _) = store.create_run(&session.session_id, "one", None, None).unwrap();

        let err = store
            .create_run(&session.session_id, "two", None, None)
            .unwrap_err();
        assert_eq!(err.code, "ACTIVE_RUN_EXISTS");
        assert_eq!(err.details.as_ref().unwrap()["run_id"], run.run_id);
    }

    #[tokio::test]
    async fn idempotency_reuse_and_conflict() {
        let (_dir, store) = open_store(None);
        let session = store.create_session("ws", false, "local-dev").await.unwrap();
        let sid = session.session_id.clone();

        let (first, reused) = store.create_run(&sid, "msg A", Some("k1"), None).unwrap();
        assert!(!reused);

        // Same key, different payload → conflict (even while active).
        let err = store.create_run(&sid, "msg B", Some("k1"), None).unwrap_err();
        assert_eq!(err.code, "IDEMPOTENCY_CONFLICT");

        // Same key + payload → reuse, bypassing the active-run check.
        let (again, reused) = store.create_run(&sid, "msg A", Some("k1"), None).unwrap();
        assert!(reused);
        assert_eq!(again.run_id, first.run_id);

        // Fingerprint is the trimmed message.
        let (trimmed, reused) = store.create_run(&sid, "  msg A  ", Some("k1"), None).unwrap();
        assert!(reused);
        assert_eq!(trimmed.run_id, first.run_id);
    }

    #[tokio::test]
    async fn run_quota_is_enforced() {
        let (_dir, store) = crate::runtime::test_support::open_store_with(None, |config| {
            config.max_runs_per_session = 2;
        });
        let session = store.create_session("ws", false, "local-dev").await.unwrap();
        let sid = session.session_id.clone();

        let (run, _) = store.create_run(&sid, "one", None, None).unwrap();
        store.set_run_status(&sid, &run.run_id, RunState::Completed, None).unwrap();

        let (run2, _) = store.create_run(&sid, "two", None, None).unwrap();
        store.set_run_status(&sid, &run2.run_id, RunState::Completed, None).unwrap();

        let err = store.create_run(&sid, "three", None, None).unwrap_err();
        assert_eq!(err.code, "SESSION_RUN_QUOTA_EXCEEDED");
    }

    #[tokio::test]
    async fn event_journal_assigns_gapless_ids() {
        let (_dir, store) = open_store(None);
        let session = store.create_session("ws", false, "local-dev").await.unwrap();
        let sid = session.session_id.clone();
        let (run, _) = store.create_run(&sid, "msg", None, None).unwrap();

        for i in 0..3 {
            store
                .append_event(
                    &sid,
                    &run.run_id,
                    EventType::AssistantDelta,
                    serde_json::json!({"text": format!("chunk {i}")}),
                )
                .unwrap();
        }

        let (events, _) = store.snapshot_events(&sid, &run.run_id, None).unwrap();
        assert_eq!(events.len(), 3);
        for (i, event) in events.iter().enumerate() {
            assert_eq!(event.event_id, format!("evt_{}_{:04}", run.run_id, i + 1));
        }

        let idx = store
            .event_index_after(&sid, &run.run_id, Some(&events[1].event_id), None)
            .unwrap();
        assert_eq!(idx, 2);
        let missing = store
            .event_index_after(&sid, &run.run_id, Some("evt_bogus"), None)
            .unwrap();
        assert_eq!(missing, 0);
        let none = store.event_index_after(&sid, &run.run_id, None, None).unwrap();
        assert_eq!(none, 0);
    }

    #[tokio::test]
    async fn terminal_transition_does_bookkeeping() {
        let (_dir, store) = open_store(None);
        let session = store.create_session("ws", false, "local-dev").await.unwrap();
        let sid = session.session_id.clone();
        let (run, _) = store.create_run(&sid, "write resume.md", None, None).unwrap();
        let rid = run.run_id.clone();

        store.set_run_status(&sid, &rid, RunState::Running, None).unwrap();
        let approvals = store
            .create_approval_batch(
                &sid,
                &rid,
                &[("file_write".to_owned(), serde_json::json!({"path": "resume.md"}))],
            )
            .unwrap();
        assert_eq!(store.get_session(&sid, None).unwrap().pending_approvals_count, 1);

        store.set_run_status(&sid, &rid, RunState::Interrupted, None).unwrap();

        let refreshed = store.get_session(&sid, None).unwrap();
        assert_eq!(refreshed.pending_approvals_count, 0);
        assert!(refreshed.active_run_id.is_none());
        let approval = refreshed.approvals.get(&approvals[0].approval_id).unwrap();
        assert_eq!(approval.status, ApprovalStatus::Rejected);
        assert!(approval.decided_at.is_some());

        let run = store.get_run(&sid, &rid, None).unwrap();
        assert!(run.ended_at.is_some());
        assert!(run.usage_finalized);
        assert!(run.usage_tokens >= 1);
        assert!(run.pending_approval_id.is_none());
        assert!(store.latches.get(&rid).is_none());
    }

    #[tokio::test]
    async fn interrupt_is_idempotent_on_terminal_runs() {
        let (_dir, store) = open_store(None);
        let session = store.create_session("ws", false, "local-dev").await.unwrap();
        let sid = session.session_id.clone();
        let (run, _) = store.create_run(&sid, "msg", None, None).unwrap();
        let rid = run.run_id.clone();

        let interrupting = store.interrupt_run(&sid, &rid, None).unwrap();
        assert_eq!(interrupting.status, RunState::Interrupting);
        assert!(interrupting.interrupt_requested);

        store.set_run_status(&sid, &rid, RunState::Interrupted, None).unwrap();
        let again = store.interrupt_run(&sid, &rid, None).unwrap();
        assert_eq!(again.status, RunState::Interrupted);
    }

    #[tokio::test]
    async fn usage_estimate_and_provider_override() {
        let (_dir, store) = open_store(None);
        let session = store.create_session("ws", false, "local-dev").await.unwrap();
        let sid = session.session_id.clone();

        let (run, _) = store.create_run(&sid, "a".repeat(400).as_str(), None, None).unwrap();
        store.set_run_status(&sid, &run.run_id, RunState::Completed, None).unwrap();
        let finalized = store.get_run(&sid, &run.run_id, None).unwrap();
        // 400 chars / 4 = 100 tokens minimum (events add a little more).
        assert!(finalized.usage_tokens >= 100);
        assert!(finalized.estimated_cost_usd > 0.0);

        let usage = store.get_session_usage(&sid, None).unwrap();
        assert_eq!(usage["run_count"], 1);
        assert_eq!(usage["completed_run_count"], 1);

        // Provider-reported usage wins and survives the terminal pass.
        let (run2, _) = store.create_run(&sid, "short", None, None).unwrap();
        store.set_run_usage(&sid, &run2.run_id, 12345, 0.5).unwrap();
        store.set_run_status(&sid, &run2.run_id, RunState::Completed, None).unwrap();
        let kept = store.get_run(&sid, &run2.run_id, None).unwrap();
        assert_eq!(kept.usage_tokens, 12345);
        assert_eq!(kept.estimated_cost_usd, 0.5);
    }

    #[tokio::test]
    async fn state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let state_file = dir.path().join("state.json");

        let sid = {
            let (_unused, store) = open_store(Some(state_file.clone()));
            let session = store.create_session("ws", true, "local-dev").await.unwrap();
            let sid = session.session_id.clone();
            let (run, _) = store.create_run(&sid, "msg", None, None).unwrap();
            store
                .append_event(
                    &sid,
                    &run.run_id,
                    EventType::RunStarted,
                    serde_json::json!({"status": "running"}),
                )
                .unwrap();
            store.set_run_status(&sid, &run.run_id, RunState::Completed, None).unwrap();
            sid
        };

        let raw: Value = serde_json::from_str(&std::fs::read_to_string(&state_file).unwrap()).unwrap();
        assert_eq!(raw["schema_version"], 1);

        let (_unused, reopened) = open_store(Some(state_file));
        let session = reopened.get_session(&sid, None).unwrap();
        assert!(session.settings.auto_approve);
        assert_eq!(session.runs.len(), 1);
        let run = session.runs.values().next().unwrap();
        assert_eq!(run.status, RunState::Completed);
        assert_eq!(run.events.len(), 1);
    }

    #[tokio::test]
    async fn legacy_state_without_schema_version_loads() {
        let dir = tempfile::tempdir().unwrap();
        let state_file = dir.path().join("legacy.json");
        std::fs::write(
            &state_file,
            serde_json::json!({
                "sessions": [{
                    "session_id": "sess_legacy",
                    "tenant_id": "local-dev",
                    "workspace_name": "legacy-workspace",
                    "created_at": "2026-02-16T00:00:00Z",
                    "workflow_state": "jd_provided",
                    "settings": {"auto_approve": false},
                    "active_run_id": null,
                    "pending_approvals_count": 0,
                    "resume_path": "resume.md",
                    "jd_text": "legacy jd",
                    "jd_url": null,
                    "latest_export_path": null,
                    "runs": [{
                        "run_id": "run_legacy",
                        "session_id": "sess_legacy",
                        "message": "Summarize resume",
                        "status": "completed",
                        "created_at": "2026-02-16T00:00:01Z",
                        "started_at": "2026-02-16T00:00:01Z",
                        "ended_at": "2026-02-16T00:00:02Z",
                        "error": null,
                        "events": [{
                            "event_id": "evt_run_legacy_0001",
                            "session_id": "sess_legacy",
                            "run_id": "run_legacy",
                            "type": "run_started",
                            "ts": "2026-02-16T00:00:01Z",
                            "payload": {"status": "running"}
                        }],
                        "event_seq": 1,
                        "interrupt_requested": false,
                        "pending_approval_id": null,
                        "usage_tokens": 10,
                        "estimated_cost_usd": 0.00001,
                        "usage_finalized": true
                    }],
                    "approvals": [],
                    "idempotency_keys": {}
                }]
            })
            .to_string(),
        )
        .unwrap();

        let (_unused, store) = open_store(Some(state_file.clone()));
        let session = store.get_session("sess_legacy", None).unwrap();
        assert_eq!(session.workflow_state, WorkflowState::JdProvided);
        let run = store.get_run("sess_legacy", "run_legacy", None).unwrap();
        assert_eq!(run.status, RunState::Completed);

        // Any save rewrites the file with the current schema version.
        store.set_auto_approve("sess_legacy", true, None).unwrap();
        let raw: Value = serde_json::from_str(&std::fs::read_to_string(&state_file).unwrap()).unwrap();
        assert_eq!(raw["schema_version"], 1);
    }

    #[tokio::test]
    async fn submit_jd_requires_resume_first() {
        let (_dir, store) = open_store(None);
        let session = store.create_session("ws", false, "local-dev").await.unwrap();
        let sid = session.session_id.clone();

        let err = store.submit_jd(&sid, Some("JD text"), None, None).unwrap_err();
        assert_eq!(err.code, "INVALID_STATE");

        let err = store.submit_jd(&sid, None, None, None).unwrap_err();
        assert_eq!(err.code, "BAD_REQUEST");

        store
            .upload_resume(&sid, "resume.md", b"# Resume", Some("text/markdown"), None)
            .await
            .unwrap();
        let updated = store.submit_jd(&sid, Some("JD text"), None, None).unwrap();
        assert_eq!(updated.workflow_state, WorkflowState::JdProvided);
        assert_eq!(updated.jd_text.as_deref(), Some("JD text"));
    }

    #[tokio::test]
    async fn upload_validation() {
        let (_dir, store) = open_store(None);
        let session = store.create_session("ws", false, "local-dev").await.unwrap();
        let sid = session.session_id.clone();

        let big = vec![b'x'; 10 * 1024 * 1024];
        let err = store
            .upload_resume(&sid, "resume.md", &big, Some("text/markdown"), None)
            .await
            .unwrap_err();
        assert_eq!(err.code, "UPLOAD_TOO_LARGE");

        let err = store
            .upload_resume(&sid, "resume.png", b"binary", Some("image/png"), None)
            .await
            .unwrap_err();
        assert_eq!(err.code, "UNSUPPORTED_FILE_TYPE");

        // A missing MIME type is accepted.
        let meta = store
            .upload_resume(&sid, "resume.md", b"# Resume", None, None)
            .await
            .unwrap();
        assert_eq!(meta.path, "resume.md");
        let refreshed = store.get_session(&sid, None).unwrap();
        assert_eq!(refreshed.resume_path.as_deref(), Some("resume.md"));
        assert_eq!(refreshed.workflow_state, WorkflowState::ResumeUploaded);
    }

    #[tokio::test]
    async fn export_prefixes_header_and_promotes() {
        let (_dir, store) = open_store(None);
        let session = store.create_session("ws", false, "local-dev").await.unwrap();
        let sid = session.session_id.clone();
        store
            .upload_resume(&sid, "resume.md", b"# My Resume", Some("text/markdown"), None)
            .await
            .unwrap();

        let meta = store.export_session(&sid, None).await.unwrap();
        assert!(meta.path.starts_with("exports/resume-export-"));
        assert!(meta.path.ends_with(".md"));

        let content = store.read_session_file(&sid, &meta.path, None).await.unwrap();
        let text = String::from_utf8(content.content).unwrap();
        assert!(text.starts_with("# Exported Resume"));
        assert!(text.ends_with("# My Resume"));

        let refreshed = store.get_session(&sid, None).unwrap();
        assert_eq!(refreshed.latest_export_path.as_deref(), Some(meta.path.as_str()));
        assert_eq!(refreshed.workflow_state, WorkflowState::Exported);
    }

    #[tokio::test]
    async fn export_without_files_is_invalid_state() {
        let (_dir, store) = open_store(None);
        let session = store.create_session("ws", false, "local-dev").await.unwrap();
        let err = store.export_session(&session.session_id, None).await.unwrap_err();
        assert_eq!(err.code, "INVALID_STATE");
    }

    #[tokio::test]
    async fn read_falls_back_to_artifacts() {
        let (_dir, store) = open_store(None);
        let session = store.create_session("ws", false, "local-dev").await.unwrap();
        let sid = session.session_id.clone();

        store
            .artifacts
            .as_ref()
            .unwrap()
            .write_artifact(&sid, "exports/only-artifact.md", b"artifact body")
            .await
            .unwrap();

        let content = store
            .read_session_file(&sid, "exports/only-artifact.md", None)
            .await
            .unwrap();
        assert_eq!(content.content, b"artifact body");

        let err = store
            .read_session_file(&sid, "missing-everywhere.md", None)
            .await
            .unwrap_err();
        assert_eq!(err.code, "FILE_NOT_FOUND");
    }
}
