//! Executor contract — the narrow seam between the run worker and
//! whatever produces the run's events.
//!
//! An [`Executor`] receives a [`RunContext`] scoped to one run and talks
//! back to the store through it: event emission, the approval
//! round-trip, cooperative interrupt checks, and scoped file I/O. The
//! deterministic stub and the [`AgentExecutor`] adapter for a real LLM
//! backend both implement the same trait; the scheduler does not care
//! which one is plugged in.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use ra_domain::runtime::{ApprovalStatus, EventType, RunState, WorkflowState};
use ra_domain::Result;
use ra_workspace::{FileContent, FileMeta};

use super::store::RuntimeStore;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Contract types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A tool call the executor wants to make against workspace files.
#[derive(Debug, Clone)]
pub struct ProposedCall {
    pub tool_name: String,
    pub args: Value,
}

/// Resolution of an approval round-trip.
#[derive(Debug)]
pub enum ApprovalDecision {
    /// Every call in the batch was approved.
    Approved(Vec<ProposedCall>),
    /// At least one call was rejected; the run finishes without writes.
    Rejected,
    /// An interrupt arrived while waiting.
    Interrupted,
}

/// How a run finished, as reported by the executor. Failures travel as
/// `Err` and are turned into `run_failed` by the worker.
#[derive(Debug)]
pub enum RunOutcome {
    Completed { final_text: String },
    Interrupted,
}

#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, ctx: &RunContext) -> Result<RunOutcome>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Run context
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Everything an executor may do on behalf of one run.
pub struct RunContext {
    store: Arc<RuntimeStore>,
    pub session_id: String,
    pub run_id: String,
}

/// Cooperative cancellation slice — executors must observe an interrupt
/// within this window while sleeping.
const SLEEP_SLICE: Duration = Duration::from_millis(50);

impl RunContext {
    pub fn new(store: Arc<RuntimeStore>, session_id: String, run_id: String) -> Self {
        Self {
            store,
            session_id,
            run_id,
        }
    }

    pub fn message(&self) -> Result<String> {
        self.store.run_message(&self.session_id, &self.run_id)
    }

    pub fn auto_approve(&self) -> Result<bool> {
        self.store.session_auto_approve(&self.session_id)
    }

    /// Append a journal event for this run.
    pub fn emit(&self, event_type: EventType, payload: Value) -> Result<()> {
        self.store
            .append_event(&self.session_id, &self.run_id, event_type, payload)
    }

    /// Authoritative interrupt flag. A vanished run reads as
    /// interrupted so the executor unwinds instead of ploughing on.
    pub fn interrupt_requested(&self) -> bool {
        self.store
            .get_run(&self.session_id, &self.run_id, None)
            .map(|run| run.interrupt_requested)
            .unwrap_or(true)
    }

    /// Sleep in ≤50 ms slices, checking the interrupt flag between
    /// slices. Returns `false` as soon as an interrupt is observed.
    pub async fn sleep_interruptible(&self, duration: Duration) -> bool {
        let mut remaining = duration;
        while remaining > Duration::ZERO {
            if self.interrupt_requested() {
                return false;
            }
            let nap = remaining.min(SLEEP_SLICE);
            tokio::time::sleep(nap).await;
            remaining = remaining.saturating_sub(nap);
        }
        !self.interrupt_requested()
    }

    /// Full approval round-trip: allocate the batch, emit one
    /// `tool_call_proposed` per call, park in `waiting_approval` until
    /// every sibling is decided (or an interrupt lands), then resume
    /// `running` on the approved path.
    pub async fn request_approval(&self, calls: Vec<ProposedCall>) -> Result<ApprovalDecision> {
        let batch: Vec<(String, Value)> = calls
            .iter()
            .map(|call| (call.tool_name.clone(), call.args.clone()))
            .collect();
        let approvals = self
            .store
            .create_approval_batch(&self.session_id, &self.run_id, &batch)?;

        for approval in &approvals {
            self.emit(
                EventType::ToolCallProposed,
                serde_json::json!({
                    "approval_id": approval.approval_id,
                    "tool_name": approval.tool_name,
                    "args": approval.args,
                }),
            )?;
        }
        self.store.set_run_status(
            &self.session_id,
            &self.run_id,
            RunState::WaitingApproval,
            None,
        )?;

        self.store
            .wait_for_decision(&self.session_id, &self.run_id)
            .await;

        if self.interrupt_requested() {
            return Ok(ApprovalDecision::Interrupted);
        }
        for approval in &approvals {
            if self.store.approval_status(&self.session_id, &approval.approval_id)?
                == ApprovalStatus::Rejected
            {
                return Ok(ApprovalDecision::Rejected);
            }
        }

        self.store
            .set_run_status(&self.session_id, &self.run_id, RunState::Running, None)?;
        Ok(ApprovalDecision::Approved(calls))
    }

    // ── Scoped file access ───────────────────────────────────────────

    /// Workspace read with transparent artifact fallback.
    pub async fn read_file(&self, path: &str) -> Result<FileContent> {
        self.store
            .read_session_file(&self.session_id, path, None)
            .await
    }

    pub async fn write_file(&self, path: &str, content: &[u8]) -> Result<FileMeta> {
        let meta = self
            .store
            .workspace
            .write_file(&self.session_id, path, content)
            .await?;
        self.store.note_file_written(&self.session_id, &meta.path)?;
        Ok(meta)
    }

    pub fn promote_workflow(&self, target: WorkflowState) -> Result<()> {
        self.store.promote_workflow(&self.session_id, target)
    }

    /// Provider-reported usage; overrides the stub estimate.
    pub fn set_usage(&self, tokens: u64, cost_usd: f64) -> Result<()> {
        self.store
            .set_run_usage(&self.session_id, &self.run_id, tokens, cost_usd)
    }

    /// The session's executor-owned conversation blob.
    pub fn conversation(&self) -> Result<Option<Value>> {
        self.store.conversation(&self.session_id)
    }

    pub fn save_conversation(&self, conversation: Value) -> Result<()> {
        self.store.set_conversation(&self.session_id, conversation)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Agent backend adapter (real executor)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Callbacks a real LLM agent registers before running. Mirrors the
/// stream-delta / approval / tool-event / interrupt-poll hook set.
#[async_trait]
pub trait AgentHooks: Send + Sync {
    async fn on_stream_delta(&self, text: &str) -> Result<()>;

    /// Blocks until the human decides; returns the approved subset via
    /// [`ApprovalDecision::Approved`].
    async fn request_approval(&self, calls: Vec<ProposedCall>) -> Result<ApprovalDecision>;

    async fn on_tool_end(&self, tool_name: &str, result: &str, success: bool) -> Result<()>;

    fn interrupt_requested(&self) -> bool;

    /// Provider-reported token/cost totals, when available.
    fn report_usage(&self, tokens: u64, cost_usd: f64) -> Result<()>;
}

/// A finished agent turn: the final assistant text plus the updated
/// conversation history to persist on the session.
#[derive(Debug)]
pub struct AgentTurn {
    pub final_text: String,
    pub conversation: Option<Value>,
}

/// The external LLM agent. Implementations must poll
/// `hooks.interrupt_requested()` at every externally observable step
/// and return early when it fires — the scheduler never aborts an
/// executor forcibly.
#[async_trait]
pub trait AgentBackend: Send + Sync {
    async fn run(
        &self,
        message: &str,
        conversation: Option<Value>,
        hooks: &dyn AgentHooks,
    ) -> Result<AgentTurn>;
}

/// Adapter that drives an [`AgentBackend`] under the executor contract,
/// wiring its hooks straight into the run's store context.
pub struct AgentExecutor {
    backend: Arc<dyn AgentBackend>,
}

impl AgentExecutor {
    pub fn new(backend: Arc<dyn AgentBackend>) -> Self {
        Self { backend }
    }
}

struct ContextHooks<'a> {
    ctx: &'a RunContext,
}

#[async_trait]
impl AgentHooks for ContextHooks<'_> {
    async fn on_stream_delta(&self, text: &str) -> Result<()> {
        if text.is_empty() {
            return Ok(());
        }
        self.ctx
            .emit(EventType::AssistantDelta, serde_json::json!({ "text": text }))
    }

    async fn request_approval(&self, calls: Vec<ProposedCall>) -> Result<ApprovalDecision> {
        self.ctx.request_approval(calls).await
    }

    async fn on_tool_end(&self, tool_name: &str, result: &str, success: bool) -> Result<()> {
        self.ctx.emit(
            EventType::ToolResult,
            serde_json::json!({
                "tool_name": tool_name,
                "success": success,
                "result": result,
            }),
        )
    }

    fn interrupt_requested(&self) -> bool {
        self.ctx.interrupt_requested()
    }

    fn report_usage(&self, tokens: u64, cost_usd: f64) -> Result<()> {
        self.ctx.set_usage(tokens, cost_usd)
    }
}

#[async_trait]
impl Executor for AgentExecutor {
    async fn execute(&self, ctx: &RunContext) -> Result<RunOutcome> {
        let hooks = ContextHooks { ctx };
        let message = ctx.message()?;
        let history = ctx.conversation()?;
        let turn = self.backend.run(&message, history, &hooks).await?;

        if let Some(conversation) = turn.conversation {
            ctx.save_conversation(conversation)?;
        }
        if ctx.interrupt_requested() {
            return Ok(RunOutcome::Interrupted);
        }
        Ok(RunOutcome::Completed {
            final_text: turn.final_text,
        })
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
