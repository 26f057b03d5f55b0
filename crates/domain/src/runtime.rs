//! Runtime state machines and shared constants.
//!
//! `RunState` is the per-run state machine; `WorkflowState` is the coarse
//! per-session lifecycle, ordered and monotonically non-decreasing.

use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Run state
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Queued,
    Running,
    WaitingApproval,
    Interrupting,
    Completed,
    Failed,
    Interrupted,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Interrupted)
    }

    pub fn is_active(self) -> bool {
        !self.is_terminal()
    }

    /// Wire name used in event payloads and JSON responses.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::WaitingApproval => "waiting_approval",
            Self::Interrupting => "interrupting",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Interrupted => "interrupted",
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Workflow state
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Coarse session lifecycle. Never regresses: `promote` only moves to a
/// state with an equal or higher rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowState {
    Draft,
    ResumeUploaded,
    JdProvided,
    GapAnalyzed,
    RewriteApplied,
    Exported,
    Cancelled,
}

impl WorkflowState {
    fn rank(self) -> u8 {
        match self {
            Self::Draft => 0,
            Self::ResumeUploaded => 1,
            Self::JdProvided => 2,
            Self::GapAnalyzed => 3,
            Self::RewriteApplied => 4,
            Self::Exported => 5,
            Self::Cancelled => 6,
        }
    }

    /// Monotonic promotion: returns the target when it does not rank
    /// below the current state, otherwise keeps the current state.
    pub fn promote(self, target: WorkflowState) -> WorkflowState {
        if target.rank() >= self.rank() {
            target
        } else {
            self
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::ResumeUploaded => "resume_uploaded",
            Self::JdProvided => "jd_provided",
            Self::GapAnalyzed => "gap_analyzed",
            Self::RewriteApplied => "rewrite_applied",
            Self::Exported => "exported",
            Self::Cancelled => "cancelled",
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Event types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    RunStarted,
    AssistantDelta,
    ToolCallProposed,
    ToolCallApproved,
    ToolCallRejected,
    ToolResult,
    RunCompleted,
    RunFailed,
    RunInterrupted,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RunStarted => "run_started",
            Self::AssistantDelta => "assistant_delta",
            Self::ToolCallProposed => "tool_call_proposed",
            Self::ToolCallApproved => "tool_call_approved",
            Self::ToolCallRejected => "tool_call_rejected",
            Self::ToolResult => "tool_result",
            Self::RunCompleted => "run_completed",
            Self::RunFailed => "run_failed",
            Self::RunInterrupted => "run_interrupted",
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Approval status
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Shared constants & helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub const DEFAULT_ALLOWED_UPLOAD_MIME_TYPES: [&str; 4] = [
    "text/markdown",
    "text/plain",
    "application/pdf",
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
];

pub const DEFAULT_COST_PER_MILLION_TOKENS: f64 = 0.08;

/// Create an opaque id matching the documented prefix style
/// (`sess_…`, `run_…`, `appr_…`).
pub fn make_id(prefix: &str) -> String {
    let hex = uuid::Uuid::new_v4().simple().to_string();
    format!("{prefix}_{}", &hex[..10])
}

/// Current UTC time truncated to whole seconds (all persisted
/// timestamps are second-precision ISO-8601).
pub fn utc_now() -> DateTime<Utc> {
    Utc::now().with_nanosecond(0).unwrap_or_else(Utc::now)
}

/// Round a cost figure to 8 decimal places for stable JSON output.
pub fn round_cost(value: f64) -> f64 {
    (value * 1e8).round() / 1e8
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
