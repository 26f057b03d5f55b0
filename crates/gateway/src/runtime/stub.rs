//! Deterministic stub executor.
//!
//! Drives the whole run lifecycle from message keywords, which makes the
//! approval/interrupt machinery testable without an LLM. The heuristics
//! are a contract: `long` inserts a 1 s cooperative sleep, `gap`/`analy`
//! advance the workflow, write-intent keywords propose a `file_write`
//! against the first `word.ext` token in the message (default
//! `resume.md`).

use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;

use ra_domain::runtime::{EventType, WorkflowState};
use ra_domain::Result;

use super::executor::{ApprovalDecision, Executor, ProposedCall, RunContext, RunOutcome};

const WRITE_INTENT_KEYWORDS: [&str; 6] = ["write", "update", "modify", "edit", "create", "copy"];

fn target_path_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"([\w./-]+\.[a-zA-Z0-9]{1,8})").expect("literal pattern compiles")
    })
}

pub(crate) fn message_requires_write(message: &str) -> bool {
    let normalized = message.to_lowercase();
    WRITE_INTENT_KEYWORDS
        .iter()
        .any(|keyword| normalized.contains(keyword))
}

pub(crate) fn extract_target_path(message: &str) -> String {
    target_path_re()
        .find(message)
        .map(|m| m.as_str().to_owned())
        .unwrap_or_else(|| "resume.md".to_owned())
}

#[derive(Default)]
pub struct StubExecutor;

impl StubExecutor {
    pub fn new() -> Self {
        Self
    }

    /// Append an annotated bullet to the target file (creating a draft
    /// when it does not exist yet).
    async fn apply_file_write(&self, ctx: &RunContext, target: &str, message: &str) -> Result<()> {
        let hint = format!("Updated by run {}: {}", ctx.run_id, message.trim());

        let next_text = match ctx.read_file(target).await {
            Ok(existing) => {
                let mut base = String::from_utf8(existing.content).unwrap_or_default();
                if !base.is_empty() && !base.ends_with('\n') {
                    base.push('\n');
                }
                format!("{base}\n- {hint}\n")
            }
            Err(err) if err.code == "FILE_NOT_FOUND" => {
                format!("# Resume Draft\n\n- {hint}\n")
            }
            Err(err) => return Err(err),
        };

        ctx.write_file(target, next_text.as_bytes()).await?;
        Ok(())
    }

    async fn emit_write_result(&self, ctx: &RunContext, target: &str) -> Result<()> {
        ctx.promote_workflow(WorkflowState::RewriteApplied)?;
        ctx.emit(
            EventType::ToolResult,
            serde_json::json!({
                "tool_name": "file_write",
                "success": true,
                "result": format!("Stub wrote content to {target}"),
            }),
        )
    }
}

#[async_trait]
impl Executor for StubExecutor {
    async fn execute(&self, ctx: &RunContext) -> Result<RunOutcome> {
        ctx.emit(
            EventType::AssistantDelta,
            serde_json::json!({
                "text": "Stub executor: request accepted and being processed.",
            }),
        )?;

        let message = ctx.message()?;
        let normalized = message.to_lowercase();

        let think_time = if normalized.contains("long") {
            Duration::from_secs(1)
        } else {
            Duration::from_millis(50)
        };
        if !ctx.sleep_interruptible(think_time).await {
            return Ok(RunOutcome::Interrupted);
        }

        if normalized.contains("gap") || normalized.contains("analy") {
            ctx.promote_workflow(WorkflowState::GapAnalyzed)?;
        }

        if message_requires_write(&message) {
            let target = extract_target_path(&message);

            if ctx.auto_approve()? {
                self.apply_file_write(ctx, &target, &message).await?;
                self.emit_write_result(ctx, &target).await?;
            } else {
                let decision = ctx
                    .request_approval(vec![ProposedCall {
                        tool_name: "file_write".into(),
                        args: serde_json::json!({ "path": target }),
                    }])
                    .await?;

                match decision {
                    ApprovalDecision::Interrupted => return Ok(RunOutcome::Interrupted),
                    ApprovalDecision::Rejected => {
                        return Ok(RunOutcome::Completed {
                            final_text: "Run completed without write changes (rejected).".into(),
                        });
                    }
                    ApprovalDecision::Approved(_) => {
                        self.apply_file_write(ctx, &target, &message).await?;
                        self.emit_write_result(ctx, &target).await?;
                    }
                }
            }
        }

        if !ctx.sleep_interruptible(Duration::from_millis(50)).await {
            return Ok(RunOutcome::Interrupted);
        }

        Ok(RunOutcome::Completed {
            final_text: "Stub run completed.".into(),
        })
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
