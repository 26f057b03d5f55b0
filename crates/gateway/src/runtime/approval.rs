//! Approval coordinator — the handshake between the executor (which
//! blocks on a pending batch) and the HTTP approve/reject endpoints.
//!
//! One `ApprovalRecord` per proposed call. `run.pending_approval_id`
//! tracks the batch head and is re-pointed to the next still-pending
//! sibling on every decision; the run's latch is raised on each decision
//! and the executor resumes once nothing in the batch is pending.

use serde_json::Value;

use ra_domain::runtime::{make_id, utc_now, ApprovalStatus, EventType, RunState};
use ra_domain::{ApiError, Result};

use super::store::{ApprovalRecord, EventRecord, RuntimeStore};

impl RuntimeStore {
    /// Allocate pending approvals for a batch of proposed tool calls and
    /// point the run at the batch head. Clears the run's latch so the
    /// worker parks until a decision (or interrupt) raises it.
    pub fn create_approval_batch(
        &self,
        session_id: &str,
        run_id: &str,
        calls: &[(String, Value)],
    ) -> Result<Vec<ApprovalRecord>> {
        let approvals = {
            let mut inner = self.inner.lock();
            let session = inner
                .sessions
                .get_mut(session_id)
                .ok_or_else(|| ApiError::session_not_found(session_id))?;
            if !session.runs.contains_key(run_id) {
                return Err(ApiError::run_not_found(run_id));
            }

            let now = utc_now();
            let mut created = Vec::with_capacity(calls.len());
            for (tool_name, args) in calls {
                let approval = ApprovalRecord {
                    approval_id: make_id("appr"),
                    session_id: session_id.to_owned(),
                    run_id: run_id.to_owned(),
                    tool_name: tool_name.clone(),
                    args: args.clone(),
                    created_at: now,
                    status: ApprovalStatus::Pending,
                    decided_at: None,
                };
                session
                    .approvals
                    .insert(approval.approval_id.clone(), approval.clone());
                session.pending_approvals_count += 1;
                created.push(approval);
            }

            if let Some(run) = session.runs.get_mut(run_id) {
                run.pending_approval_id = created.first().map(|a| a.approval_id.clone());
            }
            self.save_locked(&inner)?;
            created
        };

        if let Some(latch) = self.latches.get(run_id) {
            latch.clear();
        }
        Ok(approvals)
    }

    /// Pending approvals for a session, oldest first.
    pub fn list_pending_approvals(
        &self,
        session_id: &str,
        tenant_id: Option<&str>,
    ) -> Result<Vec<ApprovalRecord>> {
        let session = self.get_session(session_id, tenant_id)?;
        let mut items: Vec<ApprovalRecord> = session
            .approvals
            .into_values()
            .filter(|a| a.status == ApprovalStatus::Pending)
            .collect();
        items.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then(a.approval_id.cmp(&b.approval_id))
        });
        Ok(items)
    }

    pub fn approve_approval(
        &self,
        session_id: &str,
        approval_id: &str,
        apply_to_future: bool,
        tenant_id: Option<&str>,
    ) -> Result<ApprovalRecord> {
        self.decide_approval(session_id, approval_id, true, apply_to_future, tenant_id)
    }

    pub fn reject_approval(
        &self,
        session_id: &str,
        approval_id: &str,
        tenant_id: Option<&str>,
    ) -> Result<ApprovalRecord> {
        self.decide_approval(session_id, approval_id, false, false, tenant_id)
    }

    fn decide_approval(
        &self,
        session_id: &str,
        approval_id: &str,
        approve: bool,
        apply_to_future: bool,
        tenant_id: Option<&str>,
    ) -> Result<ApprovalRecord> {
        let (snapshot, run_id, event_seq) = {
            let mut inner = self.inner.lock();
            let session = Self::session_for_tenant(&mut inner, session_id, tenant_id)?;

            let approval = session
                .approvals
                .get(approval_id)
                .ok_or_else(|| ApiError::approval_not_found(approval_id))?;
            if approval.status != ApprovalStatus::Pending {
                return Err(ApiError::approval_already_processed());
            }
            let run_id = approval.run_id.clone();

            let run = session
                .runs
                .get(&run_id)
                .ok_or_else(|| ApiError::invalid_state("Approval is detached from run"))?;
            if run.status != RunState::WaitingApproval || run.pending_approval_id.is_none() {
                return Err(ApiError::invalid_state("Approval is not active for this run"));
            }

            let now = utc_now();

            // Journal the decision in the same critical section that
            // flips the status: the tool_call_* event is durable before
            // the decision is visible to anyone.
            let mut event_seq = 0;
            if let Some(run) = session.runs.get_mut(&run_id) {
                run.event_seq += 1;
                event_seq = run.event_seq;
                let (event_type, payload) = if approve {
                    (
                        EventType::ToolCallApproved,
                        serde_json::json!({ "approval_id": approval_id }),
                    )
                } else {
                    (
                        EventType::ToolCallRejected,
                        serde_json::json!({ "approval_id": approval_id, "reason": "user_rejected" }),
                    )
                };
                run.events.push(EventRecord {
                    event_id: format!("evt_{run_id}_{event_seq:04}"),
                    session_id: session_id.to_owned(),
                    run_id: run_id.clone(),
                    event_type,
                    ts: now,
                    payload,
                });
            }

            if let Some(approval) = session.approvals.get_mut(approval_id) {
                approval.status = if approve {
                    ApprovalStatus::Approved
                } else {
                    ApprovalStatus::Rejected
                };
                approval.decided_at = Some(now);
            }
            session.pending_approvals_count = session.pending_approvals_count.saturating_sub(1);

            // Re-point the batch head at the next pending sibling.
            let mut siblings: Vec<(&String, chrono::DateTime<chrono::Utc>)> = session
                .approvals
                .iter()
                .filter(|(_, a)| a.run_id == run_id && a.status == ApprovalStatus::Pending)
                .map(|(id, a)| (id, a.created_at))
                .collect();
            siblings.sort_by(|a, b| a.1.cmp(&b.1).then(a.0.cmp(b.0)));
            let next_head = siblings.first().map(|(id, _)| (*id).clone());
            if let Some(run) = session.runs.get_mut(&run_id) {
                run.pending_approval_id = next_head;
            }

            if approve && apply_to_future {
                session.settings.auto_approve = true;
            }

            let snapshot = session
                .approvals
                .get(approval_id)
                .cloned()
                .ok_or_else(|| ApiError::approval_not_found(approval_id))?;
            self.save_locked(&inner)?;
            (snapshot, run_id, event_seq)
        };

        self.signal_subscribers(&run_id, event_seq);
        self.latches.signal(&run_id);
        Ok(snapshot)
    }

    /// Executor-facing status read.
    pub fn approval_status(&self, session_id: &str, approval_id: &str) -> Result<ApprovalStatus> {
        let session = self.get_session(session_id, None)?;
        session
            .approvals
            .get(approval_id)
            .map(|a| a.status)
            .ok_or_else(|| ApiError::approval_not_found(approval_id))
    }

    /// Park the worker until every approval in the run's batch is
    /// decided or an interrupt arrives. The latch is cleared before
    /// waiting, with a re-check in between so no signal is lost.
    pub async fn wait_for_decision(&self, session_id: &str, run_id: &str) {
        loop {
            if self.decision_ready(session_id, run_id) {
                return;
            }
            let Some(latch) = self.latches.get(run_id) else {
                return;
            };
            latch.clear();
            if self.decision_ready(session_id, run_id) {
                return;
            }
            latch.wait().await;
        }
    }

    fn decision_ready(&self, session_id: &str, run_id: &str) -> bool {
        match self.get_run(session_id, run_id, None) {
            Ok(run) => run.interrupt_requested || run.pending_approval_id.is_none(),
            // A vanished run must not park the worker forever.
            Err(_) => true,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
