//! Startup recovery — normalizes state left behind by a crash.
//!
//! In-flight LLM work cannot be resumed across a restart, so every run
//! persisted in an active state is forcibly interrupted before the
//! scheduler accepts work: a synthetic `run_interrupted` event is
//! appended (unless one already exists), terminal fields are stamped,
//! orphaned pending approvals are rejected, session active-run pointers
//! are cleared, and pending counts are recomputed from the approvals
//! themselves. One lock hold, one save.

use ra_domain::runtime::{utc_now, ApprovalStatus, EventType, RunState};
use ra_domain::Result;

use super::store::{EventRecord, RuntimeStore};

impl RuntimeStore {
    /// Returns the number of runs normalized.
    pub(crate) fn normalize_active_runs(&self) -> Result<usize> {
        let mut inner = self.inner.lock();
        let now = utc_now();
        let mut normalized = 0usize;

        for session in inner.sessions.values_mut() {
            let mut affected: Vec<String> = Vec::new();

            for run in session.runs.values_mut() {
                if run.status.is_terminal() {
                    continue;
                }
                normalized += 1;
                affected.push(run.run_id.clone());

                if !run
                    .events
                    .iter()
                    .any(|e| e.event_type == EventType::RunInterrupted)
                {
                    run.event_seq += 1;
                    let seq = run.event_seq;
                    run.events.push(EventRecord {
                        event_id: format!("evt_{}_{seq:04}", run.run_id),
                        session_id: session.session_id.clone(),
                        run_id: run.run_id.clone(),
                        event_type: EventType::RunInterrupted,
                        ts: now,
                        payload: serde_json::json!({
                            "status": "interrupted",
                            "reason": "process_restarted",
                        }),
                    });
                }

                run.status = RunState::Interrupted;
                run.interrupt_requested = true;
                if run.ended_at.is_none() {
                    run.ended_at = Some(now);
                }
                if run.started_at.is_none() {
                    run.started_at = Some(run.created_at);
                }
                run.pending_approval_id = None;
            }

            for approval in session.approvals.values_mut() {
                if approval.status == ApprovalStatus::Pending
                    && affected.iter().any(|rid| *rid == approval.run_id)
                {
                    approval.status = ApprovalStatus::Rejected;
                    approval.decided_at = Some(now);
                }
            }

            if let Some(active) = &session.active_run_id {
                if affected.iter().any(|rid| rid == active) {
                    session.active_run_id = None;
                }
            }

            // Recount from the approvals table, not the stale counter.
            session.pending_approvals_count = session
                .approvals
                .values()
                .filter(|a| a.status == ApprovalStatus::Pending)
                .count() as u32;
        }

        if normalized > 0 {
            self.save_locked(&inner)?;
        }
        Ok(normalized)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
