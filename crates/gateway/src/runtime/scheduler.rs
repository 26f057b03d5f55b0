//! Run scheduler — a process-wide FIFO queue and its single worker.
//!
//! Admission happens in the store (`create_run`); the accepted
//! `(session_id, run_id)` pair is enqueued here. One worker task drains
//! the queue, so run execution is serialized across the whole process
//! and per-session ordering equals creation order. A `None` sentinel
//! shuts the worker down cleanly after everything ahead of it ran.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::Instrument;

use ra_domain::runtime::{EventType, RunState};

use super::executor::{Executor, RunContext, RunOutcome};
use super::store::RuntimeStore;

type QueueMessage = Option<(String, String)>;

pub struct Scheduler {
    tx: mpsc::UnboundedSender<QueueMessage>,
    depth: Arc<AtomicUsize>,
    worker: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Scheduler {
    /// Spawn the worker task. The store must already be recovered.
    pub fn start(store: Arc<RuntimeStore>, executor: Arc<dyn Executor>) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let depth = Arc::new(AtomicUsize::new(0));
        let worker = tokio::spawn(worker_loop(store, executor, rx, depth.clone()));
        Arc::new(Self {
            tx,
            depth,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// FIFO-enqueue an admitted run.
    pub fn enqueue(&self, session_id: &str, run_id: &str) {
        self.depth.fetch_add(1, Ordering::SeqCst);
        if self
            .tx
            .send(Some((session_id.to_owned(), run_id.to_owned())))
            .is_err()
        {
            self.depth.fetch_sub(1, Ordering::SeqCst);
            tracing::warn!(session_id, run_id, "run queue closed; run not scheduled");
        }
    }

    /// Runs admitted but not yet picked up by the worker.
    pub fn queue_depth(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }

    /// Push the shutdown sentinel and wait for the worker to drain
    /// everything queued ahead of it.
    pub async fn shutdown(&self) {
        let _ = self.tx.send(None);
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            let _ = worker.await;
        }
    }
}

async fn worker_loop(
    store: Arc<RuntimeStore>,
    executor: Arc<dyn Executor>,
    mut rx: mpsc::UnboundedReceiver<QueueMessage>,
    depth: Arc<AtomicUsize>,
) {
    tracing::info!("run worker started");
    while let Some(message) = rx.recv().await {
        let Some((session_id, run_id)) = message else {
            tracing::info!("run worker stopping on shutdown sentinel");
            break;
        };
        depth.fetch_sub(1, Ordering::SeqCst);

        let span = tracing::info_span!("run", %session_id, %run_id);
        process_run(&store, executor.as_ref(), &session_id, &run_id)
            .instrument(span)
            .await;
    }
}

async fn process_run(
    store: &Arc<RuntimeStore>,
    executor: &dyn Executor,
    session_id: &str,
    run_id: &str,
) {
    if let Err(err) = store.set_run_status(session_id, run_id, RunState::Running, None) {
        tracing::warn!(error = %err, "run could not start");
        return;
    }
    if let Err(err) = store.append_event(
        session_id,
        run_id,
        EventType::RunStarted,
        serde_json::json!({ "status": "running" }),
    ) {
        tracing::warn!(error = %err, "run_started event not persisted");
    }

    // Interrupt raced the queue: finish before doing any work.
    if finalize_interrupt_if_requested(store, session_id, run_id) {
        return;
    }

    let ctx = RunContext::new(store.clone(), session_id.to_owned(), run_id.to_owned());
    match executor.execute(&ctx).await {
        Ok(RunOutcome::Completed { final_text }) => {
            log_if_err(store.append_event(
                session_id,
                run_id,
                EventType::RunCompleted,
                serde_json::json!({ "status": "completed", "final_text": final_text }),
            ));
            log_if_err(store.set_run_status(session_id, run_id, RunState::Completed, None));
        }
        Ok(RunOutcome::Interrupted) => {
            finalize_interrupt_if_requested(store, session_id, run_id);
        }
        Err(err) => {
            // Executor failures never take the worker down.
            tracing::error!(error = %err, "run failed");
            log_if_err(store.append_event(
                session_id,
                run_id,
                EventType::RunFailed,
                serde_json::json!({
                    "status": "failed",
                    "error_code": "INTERNAL_ERROR",
                    "message": err.message,
                }),
            ));
            log_if_err(store.set_run_status(
                session_id,
                run_id,
                RunState::Failed,
                Some(serde_json::json!({
                    "code": "INTERNAL_ERROR",
                    "message": err.message,
                })),
            ));
        }
    }
}

/// Emit `run_interrupted` + transition when the flag is set. Returns
/// `true` when the run is (now) terminal via the interrupt path.
fn finalize_interrupt_if_requested(
    store: &Arc<RuntimeStore>,
    session_id: &str,
    run_id: &str,
) -> bool {
    match store.get_run(session_id, run_id, None) {
        Ok(run) => {
            if !run.interrupt_requested {
                return false;
            }
            if run.is_terminal() {
                return true;
            }
            log_if_err(store.append_event(
                session_id,
                run_id,
                EventType::RunInterrupted,
                serde_json::json!({ "status": "interrupted" }),
            ));
            log_if_err(store.set_run_status(session_id, run_id, RunState::Interrupted, None));
            true
        }
        Err(_) => true,
    }
}

fn log_if_err(result: ra_domain::Result<()>) {
    if let Err(err) = result {
        tracing::warn!(error = %err, "run bookkeeping write failed");
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::store::RunRecord;
    use crate::runtime::stub::StubExecutor;
    use crate::runtime::test_support::open_store;
    use async_trait::async_trait;
    use ra_domain::ApiError;
    use std::time::Duration;

    async fn wait_terminal(
        store: &Arc<RuntimeStore>,
        session_id: &str,
        run_id: &str,
    ) -> RunRecord {
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        loop {
            let run = store.get_run(session_id, run_id, None).unwrap();
            if run.is_terminal() {
                return run;
            }
            assert!(
                std::time::Instant::now() < deadline,
                "run did not reach a terminal state in time"
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[tokio::test]
    async fn queued_run_completes_with_event_envelope() {
        let (_dir, store) = open_store(None);
        let scheduler = Scheduler::start(store.clone(), Arc::new(StubExecutor::new()));

        let session = store.create_session("ws", false, "local-dev").await.unwrap();
        let sid = session.session_id.clone();
        let (run, _) = store.create_run(&sid, "hello there", None, None).unwrap();
        scheduler.enqueue(&sid, &run.run_id);

        let finished = wait_terminal(&store, &sid, &run.run_id).await;
        assert_eq!(finished.status, RunState::Completed);
        assert!(finished.started_at.is_some());
        assert!(finished.ended_at.is_some());

        let types: Vec<&str> = finished
            .events
            .iter()
            .map(|e| e.event_type.as_str())
            .collect();
        assert_eq!(types.first(), Some(&"run_started"));
        assert_eq!(types.last(), Some(&"run_completed"));

        // Gapless seq from 1.
        for (i, event) in finished.events.iter().enumerate() {
            assert_eq!(event.event_id, format!("evt_{}_{:04}", run.run_id, i + 1));
        }

        let session = store.get_session(&sid, None).unwrap();
        assert!(session.active_run_id.is_none());

        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn runs_across_sessions_are_serialized_fifo() {
        let (_dir, store) = open_store(None);
        let scheduler = Scheduler::start(store.clone(), Arc::new(StubExecutor::new()));

        let mut pairs = Vec::new();
        for _ in 0..3 {
            let session = store.create_session("ws", false, "local-dev").await.unwrap();
            let sid = session.session_id.clone();
            let (run, _) = store.create_run(&sid, "quick note", None, None).unwrap();
            scheduler.enqueue(&sid, &run.run_id);
            pairs.push((sid, run.run_id));
        }

        for (sid, rid) in &pairs {
            let finished = wait_terminal(&store, sid, rid).await;
            assert_eq!(finished.status, RunState::Completed);
        }

        // Single worker: completion order equals enqueue order.
        let ended: Vec<_> = pairs
            .iter()
            .map(|(sid, rid)| store.get_run(sid, rid, None).unwrap().ended_at.unwrap())
            .collect();
        assert!(ended.windows(2).all(|w| w[0] <= w[1]));

        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn interrupt_before_pickup_finishes_as_interrupted() {
        let (_dir, store) = open_store(None);
        let session = store.create_session("ws", false, "local-dev").await.unwrap();
        let sid = session.session_id.clone();
        let (run, _) = store.create_run(&sid, "never picked up yet", None, None).unwrap();

        // Interrupt while still queued (no scheduler running yet).
        store.interrupt_run(&sid, &run.run_id, None).unwrap();

        let scheduler = Scheduler::start(store.clone(), Arc::new(StubExecutor::new()));
        scheduler.enqueue(&sid, &run.run_id);

        let finished = wait_terminal(&store, &sid, &run.run_id).await;
        assert_eq!(finished.status, RunState::Interrupted);
        let types: Vec<&str> = finished
            .events
            .iter()
            .map(|e| e.event_type.as_str())
            .collect();
        assert_eq!(types, vec!["run_started", "run_interrupted"]);

        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn executor_error_marks_run_failed() {
        struct ExplodingExecutor;

        #[async_trait]
        impl Executor for ExplodingExecutor {
            async fn execute(&self, _ctx: &RunContext) -> ra_domain::Result<RunOutcome> {
                Err(ApiError::internal("executor blew up"))
            }
        }

        let (_dir, store) = open_store(None);
        let scheduler = Scheduler::start(store.clone(), Arc::new(ExplodingExecutor));

        let session = store.create_session("ws", false, "local-dev").await.unwrap();
        let sid = session.session_id.clone();
        let (run, _) = store.create_run(&sid, "boom", None, None).unwrap();
        scheduler.enqueue(&sid, &run.run_id);

        let finished = wait_terminal(&store, &sid, &run.run_id).await;
        assert_eq!(finished.status, RunState::Failed);
        let error = finished.error.as_ref().unwrap();
        assert_eq!(error["code"], "INTERNAL_ERROR");
        assert!(error["message"].as_str().unwrap().contains("blew up"));

        let last = finished.events.last().unwrap();
        assert_eq!(last.event_type, EventType::RunFailed);
        assert_eq!(last.payload["error_code"], "INTERNAL_ERROR");

        // Worker survives the failure and still processes new work.
        let session2 = store.create_session("ws", false, "local-dev").await.unwrap();
        let sid2 = session2.session_id.clone();
        let (run2, _) = store.create_run(&sid2, "still alive", None, None).unwrap();
        scheduler.enqueue(&sid2, &run2.run_id);
        let _finished2 = wait_terminal(&store, &sid2, &run2.run_id).await;

        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_drains_queued_work_first() {
        let (_dir, store) = open_store(None);
        let scheduler = Scheduler::start(store.clone(), Arc::new(StubExecutor::new()));

        let session = store.create_session("ws", false, "local-dev").await.unwrap();
        let sid = session.session_id.clone();
        let (run, _) = store.create_run(&sid, "finish me", None, None).unwrap();
        scheduler.enqueue(&sid, &run.run_id);

        // Sentinel is behind the run in the FIFO.
        scheduler.shutdown().await;

        let finished = store.get_run(&sid, &run.run_id, None).unwrap();
        assert!(finished.is_terminal());
    }

    #[tokio::test]
    async fn queue_depth_tracks_enqueues() {
        let (_dir, store) = open_store(None);
        // No worker yet: enqueue against a started scheduler but hold
        // the worker busy with a long run first.
        let scheduler = Scheduler::start(store.clone(), Arc::new(StubExecutor::new()));

        let session = store.create_session("ws", false, "local-dev").await.unwrap();
        let sid = session.session_id.clone();
        let (long_run, _) = store.create_run(&sid, "long analysis", None, None).unwrap();
        scheduler.enqueue(&sid, &long_run.run_id);

        let session2 = store.create_session("ws", false, "local-dev").await.unwrap();
        let sid2 = session2.session_id.clone();
        let (queued, _) = store.create_run(&sid2, "waiting", None, None).unwrap();
        scheduler.enqueue(&sid2, &queued.run_id);

        tokio::time::sleep(Duration::from_millis(100)).await;
        // The long run is being processed; the second is still queued.
        assert_eq!(scheduler.queue_depth(), 1);

        wait_terminal(&store, &sid2, &queued.run_id).await;
        assert_eq!(scheduler.queue_depth(), 0);

        scheduler.shutdown().await;
    }
}
