//! Runtime metrics and threshold alerts.
//!
//! Aggregated on demand from the store: run counts by bucket, error
//! rate over terminal runs, average and p95 latency from
//! `(started_at, ended_at)` durations, token/cost sums. Queue depth is
//! supplied by the scheduler's gauge.

use serde::Serialize;

use ra_domain::runtime::{round_cost, ApprovalStatus, RunState};

use super::store::RuntimeStore;

#[derive(Debug, Clone, Serialize)]
pub struct RuntimeMetrics {
    pub sessions: usize,
    pub queue_depth: usize,
    pub pending_approvals: u64,
    pub runs_total: usize,
    pub runs_active: usize,
    pub runs_completed: usize,
    pub runs_failed: usize,
    pub runs_interrupted: usize,
    pub error_rate: f64,
    pub avg_latency_ms: f64,
    pub p95_latency_ms: f64,
    pub total_tokens: u64,
    pub total_estimated_cost_usd: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct AlertItem {
    pub name: &'static str,
    pub status: &'static str,
    pub value: f64,
    pub threshold: f64,
    pub message: String,
}

impl RuntimeStore {
    pub fn runtime_metrics(&self, queue_depth: usize) -> RuntimeMetrics {
        let inner = self.inner.lock();

        let mut runs_total = 0usize;
        let mut runs_active = 0usize;
        let mut runs_completed = 0usize;
        let mut runs_failed = 0usize;
        let mut runs_interrupted = 0usize;
        let mut total_tokens = 0u64;
        let mut total_cost = 0f64;
        let mut pending_approvals = 0u64;
        let mut durations_ms: Vec<f64> = Vec::new();

        for session in inner.sessions.values() {
            pending_approvals += session
                .approvals
                .values()
                .filter(|a| a.status == ApprovalStatus::Pending)
                .count() as u64;

            for run in session.runs.values() {
                runs_total += 1;
                match run.status {
                    RunState::Completed => runs_completed += 1,
                    RunState::Failed => runs_failed += 1,
                    RunState::Interrupted => runs_interrupted += 1,
                    _ => runs_active += 1,
                }
                total_tokens += run.usage_tokens;
                total_cost += run.estimated_cost_usd;

                if run.status.is_terminal() {
                    if let (Some(started), Some(ended)) = (run.started_at, run.ended_at) {
                        let ms = (ended - started).num_milliseconds().max(0) as f64;
                        durations_ms.push(ms);
                    }
                }
            }
        }

        let terminal_total = runs_completed + runs_failed + runs_interrupted;
        let error_rate = if terminal_total > 0 {
            runs_failed as f64 / terminal_total as f64
        } else {
            0.0
        };

        let avg_latency_ms = if durations_ms.is_empty() {
            0.0
        } else {
            durations_ms.iter().sum::<f64>() / durations_ms.len() as f64
        };
        let p95_latency_ms = if durations_ms.is_empty() {
            0.0
        } else {
            durations_ms.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
            let idx = ((durations_ms.len() - 1) as f64 * 0.95) as usize;
            durations_ms[idx]
        };

        RuntimeMetrics {
            sessions: inner.sessions.len(),
            queue_depth,
            pending_approvals,
            runs_total,
            runs_active,
            runs_completed,
            runs_failed,
            runs_interrupted,
            error_rate: round6(error_rate),
            avg_latency_ms: round3(avg_latency_ms),
            p95_latency_ms: round3(p95_latency_ms),
            total_tokens,
            total_estimated_cost_usd: round_cost(total_cost),
        }
    }

    /// Compare current metrics against the configured thresholds.
    pub fn alerts(&self, queue_depth: usize) -> Vec<AlertItem> {
        let metrics = self.runtime_metrics(queue_depth);
        let thresholds = &self.config.alerts;
        let checks: [(&'static str, f64, f64); 4] = [
            ("error_rate", metrics.error_rate, thresholds.max_error_rate),
            (
                "p95_latency_ms",
                metrics.p95_latency_ms,
                thresholds.max_p95_latency_ms,
            ),
            (
                "total_estimated_cost_usd",
                metrics.total_estimated_cost_usd,
                thresholds.max_total_cost_usd,
            ),
            (
                "queue_depth",
                metrics.queue_depth as f64,
                thresholds.max_queue_depth,
            ),
        ];

        checks
            .into_iter()
            .map(|(name, value, threshold)| {
                let alerting = value > threshold;
                AlertItem {
                    name,
                    status: if alerting { "alert" } else { "ok" },
                    value,
                    threshold,
                    message: if alerting {
                        format!("{name}={value} exceeds threshold={threshold}")
                    } else {
                        format!("{name}={value} within threshold={threshold}")
                    },
                }
            })
            .collect()
    }
}

fn round3(value: f64) -> f64 {
    (value * 1e3).round() / 1e3
}

fn round6(value: f64) -> f64 {
    (value * 1e6).round() / 1e6
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::test_support::{open_store, open_store_with};

    #[tokio::test]
    async fn empty_store_metrics() {
        let (_dir, store) = open_store(None);
        let metrics = store.runtime_metrics(0);
        assert_eq!(metrics.sessions, 0);
        assert_eq!(metrics.runs_total, 0);
        assert_eq!(metrics.error_rate, 0.0);
        assert_eq!(metrics.avg_latency_ms, 0.0);
        assert_eq!(metrics.p95_latency_ms, 0.0);
    }

    #[tokio::test]
    async fn buckets_and_error_rate() {
        let (_dir, store) = open_store(None);
        let session = store.create_session("ws", false, "local-dev").await.unwrap();
        let sid = session.session_id.clone();

        let (r1, _) = store.create_run(&sid, "one", None, None).unwrap();
        store.set_run_status(&sid, &r1.run_id, RunState::Running, None).unwrap();
        store.set_run_status(&sid, &r1.run_id, RunState::Completed, None).unwrap();

        let (r2, _) = store.create_run(&sid, "two", None, None).unwrap();
        store.set_run_status(&sid, &r2.run_id, RunState::Running, None).unwrap();
        store
            .set_run_status(
                &sid,
                &r2.run_id,
                RunState::Failed,
                Some(serde_json::json!({"code": "INTERNAL_ERROR", "message": "boom"})),
            )
            .unwrap();

        let (r3, _) = store.create_run(&sid, "three", None, None).unwrap();
        let _ = r3;

        let metrics = store.runtime_metrics(4);
        assert_eq!(metrics.sessions, 1);
        assert_eq!(metrics.queue_depth, 4);
        assert_eq!(metrics.runs_total, 3);
        assert_eq!(metrics.runs_active, 1);
        assert_eq!(metrics.runs_completed, 1);
        assert_eq!(metrics.runs_failed, 1);
        // 1 failed of 2 terminal.
        assert_eq!(metrics.error_rate, 0.5);
        assert!(metrics.total_tokens > 0);
    }

    #[tokio::test]
    async fn latency_comes_from_run_timestamps() {
        let (_dir, store) = open_store(None);
        let session = store.create_session("ws", false, "local-dev").await.unwrap();
        let sid = session.session_id.clone();

        let (run, _) = store.create_run(&sid, "msg", None, None).unwrap();
        store.set_run_status(&sid, &run.run_id, RunState::Running, None).unwrap();
        store.set_run_status(&sid, &run.run_id, RunState::Completed, None).unwrap();

        let metrics = store.runtime_metrics(0);
        // Second-precision stamps: duration is small but non-negative.
        assert!(metrics.avg_latency_ms >= 0.0);
        assert!(metrics.p95_latency_ms >= 0.0);
    }

    #[tokio::test]
    async fn alerts_flag_threshold_breaches() {
        let (_dir, store) = open_store_with(None, |config| {
            config.alerts.max_queue_depth = 2.0;
            config.alerts.max_error_rate = 0.0;
        });
        let session = store.create_session("ws", false, "local-dev").await.unwrap();
        let sid = session.session_id.clone();
        let (run, _) = store.create_run(&sid, "boom", None, None).unwrap();
        store.set_run_status(&sid, &run.run_id, RunState::Running, None).unwrap();
        store
            .set_run_status(
                &sid,
                &run.run_id,
                RunState::Failed,
                Some(serde_json::json!({"code": "INTERNAL_ERROR", "message": "x"})),
            )
            .unwrap();

        let alerts = store.alerts(5);
        let by_name: std::collections::HashMap<&str, &AlertItem> =
            alerts.iter().map(|a| (a.name, a)).collect();

        let queue = by_name["queue_depth"];
        assert_eq!(queue.status, "alert");
        assert!(queue.message.contains("exceeds"));

        let errors = by_name["error_rate"];
        assert_eq!(errors.status, "alert");
        assert_eq!(errors.value, 1.0);

        let cost = by_name["total_estimated_cost_usd"];
        assert_eq!(cost.status, "ok");
        assert!(cost.message.contains("within"));
    }

    #[tokio::test]
    async fn alert_list_is_complete() {
        let (_dir, store) = open_store(None);
        let alerts = store.alerts(0);
        let names: Vec<&str> = alerts.iter().map(|a| a.name).collect();
        assert_eq!(
            names,
            vec![
                "error_rate",
                "p95_latency_ms",
                "total_estimated_cost_usd",
                "queue_depth"
            ]
        );
        assert!(alerts.iter().all(|a| a.status == "ok"));
    }
}
