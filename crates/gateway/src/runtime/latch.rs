//! Per-run wait latches.
//!
//! A [`WaitLatch`] is a level-triggered signal: `set` leaves it raised
//! until the single consumer (the run worker) clears it. Approval and
//! interrupt handlers raise it; the worker clears it before waiting so a
//! decision arriving between the clear and the wait is never lost —
//! callers must re-check their condition after `clear`.
//!
//! Latches are in-memory only. After a restart the recovery normalizer
//! turns any would-be waiter into an interrupted run.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

pub struct WaitLatch {
    raised: AtomicBool,
    notify: Notify,
}

impl WaitLatch {
    pub fn new() -> Self {
        Self {
            raised: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    /// Raise the latch and wake any waiter.
    pub fn set(&self) {
        self.raised.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    /// Lower the latch. Only the worker calls this, before waiting.
    pub fn clear(&self) {
        self.raised.store(false, Ordering::Release);
    }

    pub fn is_set(&self) -> bool {
        self.raised.load(Ordering::Acquire)
    }

    /// Wait until the latch is raised. Returns immediately if it
    /// already is (level semantics — no pulse can be missed between
    /// the flag check and the registration below).
    pub async fn wait(&self) {
        loop {
            if self.raised.load(Ordering::Acquire) {
                return;
            }
            let notified = self.notify.notified();
            if self.raised.load(Ordering::Acquire) {
                return;
            }
            notified.await;
        }
    }
}

impl Default for WaitLatch {
    fn default() -> Self {
        Self::new()
    }
}

/// Tracks the latch of every active run, keyed by run id.
pub struct LatchMap {
    latches: Mutex<HashMap<String, Arc<WaitLatch>>>,
}

impl Default for LatchMap {
    fn default() -> Self {
        Self::new()
    }
}

impl LatchMap {
    pub fn new() -> Self {
        Self {
            latches: Mutex::new(HashMap::new()),
        }
    }

    /// Create and register a fresh latch for a run.
    pub fn register(&self, run_id: &str) -> Arc<WaitLatch> {
        let latch = Arc::new(WaitLatch::new());
        self.latches.lock().insert(run_id.to_owned(), latch.clone());
        latch
    }

    pub fn get(&self, run_id: &str) -> Option<Arc<WaitLatch>> {
        self.latches.lock().get(run_id).cloned()
    }

    /// Raise the latch for a run, if one is registered.
    pub fn signal(&self, run_id: &str) {
        if let Some(latch) = self.get(run_id) {
            latch.set();
        }
    }

    /// Drop the latch when a run reaches a terminal state.
    pub fn remove(&self, run_id: &str) {
        self.latches.lock().remove(run_id);
    }

    pub fn len(&self) -> usize {
        self.latches.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.latches.lock().is_empty()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn wait_returns_immediately_when_already_set() {
        let latch = WaitLatch::new();
        latch.set();
        // Must not hang.
        tokio::time::timeout(Duration::from_millis(100), latch.wait())
            .await
            .expect("latch.wait() should return at once");
    }

    #[tokio::test]
    async fn set_wakes_a_parked_waiter() {
        let latch = Arc::new(WaitLatch::new());
        let waiter = latch.clone();
        let handle = tokio::spawn(async move {
            waiter.wait().await;
            7
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        latch.set();
        let result = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result, 7);
    }

    #[tokio::test]
    async fn level_semantics_survive_clear_and_reset() {
        let latch = WaitLatch::new();
        latch.set();
        assert!(latch.is_set());

        latch.clear();
        assert!(!latch.is_set());

        latch.set();
        tokio::time::timeout(Duration::from_millis(100), latch.wait())
            .await
            .expect("raised latch must not block");
    }

    #[tokio::test]
    async fn set_before_wait_is_not_lost() {
        let latch = Arc::new(WaitLatch::new());
        // Signal first, wait second — the level flag must carry it.
        latch.set();
        let waiter = latch.clone();
        tokio::time::timeout(Duration::from_millis(100), async move {
            waiter.wait().await;
        })
        .await
        .expect("pre-raised latch must not block");
    }

    #[test]
    fn map_register_signal_remove() {
        let map = LatchMap::new();
        let latch = map.register("run_1");
        assert!(!latch.is_set());

        map.signal("run_1");
        assert!(latch.is_set());

        map.remove("run_1");
        assert!(map.get("run_1").is_none());
        assert!(map.is_empty());
    }

    #[test]
    fn signal_unknown_run_is_a_noop() {
        let map = LatchMap::new();
        map.signal("ghost");
        assert_eq!(map.len(), 0);
    }

    #[test]
    fn register_replaces_previous_latch() {
        let map = LatchMap::new();
        let old = map.register("run_1");
        let new = map.register("run_1");

        map.signal("run_1");
        assert!(new.is_set());
        assert!(!old.is_set());
    }
}
