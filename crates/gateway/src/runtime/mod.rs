//! Runtime core — the durable store, the run scheduler, the executor
//! contract, and the coordination pieces between them.
//!
//! Data flow: an HTTP handler admits a run via [`store::RuntimeStore`],
//! the [`scheduler::Scheduler`] worker dequeues it and drives an
//! [`executor::Executor`], which talks back to the store through its
//! [`executor::RunContext`] (events, approvals, interrupt checks). The
//! stream endpoints replay the store's event journal.

pub mod approval;
pub mod cleanup;
pub mod executor;
pub mod latch;
pub mod metrics;
pub mod recovery;
pub mod scheduler;
pub mod store;
pub mod stub;

#[cfg(test)]
pub(crate) mod test_support {
    use std::path::PathBuf;
    use std::sync::Arc;

    use ra_domain::config::Config;
    use ra_workspace::{LocalArtifactStorage, LocalWorkspaceProvider};

    use super::store::RuntimeStore;

    pub(crate) fn open_store(state_file: Option<PathBuf>) -> (tempfile::TempDir, Arc<RuntimeStore>) {
        open_store_with(state_file, |_| {})
    }

    pub(crate) fn open_store_with(
        state_file: Option<PathBuf>,
        tweak: impl FnOnce(&mut Config),
    ) -> (tempfile::TempDir, Arc<RuntimeStore>) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config {
            state_file,
            workspace_root: dir.path().join("sessions"),
            artifact_root: dir.path().join("artifacts"),
            ..Config::default()
        };
        tweak(&mut config);

        let workspace = Arc::new(LocalWorkspaceProvider::new(config.workspace_root.clone()));
        let artifacts = Arc::new(LocalArtifactStorage::new(config.artifact_root.clone()));
        let store = RuntimeStore::open(Arc::new(config), workspace, Some(artifacts)).unwrap();
        (dir, store)
    }
}
