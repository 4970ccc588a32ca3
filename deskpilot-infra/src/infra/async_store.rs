use super::sqlite_store::{PruneReport, SqliteStore, SqliteStoreError};
use async_trait::async_trait;
use deskpilot_core::{AutonomyRun, DesktopEvent, EventSink, RunStore, StoreError};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

fn backend(e: impl std::fmt::Display) -> StoreError {
    StoreError::Backend(e.to_string())
}

/// Async wrapper for the sync SQLite store. Every call runs on the blocking
/// pool.
#[derive(Clone)]
pub struct AsyncSqliteStore {
    inner: Arc<SqliteStore>,
}

impl AsyncSqliteStore {
    pub fn new(inner: Arc<SqliteStore>) -> Self {
        Self { inner }
    }

    pub fn inner(&self) -> Arc<SqliteStore> {
        self.inner.clone()
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&SqliteStore) -> Result<T, SqliteStoreError> + Send + 'static,
    {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || f(&inner).map_err(backend))
            .await
            .map_err(backend)?
    }

    pub async fn recent_events(&self, limit: usize) -> Result<Vec<DesktopEvent>, StoreError> {
        self.blocking(move |store| store.recent_events(limit)).await
    }

    pub async fn prune(&self) -> Result<PruneReport, StoreError> {
        self.blocking(|store| store.prune()).await
    }

    /// Apply the retention policy every `every`, starting now, until the
    /// handle is aborted.
    pub fn spawn_pruner(&self, every: Duration) -> JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match store.prune().await {
                    Ok(report) => debug!(
                        "Scheduled prune removed {} run(s) and {} event(s)",
                        report.runs_removed, report.events_removed
                    ),
                    Err(e) => warn!("Scheduled prune failed: {}", e),
                }
            }
        })
    }
}

#[async_trait]
impl RunStore for AsyncSqliteStore {
    async fn save_run(&self, run: &AutonomyRun) -> Result<(), StoreError> {
        let run = run.clone();
        self.blocking(move |store| store.save_run(&run)).await
    }

    async fn get_run(&self, run_id: &str) -> Result<Option<AutonomyRun>, StoreError> {
        let run_id = run_id.to_string();
        self.blocking(move |store| store.get_run(&run_id)).await
    }

    async fn load_runs(&self, limit: usize) -> Result<Vec<AutonomyRun>, StoreError> {
        self.blocking(move |store| store.recent_runs(limit)).await
    }
}

#[async_trait]
impl EventSink for AsyncSqliteStore {
    async fn record_event(&self, event: &DesktopEvent) -> Result<(), StoreError> {
        let event = event.clone();
        self.blocking(move |store| store.append_event(&event).map(|_| ())).await
    }
}
