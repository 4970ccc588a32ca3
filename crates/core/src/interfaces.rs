//! Seams between the bridge, executors, orchestrator and persistence.

use crate::run::AutonomyRun;
use crate::types::{BridgeCommand, BridgeResult, DesktopEvent};
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// Persistence errors.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Store backend error: {0}")]
    Backend(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Request/response channel to the native desktop side.
#[async_trait]
pub trait CommandChannel: Send + Sync {
    /// Send a command and wait for its correlated result or the timeout.
    /// Channel-level failures are reported as a failed [`BridgeResult`].
    async fn dispatch(&self, command: BridgeCommand, timeout: Duration) -> BridgeResult;

    /// Heartbeat-based liveness of the channel.
    fn is_connected(&self) -> bool;
}

/// Persisted run log.
#[async_trait]
pub trait RunStore: Send + Sync {
    async fn save_run(&self, run: &AutonomyRun) -> Result<(), StoreError>;

    async fn get_run(&self, run_id: &str) -> Result<Option<AutonomyRun>, StoreError>;

    /// Most recently updated runs first.
    async fn load_runs(&self, limit: usize) -> Result<Vec<AutonomyRun>, StoreError>;
}

/// Append-only sink for observed desktop events.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn record_event(&self, event: &DesktopEvent) -> Result<(), StoreError>;
}
