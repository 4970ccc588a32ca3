//! Single live desktop context, swapped atomically.

use crate::types::DesktopContext;
use chrono::Utc;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// Holds the one live [`DesktopContext`] of a session.
///
/// Writers publish a whole new snapshot; readers get an `Arc` to a complete
/// value and never observe a partially updated record.
pub struct ContextCell {
    current: RwLock<Arc<DesktopContext>>,
    changed: Notify,
}

impl ContextCell {
    pub fn new() -> Self {
        Self {
            current: RwLock::new(Arc::new(DesktopContext::default())),
            changed: Notify::new(),
        }
    }

    pub fn load(&self) -> Arc<DesktopContext> {
        self.current.read().clone()
    }

    pub fn version(&self) -> u64 {
        self.current.read().version
    }

    /// Replace the live context. The version is assigned here and is strictly
    /// increasing regardless of what the caller put in.
    pub fn publish(&self, mut next: DesktopContext) -> Arc<DesktopContext> {
        let published = {
            let mut guard = self.current.write();
            next.version = guard.version + 1;
            next.updated_at = Utc::now();
            let published = Arc::new(next);
            *guard = published.clone();
            published
        };
        self.changed.notify_waiters();
        published
    }

    /// Wait until a context newer than `version` is published, or the timeout
    /// elapses. Returns whatever is current at that point.
    pub async fn wait_newer(&self, version: u64, timeout: Duration) -> Arc<DesktopContext> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.changed.notified();
            let current = self.load();
            if current.version > version {
                return current;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.load();
            }
        }
    }
}

impl Default for ContextCell {
    fn default() -> Self {
        Self::new()
    }
}
