//! Merges monitor events, accessibility snapshots and captures into the live
//! [`DesktopContext`] and forwards each new version over the bridge.

use crate::capture::{CaptureRing, Frame};
use crate::snapshot::Snapshotter;
use deskpilot_bridge::ClientHandle;
use deskpilot_core::{build_uia_summary, ContextCell, DesktopContext, DesktopEvent, DesktopEventKind, UiaSnapshot};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

const MIN_REFRESH_INTERVAL: Duration = Duration::from_millis(100);

/// Cheap to clone; clones share the same context and sensors.
#[derive(Clone)]
pub struct Aggregator {
    cell: Arc<ContextCell>,
    snapshotter: Arc<Mutex<Option<Snapshotter>>>,
    capture: Option<Arc<CaptureRing>>,
    client: Option<ClientHandle>,
    /// Bumped on every window change; sensor results from an older window
    /// are discarded.
    window: Arc<AtomicU64>,
    fold: Arc<parking_lot::Mutex<()>>,
}

impl Aggregator {
    pub fn new(cell: Arc<ContextCell>) -> Self {
        Self {
            cell,
            snapshotter: Arc::new(Mutex::new(None)),
            capture: None,
            client: None,
            window: Arc::new(AtomicU64::new(0)),
            fold: Arc::new(parking_lot::Mutex::new(())),
        }
    }

    pub fn with_snapshotter(self, snapshotter: Snapshotter) -> Self {
        Self {
            snapshotter: Arc::new(Mutex::new(Some(snapshotter))),
            ..self
        }
    }

    pub fn with_capture(mut self, ring: Arc<CaptureRing>) -> Self {
        self.capture = Some(ring);
        self
    }

    pub fn with_client(mut self, client: ClientHandle) -> Self {
        self.client = Some(client);
        self
    }

    pub fn context(&self) -> Arc<ContextCell> {
        self.cell.clone()
    }

    pub fn latest_frame(&self) -> Option<Frame> {
        self.capture.as_ref().and_then(|ring| ring.latest())
    }

    /// Fold one event into the context and publish it without waiting on
    /// the sensors. A foreground event starts a sensor pass in the
    /// background that publishes a follow-up version.
    pub async fn apply(&self, event: DesktopEvent) -> Arc<DesktopContext> {
        let foreground = event.kind == DesktopEventKind::Foreground;
        let published = {
            let _fold = self.fold.lock();
            let mut next = (*self.cell.load()).clone();
            if foreground {
                if next.window_title != event.window_title || next.process_id != event.process_id {
                    // whatever the sensors saw belongs to the previous window
                    self.window.fetch_add(1, Ordering::SeqCst);
                    next.uia = None;
                    next.uia_summary.clear();
                    next.screenshot = None;
                    next.screenshot_available = false;
                }
                next.window_title = event.window_title.clone();
                next.process_path = event.process_path.clone();
                next.process_id = event.process_id;
            }
            next.last_event = Some(event.clone());
            self.publish(next, Some(event))
        };
        if foreground {
            let this = self.clone();
            let window = self.window.load(Ordering::SeqCst);
            tokio::spawn(async move {
                let snapshot = this.take_snapshot(window, true).await;
                let frame = this.grab_frame().await;
                if snapshot.is_some() || frame.is_some() {
                    this.merge(window, snapshot, frame);
                }
            });
        }
        published
    }

    /// Re-read the snapshot and capture without a triggering event. Always
    /// publishes a new version unless the window changed meanwhile.
    pub async fn refresh(&self) -> Arc<DesktopContext> {
        let window = self.window.load(Ordering::SeqCst);
        let snapshot = self.take_snapshot(window, false).await;
        let frame = self.grab_frame().await;
        match self.merge(window, snapshot, frame) {
            Some(published) => published,
            None => self.cell.load(),
        }
    }

    /// With `trailing`, a throttled snapshot is retried once the throttle
    /// opens, as long as the window has not changed again.
    async fn take_snapshot(&self, window: u64, trailing: bool) -> Option<UiaSnapshot> {
        loop {
            let wait = {
                let mut guard = self.snapshotter.lock().await;
                let snapshotter = guard.as_mut()?;
                match snapshotter.throttled_for() {
                    Some(wait) if trailing => wait,
                    _ => return snapshotter.snapshot().await,
                }
            };
            tokio::time::sleep(wait).await;
            if self.window.load(Ordering::SeqCst) != window {
                return None;
            }
        }
    }

    async fn grab_frame(&self) -> Option<Frame> {
        let ring = self.capture.as_ref()?;
        match ring.capture().await {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Screen capture failed: {}", e);
                None
            }
        }
    }

    fn merge(&self, window: u64, snapshot: Option<UiaSnapshot>, frame: Option<Frame>) -> Option<Arc<DesktopContext>> {
        let _fold = self.fold.lock();
        if self.window.load(Ordering::SeqCst) != window {
            debug!("Discarding sensor readings taken for a previous window");
            return None;
        }
        let mut next = (*self.cell.load()).clone();
        if let Some(snapshot) = snapshot {
            next.uia_summary = build_uia_summary(&snapshot);
            next.uia = Some(snapshot);
        }
        if let Some(frame) = frame {
            next.screenshot_available = true;
            next.screenshot = Some(frame.capture_ref());
        }
        Some(self.publish(next, None))
    }

    fn publish(&self, next: DesktopContext, event: Option<DesktopEvent>) -> Arc<DesktopContext> {
        let published = self.cell.publish(next);
        debug!("Published context v{}", published.version);
        if let Some(client) = &self.client {
            client.send_context((*published).clone(), event);
        }
        published
    }

    /// Consume events until every sender is gone.
    pub async fn run(self: Arc<Self>, mut events: mpsc::Receiver<DesktopEvent>) {
        info!("Context aggregator started");
        while let Some(event) = events.recv().await {
            self.apply(event).await;
        }
        info!("Context aggregator stopped");
    }

    /// Periodic sensor refresh, independent of window events.
    pub async fn run_refresh(self: Arc<Self>, every: Duration) {
        let mut ticker = tokio::time::interval(every.max(MIN_REFRESH_INTERVAL));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.refresh().await;
        }
    }
}
