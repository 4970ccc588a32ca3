//! Foreground window monitor.
//!
//! Subscribes to the Hyprland event socket and turns `activewindow` lines into
//! [`DesktopEvent`]s. Nothing here polls; a new event is emitted only when the
//! compositor reports a focus change. A closed or failed socket is
//! reconnected with exponential backoff.

use crate::error::{DesktopError, DesktopResult};
use crate::hyprctl;
use async_trait::async_trait;
use deskpilot_bridge::Backoff;
use deskpilot_core::DesktopEvent;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use sysinfo::{Pid, System};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const RECONNECT_INITIAL_MS: u64 = 500;
const RECONNECT_MAX_MS: u64 = 30_000;

/// How one pass over the compositor event stream ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
    Closed,
    ReceiverGone,
}

/// Milliseconds since the monitor started.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    epoch: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }

    pub fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Focus change as reported by the compositor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FocusChange {
    pub class: String,
    pub title: String,
}

/// Parse an `activewindow>>class,title` line. The title may contain commas.
pub fn parse_focus_line(line: &str) -> Option<FocusChange> {
    let payload = line.trim_end().strip_prefix("activewindow>>")?;
    let (class, title) = payload.split_once(',').unwrap_or((payload, ""));
    Some(FocusChange {
        class: class.to_string(),
        title: title.to_string(),
    })
}

/// Process metadata for the focused window.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProcessInfo {
    pub pid: u32,
    pub path: String,
}

#[async_trait]
pub trait ProcessLookup: Send + Sync {
    /// Best effort: unknown fields are left empty.
    async fn focused_process(&self, change: &FocusChange) -> ProcessInfo;
}

/// Resolves the pid with `hyprctl activewindow -j` and the executable with sysinfo.
pub struct HyprlandProcessLookup {
    system: Arc<Mutex<System>>,
}

impl HyprlandProcessLookup {
    pub fn new() -> Self {
        Self {
            system: Arc::new(Mutex::new(System::new())),
        }
    }

    async fn process_path(&self, pid: u32) -> String {
        let system = self.system.clone();
        tokio::task::spawn_blocking(move || {
            let mut system = system.lock();
            let pid = Pid::from_u32(pid);
            if !system.refresh_process(pid) {
                return String::new();
            }
            system
                .process(pid)
                .and_then(|p| p.exe())
                .map(|exe| exe.display().to_string())
                .unwrap_or_default()
        })
        .await
        .unwrap_or_default()
    }
}

impl Default for HyprlandProcessLookup {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProcessLookup for HyprlandProcessLookup {
    async fn focused_process(&self, change: &FocusChange) -> ProcessInfo {
        let pid = match hyprctl::active_window().await {
            Ok(Some(window)) => window.pid(),
            Ok(None) => 0,
            Err(e) => {
                debug!("Active window lookup failed for {}: {}", change.class, e);
                0
            }
        };
        if pid == 0 {
            return ProcessInfo::default();
        }
        ProcessInfo {
            pid,
            path: self.process_path(pid).await,
        }
    }
}

pub struct ForegroundMonitor {
    clock: MonotonicClock,
    lookup: Arc<dyn ProcessLookup>,
}

impl ForegroundMonitor {
    pub fn new(clock: MonotonicClock, lookup: Arc<dyn ProcessLookup>) -> Self {
        Self { clock, lookup }
    }

    /// Stream focus events until the receiver is dropped, reconnecting to
    /// the compositor socket whenever it closes.
    pub async fn run(&self, events: mpsc::Sender<DesktopEvent>) {
        let backoff = Backoff::new(RECONNECT_INITIAL_MS, RECONNECT_MAX_MS);
        let announce = events.clone();
        self.supervise(events, backoff, move || {
            let announce = announce.clone();
            async move {
                let path = hyprctl::event_socket_path()?;
                info!("Subscribing to compositor events at {}", path.display());
                let stream = UnixStream::connect(&path).await?;
                self.announce_active(&announce).await;
                Ok::<_, DesktopError>(BufReader::new(stream))
            }
        })
        .await
    }

    /// Reconnect loop over any event source.
    pub async fn supervise<F, Fut, R>(&self, events: mpsc::Sender<DesktopEvent>, mut backoff: Backoff, mut connect: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = DesktopResult<R>>,
        R: AsyncBufRead + Unpin,
    {
        loop {
            match connect().await {
                Ok(reader) => {
                    backoff.reset();
                    match self.watch(reader, events.clone()).await {
                        Ok(StreamEnd::ReceiverGone) => break,
                        Ok(StreamEnd::Closed) => warn!("Compositor event stream ended"),
                        Err(e) => warn!("Compositor event stream failed: {}", e),
                    }
                }
                Err(e) => warn!("Compositor event socket unavailable: {}", e),
            }
            if events.is_closed() {
                break;
            }
            let delay = backoff.next_delay();
            debug!("Resubscribing to compositor events in {:?}", delay);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = events.closed() => break,
            }
        }
        info!("Foreground monitor stopped");
    }

    async fn announce_active(&self, events: &mpsc::Sender<DesktopEvent>) {
        if let Ok(Some(window)) = hyprctl::active_window().await {
            let change = FocusChange {
                class: window.class.clone(),
                title: window.title.clone(),
            };
            self.emit(&change, events).await;
        }
    }

    /// Consume compositor event lines from any reader.
    pub async fn watch<R>(&self, reader: R, events: mpsc::Sender<DesktopEvent>) -> DesktopResult<StreamEnd>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut lines = reader.lines();
        let mut last: Option<FocusChange> = None;
        while let Some(line) = lines.next_line().await? {
            let Some(change) = parse_focus_line(&line) else {
                continue;
            };
            if last.as_ref() == Some(&change) {
                continue;
            }
            if !self.emit(&change, &events).await {
                return Ok(StreamEnd::ReceiverGone);
            }
            last = Some(change);
        }
        Ok(StreamEnd::Closed)
    }

    async fn emit(&self, change: &FocusChange, events: &mpsc::Sender<DesktopEvent>) -> bool {
        let process = self.lookup.focused_process(change).await;
        let event = DesktopEvent::foreground(
            change.title.clone(),
            process.path,
            process.pid,
            self.clock.now_ms(),
        );
        debug!("Foreground: {} ({})", change.title, change.class);
        events.send(event).await.is_ok()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use deskpilot_core::DesktopEventKind;
    use std::time::Duration;

    struct FixedLookup;

    #[async_trait]
    impl ProcessLookup for FixedLookup {
        async fn focused_process(&self, change: &FocusChange) -> ProcessInfo {
            if change.class == "ghost" {
                return ProcessInfo::default();
            }
            ProcessInfo {
                pid: 100,
                path: format!("/usr/bin/{}", change.class),
            }
        }
    }

    #[test]
    fn test_parse_focus_line() {
        assert_eq!(
            parse_focus_line("activewindow>>firefox,Docs, Sheets and more"),
            Some(FocusChange {
                class: "firefox".into(),
                title: "Docs, Sheets and more".into(),
            })
        );
        assert_eq!(
            parse_focus_line("activewindow>>,"),
            Some(FocusChange {
                class: String::new(),
                title: String::new(),
            })
        );
        assert_eq!(parse_focus_line("activewindowv2>>55d1"), None);
        assert_eq!(parse_focus_line("workspace>>2"), None);
    }

    #[tokio::test]
    async fn test_watch_emits_only_on_change() {
        let input = "workspace>>1\n\
                     activewindow>>kitty,~\n\
                     activewindowv2>>55d1\n\
                     activewindow>>kitty,~\n\
                     activewindow>>firefox,Inbox\n\
                     activewindow>>ghost,Popup\n";
        let monitor = ForegroundMonitor::new(MonotonicClock::new(), Arc::new(FixedLookup));
        let (tx, mut rx) = mpsc::channel(16);
        let end = monitor.watch(input.as_bytes(), tx).await.unwrap();
        assert_eq!(end, StreamEnd::Closed);

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        assert_eq!(events.len(), 3);
        assert!(events.iter().all(|e| e.kind == DesktopEventKind::Foreground));
        assert_eq!(events[0].process_path, "/usr/bin/kitty");
        assert_eq!(events[1].window_title, "Inbox");
        assert_eq!(events[1].process_id, 100);
        // lookup failure still emits with empty metadata
        assert_eq!(events[2].window_title, "Popup");
        assert_eq!(events[2].process_path, "");
        assert_eq!(events[2].process_id, 0);
        assert!(events[0].monotonic_ms <= events[2].monotonic_ms);
    }

    #[tokio::test]
    async fn test_watch_stops_when_receiver_dropped() {
        let monitor = ForegroundMonitor::new(MonotonicClock::new(), Arc::new(FixedLookup));
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let input = "activewindow>>a,1\nactivewindow>>b,2\n";
        assert_eq!(monitor.watch(input.as_bytes(), tx).await.unwrap(), StreamEnd::ReceiverGone);
    }

    #[tokio::test]
    async fn test_closed_stream_is_resubscribed() {
        let monitor = Arc::new(ForegroundMonitor::new(MonotonicClock::new(), Arc::new(FixedLookup)));
        let streams = Arc::new(Mutex::new(std::collections::VecDeque::from(vec![
            Ok("activewindow>>kitty,~\n"),
            Err(DesktopError::Unavailable("socket gone".into())),
            Ok("activewindow>>firefox,Inbox\n"),
        ])));
        let attempts = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let (tx, mut rx) = mpsc::channel(16);

        let task = {
            let monitor = monitor.clone();
            let streams = streams.clone();
            let attempts = attempts.clone();
            tokio::spawn(async move {
                monitor
                    .supervise(tx, Backoff::new(5, 20), move || {
                        attempts.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                        let next = streams
                            .lock()
                            .pop_front()
                            .unwrap_or(Err(DesktopError::Unavailable("no compositor".into())));
                        async move { next.map(|text: &'static str| text.as_bytes()) }
                    })
                    .await
            })
        };

        let first = rx.recv().await.unwrap();
        let second = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.window_title, "~");
        assert_eq!(second.window_title, "Inbox");
        assert!(attempts.load(std::sync::atomic::Ordering::SeqCst) >= 3);

        drop(rx);
        tokio::time::timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
    }
}
