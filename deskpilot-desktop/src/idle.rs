//! Idle/active edge detection.

use crate::config::DesktopConfig;
use crate::error::{DesktopError, DesktopResult};
use crate::hyprctl::run_output;
use crate::monitor::MonotonicClock;
use async_trait::async_trait;
use deskpilot_core::DesktopEvent;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Reports how long the user has been inactive.
#[async_trait]
pub trait IdleSource: Send + Sync {
    async fn idle_ms(&self) -> DesktopResult<u64>;
}

/// Runs an external command that prints the idle time in milliseconds.
pub struct CommandIdleSource {
    command: String,
}

impl CommandIdleSource {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

pub fn parse_idle_output(stdout: &[u8]) -> DesktopResult<u64> {
    let text = String::from_utf8_lossy(stdout);
    text.trim()
        .parse::<u64>()
        .map_err(|_| DesktopError::OperationFailed(format!("unexpected idle output: {}", text.trim())))
}

#[async_trait]
impl IdleSource for CommandIdleSource {
    async fn idle_ms(&self) -> DesktopResult<u64> {
        let mut parts = self.command.split_whitespace();
        let program = parts
            .next()
            .ok_or_else(|| DesktopError::InvalidArgument("idle command is empty".to_string()))?;
        let args: Vec<&str> = parts.collect();
        let stdout = run_output(program, &args).await?;
        parse_idle_output(&stdout)
    }
}

/// Emits only on idle/active transitions. The first observation always emits.
#[derive(Debug)]
pub struct IdleTracker {
    threshold_ms: u64,
    last: Option<bool>,
}

impl IdleTracker {
    pub fn new(threshold_ms: u64) -> Self {
        Self {
            threshold_ms,
            last: None,
        }
    }

    pub fn is_idle(&self) -> Option<bool> {
        self.last
    }

    pub fn observe(&mut self, idle_ms: u64, monotonic_ms: u64) -> Option<DesktopEvent> {
        let idle = idle_ms >= self.threshold_ms;
        if self.last == Some(idle) {
            return None;
        }
        self.last = Some(idle);
        Some(DesktopEvent::activity(idle, idle_ms, monotonic_ms))
    }
}

/// Poll `source` and forward idle/active edges. Returns at once when idle
/// tracking is disabled, and when the receiver goes away.
pub async fn run_idle_monitor(
    config: &DesktopConfig,
    source: Arc<dyn IdleSource>,
    clock: MonotonicClock,
    events: mpsc::Sender<DesktopEvent>,
) {
    if !config.idle_enabled {
        info!("Idle tracking disabled");
        return;
    }

    let mut tracker = IdleTracker::new(config.idle_threshold_ms);
    let mut ticker = tokio::time::interval(config.idle_poll());
    let mut failing = false;
    loop {
        ticker.tick().await;
        let idle_ms = match source.idle_ms().await {
            Ok(ms) => {
                failing = false;
                ms
            }
            Err(e) => {
                if !failing {
                    warn!("Idle source unavailable: {}", e);
                    failing = true;
                }
                continue;
            }
        };
        if let Some(event) = tracker.observe(idle_ms, clock.now_ms()) {
            debug!("Activity edge: {} after {}ms", event.kind.as_str(), idle_ms);
            if events.send(event).await.is_err() {
                return;
            }
        }
    }
}
