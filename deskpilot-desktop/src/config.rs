//! Desktop-side sensing configuration.

use crate::capture::CaptureSettings;
use crate::snapshot::WalkLimits;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DesktopConfig {
    pub idle_enabled: bool,
    pub idle_threshold_ms: u64,
    pub idle_poll_ms: u64,
    /// Command printing the idle time in milliseconds (xprintidle style).
    pub idle_command: String,

    pub snapshot_interval_ms: u64,
    pub snapshot_max_depth: usize,
    pub snapshot_max_children: usize,
    pub text_max_chars: usize,
    /// Read accessibility trees over AT-SPI; compositor geometry otherwise.
    pub atspi_enabled: bool,
    /// Upper bound on AT-SPI nodes read per snapshot.
    pub atspi_max_nodes: usize,

    pub screenshot_enabled: bool,
    pub screenshot_interval_ms: u64,
    pub screenshot_max_width: u32,
    pub screenshot_max_height: u32,
    pub jpeg_quality: u8,
    pub capture_ring_size: usize,
}

impl Default for DesktopConfig {
    fn default() -> Self {
        Self {
            idle_enabled: true,
            idle_threshold_ms: 60_000,
            idle_poll_ms: 1_000,
            idle_command: "xprintidle".to_string(),
            snapshot_interval_ms: 1_000,
            snapshot_max_depth: 3,
            snapshot_max_children: 20,
            text_max_chars: 240,
            atspi_enabled: true,
            atspi_max_nodes: 80,
            screenshot_enabled: false,
            screenshot_interval_ms: 2_000,
            screenshot_max_width: 1280,
            screenshot_max_height: 720,
            jpeg_quality: 70,
            capture_ring_size: 5,
        }
    }
}

impl DesktopConfig {
    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms.max(10))
    }

    pub fn snapshot_interval(&self) -> Duration {
        Duration::from_millis(self.snapshot_interval_ms)
    }

    pub fn screenshot_interval(&self) -> Duration {
        Duration::from_millis(self.screenshot_interval_ms)
    }

    /// Period of the background sensor refresh: the snapshot interval, or
    /// the screenshot interval when captures are on and due more often.
    pub fn refresh_interval(&self) -> Duration {
        let snapshot = self.snapshot_interval();
        if self.screenshot_enabled {
            snapshot.min(self.screenshot_interval())
        } else {
            snapshot
        }
    }

    pub fn walk_limits(&self) -> WalkLimits {
        WalkLimits {
            max_depth: self.snapshot_max_depth,
            max_children: self.snapshot_max_children,
            text_max_chars: self.text_max_chars,
        }
    }

    pub fn capture_settings(&self) -> CaptureSettings {
        CaptureSettings {
            max_width: self.screenshot_max_width,
            max_height: self.screenshot_max_height,
            quality: self.jpeg_quality,
            capacity: self.capture_ring_size,
            min_interval: self.screenshot_interval(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn test_refresh_runs_without_screenshots() {
        let config = DesktopConfig::default();
        assert!(!config.screenshot_enabled);
        assert_eq!(config.refresh_interval(), Duration::from_millis(1_000));

        let config = DesktopConfig {
            screenshot_enabled: true,
            screenshot_interval_ms: 400,
            ..Default::default()
        };
        assert_eq!(config.refresh_interval(), Duration::from_millis(400));
    }
}
