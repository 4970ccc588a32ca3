//! Bridge configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Both sides must agree on the heartbeat values; they are not negotiated.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BridgeConfig {
    /// Address the hub listens on.
    pub listen_addr: String,
    /// URL the desktop client connects to.
    pub url: String,
    pub heartbeat_interval_ms: u64,
    pub heartbeat_timeout_ms: u64,
    pub reconnect_initial_ms: u64,
    pub reconnect_max_ms: u64,
    pub command_timeout_ms: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8765".to_string(),
            url: "ws://127.0.0.1:8765/bridge".to_string(),
            heartbeat_interval_ms: 5_000,
            heartbeat_timeout_ms: 15_000,
            reconnect_initial_ms: 1_000,
            reconnect_max_ms: 30_000,
            command_timeout_ms: 5_000,
        }
    }
}

impl BridgeConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms.max(1))
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}
