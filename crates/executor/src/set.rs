//! Mode-based routing across the available executors.

use crate::bridge::{normalize_action, BridgeExecutor};
use crate::browser::{is_browser_action, BrowserExecutor};
use crate::outcome::{ActionExecutor, ActionOutcome};
use crate::simulator::SimulatorExecutor;
use async_trait::async_trait;
use deskpilot_core::{ExecutorMode, Params};
use std::time::Duration;
use tracing::debug;

pub struct ExecutorSet {
    mode: ExecutorMode,
    simulator: SimulatorExecutor,
    bridge: Option<BridgeExecutor>,
    browser: Option<BrowserExecutor>,
}

impl ExecutorSet {
    pub fn new(mode: ExecutorMode) -> Self {
        Self {
            mode,
            simulator: SimulatorExecutor,
            bridge: None,
            browser: None,
        }
    }

    pub fn with_bridge(mut self, bridge: BridgeExecutor) -> Self {
        self.bridge = Some(bridge);
        self
    }

    pub fn with_browser(mut self, browser: BrowserExecutor) -> Self {
        self.browser = Some(browser);
        self
    }

    pub fn mode(&self) -> ExecutorMode {
        self.mode
    }

    pub fn bridge_connected(&self) -> bool {
        self.bridge.as_ref().is_some_and(BridgeExecutor::is_connected)
    }

    /// Wait up to `window` for the bridge to report connected again.
    pub async fn wait_bridge(&self, window: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + window;
        loop {
            if self.bridge_connected() {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    /// Pick the executor for one call. `Auto` is decided per call.
    pub fn route(&self, mode: ExecutorMode, action: &str, params: &Params) -> Result<&dyn ActionExecutor, String> {
        match mode {
            ExecutorMode::Simulator => Ok(&self.simulator as &dyn ActionExecutor),
            ExecutorMode::Bridge => self
                .bridge
                .as_ref()
                .map(|b| b as &dyn ActionExecutor)
                .ok_or_else(|| "bridge executor not configured".to_string()),
            ExecutorMode::Browser => self
                .browser
                .as_ref()
                .map(|b| b as &dyn ActionExecutor)
                .ok_or_else(|| "browser executor not configured".to_string()),
            ExecutorMode::Auto => {
                if is_browser_action(action, params) {
                    if let Some(browser) = &self.browser {
                        return Ok(browser as &dyn ActionExecutor);
                    }
                }
                match &self.bridge {
                    Some(bridge) if bridge.is_connected() => Ok(bridge as &dyn ActionExecutor),
                    _ => Ok(&self.simulator as &dyn ActionExecutor),
                }
            }
        }
    }

    /// Execute under an explicit mode, overriding the set default.
    pub async fn execute_in(&self, mode: ExecutorMode, action: &str, params: &Params) -> ActionOutcome {
        let action = normalize_action(action);
        match self.route(mode, action, params) {
            Ok(executor) => {
                debug!("Routing {} to {} ({})", action, executor.name(), mode.as_str());
                executor.execute(action, params).await
            }
            Err(e) => ActionOutcome::failed(e),
        }
    }
}

#[async_trait]
impl ActionExecutor for ExecutorSet {
    fn name(&self) -> &'static str {
        "set"
    }

    async fn execute(&self, action: &str, params: &Params) -> ActionOutcome {
        self.execute_in(self.mode, action, params).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::browser::BrowserSettings;
    use deskpilot_core::{BridgeCommand, BridgeResult, CommandChannel, ContextCell};
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    struct Switch(AtomicBool);

    #[async_trait]
    impl CommandChannel for Switch {
        async fn dispatch(&self, command: BridgeCommand, _timeout: Duration) -> BridgeResult {
            BridgeResult::success(command.id, json!({}))
        }

        fn is_connected(&self) -> bool {
            self.0.load(Ordering::SeqCst)
        }
    }

    fn set_with_bridge(connected: bool) -> (ExecutorSet, Arc<Switch>) {
        let switch = Arc::new(Switch(AtomicBool::new(connected)));
        let bridge = BridgeExecutor::new(switch.clone(), Arc::new(ContextCell::new()), Duration::from_secs(1))
            .with_settle(Duration::ZERO);
        (ExecutorSet::new(ExecutorMode::Auto).with_bridge(bridge), switch)
    }

    #[test]
    fn test_auto_falls_back_to_simulator_when_disconnected() {
        let (set, switch) = set_with_bridge(false);
        let params = Params::new();
        assert_eq!(set.route(ExecutorMode::Auto, "click", &params).unwrap().name(), "simulator");
        switch.0.store(true, Ordering::SeqCst);
        assert_eq!(set.route(ExecutorMode::Auto, "click", &params).unwrap().name(), "bridge");
    }

    #[test]
    fn test_auto_sends_browser_actions_to_browser_when_configured() {
        let (set, _) = set_with_bridge(true);
        let set = set.with_browser(BrowserExecutor::new(BrowserSettings::default()));
        let params = Params::new();
        assert_eq!(set.route(ExecutorMode::Auto, "navigate", &params).unwrap().name(), "browser");
        assert_eq!(set.route(ExecutorMode::Auto, "type_text", &params).unwrap().name(), "bridge");
    }

    #[test]
    fn test_explicit_mode_without_backend_is_error() {
        let set = ExecutorSet::new(ExecutorMode::Bridge);
        assert!(set.route(ExecutorMode::Bridge, "click", &Params::new()).is_err());
        assert!(set.route(ExecutorMode::Browser, "navigate", &Params::new()).is_err());
    }

    #[tokio::test]
    async fn test_bridge_mode_does_not_fall_back() {
        let (set, _) = set_with_bridge(false);
        let outcome = set.execute_in(ExecutorMode::Bridge, "observe_desktop", &Params::new()).await;
        assert_eq!(outcome.error.as_deref(), Some("bridge not connected to collector"));
        assert!(!set.bridge_connected());
    }

    #[tokio::test]
    async fn test_wait_bridge() {
        let (set, switch) = set_with_bridge(false);
        assert!(!set.wait_bridge(Duration::from_millis(50)).await);
        switch.0.store(true, Ordering::SeqCst);
        assert!(set.wait_bridge(Duration::from_millis(50)).await);
    }
}
