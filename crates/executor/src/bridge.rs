//! Executor that drives the real desktop through the command bridge.

use crate::outcome::{ActionExecutor, ActionOutcome};
use async_trait::async_trait;
use deskpilot_core::{BridgeCommand, ChannelFailure, CommandChannel, ContextCell, DesktopAction, DesktopContext, Params};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub const BRIDGE_DISCONNECTED: &str = "bridge not connected to collector";

/// Map planner spellings onto the command catalog.
pub fn normalize_action(action: &str) -> &str {
    match action {
        "observe_desktop" => "observe",
        "send_or_submit" => "send_keys",
        other => other,
    }
}

/// Describe what visibly changed between two contexts, if anything.
pub fn change_note(before: &DesktopContext, after: &DesktopContext) -> Option<String> {
    if after.window_title != before.window_title {
        return Some(format!("window changed to {}", after.window_title));
    }
    if after.uia_summary != before.uia_summary {
        return Some("UI state changed".to_string());
    }
    None
}

pub struct BridgeExecutor {
    channel: Arc<dyn CommandChannel>,
    context: Arc<ContextCell>,
    timeout: Duration,
    settle: Duration,
}

impl BridgeExecutor {
    pub fn new(channel: Arc<dyn CommandChannel>, context: Arc<ContextCell>, timeout: Duration) -> Self {
        Self {
            channel,
            context,
            timeout,
            settle: Duration::from_millis(300),
        }
    }

    /// How long to wait for the desktop to report the effect of an action.
    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    pub fn is_connected(&self) -> bool {
        self.channel.is_connected()
    }

    pub fn channel(&self) -> Arc<dyn CommandChannel> {
        self.channel.clone()
    }
}

#[async_trait]
impl ActionExecutor for BridgeExecutor {
    fn name(&self) -> &'static str {
        "bridge"
    }

    async fn execute(&self, action: &str, params: &Params) -> ActionOutcome {
        let action = match normalize_action(action).parse::<DesktopAction>() {
            Ok(action) => action,
            Err(e) => return ActionOutcome::failed(e),
        };
        if !self.channel.is_connected() {
            return ActionOutcome::disconnected(BRIDGE_DISCONNECTED, ChannelFailure::NotConnected);
        }

        let before = self.context.load();
        let result = self
            .channel
            .dispatch(BridgeCommand::new(action, params.clone()), self.timeout)
            .await;
        if !result.ok {
            let error = result.error.unwrap_or_else(|| "command failed".to_string());
            warn!("Bridge command {} ({}) failed: {}", result.id, action, error);
            return match result.channel {
                Some(failure) => ActionOutcome::disconnected(error, failure),
                None => ActionOutcome::failed(error),
            };
        }

        let after = if action == DesktopAction::Observe {
            self.context.load()
        } else {
            self.context.wait_newer(before.version, self.settle).await
        };
        let change = change_note(&before, &after);
        debug!("Command {} ({}) change: {:?}", result.id, action, change);

        let mut output = match result.output {
            Some(Value::Object(map)) => map,
            Some(other) => {
                let mut map = serde_json::Map::new();
                map.insert("result".to_string(), other);
                map
            }
            None => serde_json::Map::new(),
        };
        output.insert("command_id".to_string(), json!(result.id));
        if let Some(change) = change {
            output.insert("change".to_string(), json!(change));
        }
        ActionOutcome::ok(Value::Object(output))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use deskpilot_core::BridgeResult;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct FakeChannel {
        connected: AtomicBool,
        context: Arc<ContextCell>,
        sent: Mutex<Vec<BridgeCommand>>,
        fail_with: Option<String>,
    }

    #[async_trait]
    impl CommandChannel for FakeChannel {
        async fn dispatch(&self, command: BridgeCommand, _timeout: Duration) -> BridgeResult {
            self.sent.lock().push(command.clone());
            if let Some(error) = &self.fail_with {
                return BridgeResult::failure(1, error.clone());
            }
            if command.action == DesktopAction::OpenApplication {
                self.context.publish(DesktopContext {
                    window_title: "Calculator".into(),
                    ..Default::default()
                });
            }
            BridgeResult::success(1, json!({"done": true}))
        }

        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }
    }

    fn executor(connected: bool, fail_with: Option<&str>) -> (BridgeExecutor, Arc<FakeChannel>) {
        let context = Arc::new(ContextCell::new());
        let channel = Arc::new(FakeChannel {
            connected: AtomicBool::new(connected),
            context: context.clone(),
            sent: Mutex::new(Vec::new()),
            fail_with: fail_with.map(str::to_string),
        });
        let executor = BridgeExecutor::new(channel.clone(), context, Duration::from_secs(1))
            .with_settle(Duration::from_millis(20));
        (executor, channel)
    }

    #[test]
    fn test_aliases() {
        assert_eq!(normalize_action("observe_desktop"), "observe");
        assert_eq!(normalize_action("send_or_submit"), "send_keys");
        assert_eq!(normalize_action("click"), "click");
    }

    #[tokio::test]
    async fn test_disconnected_bridge_fails() {
        let (executor, channel) = executor(false, None);
        let outcome = executor.execute("click", &Params::new()).await;
        assert_eq!(outcome.error.as_deref(), Some(BRIDGE_DISCONNECTED));
        assert_eq!(outcome.disconnect, Some(ChannelFailure::NotConnected));
        assert!(channel.sent.lock().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_action_rejected_before_dispatch() {
        let (executor, channel) = executor(true, None);
        let outcome = executor.execute("teleport", &Params::new()).await;
        assert_eq!(outcome.error.as_deref(), Some("unknown action: teleport"));
        assert!(channel.sent.lock().is_empty());
    }

    #[tokio::test]
    async fn test_alias_dispatches_catalog_action() {
        let (executor, channel) = executor(true, None);
        let outcome = executor.execute("send_or_submit", &Params::new()).await;
        assert!(outcome.success);
        assert_eq!(channel.sent.lock()[0].action, DesktopAction::SendKeys);
    }

    #[tokio::test]
    async fn test_window_change_is_reported() {
        let (executor, _) = executor(true, None);
        let outcome = executor.execute("open_application", &Params::new()).await;
        assert!(outcome.success);
        assert_eq!(outcome.describe(), "window changed to Calculator");
        assert_eq!(outcome.output.unwrap()["done"], true);
    }

    #[tokio::test]
    async fn test_channel_failure_surfaces_as_outcome() {
        let (executor, _) = executor(true, Some("command timed out after 1000ms"));
        let outcome = executor.execute("scroll", &Params::new()).await;
        assert!(!outcome.success);
        assert_eq!(outcome.error.as_deref(), Some("command timed out after 1000ms"));
        assert!(!outcome.is_disconnect());
    }

    struct DroppingChannel;

    #[async_trait]
    impl CommandChannel for DroppingChannel {
        async fn dispatch(&self, command: BridgeCommand, _timeout: Duration) -> BridgeResult {
            BridgeResult::channel_failure(command.id, ChannelFailure::ConnectionLost)
        }

        fn is_connected(&self) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn test_lost_connection_is_a_disconnect() {
        let executor = BridgeExecutor::new(Arc::new(DroppingChannel), Arc::new(ContextCell::new()), Duration::from_secs(1));
        let outcome = executor.execute("click", &Params::new()).await;
        assert!(!outcome.success);
        assert_eq!(outcome.error.as_deref(), Some("connection lost"));
        assert_eq!(outcome.disconnect, Some(ChannelFailure::ConnectionLost));
    }

    #[test]
    fn test_change_note() {
        let before = DesktopContext {
            window_title: "Inbox".into(),
            uia_summary: "Focused: Search".into(),
            ..Default::default()
        };
        let mut after = before.clone();
        assert_eq!(change_note(&before, &after), None);
        after.uia_summary = "Focused: Reply".into();
        assert_eq!(change_note(&before, &after).as_deref(), Some("UI state changed"));
        after.window_title = "Compose".into();
        assert_eq!(
            change_note(&before, &after).as_deref(),
            Some("window changed to Compose")
        );
    }
}
