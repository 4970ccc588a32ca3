//! Executor result type and trait.

use async_trait::async_trait;
use deskpilot_core::{ChannelFailure, Params};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Result of executing one planned action.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActionOutcome {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// The bridge was down, so the action never ran to completion on the
    /// desktop.
    #[serde(skip)]
    pub disconnect: Option<ChannelFailure>,
}

impl ActionOutcome {
    pub fn ok(output: Value) -> Self {
        Self {
            success: true,
            output: Some(output),
            error: None,
            disconnect: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: None,
            error: Some(error.into()),
            disconnect: None,
        }
    }

    pub fn disconnected(error: impl Into<String>, failure: ChannelFailure) -> Self {
        Self {
            disconnect: Some(failure),
            ..Self::failed(error)
        }
    }

    pub fn is_disconnect(&self) -> bool {
        self.disconnect.is_some()
    }

    /// Short human-readable line for agent logs.
    pub fn describe(&self) -> String {
        if let Some(error) = &self.error {
            return error.clone();
        }
        match self.output.as_ref().and_then(|o| o.get("change")).and_then(Value::as_str) {
            Some(change) => change.to_string(),
            None => "ok".to_string(),
        }
    }
}

#[async_trait]
pub trait ActionExecutor: Send + Sync {
    fn name(&self) -> &'static str;

    async fn execute(&self, action: &str, params: &Params) -> ActionOutcome;
}
