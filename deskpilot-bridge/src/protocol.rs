//! Wire format shared by the hub and the desktop client.

use deskpilot_core::{BridgeCommand, BridgeResult, DesktopContext, DesktopEvent};
use serde::{Deserialize, Serialize};

/// One frame on the bridge. Serialized as a JSON object with a `type` tag.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireMessage {
    Context {
        context: DesktopContext,
        /// Set when this context was produced by a fresh desktop event.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        event: Option<DesktopEvent>,
    },
    Command(BridgeCommand),
    Result(BridgeResult),
    Ping,
    Pong,
}

impl WireMessage {
    pub fn decode(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            WireMessage::Context { .. } => "context",
            WireMessage::Command(_) => "command",
            WireMessage::Result(_) => "result",
            WireMessage::Ping => "ping",
            WireMessage::Pong => "pong",
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use deskpilot_core::DesktopAction;
    use serde_json::{json, Value};

    #[test]
    fn test_ping_pong_shape() {
        assert_eq!(WireMessage::Ping.encode().unwrap(), r#"{"type":"ping"}"#);
        assert_eq!(
            WireMessage::decode(r#"{"type":"pong"}"#).unwrap(),
            WireMessage::Pong
        );
    }

    #[test]
    fn test_command_frame_is_flat() {
        let mut params = serde_json::Map::new();
        params.insert("text".into(), json!("hello"));
        let mut command = BridgeCommand::new(DesktopAction::TypeText, params);
        command.id = 7;
        let value: Value =
            serde_json::from_str(&WireMessage::Command(command).encode().unwrap()).unwrap();
        assert_eq!(value["type"], "command");
        assert_eq!(value["id"], 7);
        assert_eq!(value["action"], "type_text");
        assert_eq!(value["params"]["text"], "hello");
    }

    #[test]
    fn test_result_frame_decodes() {
        let msg = WireMessage::decode(
            r#"{"type":"result","id":12,"ok":false,"error":"unknown action: fly"}"#,
        )
        .unwrap();
        match msg {
            WireMessage::Result(result) => {
                assert_eq!(result.id, 12);
                assert!(!result.ok);
                assert_eq!(result.error.as_deref(), Some("unknown action: fly"));
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_type_rejected() {
        assert!(WireMessage::decode(r#"{"type":"telemetry"}"#).is_err());
    }
}
