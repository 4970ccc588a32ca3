use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// Action parameters as carried on the wire.
pub type Params = Map<String, Value>;

/// Default per-command timeout used when a command does not carry one.
pub const DEFAULT_COMMAND_TIMEOUT_MS: u64 = 5000;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum DesktopEventKind {
    Foreground,
    Idle,
    Active,
}

impl DesktopEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DesktopEventKind::Foreground => "foreground",
            DesktopEventKind::Idle => "idle",
            DesktopEventKind::Active => "active",
        }
    }
}

/// One observed desktop transition. Never mutated after emission.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DesktopEvent {
    pub kind: DesktopEventKind,
    #[serde(default)]
    pub window_title: String,
    #[serde(default)]
    pub process_path: String,
    #[serde(default)]
    pub process_id: u32,
    pub timestamp: DateTime<Utc>,
    /// Milliseconds since the emitting monitor started.
    #[serde(default)]
    pub monotonic_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idle_duration_ms: Option<u64>,
}

impl DesktopEvent {
    pub fn foreground(
        window_title: impl Into<String>,
        process_path: impl Into<String>,
        process_id: u32,
        monotonic_ms: u64,
    ) -> Self {
        Self {
            kind: DesktopEventKind::Foreground,
            window_title: window_title.into(),
            process_path: process_path.into(),
            process_id,
            timestamp: Utc::now(),
            monotonic_ms,
            idle_duration_ms: None,
        }
    }

    /// Idle/active edge event. Carries no window context.
    pub fn activity(idle: bool, idle_duration_ms: u64, monotonic_ms: u64) -> Self {
        Self {
            kind: if idle {
                DesktopEventKind::Idle
            } else {
                DesktopEventKind::Active
            },
            window_title: String::new(),
            process_path: String::new(),
            process_id: 0,
            timestamp: Utc::now(),
            monotonic_ms,
            idle_duration_ms: Some(idle_duration_ms),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum UiaPattern {
    Value,
    Toggle,
    Invoke,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ToggleState {
    Off,
    On,
    Indeterminate,
}

/// A node of the accessibility tree, rebuilt wholesale on each snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct UiaElement {
    #[serde(default)]
    pub automation_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub control_type: String,
    #[serde(default)]
    pub class_name: String,
    /// `[x, y, width, height]`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bounding_rect: Option<[i32; 4]>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub offscreen: bool,
    #[serde(default)]
    pub patterns: Vec<UiaPattern>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub toggle_state: Option<ToggleState>,
    #[serde(default)]
    pub children: Vec<UiaElement>,
}

fn default_true() -> bool {
    true
}

impl UiaElement {
    /// Depth-first search by name or automation id.
    pub fn find(&self, predicate: &dyn Fn(&UiaElement) -> bool) -> Option<&UiaElement> {
        if predicate(self) {
            return Some(self);
        }
        self.children.iter().find_map(|child| child.find(predicate))
    }

    pub fn center(&self) -> Option<(i32, i32)> {
        self.bounding_rect
            .map(|[x, y, w, h]| (x + w / 2, y + h / 2))
    }

    pub fn node_count(&self) -> usize {
        1 + self.children.iter().map(UiaElement::node_count).sum::<usize>()
    }
}

/// Structured accessibility snapshot of the focused window.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct UiaSnapshot {
    #[serde(default)]
    pub focused_name: String,
    #[serde(default)]
    pub control_type: String,
    #[serde(default)]
    pub document_text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub focused_element: Option<UiaElement>,
    #[serde(default)]
    pub window_tree: Vec<UiaElement>,
    /// Set when the walk failed partway and the tree is incomplete.
    #[serde(default)]
    pub partial: bool,
}

impl UiaSnapshot {
    pub fn is_empty(&self) -> bool {
        self.focused_name.is_empty()
            && self.control_type.is_empty()
            && self.document_text.is_empty()
            && self.focused_element.is_none()
            && self.window_tree.is_empty()
    }

    pub fn find_element(&self, predicate: &dyn Fn(&UiaElement) -> bool) -> Option<&UiaElement> {
        self.window_tree
            .iter()
            .chain(self.focused_element.iter())
            .find_map(|root| root.find(predicate))
    }
}

/// Opaque handle to a frame held in the capture ring.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CaptureRef {
    pub frame_id: u64,
    pub width: u32,
    pub height: u32,
    pub format: String,
    pub captured_at: DateTime<Utc>,
}

/// The latest merged view of the desktop.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DesktopContext {
    #[serde(default)]
    pub version: u64,
    #[serde(default)]
    pub window_title: String,
    #[serde(default)]
    pub process_path: String,
    #[serde(default)]
    pub process_id: u32,
    #[serde(default)]
    pub uia_summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uia: Option<UiaSnapshot>,
    #[serde(default)]
    pub screenshot_available: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screenshot: Option<CaptureRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screenshot_b64: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_event: Option<DesktopEvent>,
    pub updated_at: DateTime<Utc>,
}

impl Default for DesktopContext {
    fn default() -> Self {
        Self {
            version: 0,
            window_title: String::new(),
            process_path: String::new(),
            process_id: 0,
            uia_summary: String::new(),
            uia: None,
            screenshot_available: false,
            screenshot: None,
            screenshot_b64: None,
            last_event: None,
            updated_at: Utc::now(),
        }
    }
}

impl DesktopContext {
    /// Render the context as planner input text.
    pub fn to_prompt(&self) -> String {
        let mut parts = vec![format!("Window: {}", self.window_title)];
        if !self.process_path.is_empty() {
            parts.push(format!("Process: {}", self.process_path));
        }
        if !self.uia_summary.is_empty() {
            parts.push(format!("UI Elements:\n{}", self.uia_summary));
        }
        if self.screenshot_available {
            parts.push("[Screenshot available]".to_string());
        }
        parts.join("\n")
    }
}

/// Fixed catalog of desktop actions the native side understands.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DesktopAction {
    Observe,
    Click,
    DoubleClick,
    RightClick,
    TypeText,
    SendKeys,
    OpenApplication,
    FocusWindow,
    Scroll,
}

impl DesktopAction {
    pub const ALL: [DesktopAction; 9] = [
        DesktopAction::Observe,
        DesktopAction::Click,
        DesktopAction::DoubleClick,
        DesktopAction::RightClick,
        DesktopAction::TypeText,
        DesktopAction::SendKeys,
        DesktopAction::OpenApplication,
        DesktopAction::FocusWindow,
        DesktopAction::Scroll,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DesktopAction::Observe => "observe",
            DesktopAction::Click => "click",
            DesktopAction::DoubleClick => "double_click",
            DesktopAction::RightClick => "right_click",
            DesktopAction::TypeText => "type_text",
            DesktopAction::SendKeys => "send_keys",
            DesktopAction::OpenApplication => "open_application",
            DesktopAction::FocusWindow => "focus_window",
            DesktopAction::Scroll => "scroll",
        }
    }
}

impl fmt::Display for DesktopAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DesktopAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DesktopAction::ALL
            .iter()
            .copied()
            .find(|action| action.as_str() == s)
            .ok_or_else(|| format!("unknown action: {}", s))
    }
}

/// Outbound action request. The id is assigned by the bridge on dispatch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BridgeCommand {
    #[serde(default)]
    pub id: u64,
    pub action: DesktopAction,
    #[serde(default)]
    pub params: Params,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_timeout_ms() -> u64 {
    DEFAULT_COMMAND_TIMEOUT_MS
}

impl BridgeCommand {
    pub fn new(action: DesktopAction, params: Params) -> Self {
        Self {
            id: 0,
            action,
            params,
            timeout_ms: DEFAULT_COMMAND_TIMEOUT_MS,
        }
    }

    pub fn str_param(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(Value::as_str)
    }

    pub fn i64_param(&self, key: &str) -> Option<i64> {
        self.params.get(key).and_then(Value::as_i64)
    }
}

/// Channel-level reason a command got no answer from the desktop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ChannelFailure {
    #[error("bridge not connected")]
    NotConnected,
    #[error("connection lost")]
    ConnectionLost,
}

/// Correlated answer to a [`BridgeCommand`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BridgeResult {
    pub id: u64,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Set by the hub when the command never reached or never came back
    /// from the desktop. Not part of the wire format.
    #[serde(skip)]
    pub channel: Option<ChannelFailure>,
}

impl BridgeResult {
    pub fn success(id: u64, output: Value) -> Self {
        Self {
            id,
            ok: true,
            output: Some(output),
            error: None,
            channel: None,
        }
    }

    pub fn failure(id: u64, error: impl Into<String>) -> Self {
        Self {
            id,
            ok: false,
            output: None,
            error: Some(error.into()),
            channel: None,
        }
    }

    pub fn channel_failure(id: u64, failure: ChannelFailure) -> Self {
        Self {
            channel: Some(failure),
            ..Self::failure(id, failure.to_string())
        }
    }

    pub fn is_disconnect(&self) -> bool {
        self.channel.is_some()
    }
}

/// Executor backend selection.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExecutorMode {
    Simulator,
    Bridge,
    Browser,
    #[default]
    Auto,
}

impl ExecutorMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutorMode::Simulator => "simulator",
            ExecutorMode::Bridge => "bridge",
            ExecutorMode::Browser => "browser",
            ExecutorMode::Auto => "auto",
        }
    }
}

impl FromStr for ExecutorMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "simulator" | "simulated" => Ok(ExecutorMode::Simulator),
            "bridge" => Ok(ExecutorMode::Bridge),
            "browser" => Ok(ExecutorMode::Browser),
            "auto" => Ok(ExecutorMode::Auto),
            other => Err(format!(
                "invalid executor mode: {} (expected simulator, bridge, browser or auto)",
                other
            )),
        }
    }
}
