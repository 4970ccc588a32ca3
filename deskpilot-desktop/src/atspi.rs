//! AT-SPI accessibility provider.
//!
//! Talks to the accessibility bus through `gdbus` calls. The compositor's
//! focused window is located among the AT-SPI application windows by title,
//! then its subtree is fetched up front within a node budget so the
//! synchronous walk in [`crate::snapshot`] can run over it. When the bus is
//! unavailable or no window matches, the compositor provider's node is used
//! as is.

use crate::error::{DesktopError, DesktopResult};
use crate::hyprctl::{command_exists, run_output};
use crate::snapshot::{AccessibilityProvider, AccessibleNode, NodeProperties, WalkLimits};
use async_trait::async_trait;
use deskpilot_core::ToggleState;
use regex::Regex;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::debug;

pub const REGISTRY: &str = "org.a11y.atspi.Registry";
pub const ROOT_PATH: &str = "/org/a11y/atspi/accessible/root";

const CALL_TIMEOUT: Duration = Duration::from_secs(2);
const MAX_APPLICATIONS: usize = 48;

// AtspiStateType bit positions
const STATE_CHECKED: u32 = 4;
const STATE_ENABLED: u32 = 8;
const STATE_FOCUSED: u32 = 12;
const STATE_SENSITIVE: u32 = 24;
const STATE_SHOWING: u32 = 25;
const STATE_INDETERMINATE: u32 = 32;
const STATE_CHECKABLE: u32 = 41;

/// An accessible object on the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusRef {
    pub destination: String,
    pub path: String,
}

impl BusRef {
    pub fn new(destination: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            destination: destination.into(),
            path: path.into(),
        }
    }

    pub fn root() -> Self {
        Self::new(REGISTRY, ROOT_PATH)
    }
}

/// One method call on the accessibility bus, returning gdbus' text output.
#[async_trait]
pub trait BusCall: Send + Sync {
    async fn call(&self, target: &BusRef, method: &str, args: &[&str]) -> DesktopResult<String>;
}

/// `gdbus call` against the accessibility bus, whose address is asked from
/// the session bus once.
#[derive(Default)]
pub struct GdbusCall {
    address: OnceCell<String>,
}

impl GdbusCall {
    pub fn new() -> Self {
        Self::default()
    }

    async fn gdbus(args: &[&str]) -> DesktopResult<String> {
        let output = tokio::time::timeout(CALL_TIMEOUT, run_output("gdbus", args))
            .await
            .map_err(|_| DesktopError::OperationFailed(format!("gdbus timed out after {:?}", CALL_TIMEOUT)))??;
        Ok(String::from_utf8_lossy(&output).into_owned())
    }

    async fn address(&self) -> DesktopResult<&str> {
        let address = self
            .address
            .get_or_try_init(|| async {
                if !command_exists("gdbus").await {
                    return Err(DesktopError::Unavailable(
                        "AT-SPI needs 'gdbus' (install glib2)".to_string(),
                    ));
                }
                let raw = Self::gdbus(&[
                    "call",
                    "--session",
                    "--dest",
                    "org.a11y.Bus",
                    "--object-path",
                    "/org/a11y/bus",
                    "--method",
                    "org.a11y.Bus.GetAddress",
                ])
                .await?;
                parse_first_quoted(&raw)
                    .filter(|address| !address.is_empty())
                    .ok_or_else(|| DesktopError::Unavailable("accessibility bus has no address".to_string()))
            })
            .await?;
        Ok(address.as_str())
    }
}

#[async_trait]
impl BusCall for GdbusCall {
    async fn call(&self, target: &BusRef, method: &str, args: &[&str]) -> DesktopResult<String> {
        let address = self.address().await?;
        let mut argv = vec![
            "call",
            "--address",
            address,
            "--dest",
            target.destination.as_str(),
            "--object-path",
            target.path.as_str(),
            "--method",
            method,
        ];
        argv.extend_from_slice(args);
        Self::gdbus(&argv).await
    }
}

fn cached(cell: &'static OnceLock<Option<Regex>>, pattern: &str) -> Option<&'static Regex> {
    cell.get_or_init(|| Regex::new(pattern).ok()).as_ref()
}

fn ref_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    cached(&RE, r"\(\s*'([^']+)'\s*,\s*objectpath\s+'([^']+)'\s*\)")
}

fn quoted_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    cached(&RE, r"'([^']*)'")
}

fn integer_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    cached(&RE, r"-?\d+")
}

fn property_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    cached(&RE, r"'(\w+)':\s*<'([^']*)'>")
}

/// `([('dest', objectpath '/path'), ...],)`
pub fn parse_refs(raw: &str) -> Vec<BusRef> {
    let Some(re) = ref_re() else {
        return Vec::new();
    };
    re.captures_iter(raw)
        .filter_map(|c| Some(BusRef::new(c.get(1)?.as_str(), c.get(2)?.as_str())))
        .filter(|r| r.path != "/org/a11y/atspi/null")
        .collect()
}

pub fn parse_first_quoted(raw: &str) -> Option<String> {
    quoted_re()?
        .captures(raw)
        .and_then(|c| c.get(1).map(|m| m.as_str().to_string()))
}

fn integers(raw: &str) -> Vec<i64> {
    // type prefixes such as `uint32` carry digits of their own
    let cleaned = raw.replace("uint32", "").replace("int32", "");
    match integer_re() {
        Some(re) => re
            .find_iter(&cleaned)
            .filter_map(|m| m.as_str().parse::<i64>().ok())
            .collect(),
        None => Vec::new(),
    }
}

/// `((x, y, width, height),)`
pub fn parse_extents(raw: &str) -> Option<[i32; 4]> {
    let values = integers(raw);
    if values.len() < 4 {
        return None;
    }
    let mut rect = [0i32; 4];
    for (slot, value) in rect.iter_mut().zip(values) {
        *slot = i32::try_from(value).ok()?;
    }
    (rect[2] > 0 && rect[3] > 0).then_some(rect)
}

/// The two 32-bit words of an AT-SPI state set, as one 64-bit mask.
pub fn parse_states(raw: &str) -> u64 {
    let words = integers(raw);
    let low = words.first().copied().unwrap_or(0) as u64 & 0xFFFF_FFFF;
    let high = words.get(1).copied().unwrap_or(0) as u64 & 0xFFFF_FFFF;
    low | (high << 32)
}

/// String properties out of a `Properties.GetAll` reply.
pub fn parse_string_properties(raw: &str) -> Vec<(String, String)> {
    let Some(re) = property_re() else {
        return Vec::new();
    };
    re.captures_iter(raw)
        .filter_map(|c| Some((c.get(1)?.as_str().to_string(), c.get(2)?.as_str().to_string())))
        .collect()
}

fn has_state(states: u64, bit: u32) -> bool {
    states & (1u64 << bit) != 0
}

/// AT-SPI role names onto the control type vocabulary used in snapshots.
pub fn control_type(role: &str) -> String {
    let mapped = match role {
        "frame" | "window" | "dialog" | "alert" => "Window",
        "push button" | "button" | "toggle button" => "Button",
        "check box" => "CheckBox",
        "radio button" => "RadioButton",
        "text" | "entry" | "password text" => "Edit",
        "document web" | "document text" | "document frame" => "Document",
        "label" | "static" => "Text",
        "link" => "Hyperlink",
        "menu item" | "check menu item" | "radio menu item" => "MenuItem",
        "menu" => "Menu",
        "menu bar" => "MenuBar",
        "list" | "list box" => "List",
        "list item" => "ListItem",
        "page tab" => "TabItem",
        "page tab list" => "Tab",
        "combo box" => "ComboBox",
        "tool bar" => "ToolBar",
        "panel" | "filler" | "section" | "grouping" => "Pane",
        "table" => "Table",
        "table cell" => "DataItem",
        "tree" => "Tree",
        "tree item" => "TreeItem",
        "scroll bar" => "ScrollBar",
        "slider" => "Slider",
        "image" | "icon" => "Image",
        "heading" => "Header",
        _ => "",
    };
    if mapped.is_empty() {
        role.to_string()
    } else {
        mapped.to_string()
    }
}

fn invokable(role: &str) -> bool {
    matches!(
        role,
        "push button"
            | "button"
            | "toggle button"
            | "check box"
            | "radio button"
            | "link"
            | "menu item"
            | "check menu item"
            | "radio menu item"
            | "page tab"
    )
}

fn toggle_state(role: &str, states: u64) -> Option<ToggleState> {
    let toggles = has_state(states, STATE_CHECKABLE)
        || matches!(role, "check box" | "toggle button" | "radio button" | "check menu item");
    if !toggles {
        return None;
    }
    Some(if has_state(states, STATE_INDETERMINATE) {
        ToggleState::Indeterminate
    } else if has_state(states, STATE_CHECKED) {
        ToggleState::On
    } else {
        ToggleState::Off
    })
}

/// A subtree read from the bus ahead of the walk.
#[derive(Debug, Clone, Default)]
pub struct FetchedNode {
    pub props: NodeProperties,
    pub focused: bool,
    pub children: Vec<FetchedNode>,
    /// Reading the children failed; the walk reports the snapshot as partial.
    pub broken: bool,
}

impl FetchedNode {
    fn find_focused(&self) -> Option<&FetchedNode> {
        if self.focused {
            return Some(self);
        }
        self.children.iter().find_map(|child| child.find_focused())
    }
}

impl AccessibleNode for FetchedNode {
    fn properties(&self) -> NodeProperties {
        self.props.clone()
    }

    fn children(&self) -> DesktopResult<Vec<Box<dyn AccessibleNode>>> {
        if self.broken {
            return Err(DesktopError::OperationFailed("children unavailable on the bus".to_string()));
        }
        Ok(self
            .children
            .iter()
            .cloned()
            .map(|child| Box::new(child) as Box<dyn AccessibleNode>)
            .collect())
    }
}

type Fetch<'a> = Pin<Box<dyn Future<Output = FetchedNode> + Send + 'a>>;

/// AT-SPI first, compositor geometry when the bus has nothing for the
/// focused window.
pub struct AtspiProvider {
    bus: Arc<dyn BusCall>,
    compositor: Box<dyn AccessibilityProvider>,
    limits: WalkLimits,
    max_nodes: usize,
    /// Focus found during the last window fetch.
    focused: parking_lot::Mutex<Option<FetchedNode>>,
}

impl AtspiProvider {
    pub fn new(
        bus: Arc<dyn BusCall>,
        compositor: Box<dyn AccessibilityProvider>,
        limits: WalkLimits,
        max_nodes: usize,
    ) -> Self {
        Self {
            bus,
            compositor,
            limits,
            max_nodes: max_nodes.max(1),
            focused: parking_lot::Mutex::new(None),
        }
    }

    async fn children_of(&self, node: &BusRef) -> DesktopResult<Vec<BusRef>> {
        let raw = self
            .bus
            .call(node, "org.a11y.atspi.Accessible.GetChildren", &[])
            .await?;
        Ok(parse_refs(&raw))
    }

    async fn name_of(&self, node: &BusRef) -> Option<String> {
        let raw = self
            .bus
            .call(node, "org.a11y.atspi.Accessible.GetName", &[])
            .await
            .ok()?;
        parse_first_quoted(&raw).map(|name| name.trim().to_string())
    }

    /// The application window whose name matches `title`; an exact match
    /// wins over a containing one.
    pub async fn find_window(&self, title: &str) -> DesktopResult<Option<BusRef>> {
        let title = title.trim();
        if title.is_empty() {
            return Ok(None);
        }
        let mut partial: Option<BusRef> = None;
        for app in self.children_of(&BusRef::root()).await?.into_iter().take(MAX_APPLICATIONS) {
            let Ok(windows) = self.children_of(&app).await else {
                continue;
            };
            for window in windows {
                let Some(name) = self.name_of(&window).await else {
                    continue;
                };
                if name == title {
                    return Ok(Some(window));
                }
                if partial.is_none() && !name.is_empty() && (title.contains(&name) || name.contains(title)) {
                    partial = Some(window);
                }
            }
        }
        Ok(partial)
    }

    async fn read_properties(&self, node: &BusRef) -> (NodeProperties, bool) {
        let mut props = NodeProperties {
            automation_id: node.path.clone(),
            enabled: true,
            ..Default::default()
        };
        if let Ok(raw) = self
            .bus
            .call(
                node,
                "org.freedesktop.DBus.Properties.GetAll",
                &["org.a11y.atspi.Accessible"],
            )
            .await
        {
            for (key, value) in parse_string_properties(&raw) {
                match key.as_str() {
                    "Name" => props.name = value.trim().to_string(),
                    "AccessibleId" if !value.is_empty() => props.automation_id = value,
                    _ => {}
                }
            }
        }
        let role = match self.bus.call(node, "org.a11y.atspi.Accessible.GetRoleName", &[]).await {
            Ok(raw) => parse_first_quoted(&raw).unwrap_or_default(),
            Err(_) => String::new(),
        };
        if let Ok(raw) = self.bus.call(node, "org.a11y.atspi.Component.GetExtents", &["0"]).await {
            props.bounding_rect = parse_extents(&raw);
        }
        let mut focused = false;
        if let Ok(raw) = self.bus.call(node, "org.a11y.atspi.Accessible.GetState", &[]).await {
            let states = parse_states(&raw);
            props.enabled = has_state(states, STATE_ENABLED) || has_state(states, STATE_SENSITIVE);
            props.offscreen = !has_state(states, STATE_SHOWING);
            props.toggle_state = toggle_state(&role, states);
            focused = has_state(states, STATE_FOCUSED);
        }
        props.invokable = invokable(&role);
        props.control_type = control_type(&role);
        props.class_name = role;
        (props, focused)
    }

    /// Depth-first read bounded by the walk limits and the node budget.
    fn fetch<'a>(&'a self, node: BusRef, depth: usize, budget: &'a mut usize) -> Fetch<'a> {
        Box::pin(async move {
            *budget = budget.saturating_sub(1);
            let (props, focused) = self.read_properties(&node).await;
            let mut fetched = FetchedNode {
                props,
                focused,
                ..Default::default()
            };
            if depth >= self.limits.max_depth || *budget == 0 {
                return fetched;
            }
            match self.children_of(&node).await {
                Ok(children) => {
                    for child in children.into_iter().take(self.limits.max_children) {
                        if *budget == 0 {
                            break;
                        }
                        let child = self.fetch(child, depth + 1, budget).await;
                        fetched.children.push(child);
                    }
                }
                Err(e) => {
                    debug!("AT-SPI children of {} unavailable: {}", node.path, e);
                    fetched.broken = true;
                }
            }
            fetched
        })
    }

    pub async fn fetch_window(&self, window: BusRef) -> FetchedNode {
        let mut budget = self.max_nodes;
        self.fetch(window, 0, &mut budget).await
    }
}

#[async_trait]
impl AccessibilityProvider for AtspiProvider {
    async fn focused_window(&self) -> DesktopResult<Option<Box<dyn AccessibleNode>>> {
        let Some(window) = self.compositor.focused_window().await? else {
            *self.focused.lock() = None;
            return Ok(None);
        };
        let title = window.properties().name;
        let target = match self.find_window(&title).await {
            Ok(Some(target)) => target,
            Ok(None) => {
                debug!("No AT-SPI window named {:?}; using compositor geometry", title);
                *self.focused.lock() = None;
                return Ok(Some(window));
            }
            Err(e) => {
                debug!("AT-SPI unavailable ({}); using compositor geometry", e);
                *self.focused.lock() = None;
                return Ok(Some(window));
            }
        };
        let fetched = self.fetch_window(target).await;
        *self.focused.lock() = fetched.find_focused().cloned();
        Ok(Some(Box::new(fetched)))
    }

    /// The focused element seen by the most recent window fetch.
    async fn focused_element(&self) -> DesktopResult<Option<Box<dyn AccessibleNode>>> {
        Ok(self
            .focused
            .lock()
            .clone()
            .map(|node| Box::new(node) as Box<dyn AccessibleNode>))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::snapshot::{walk, Snapshotter};
    use std::collections::HashMap;

    /// Canned gdbus replies keyed by object path and method.
    #[derive(Default)]
    struct FakeBus {
        replies: HashMap<(String, String), String>,
    }

    impl FakeBus {
        fn reply(mut self, path: &str, method: &str, raw: &str) -> Self {
            self.replies.insert((path.to_string(), method.to_string()), raw.to_string());
            self
        }

        fn element(self, path: &str, name: &str, role: &str, states: u32, children: &[&str]) -> Self {
            let refs: Vec<String> = children
                .iter()
                .map(|c| format!("(':1.42', objectpath '{}')", c))
                .collect();
            self.reply(
                path,
                "org.freedesktop.DBus.Properties.GetAll",
                &format!("({{'Name': <'{}'>, 'Description': <''>, 'AccessibleId': <''>}},)", name),
            )
            .reply(path, "org.a11y.atspi.Accessible.GetName", &format!("('{}',)", name))
            .reply(path, "org.a11y.atspi.Accessible.GetRoleName", &format!("('{}',)", role))
            .reply(path, "org.a11y.atspi.Component.GetExtents", "((100, 200, 80, 20),)")
            .reply(
                path,
                "org.a11y.atspi.Accessible.GetState",
                &format!("([uint32 {}, uint32 0],)", states),
            )
            .reply(
                path,
                "org.a11y.atspi.Accessible.GetChildren",
                &format!("([{}],)", refs.join(", ")),
            )
        }
    }

    #[async_trait]
    impl BusCall for FakeBus {
        async fn call(&self, target: &BusRef, method: &str, _args: &[&str]) -> DesktopResult<String> {
            self.replies
                .get(&(target.path.clone(), method.to_string()))
                .cloned()
                .ok_or_else(|| DesktopError::NotFound(format!("{} on {}", method, target.path)))
        }
    }

    struct Unreachable;

    #[async_trait]
    impl BusCall for Unreachable {
        async fn call(&self, _target: &BusRef, _method: &str, _args: &[&str]) -> DesktopResult<String> {
            Err(DesktopError::Unavailable("no accessibility bus".into()))
        }
    }

    struct CompositorWindow(&'static str);

    #[async_trait]
    impl AccessibilityProvider for CompositorWindow {
        async fn focused_window(&self) -> DesktopResult<Option<Box<dyn AccessibleNode>>> {
            Ok(Some(Box::new(FetchedNode {
                props: NodeProperties {
                    name: self.0.to_string(),
                    control_type: "Window".to_string(),
                    ..Default::default()
                },
                ..Default::default()
            })))
        }
    }

    const VISIBLE: u32 = (1 << STATE_ENABLED) | (1 << STATE_SHOWING);

    fn mail_bus() -> FakeBus {
        FakeBus::default()
            .reply(ROOT_PATH, "org.a11y.atspi.Accessible.GetChildren", "([(':1.42', objectpath '/app/term'), (':1.42', objectpath '/app/mail')],)")
            .element("/app/term", "foot", "application", 0, &["/term/win"])
            .element("/term/win", "~/src", "frame", VISIBLE, &[])
            .element("/app/mail", "Thunderbird", "application", 0, &["/mail/win"])
            .element("/mail/win", "Inbox - Thunderbird", "frame", VISIBLE, &["/mail/send", "/mail/bold"])
            .element("/mail/send", "Send", "push button", VISIBLE | (1 << STATE_FOCUSED), &[])
            .element("/mail/bold", "Bold", "toggle button", VISIBLE | (1 << STATE_CHECKED), &[])
    }

    #[test]
    fn test_parse_refs_skips_null_objects() {
        let raw = "([('org.a11y.atspi.Registry', objectpath '/org/a11y/atspi/accessible/3'), (':1.9', objectpath '/org/a11y/atspi/null')],)";
        assert_eq!(
            parse_refs(raw),
            vec![BusRef::new("org.a11y.atspi.Registry", "/org/a11y/atspi/accessible/3")]
        );
    }

    #[test]
    fn test_parsers() {
        assert_eq!(parse_first_quoted("('Send',)").as_deref(), Some("Send"));
        assert_eq!(parse_extents("((10, -5, 300, 40),)"), Some([10, -5, 300, 40]));
        assert_eq!(parse_extents("((0, 0, 0, 0),)"), None);
        let states = parse_states("([uint32 33554688, uint32 512],)");
        assert!(has_state(states, STATE_ENABLED));
        assert!(has_state(states, STATE_SHOWING));
        assert!(has_state(states, STATE_CHECKABLE));
        assert!(!has_state(states, STATE_CHECKED));
        assert_eq!(
            parse_string_properties("({'Name': <'Inbox'>, 'ChildCount': <3>, 'AccessibleId': <'msg-list'>},)"),
            vec![
                ("Name".to_string(), "Inbox".to_string()),
                ("AccessibleId".to_string(), "msg-list".to_string())
            ]
        );
        assert_eq!(control_type("push button"), "Button");
        assert_eq!(control_type("spin button"), "spin button");
    }

    #[tokio::test]
    async fn test_focused_window_is_read_from_the_bus() {
        let provider = AtspiProvider::new(
            Arc::new(mail_bus()),
            Box::new(CompositorWindow("Inbox - Thunderbird")),
            WalkLimits::default(),
            50,
        );
        let node = provider.focused_window().await.unwrap().unwrap();
        let (window, partial) = walk(node.as_ref(), &WalkLimits::default());
        assert!(!partial);
        assert_eq!(window.name, "Inbox - Thunderbird");
        assert_eq!(window.control_type, "Window");
        assert_eq!(window.children.len(), 2);

        let send = &window.children[0];
        assert_eq!(send.control_type, "Button");
        assert_eq!(send.automation_id, "/mail/send");
        assert_eq!(send.bounding_rect, Some([100, 200, 80, 20]));
        assert!(send.enabled && !send.offscreen);
        let bold = &window.children[1];
        assert_eq!(bold.toggle_state, Some(ToggleState::On));

        let focused = provider.focused_element().await.unwrap().unwrap();
        assert_eq!(focused.properties().name, "Send");
    }

    #[tokio::test]
    async fn test_snapshot_through_atspi_names_focus() {
        let provider = AtspiProvider::new(
            Arc::new(mail_bus()),
            Box::new(CompositorWindow("Inbox - Thunderbird")),
            WalkLimits::default(),
            50,
        );
        let mut snapshotter = Snapshotter::new(Box::new(provider), WalkLimits::default(), Duration::ZERO);
        // the focus is learned from the window fetch, so it shows up from the second snapshot on
        snapshotter.snapshot().await.unwrap();
        let snapshot = snapshotter.snapshot().await.unwrap();
        assert_eq!(snapshot.focused_name, "Send");
        assert!(snapshot.find_element(&|e| e.name == "Bold").is_some());
    }

    #[tokio::test]
    async fn test_node_budget_bounds_bus_traffic() {
        let provider = AtspiProvider::new(
            Arc::new(mail_bus()),
            Box::new(CompositorWindow("Inbox - Thunderbird")),
            WalkLimits::default(),
            2,
        );
        let window = provider.fetch_window(BusRef::new(":1.42", "/mail/win")).await;
        assert_eq!(window.children.len(), 1);
        assert_eq!(window.children[0].props.name, "Send");
    }

    #[tokio::test]
    async fn test_partial_title_match() {
        let provider = AtspiProvider::new(
            Arc::new(mail_bus()),
            Box::new(CompositorWindow("unused")),
            WalkLimits::default(),
            50,
        );
        let found = provider.find_window("Inbox - Thunderbird - Mozilla").await.unwrap();
        assert_eq!(found, Some(BusRef::new(":1.42", "/mail/win")));
        assert_eq!(provider.find_window("Spreadsheet").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_falls_back_to_compositor_without_bus() {
        let provider = AtspiProvider::new(
            Arc::new(Unreachable),
            Box::new(CompositorWindow("Terminal")),
            WalkLimits::default(),
            50,
        );
        let node = provider.focused_window().await.unwrap().unwrap();
        assert_eq!(node.properties().name, "Terminal");
        assert!(provider.focused_element().await.unwrap().is_none());
    }
}
