//! Accessibility snapshots of the focused window.
//!
//! The walk is read-only and bounded by depth and by a per-node child cap.
//! Providers plug in through [`AccessibilityProvider`]: AT-SPI in
//! [`crate::atspi`], and a shallow one built from compositor window geometry
//! that also serves as its fallback.

use crate::error::{DesktopError, DesktopResult};
use crate::hyprctl::{self, HyprWindow};
use async_trait::async_trait;
use deskpilot_core::{collapse_whitespace, truncate_chars, ToggleState, UiaElement, UiaPattern, UiaSnapshot};
use std::time::{Duration, Instant};
use tracing::debug;

/// Properties read from one accessible node.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeProperties {
    pub automation_id: String,
    pub name: String,
    pub control_type: String,
    pub class_name: String,
    pub bounding_rect: Option<[i32; 4]>,
    pub enabled: bool,
    pub offscreen: bool,
    pub value: Option<String>,
    pub toggle_state: Option<ToggleState>,
    pub invokable: bool,
}

pub trait AccessibleNode: Send {
    fn properties(&self) -> NodeProperties;

    fn children(&self) -> DesktopResult<Vec<Box<dyn AccessibleNode>>>;
}

#[async_trait]
pub trait AccessibilityProvider: Send + Sync {
    async fn focused_window(&self) -> DesktopResult<Option<Box<dyn AccessibleNode>>>;

    async fn focused_element(&self) -> DesktopResult<Option<Box<dyn AccessibleNode>>> {
        Ok(None)
    }

    async fn document_text(&self) -> DesktopResult<Option<String>> {
        Ok(None)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct WalkLimits {
    pub max_depth: usize,
    pub max_children: usize,
    pub text_max_chars: usize,
}

impl Default for WalkLimits {
    fn default() -> Self {
        Self {
            max_depth: 3,
            max_children: 20,
            text_max_chars: 240,
        }
    }
}

/// Rejects snapshots requested sooner than `interval` after the last one.
#[derive(Debug)]
pub struct SnapshotThrottle {
    interval: Duration,
    last: Option<Instant>,
}

impl SnapshotThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
        }
    }

    /// Time left before the next snapshot is allowed.
    pub fn remaining(&self) -> Option<Duration> {
        let last = self.last?;
        self.interval
            .checked_sub(last.elapsed())
            .filter(|left| !left.is_zero())
    }

    pub fn try_acquire(&mut self) -> bool {
        let now = Instant::now();
        match self.last {
            Some(last) if now.duration_since(last) < self.interval => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }
}

fn to_element(props: NodeProperties, limits: &WalkLimits) -> UiaElement {
    let mut patterns = Vec::new();
    if props.value.is_some() {
        patterns.push(UiaPattern::Value);
    }
    if props.toggle_state.is_some() {
        patterns.push(UiaPattern::Toggle);
    }
    if props.invokable {
        patterns.push(UiaPattern::Invoke);
    }
    UiaElement {
        automation_id: props.automation_id,
        name: truncate_chars(&props.name, limits.text_max_chars),
        control_type: props.control_type,
        class_name: props.class_name,
        bounding_rect: props.bounding_rect,
        enabled: props.enabled,
        offscreen: props.offscreen,
        patterns,
        value: props.value.map(|v| truncate_chars(&v, limits.text_max_chars)),
        toggle_state: props.toggle_state,
        children: Vec::new(),
    }
}

/// Walk `node` down to `max_depth`. Returns the element and whether any part
/// of the walk failed.
pub fn walk(node: &dyn AccessibleNode, limits: &WalkLimits) -> (UiaElement, bool) {
    walk_at(node, limits, 0)
}

fn walk_at(node: &dyn AccessibleNode, limits: &WalkLimits, depth: usize) -> (UiaElement, bool) {
    let mut element = to_element(node.properties(), limits);
    if depth >= limits.max_depth {
        return (element, false);
    }
    let children = match node.children() {
        Ok(children) => children,
        Err(e) => {
            debug!("Accessibility walk stopped at depth {}: {}", depth, e);
            return (element, true);
        }
    };
    let mut partial = false;
    for child in children.iter().take(limits.max_children) {
        let (child_element, child_partial) = walk_at(child.as_ref(), limits, depth + 1);
        partial |= child_partial;
        element.children.push(child_element);
    }
    (element, partial)
}

pub struct Snapshotter {
    provider: Box<dyn AccessibilityProvider>,
    limits: WalkLimits,
    throttle: SnapshotThrottle,
}

impl Snapshotter {
    pub fn new(provider: Box<dyn AccessibilityProvider>, limits: WalkLimits, interval: Duration) -> Self {
        Self {
            provider,
            limits,
            throttle: SnapshotThrottle::new(interval),
        }
    }

    pub fn throttled_for(&self) -> Option<Duration> {
        self.throttle.remaining()
    }

    /// `None` when throttled or when there is nothing to report.
    pub async fn snapshot(&mut self) -> Option<UiaSnapshot> {
        if !self.throttle.try_acquire() {
            return None;
        }
        self.capture().await
    }

    async fn capture(&self) -> Option<UiaSnapshot> {
        let mut snapshot = UiaSnapshot::default();

        match self.provider.focused_element().await {
            Ok(Some(node)) => {
                let (element, partial) = walk(node.as_ref(), &self.limits);
                snapshot.focused_name = element.name.clone();
                snapshot.control_type = element.control_type.clone();
                snapshot.partial |= partial;
                snapshot.focused_element = Some(element);
            }
            Ok(None) => {}
            Err(e) => {
                debug!("Focused element unavailable: {}", e);
                snapshot.partial = true;
            }
        }

        match self.provider.focused_window().await {
            Ok(Some(node)) => {
                let (element, partial) = walk(node.as_ref(), &self.limits);
                if snapshot.focused_name.is_empty() {
                    snapshot.focused_name = element.name.clone();
                    snapshot.control_type = element.control_type.clone();
                }
                snapshot.partial |= partial;
                snapshot.window_tree.push(element);
            }
            Ok(None) => {}
            Err(e) => {
                debug!("Focused window unavailable: {}", e);
                snapshot.partial = true;
            }
        }

        if let Ok(Some(text)) = self.provider.document_text().await {
            snapshot.document_text = truncate_chars(&collapse_whitespace(&text), self.limits.text_max_chars);
        }

        if snapshot.is_empty() {
            None
        } else {
            Some(snapshot)
        }
    }
}

/// A compositor window as an accessible node. Other visible windows on the
/// same monitor are listed as its children.
struct WindowNode {
    window: HyprWindow,
    siblings: Vec<HyprWindow>,
}

impl AccessibleNode for WindowNode {
    fn properties(&self) -> NodeProperties {
        NodeProperties {
            automation_id: self.window.address.clone(),
            name: self.window.title.clone(),
            control_type: "Window".to_string(),
            class_name: self.window.class.clone(),
            bounding_rect: Some(self.window.bounding_rect()),
            enabled: true,
            offscreen: self.window.hidden,
            value: None,
            toggle_state: None,
            invokable: false,
        }
    }

    fn children(&self) -> DesktopResult<Vec<Box<dyn AccessibleNode>>> {
        Ok(self
            .siblings
            .iter()
            .map(|w| {
                Box::new(WindowNode {
                    window: w.clone(),
                    siblings: Vec::new(),
                }) as Box<dyn AccessibleNode>
            })
            .collect())
    }
}

/// Shallow provider built from `hyprctl` window geometry.
pub struct HyprlandWindowProvider;

#[async_trait]
impl AccessibilityProvider for HyprlandWindowProvider {
    async fn focused_window(&self) -> DesktopResult<Option<Box<dyn AccessibleNode>>> {
        let Some(window) = hyprctl::active_window().await? else {
            return Ok(None);
        };
        let siblings = match hyprctl::clients().await {
            Ok(clients) => clients
                .into_iter()
                .filter(|c| c.monitor == window.monitor && c.address != window.address && !c.hidden)
                .collect(),
            Err(DesktopError::Io(e)) => return Err(DesktopError::Io(e)),
            Err(_) => Vec::new(),
        };
        Ok(Some(Box::new(WindowNode { window, siblings })))
    }
}
