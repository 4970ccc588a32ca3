//! Executes bridge commands against the local desktop.

use crate::aggregator::Aggregator;
use crate::error::{DesktopError, DesktopResult};
use crate::hyprctl;
use crate::input::{self, MouseButton, ScrollDirection};
use async_trait::async_trait;
use deskpilot_bridge::CommandHandler;
use deskpilot_core::{BridgeCommand, BridgeResult, DesktopAction, UiaElement};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{info, warn};

const DEFAULT_SCROLL_AMOUNT: i32 = 3;

/// Low-level input primitives the actuator drives.
#[async_trait]
pub trait InputDriver: Send + Sync {
    async fn click(&self, x: i32, y: i32, button: MouseButton, clicks: u8) -> DesktopResult<()>;
    async fn type_text(&self, text: &str) -> DesktopResult<()>;
    async fn send_keys(&self, keys: &str) -> DesktopResult<()>;
    async fn open_application(&self, application: &str) -> DesktopResult<()>;
    async fn focus_window(&self, selector: &str) -> DesktopResult<()>;
    async fn scroll(&self, direction: ScrollDirection, amount: i32) -> DesktopResult<()>;
}

/// Wayland input through wtype/ydotool/wlrctl and Hyprland dispatchers.
pub struct HyprlandDriver;

#[async_trait]
impl InputDriver for HyprlandDriver {
    async fn click(&self, x: i32, y: i32, button: MouseButton, clicks: u8) -> DesktopResult<()> {
        input::click_at(x, y, button, clicks).await
    }

    async fn type_text(&self, text: &str) -> DesktopResult<()> {
        input::type_text(text).await
    }

    async fn send_keys(&self, keys: &str) -> DesktopResult<()> {
        input::send_keys(keys).await
    }

    async fn open_application(&self, application: &str) -> DesktopResult<()> {
        hyprctl::exec(application).await
    }

    async fn focus_window(&self, selector: &str) -> DesktopResult<()> {
        hyprctl::focus_window(selector).await
    }

    async fn scroll(&self, direction: ScrollDirection, amount: i32) -> DesktopResult<()> {
        input::scroll(direction, amount).await
    }
}

/// Escape regex metacharacters for Hyprland window rules.
fn escape_selector(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for ch in text.chars() {
        if matches!(
            ch,
            '\\' | '.' | '+' | '*' | '?' | '(' | ')' | '|' | '[' | ']' | '{' | '}' | '^' | '$'
        ) {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}

fn required_str<'a>(command: &'a BridgeCommand, key: &str) -> DesktopResult<&'a str> {
    command
        .str_param(key)
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| {
            DesktopError::InvalidArgument(format!("{} requires '{}'", command.action, key))
        })
}

fn int_param(command: &BridgeCommand, key: &str) -> DesktopResult<Option<i32>> {
    match command.params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => value
            .as_i64()
            .or_else(|| value.as_f64().map(|f| f.round() as i64))
            .and_then(|v| i32::try_from(v).ok())
            .map(Some)
            .ok_or_else(|| DesktopError::InvalidArgument(format!("'{}' must be an integer", key))),
    }
}

pub struct DesktopActuator {
    aggregator: Arc<Aggregator>,
    driver: Arc<dyn InputDriver>,
}

impl DesktopActuator {
    pub fn new(aggregator: Arc<Aggregator>, driver: Arc<dyn InputDriver>) -> Self {
        Self { aggregator, driver }
    }

    /// Resolve the click target: element by automation id or name from the
    /// latest snapshot, else explicit coordinates.
    fn click_target(&self, command: &BridgeCommand) -> DesktopResult<(i32, i32, String)> {
        let automation_id = command.str_param("automation_id").filter(|s| !s.is_empty());
        let name = command.str_param("name").filter(|s| !s.is_empty());

        if automation_id.is_some() || name.is_some() {
            let context = self.aggregator.context().load();
            let snapshot = context.uia.as_ref();
            let found: Option<&UiaElement> = snapshot.and_then(|s| {
                if let Some(id) = automation_id {
                    if let Some(el) = s.find_element(&|e| e.automation_id == id) {
                        return Some(el);
                    }
                }
                let name = name?.to_lowercase();
                s.find_element(&|e| e.name.to_lowercase() == name)
                    .or_else(|| s.find_element(&|e| e.name.to_lowercase().contains(&name)))
            });
            let label = automation_id.or(name).unwrap_or_default().to_string();
            return match found.and_then(|el| el.center()) {
                Some((x, y)) => Ok((x, y, label)),
                None => Err(DesktopError::NotFound(format!("element '{}' not found", label))),
            };
        }

        match (int_param(command, "x")?, int_param(command, "y")?) {
            (Some(x), Some(y)) => Ok((x, y, format!("({}, {})", x, y))),
            _ => Err(DesktopError::InvalidArgument(format!(
                "{} requires name, automation_id or x and y",
                command.action
            ))),
        }
    }

    async fn execute(&self, command: &BridgeCommand) -> DesktopResult<Value> {
        match command.action {
            DesktopAction::Observe => {
                let context = self.aggregator.refresh().await;
                let screenshot = self.aggregator.latest_frame().map(|f| f.to_base64());
                Ok(json!({ "context": &*context, "screenshot_b64": screenshot }))
            }
            DesktopAction::Click | DesktopAction::DoubleClick | DesktopAction::RightClick => {
                let (x, y, label) = self.click_target(command)?;
                let (button, clicks) = match command.action {
                    DesktopAction::DoubleClick => (MouseButton::Left, 2),
                    DesktopAction::RightClick => (MouseButton::Right, 1),
                    _ => (MouseButton::Left, 1),
                };
                self.driver.click(x, y, button, clicks).await?;
                Ok(json!({ "clicked": label, "x": x, "y": y }))
            }
            DesktopAction::TypeText => {
                let text = command
                    .str_param("text")
                    .ok_or_else(|| DesktopError::InvalidArgument("type_text requires 'text'".to_string()))?;
                self.driver.type_text(text).await?;
                Ok(json!({ "typed_chars": text.chars().count() }))
            }
            DesktopAction::SendKeys => {
                let keys = required_str(command, "keys")?;
                self.driver.send_keys(keys).await?;
                Ok(json!({ "keys": keys }))
            }
            DesktopAction::OpenApplication => {
                let application = required_str(command, "application")?;
                self.driver.open_application(application).await?;
                Ok(json!({ "launched": application }))
            }
            DesktopAction::FocusWindow => {
                let selector = if let Some(title) = command.str_param("title").filter(|s| !s.is_empty()) {
                    format!("title:{}", escape_selector(title))
                } else if let Some(process) = command.str_param("process").filter(|s| !s.is_empty()) {
                    format!("class:{}", escape_selector(process))
                } else {
                    return Err(DesktopError::InvalidArgument(
                        "focus_window requires 'title' or 'process'".to_string(),
                    ));
                };
                self.driver.focus_window(&selector).await?;
                Ok(json!({ "focused": selector }))
            }
            DesktopAction::Scroll => {
                let direction = match command.str_param("direction") {
                    Some(direction) => ScrollDirection::parse(direction)?,
                    None => ScrollDirection::Down,
                };
                let amount = int_param(command, "amount")?.unwrap_or(DEFAULT_SCROLL_AMOUNT);
                self.driver.scroll(direction, amount).await?;
                Ok(json!({ "scrolled": amount }))
            }
        }
    }
}

#[async_trait]
impl CommandHandler for DesktopActuator {
    async fn handle(&self, command: BridgeCommand) -> BridgeResult {
        info!("Executing {} (command {})", command.action, command.id);
        match self.execute(&command).await {
            Ok(output) => {
                // observe has refreshed already
                if command.action != DesktopAction::Observe {
                    self.aggregator.refresh().await;
                }
                BridgeResult::success(command.id, output)
            }
            Err(e) => {
                warn!("Command {} ({}) failed: {}", command.id, command.action, e);
                BridgeResult::failure(command.id, e.to_string())
            }
        }
    }
}
