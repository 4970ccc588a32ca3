//! Hyprland compositor queries and dispatchers.

use crate::error::{DesktopError, DesktopResult};
use serde::Deserialize;
use std::path::PathBuf;
use tokio::process::Command;

/// Subset of `hyprctl activewindow -j` / `hyprctl clients -j` entries.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct HyprWindow {
    pub address: String,
    pub class: String,
    pub title: String,
    pub pid: i64,
    pub at: [i32; 2],
    pub size: [i32; 2],
    pub monitor: i64,
    pub mapped: bool,
    pub hidden: bool,
}

impl HyprWindow {
    pub fn pid(&self) -> u32 {
        u32::try_from(self.pid).unwrap_or_default()
    }

    pub fn bounding_rect(&self) -> [i32; 4] {
        [self.at[0], self.at[1], self.size[0], self.size[1]]
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct HyprMonitor {
    name: String,
    focused: bool,
}

fn validate_window_selector(selector: &str) -> DesktopResult<()> {
    if selector.trim().is_empty() {
        return Err(DesktopError::InvalidArgument(
            "window selector cannot be empty".to_string(),
        ));
    }
    if selector.contains('\n') || selector.contains('\0') {
        return Err(DesktopError::InvalidArgument(
            "window selector contains invalid control characters".to_string(),
        ));
    }
    Ok(())
}

fn validate_exec_command(command: &str) -> DesktopResult<()> {
    if command.trim().is_empty() {
        return Err(DesktopError::InvalidArgument(
            "command cannot be empty".to_string(),
        ));
    }
    if command.contains('\n') || command.contains('\0') {
        return Err(DesktopError::InvalidArgument(
            "command contains invalid control characters".to_string(),
        ));
    }
    Ok(())
}

pub(crate) async fn command_exists(command: &str) -> bool {
    Command::new("which")
        .arg(command)
        .output()
        .await
        .map(|output| output.status.success())
        .unwrap_or(false)
}

pub(crate) async fn run_checked(command: &str, args: &[&str]) -> DesktopResult<()> {
    let output = Command::new(command).args(args).output().await?;
    if output.status.success() {
        return Ok(());
    }
    Err(DesktopError::OperationFailed(
        String::from_utf8_lossy(&output.stderr).trim().to_string(),
    ))
}

pub(crate) async fn run_output(command: &str, args: &[&str]) -> DesktopResult<Vec<u8>> {
    let output = Command::new(command).args(args).output().await?;
    if output.status.success() {
        return Ok(output.stdout);
    }
    Err(DesktopError::OperationFailed(
        String::from_utf8_lossy(&output.stderr).trim().to_string(),
    ))
}

/// Path of the compositor event socket for the running instance.
pub fn event_socket_path() -> DesktopResult<PathBuf> {
    let runtime = std::env::var("XDG_RUNTIME_DIR")
        .map_err(|_| DesktopError::Unavailable("XDG_RUNTIME_DIR is not set".to_string()))?;
    let signature = std::env::var("HYPRLAND_INSTANCE_SIGNATURE").map_err(|_| {
        DesktopError::Unavailable("HYPRLAND_INSTANCE_SIGNATURE is not set".to_string())
    })?;
    Ok(PathBuf::from(runtime)
        .join("hypr")
        .join(signature)
        .join(".socket2.sock"))
}

/// Current active window. `None` when no window has focus.
pub async fn active_window() -> DesktopResult<Option<HyprWindow>> {
    let stdout = run_output("hyprctl", &["activewindow", "-j"]).await?;
    let value: serde_json::Value = serde_json::from_slice(&stdout)?;
    if value.as_object().map_or(true, |o| o.is_empty()) {
        return Ok(None);
    }
    Ok(Some(serde_json::from_value(value)?))
}

/// Mapped client windows.
pub async fn clients() -> DesktopResult<Vec<HyprWindow>> {
    let stdout = run_output("hyprctl", &["clients", "-j"]).await?;
    let windows: Vec<HyprWindow> = serde_json::from_slice(&stdout)?;
    Ok(windows.into_iter().filter(|w| w.mapped).collect())
}

pub async fn focused_monitor() -> DesktopResult<String> {
    let stdout = run_output("hyprctl", &["monitors", "-j"]).await?;
    let monitors: Vec<HyprMonitor> = serde_json::from_slice(&stdout)?;
    monitors
        .into_iter()
        .find(|m| m.focused)
        .map(|m| m.name)
        .ok_or_else(|| DesktopError::NotFound("no focused monitor".to_string()))
}

/// Focus a window by Hyprland selector (`title:...`, `class:...`, `pid:...`).
pub async fn focus_window(selector: &str) -> DesktopResult<()> {
    validate_window_selector(selector)?;
    run_checked("hyprctl", &["dispatch", "focuswindow", selector]).await
}

/// Launch a program through the compositor.
pub async fn exec(command: &str) -> DesktopResult<()> {
    validate_exec_command(command)?;
    run_checked("hyprctl", &["dispatch", "exec", command]).await
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn test_window_parses_from_hyprctl_json() {
        let json = r#"{
            "address": "0x55d1",
            "mapped": true,
            "hidden": false,
            "at": [10, 40],
            "size": [800, 600],
            "workspace": {"id": 1, "name": "1"},
            "monitor": 0,
            "class": "firefox",
            "title": "Mozilla Firefox",
            "pid": 4242
        }"#;
        let window: HyprWindow = serde_json::from_str(json).unwrap();
        assert_eq!(window.pid(), 4242);
        assert_eq!(window.bounding_rect(), [10, 40, 800, 600]);
        assert_eq!(window.class, "firefox");
    }

    #[test]
    fn test_negative_pid_maps_to_zero() {
        let window = HyprWindow {
            pid: -1,
            ..Default::default()
        };
        assert_eq!(window.pid(), 0);
    }

    #[test]
    fn test_selectors_are_validated() {
        assert!(validate_window_selector("").is_err());
        assert!(validate_window_selector("title:Inbox\n").is_err());
        assert!(validate_window_selector("title:Inbox - Mail").is_ok());
        assert!(validate_exec_command("  ").is_err());
        assert!(validate_exec_command("firefox").is_ok());
    }
}
