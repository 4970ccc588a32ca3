//! Synthetic keyboard and pointer input on Wayland (wtype / ydotool / wlrctl).

use crate::error::{DesktopError, DesktopResult};
use crate::hyprctl::{command_exists, run_checked};
use tokio::time::{sleep, Duration};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MouseButton {
    Left,
    Middle,
    Right,
}

impl MouseButton {
    fn ydotool_code(&self) -> &'static str {
        match self {
            MouseButton::Left => "1",
            MouseButton::Middle => "2",
            MouseButton::Right => "3",
        }
    }

    fn name(&self) -> &'static str {
        match self {
            MouseButton::Left => "left",
            MouseButton::Middle => "middle",
            MouseButton::Right => "right",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScrollDirection {
    Up,
    Down,
    Left,
    Right,
}

impl ScrollDirection {
    pub fn parse(direction: &str) -> DesktopResult<Self> {
        match direction.trim().to_lowercase().as_str() {
            "up" => Ok(ScrollDirection::Up),
            "down" => Ok(ScrollDirection::Down),
            "left" => Ok(ScrollDirection::Left),
            "right" => Ok(ScrollDirection::Right),
            other => Err(DesktopError::InvalidArgument(format!(
                "unsupported scroll direction: {other}"
            ))),
        }
    }

    /// `(dx, dy)` wheel steps for `amount` notches.
    pub fn delta(&self, amount: i32) -> (i32, i32) {
        match self {
            ScrollDirection::Up => (0, -amount),
            ScrollDirection::Down => (0, amount),
            ScrollDirection::Left => (-amount, 0),
            ScrollDirection::Right => (amount, 0),
        }
    }
}

fn validate_text(text: &str) -> DesktopResult<()> {
    if text.contains('\0') {
        return Err(DesktopError::InvalidArgument(
            "text contains null byte".to_string(),
        ));
    }
    Ok(())
}

fn validate_key_token(key: &str) -> DesktopResult<()> {
    if key.trim().is_empty() {
        return Err(DesktopError::InvalidArgument("key cannot be empty".to_string()));
    }
    if !key
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '_' | '-'))
    {
        return Err(DesktopError::InvalidArgument(format!(
            "key contains invalid characters: {key}"
        )));
    }
    Ok(())
}

fn validate_coordinate(value: i32, label: &str) -> DesktopResult<()> {
    if value < 0 {
        return Err(DesktopError::InvalidArgument(format!(
            "{label} must be >= 0, got {value}"
        )));
    }
    Ok(())
}

fn modifier_name(token: &str) -> Option<&'static str> {
    match token {
        "ctrl" | "control" => Some("ctrl"),
        "shift" => Some("shift"),
        "alt" => Some("alt"),
        "super" | "win" | "meta" | "logo" => Some("logo"),
        _ => None,
    }
}

fn key_name(token: &str) -> String {
    match token {
        "enter" | "return" => "Return".to_string(),
        "esc" | "escape" => "Escape".to_string(),
        "tab" => "Tab".to_string(),
        "space" => "space".to_string(),
        "backspace" => "BackSpace".to_string(),
        "delete" | "del" => "Delete".to_string(),
        "up" => "Up".to_string(),
        "down" => "Down".to_string(),
        "left" => "Left".to_string(),
        "right" => "Right".to_string(),
        "home" => "Home".to_string(),
        "end" => "End".to_string(),
        "pageup" => "Prior".to_string(),
        "pagedown" => "Next".to_string(),
        other if other.len() > 1 && other.starts_with('f') && other[1..].parse::<u8>().is_ok() => {
            other.to_uppercase()
        }
        other => other.to_string(),
    }
}

/// Translate a chord such as `ctrl+shift+t` into wtype arguments.
pub fn key_chord_args(keys: &str) -> DesktopResult<Vec<String>> {
    let tokens: Vec<String> = keys
        .split('+')
        .map(|t| t.trim().to_lowercase())
        .collect();
    for token in &tokens {
        validate_key_token(token)?;
    }
    let Some((main, modifiers)) = tokens.split_last() else {
        return Err(DesktopError::InvalidArgument("keys cannot be empty".to_string()));
    };

    let mut resolved = Vec::with_capacity(modifiers.len());
    for modifier in modifiers {
        let name = modifier_name(modifier).ok_or_else(|| {
            DesktopError::InvalidArgument(format!("unknown modifier: {modifier}"))
        })?;
        resolved.push(name);
    }

    let mut args: Vec<String> = Vec::new();
    for modifier in &resolved {
        args.push("-M".to_string());
        args.push(modifier.to_string());
    }
    args.push("-k".to_string());
    args.push(key_name(main));
    for modifier in resolved.iter().rev() {
        args.push("-m".to_string());
        args.push(modifier.to_string());
    }
    Ok(args)
}

/// Type text into the currently focused window.
pub async fn type_text(text: &str) -> DesktopResult<()> {
    validate_text(text)?;
    if command_exists("wtype").await {
        return run_checked("wtype", &[text]).await;
    }
    if command_exists("ydotool").await {
        return run_checked("ydotool", &["type", text]).await;
    }
    Err(DesktopError::Unavailable(
        "No text input backend found (install 'wtype' or 'ydotool')".to_string(),
    ))
}

/// Press a key or chord, e.g. `enter` or `ctrl+c`.
pub async fn send_keys(keys: &str) -> DesktopResult<()> {
    let args = key_chord_args(keys)?;
    if !command_exists("wtype").await {
        return Err(DesktopError::Unavailable(
            "wtype not found for key presses".to_string(),
        ));
    }
    let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
    run_checked("wtype", &arg_refs).await
}

/// Click at the current cursor position.
pub async fn mouse_click(button: MouseButton) -> DesktopResult<()> {
    if command_exists("ydotool").await {
        return run_checked("ydotool", &["click", button.ydotool_code()]).await;
    }
    if command_exists("wlrctl").await {
        return run_checked("wlrctl", &["pointer", "click", button.name()]).await;
    }
    Err(DesktopError::Unavailable(
        "No click backend found (install 'ydotool' or 'wlrctl')".to_string(),
    ))
}

pub async fn mouse_move_absolute(x: i32, y: i32) -> DesktopResult<()> {
    validate_coordinate(x, "x")?;
    validate_coordinate(y, "y")?;

    let xs = x.to_string();
    let ys = y.to_string();

    if command_exists("wlrctl").await {
        return run_checked("wlrctl", &["pointer", "move", &xs, &ys]).await;
    }
    if command_exists("ydotool").await {
        return run_checked("ydotool", &["mousemove", "--absolute", "-x", &xs, "-y", &ys]).await;
    }
    Err(DesktopError::Unavailable(
        "No mouse move backend found (install 'wlrctl' or 'ydotool')".to_string(),
    ))
}

/// Move to `(x, y)` and click `clicks` times.
pub async fn click_at(x: i32, y: i32, button: MouseButton, clicks: u8) -> DesktopResult<()> {
    mouse_move_absolute(x, y).await?;
    // compositor needs the move before the press
    sleep(Duration::from_millis(30)).await;
    for i in 0..clicks.max(1) {
        if i > 0 {
            sleep(Duration::from_millis(40)).await;
        }
        mouse_click(button).await?;
    }
    Ok(())
}

/// Scroll the wheel under the cursor.
pub async fn scroll(direction: ScrollDirection, amount: i32) -> DesktopResult<()> {
    if amount <= 0 {
        return Err(DesktopError::InvalidArgument(format!(
            "amount must be > 0, got {amount}"
        )));
    }
    let (dx, dy) = direction.delta(amount);
    let dxs = dx.to_string();
    let dys = dy.to_string();

    if command_exists("wlrctl").await {
        return run_checked("wlrctl", &["pointer", "scroll", &dys, &dxs]).await;
    }
    if command_exists("ydotool").await {
        return run_checked("ydotool", &["mousemove", "--wheel", "-x", &dxs, "-y", &dys]).await;
    }
    Err(DesktopError::Unavailable(
        "No scroll backend found (install 'wlrctl' or 'ydotool')".to_string(),
    ))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn test_chord_wraps_modifiers() {
        let args = key_chord_args("ctrl+shift+t").unwrap();
        assert_eq!(
            args,
            vec!["-M", "ctrl", "-M", "shift", "-k", "t", "-m", "shift", "-m", "ctrl"]
        );
    }

    #[test]
    fn test_single_key_maps_names() {
        assert_eq!(key_chord_args("Enter").unwrap(), vec!["-k", "Return"]);
        assert_eq!(key_chord_args("f5").unwrap(), vec!["-k", "F5"]);
    }

    #[test]
    fn test_invalid_chords_rejected() {
        assert!(key_chord_args("").is_err());
        assert!(key_chord_args("ctrl+").is_err());
        assert!(key_chord_args("hyper+c").is_err());
        assert!(key_chord_args("ctrl+;").is_err());
    }

    #[test]
    fn test_scroll_direction() {
        assert_eq!(ScrollDirection::parse("Down").unwrap().delta(3), (0, 3));
        assert_eq!(ScrollDirection::parse("left").unwrap().delta(2), (-2, 0));
        assert!(ScrollDirection::parse("sideways").is_err());
    }
}
