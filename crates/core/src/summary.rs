//! Bounded text rendering of accessibility snapshots.

use crate::types::{UiaElement, UiaSnapshot};

pub const MAX_UIA_SUMMARY_CHARS: usize = 2048;
const DOCUMENT_PREVIEW_CHARS: usize = 200;
const TREE_MAX_LINES: usize = 40;

/// Truncate to at most `max` characters on a char boundary.
pub fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}

/// Collapse runs of whitespace (including newlines) into single spaces.
pub fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

pub fn build_uia_summary(snapshot: &UiaSnapshot) -> String {
    let mut parts = Vec::new();
    if !snapshot.focused_name.is_empty() {
        parts.push(format!("Focused: {}", snapshot.focused_name));
    }
    if !snapshot.control_type.is_empty() {
        parts.push(format!("Control: {}", snapshot.control_type));
    }
    if !snapshot.document_text.is_empty() {
        parts.push(format!(
            "Document: {}",
            truncate_chars(&snapshot.document_text, DOCUMENT_PREVIEW_CHARS)
        ));
    }
    if !snapshot.window_tree.is_empty() {
        let lines = summarize_tree(&snapshot.window_tree, 0, TREE_MAX_LINES);
        parts.push(format!("Tree:\n{}", lines.join("\n")));
    }

    let text = parts.join("\n");
    if text.chars().count() > MAX_UIA_SUMMARY_CHARS {
        format!("{}...", truncate_chars(&text, MAX_UIA_SUMMARY_CHARS - 3))
    } else {
        text
    }
}

fn summarize_tree(elements: &[UiaElement], depth: usize, max_lines: usize) -> Vec<String> {
    let mut lines = Vec::new();
    let indent = "  ".repeat(depth);
    for element in elements {
        if lines.len() >= max_lines {
            lines.push(format!("{}... (truncated)", indent));
            break;
        }
        lines.push(format!("{}{}", indent, describe(element)));
        if !element.children.is_empty() {
            let remaining = max_lines.saturating_sub(lines.len());
            lines.extend(summarize_tree(&element.children, depth + 1, remaining));
        }
    }
    lines
}

fn describe(element: &UiaElement) -> String {
    let mut desc = Vec::new();
    if !element.control_type.is_empty() {
        desc.push(element.control_type.clone());
    }
    if !element.name.is_empty() {
        desc.push(format!("\"{}\"", element.name));
    }
    if let Some(value) = &element.value {
        desc.push(format!("val={}", value));
    }
    if desc.is_empty() {
        "(element)".to_string()
    } else {
        desc.join(" ")
    }
}
