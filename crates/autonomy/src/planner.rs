//! Planning capability: the trait the orchestrator consults each iteration,
//! a keyword-driven planner that needs no model, and the parser for JSON
//! decisions produced by model-backed planners.

use crate::error::PlannerError;
use async_trait::async_trait;
use deskpilot_core::{DesktopContext, Params, PlannedStep};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

/// Words that mark an action as hard to undo.
pub const IRREVERSIBLE_KEYWORDS: [&str; 7] = ["send", "submit", "delete", "publish", "transfer", "buy", "purchase"];

/// Action name for a step that deliberately does nothing this iteration.
pub const WAIT_ACTION: &str = "wait";

#[derive(Debug, Clone)]
pub struct PlanningInput {
    pub objective: String,
    pub context: Arc<DesktopContext>,
    pub iteration: u32,
    /// Steps that already executed successfully, oldest first.
    pub history: Vec<PlannedStep>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PlanDecision {
    Step(PlannedStep),
    Complete { summary: String },
}

#[async_trait]
pub trait Planner: Send + Sync {
    /// Recorded on each run as `planner_mode`.
    fn mode(&self) -> &str;

    async fn next_step(&self, input: &PlanningInput) -> Result<PlanDecision, PlannerError>;
}

/// Classify a step as irreversible by keyword.
///
/// `send_keys` is judged by its description only, so a plain shortcut such as
/// `ctrl+c` is not gated.
pub fn is_irreversible(action: &str, params: &Params, description: &str) -> bool {
    if action == "send_or_submit" {
        return true;
    }
    let mut texts: Vec<String> = vec![description.to_string()];
    if action != "send_keys" {
        texts.push(action.replace('_', " "));
    }
    for key in ["name", "automation_id", "label"] {
        if let Some(value) = params.get(key).and_then(Value::as_str) {
            texts.push(value.to_string());
        }
    }
    texts.iter().any(|text| contains_keyword(text))
}

fn contains_keyword(text: &str) -> bool {
    text.split(|c: char| !c.is_alphanumeric())
        .any(|word| IRREVERSIBLE_KEYWORDS.contains(&word.to_lowercase().as_str()))
}

/// Planner that derives a fixed step list from the objective's wording.
///
/// The objective is split into clauses on `,`, `;`, `and` and `then`
/// (outside double quotes). Each clause contributes at most one step, picked
/// by its first keyword. An objective with no recognised clause becomes a
/// single observation.
#[derive(Debug, Default, Clone, Copy)]
pub struct DeterministicPlanner;

impl DeterministicPlanner {
    pub fn plan(objective: &str) -> Vec<PlannedStep> {
        let steps: Vec<PlannedStep> = split_clauses(objective)
            .iter()
            .filter_map(|clause| clause_step(clause))
            .collect();
        if steps.is_empty() {
            return vec![PlannedStep::new("observe_desktop", Params::new()).with_description("observe the desktop")];
        }
        steps
    }
}

#[async_trait]
impl Planner for DeterministicPlanner {
    fn mode(&self) -> &str {
        "deterministic"
    }

    async fn next_step(&self, input: &PlanningInput) -> Result<PlanDecision, PlannerError> {
        let plan = Self::plan(&input.objective);
        match plan.get(input.history.len()) {
            Some(step) => Ok(PlanDecision::Step(step.clone())),
            None => Ok(PlanDecision::Complete {
                summary: format!("completed {} planned step(s)", plan.len()),
            }),
        }
    }
}

fn split_clauses(objective: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    for c in objective.chars() {
        match c {
            '"' => {
                quoted = !quoted;
                current.push(c);
            }
            ',' | ';' if !quoted => parts.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    parts.push(current);

    let mut clauses = Vec::new();
    for part in parts {
        let mut words: Vec<&str> = Vec::new();
        let mut quoted = false;
        for word in part.split_whitespace() {
            let connective = matches!(word.to_lowercase().as_str(), "and" | "then");
            if connective && !quoted {
                if !words.is_empty() {
                    clauses.push(words.join(" "));
                    words.clear();
                }
                continue;
            }
            if word.matches('"').count() % 2 == 1 {
                quoted = !quoted;
            }
            words.push(word);
        }
        if !words.is_empty() {
            clauses.push(words.join(" "));
        }
    }
    clauses
}

fn quoted_text(clause: &str) -> Option<&str> {
    let start = clause.find('"')?;
    let rest = &clause[start + 1..];
    let end = rest.find('"')?;
    Some(&rest[..end])
}

fn clause_step(clause: &str) -> Option<PlannedStep> {
    let words: Vec<&str> = clause.split_whitespace().collect();
    for (i, word) in words.iter().enumerate() {
        let keyword = word
            .trim_matches(|c: char| !c.is_alphanumeric())
            .to_lowercase();
        let rest = words[i + 1..].join(" ");
        let rest = rest.trim().trim_matches('"').trim();
        match keyword.as_str() {
            "open" | "launch" => {
                if rest.is_empty() {
                    return None;
                }
                let mut params = Params::new();
                params.insert("application".into(), json!(rest));
                return Some(
                    PlannedStep::new("open_application", params).with_description(format!("open {}", rest)),
                );
            }
            "type" | "reply" | "draft" => {
                let text = quoted_text(clause).unwrap_or(rest);
                if text.is_empty() {
                    return None;
                }
                let mut params = Params::new();
                params.insert("text".into(), json!(text));
                return Some(PlannedStep::new("type_text", params).with_description(format!("{} text", keyword)));
            }
            k if IRREVERSIBLE_KEYWORDS.contains(&k) => {
                let keys = if k == "delete" { "delete" } else { "enter" };
                let mut params = Params::new();
                params.insert("keys".into(), json!(keys));
                return Some(
                    PlannedStep::new("send_keys", params)
                        .with_description(clause.to_string())
                        .irreversible(),
                );
            }
            _ => {}
        }
    }
    None
}

#[derive(Debug, Deserialize)]
struct RawDecision {
    action: String,
    #[serde(default, alias = "params")]
    parameters: Params,
    #[serde(default = "full_confidence")]
    confidence: f64,
    #[serde(default)]
    reasoning: String,
}

fn full_confidence() -> f64 {
    1.0
}

fn strip_fences(text: &str) -> &str {
    let mut body = text.trim();
    if let Some(rest) = body.strip_prefix("```") {
        body = rest.split_once('\n').map(|(_, b)| b).unwrap_or("");
        body = body.trim_end().strip_suffix("```").unwrap_or(body);
    }
    match (body.find('{'), body.rfind('}')) {
        (Some(start), Some(end)) if start < end => &body[start..=end],
        _ => body.trim(),
    }
}

/// Parse a planner's JSON reply of the form
/// `{"action", "parameters", "confidence", "reasoning"}`.
///
/// `done` ends the run; `wait` yields a step with no effect.
pub fn parse_planner_output(text: &str) -> Result<PlanDecision, PlannerError> {
    let body = strip_fences(text);
    if body.is_empty() {
        return Err(PlannerError::InvalidOutput("empty reply".to_string()));
    }
    let raw: RawDecision = serde_json::from_str(body)?;
    let action = raw.action.trim().to_lowercase();
    let confidence = if raw.confidence.is_finite() {
        raw.confidence.clamp(0.0, 1.0)
    } else {
        0.0
    };

    match action.as_str() {
        "" => Err(PlannerError::InvalidOutput("missing action".to_string())),
        "done" | "complete" => Ok(PlanDecision::Complete {
            summary: if raw.reasoning.is_empty() {
                "objective complete".to_string()
            } else {
                raw.reasoning
            },
        }),
        WAIT_ACTION => Ok(PlanDecision::Step(
            PlannedStep::new(WAIT_ACTION, Params::new())
                .with_confidence(confidence)
                .with_description(raw.reasoning),
        )),
        _ => {
            let irreversible = is_irreversible(&action, &raw.parameters, &raw.reasoning);
            let mut step = PlannedStep::new(action, raw.parameters)
                .with_confidence(confidence)
                .with_description(raw.reasoning);
            step.irreversible = irreversible;
            Ok(PlanDecision::Step(step))
        }
    }
}
