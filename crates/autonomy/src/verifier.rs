//! Step verification and the objective success check.

use deskpilot_core::{DesktopContext, PlannedStep};
use deskpilot_executor::{change_note, ActionOutcome};

/// Same successful step this many times in a row counts as done.
pub const DEFAULT_REPEAT_THRESHOLD: u32 = 3;

#[derive(Debug, Clone, PartialEq)]
pub struct StepVerdict {
    pub changed: bool,
    pub note: String,
}

pub trait Verifier: Send + Sync {
    /// Compare the context around one executed step.
    fn verify_step(&self, before: &DesktopContext, after: &DesktopContext, outcome: &ActionOutcome) -> StepVerdict;

    /// Whether the objective's success condition holds in `context`.
    fn objective_met(&self, objective: &str, context: &DesktopContext) -> bool;
}

/// Verifier driven purely by the desktop context.
///
/// Objectives that open or launch an application are met once that
/// application owns the foreground window. Other objectives are left to the
/// planner's completion signal and the repeat detector.
#[derive(Debug, Default, Clone, Copy)]
pub struct ContextVerifier;

fn launch_target(objective: &str) -> Option<String> {
    let lower = objective.to_lowercase();
    let mut words = lower.split_whitespace();
    while let Some(word) = words.next() {
        if word == "open" || word == "launch" {
            let target: Vec<&str> = words
                .by_ref()
                .take_while(|w| !matches!(*w, "and" | "then"))
                .collect();
            let target = target.join(" ");
            let target = target.trim_matches(|c: char| !c.is_alphanumeric());
            return (!target.is_empty()).then(|| target.to_string());
        }
    }
    None
}

impl Verifier for ContextVerifier {
    fn verify_step(&self, before: &DesktopContext, after: &DesktopContext, outcome: &ActionOutcome) -> StepVerdict {
        if !outcome.success {
            return StepVerdict {
                changed: false,
                note: format!("step failed: {}", outcome.describe()),
            };
        }
        match change_note(before, after) {
            Some(note) => StepVerdict { changed: true, note },
            None if after.version > before.version => StepVerdict {
                changed: true,
                note: "context refreshed".to_string(),
            },
            None => StepVerdict {
                changed: false,
                note: "no visible change".to_string(),
            },
        }
    }

    fn objective_met(&self, objective: &str, context: &DesktopContext) -> bool {
        let Some(target) = launch_target(objective) else {
            return false;
        };
        let title = context.window_title.to_lowercase();
        let path = context.process_path.to_lowercase();
        title.contains(&target) || path.contains(&target)
    }
}

/// Counts consecutive successful executions of the same step.
#[derive(Debug)]
pub struct RepeatTracker {
    threshold: u32,
    last: Option<String>,
    count: u32,
}

impl RepeatTracker {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            last: None,
            count: 0,
        }
    }

    /// Record a successful step; true once it has repeated `threshold` times.
    pub fn record(&mut self, step: &PlannedStep) -> bool {
        let signature = step.signature();
        if self.last.as_deref() == Some(signature.as_str()) {
            self.count += 1;
        } else {
            self.last = Some(signature);
            self.count = 1;
        }
        self.count >= self.threshold
    }

    pub fn reset(&mut self) {
        self.last = None;
        self.count = 0;
    }
}
