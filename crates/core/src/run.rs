//! Autonomy run records and their state machine.

use crate::types::{ExecutorMode, Params};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Agent log entries kept per run; older entries are dropped first.
pub const AGENT_LOG_LIMIT: usize = 200;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    WaitingApproval,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled
        )
    }

    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        use RunStatus::*;
        match (self, next) {
            (Pending, Running | Failed | Cancelled) => true,
            (Running, WaitingApproval | Paused | Completed | Failed | Cancelled) => true,
            (WaitingApproval, Running | Failed | Cancelled) => true,
            (Paused, Running | Failed | Cancelled) => true,
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::WaitingApproval => "waiting_approval",
            RunStatus::Paused => "paused",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid run transition: {from} -> {to}")]
pub struct InvalidTransition {
    pub from: RunStatus,
    pub to: RunStatus,
}

/// A step proposed by the planning capability.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlannedStep {
    pub action: String,
    #[serde(default)]
    pub params: Params,
    #[serde(default = "full_confidence")]
    pub confidence: f64,
    #[serde(default)]
    pub irreversible: bool,
    #[serde(default)]
    pub description: String,
}

fn full_confidence() -> f64 {
    1.0
}

impl PlannedStep {
    pub fn new(action: impl Into<String>, params: Params) -> Self {
        Self {
            action: action.into(),
            params,
            confidence: 1.0,
            irreversible: false,
            description: String::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn irreversible(mut self) -> Self {
        self.irreversible = true;
        self
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence;
        self
    }

    /// Action name plus canonical params, used for repeat detection.
    pub fn signature(&self) -> String {
        format!(
            "{}:{}",
            self.action,
            serde_json::Value::Object(self.params.clone())
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentLogEntry {
    pub agent: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
}

impl AgentLogEntry {
    pub fn new(agent: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            agent: agent.into(),
            message: message.into(),
            timestamp: Utc::now(),
            confidence: None,
            action: None,
            success: None,
        }
    }

    pub fn with_action(mut self, action: impl Into<String>, success: bool) -> Self {
        self.action = Some(action.into());
        self.success = Some(success);
        self
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = Some(confidence);
        self
    }
}

/// One objective-to-completion execution of the plan/execute/verify loop.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AutonomyRun {
    pub run_id: String,
    pub objective: String,
    pub status: RunStatus,
    pub iteration: u32,
    pub max_iterations: u32,
    pub planner_mode: String,
    #[serde(default)]
    pub executor_mode: ExecutorMode,
    #[serde(default)]
    pub auto_approve_irreversible: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_step: Option<PlannedStep>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub agent_log: Vec<AgentLogEntry>,
}

impl AutonomyRun {
    pub fn new(
        run_id: impl Into<String>,
        objective: impl Into<String>,
        max_iterations: u32,
        planner_mode: impl Into<String>,
        executor_mode: ExecutorMode,
        auto_approve_irreversible: bool,
    ) -> Self {
        let now = Utc::now();
        Self {
            run_id: run_id.into(),
            objective: objective.into(),
            status: RunStatus::Pending,
            iteration: 0,
            max_iterations,
            planner_mode: planner_mode.into(),
            executor_mode,
            auto_approve_irreversible,
            approval_token: None,
            pending_step: None,
            last_error: None,
            started_at: now,
            updated_at: now,
            finished_at: None,
            agent_log: Vec::new(),
        }
    }

    pub fn transition(&mut self, next: RunStatus) -> Result<(), InvalidTransition> {
        if !self.status.can_transition_to(next) {
            return Err(InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.updated_at = Utc::now();
        if next.is_terminal() {
            self.finished_at = Some(self.updated_at);
            self.approval_token = None;
            self.pending_step = None;
        }
        Ok(())
    }

    pub fn log(&mut self, entry: AgentLogEntry) {
        self.agent_log.push(entry);
        if self.agent_log.len() > AGENT_LOG_LIMIT {
            let excess = self.agent_log.len() - AGENT_LOG_LIMIT;
            self.agent_log.drain(..excess);
        }
        self.updated_at = Utc::now();
    }

    pub fn note(&mut self, agent: &str, message: impl Into<String>) {
        self.log(AgentLogEntry::new(agent, message));
    }
}
