//! Autonomy orchestration: planning, verification and the run state machine
//! that sequences plan, execute and verify cycles with approval gating.

pub mod error;
pub mod orchestrator;
pub mod planner;
pub mod verifier;

pub use error::{OrchestratorError, PlannerError};
pub use orchestrator::{
    AdmissionPolicy, Orchestrator, OrchestratorConfig, RunRequest, BUDGET_EXHAUSTED, INTERRUPTED_BY_SHUTDOWN,
    RESTORED_AFTER_RESTART, RUN_TIMED_OUT, ZERO_BUDGET,
};
pub use planner::{
    is_irreversible, parse_planner_output, DeterministicPlanner, PlanDecision, Planner, PlanningInput,
    IRREVERSIBLE_KEYWORDS, WAIT_ACTION,
};
pub use verifier::{ContextVerifier, RepeatTracker, StepVerdict, Verifier, DEFAULT_REPEAT_THRESHOLD};
