use deskpilot_core::{InvalidTransition, StoreError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PlannerError {
    #[error("Planner unavailable: {0}")]
    Unavailable(String),

    #[error("Invalid planner output: {0}")]
    InvalidOutput(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("run not found: {0}")]
    NotFound(String),

    #[error("run is not waiting approval")]
    NotWaitingApproval,

    #[error("invalid approval token")]
    InvalidToken,

    #[error("run already finished: {0}")]
    AlreadyFinished(String),

    #[error("orchestrator busy: another run holds the executor")]
    Busy,

    #[error("objective cannot be empty")]
    EmptyObjective,

    #[error(transparent)]
    Transition(#[from] InvalidTransition),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}
