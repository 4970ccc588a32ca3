//! Deskpilot core model
//!
//! Shared data types for desktop sensing, the bridge command catalog, autonomy
//! runs, and the seams the other crates plug into.

pub mod context;
pub mod interfaces;
pub mod run;
pub mod summary;
pub mod types;

pub use context::ContextCell;
pub use interfaces::{CommandChannel, EventSink, RunStore, StoreError};
pub use run::{AgentLogEntry, AutonomyRun, InvalidTransition, PlannedStep, RunStatus, AGENT_LOG_LIMIT};
pub use summary::{build_uia_summary, collapse_whitespace, truncate_chars};
pub use types::*;
