//! Action executors for autonomy runs.
//!
//! Every executor implements [`ActionExecutor`]. [`ExecutorSet`] routes each
//! call by [`deskpilot_core::ExecutorMode`].

pub mod bridge;
pub mod browser;
pub mod error;
pub mod outcome;
pub mod set;
pub mod simulator;

pub use bridge::{change_note, normalize_action, BridgeExecutor, BRIDGE_DISCONNECTED};
pub use browser::{is_browser_action, BrowserExecutor, BrowserSettings};
pub use error::ExecutorError;
pub use outcome::{ActionExecutor, ActionOutcome};
pub use set::ExecutorSet;
pub use simulator::SimulatorExecutor;
