//! WebSocket bridge between the desktop collector and the orchestrator.
//!
//! [`BridgeHub`] runs on the orchestration side and implements
//! [`deskpilot_core::CommandChannel`]. [`BridgeClient`] runs next to the
//! desktop, streams context upward and executes commands through a
//! [`CommandHandler`].

pub mod backoff;
pub mod client;
pub mod config;
pub mod error;
pub mod hub;
pub mod liveness;
pub mod metrics;
pub mod protocol;

pub use backoff::Backoff;
pub use client::{BridgeClient, ClientHandle, CommandHandler};
pub use config::BridgeConfig;
pub use error::BridgeError;
pub use hub::BridgeHub;
pub use liveness::Liveness;
pub use protocol::WireMessage;
