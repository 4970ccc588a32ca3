//! Desktop side of deskpilot: sensing and actuation on Hyprland.
//!
//! The [`monitor`] and [`idle`] tasks emit [`deskpilot_core::DesktopEvent`]s,
//! the [`aggregator`] folds them together with accessibility snapshots and
//! screen captures into the live context, and the [`actuator`] executes
//! commands received over the bridge. Accessibility trees come from AT-SPI
//! ([`atspi`]) with compositor geometry as the fallback.

pub mod actuator;
pub mod aggregator;
pub mod atspi;
pub mod capture;
pub mod config;
pub mod error;
pub mod hyprctl;
pub mod idle;
pub mod input;
pub mod monitor;
pub mod snapshot;

pub use actuator::{DesktopActuator, HyprlandDriver, InputDriver};
pub use aggregator::Aggregator;
pub use atspi::{AtspiProvider, BusCall, BusRef, GdbusCall};
pub use capture::{CaptureRing, CaptureSettings, GrimGrabber, ScreenGrabber};
pub use config::DesktopConfig;
pub use error::{DesktopError, DesktopResult};
pub use idle::{run_idle_monitor, CommandIdleSource, IdleSource, IdleTracker};
pub use monitor::{ForegroundMonitor, HyprlandProcessLookup, MonotonicClock, ProcessLookup, StreamEnd};
pub use snapshot::{
    AccessibilityProvider, AccessibleNode, HyprlandWindowProvider, Snapshotter, SnapshotThrottle,
    WalkLimits,
};
