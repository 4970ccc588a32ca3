//! Desktop side: sensors, context aggregation and the bridge client.

use crate::config::Config;
use anyhow::Result;
use async_trait::async_trait;
use deskpilot_bridge::{BridgeClient, CommandHandler};
use deskpilot_core::{BridgeCommand, BridgeResult, ContextCell};
use deskpilot_desktop::{
    run_idle_monitor, AccessibilityProvider, Aggregator, AtspiProvider, CaptureRing, CommandIdleSource,
    DesktopActuator, ForegroundMonitor, GdbusCall, GrimGrabber, HyprlandDriver, HyprlandProcessLookup,
    HyprlandWindowProvider, MonotonicClock, Snapshotter,
};
use std::sync::{Arc, OnceLock};
use tokio::sync::mpsc;
use tracing::info;

const EVENT_QUEUE: usize = 256;

/// The client is created before the actuator that handles its commands, so
/// the actuator is installed once everything is wired.
#[derive(Default)]
struct LateHandler(OnceLock<Arc<DesktopActuator>>);

#[async_trait]
impl CommandHandler for LateHandler {
    async fn handle(&self, command: BridgeCommand) -> BridgeResult {
        match self.0.get() {
            Some(actuator) => actuator.handle(command).await,
            None => BridgeResult::failure(command.id, "desktop agent is starting"),
        }
    }
}

pub async fn run(config: &Config) -> Result<()> {
    info!("Starting desktop agent; hub at {}", config.bridge.url);

    let handler = Arc::new(LateHandler::default());
    let (client, client_task) = BridgeClient::new(config.bridge.clone(), handler.clone()).spawn();

    let provider: Box<dyn AccessibilityProvider> = if config.desktop.atspi_enabled {
        Box::new(AtspiProvider::new(
            Arc::new(GdbusCall::new()),
            Box::new(HyprlandWindowProvider),
            config.desktop.walk_limits(),
            config.desktop.atspi_max_nodes,
        ))
    } else {
        Box::new(HyprlandWindowProvider)
    };
    let snapshotter = Snapshotter::new(provider, config.desktop.walk_limits(), config.desktop.snapshot_interval());
    let mut aggregator = Aggregator::new(Arc::new(ContextCell::new()))
        .with_snapshotter(snapshotter)
        .with_client(client.clone());
    if config.desktop.screenshot_enabled {
        let ring = CaptureRing::new(Arc::new(GrimGrabber), config.desktop.capture_settings());
        aggregator = aggregator.with_capture(Arc::new(ring));
    }
    let aggregator = Arc::new(aggregator);
    let _ = handler
        .0
        .set(Arc::new(DesktopActuator::new(aggregator.clone(), Arc::new(HyprlandDriver))));

    let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE);
    let clock = MonotonicClock::new();

    let monitor = ForegroundMonitor::new(clock, Arc::new(HyprlandProcessLookup::new()));
    let monitor_tx = events_tx.clone();
    tokio::spawn(async move { monitor.run(monitor_tx).await });

    let desktop = config.desktop.clone();
    tokio::spawn(async move {
        let source = Arc::new(CommandIdleSource::new(desktop.idle_command.clone()));
        run_idle_monitor(&desktop, source, clock, events_tx).await;
    });

    tokio::spawn(aggregator.clone().run(events_rx));
    aggregator.refresh().await;

    tokio::spawn(aggregator.clone().run_refresh(config.desktop.refresh_interval()));

    tokio::signal::ctrl_c().await?;
    info!("Shutting down desktop agent");
    client.shutdown();
    let _ = client_task.await;
    Ok(())
}
