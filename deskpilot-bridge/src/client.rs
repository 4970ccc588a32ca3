//! Desktop-side end of the bridge.
//!
//! Keeps one outbound WebSocket to the hub, reconnecting with exponential
//! backoff. Context updates are forwarded as they arrive; while the link is
//! down only the most recent context is kept and it is sent first after the
//! next successful connect. Commands are executed one at a time in arrival
//! order by a [`CommandHandler`].

use crate::backoff::Backoff;
use crate::config::BridgeConfig;
use crate::liveness::Liveness;
use crate::metrics;
use crate::protocol::WireMessage;
use async_trait::async_trait;
use deskpilot_core::{BridgeCommand, BridgeResult, DesktopAction, DesktopContext, DesktopEvent};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

const CONTEXT_QUEUE: usize = 64;

/// Executes bridge commands on the local desktop.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle(&self, command: BridgeCommand) -> BridgeResult;
}

type ContextUpdate = (DesktopContext, Option<DesktopEvent>);

/// Cheap handle used by the sensing side to push context to the hub.
#[derive(Clone)]
pub struct ClientHandle {
    updates: mpsc::Sender<ContextUpdate>,
    liveness: Arc<Liveness>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl ClientHandle {
    /// Queue a context update. Never blocks; a full queue drops the update
    /// since a newer one will follow.
    pub fn send_context(&self, context: DesktopContext, event: Option<DesktopEvent>) {
        if let Err(e) = self.updates.try_send((context, event)) {
            debug!("Context update not queued: {}", e);
        }
    }

    pub fn is_connected(&self) -> bool {
        self.liveness.is_fresh()
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }
}

pub struct BridgeClient {
    config: BridgeConfig,
    handler: Arc<dyn CommandHandler>,
}

enum SessionEnd {
    Reconnect,
    Shutdown,
}

impl BridgeClient {
    pub fn new(config: BridgeConfig, handler: Arc<dyn CommandHandler>) -> Self {
        Self { config, handler }
    }

    /// Spawn the connection loop and return a handle to it.
    pub fn spawn(self) -> (ClientHandle, JoinHandle<()>) {
        let (updates_tx, updates_rx) = mpsc::channel(CONTEXT_QUEUE);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let liveness = Arc::new(Liveness::new(self.config.heartbeat_timeout()));

        let handle = ClientHandle {
            updates: updates_tx,
            liveness: liveness.clone(),
            shutdown: Arc::new(shutdown_tx),
        };
        let task = tokio::spawn(self.run(updates_rx, shutdown_rx, liveness));
        (handle, task)
    }

    async fn run(
        self,
        mut updates: mpsc::Receiver<ContextUpdate>,
        mut shutdown: watch::Receiver<bool>,
        liveness: Arc<Liveness>,
    ) {
        let mut backoff = Backoff::new(self.config.reconnect_initial_ms, self.config.reconnect_max_ms);
        let mut latest: Option<DesktopContext> = None;

        loop {
            if *shutdown.borrow() {
                break;
            }

            info!("Connecting to bridge hub at {}", self.config.url);
            match connect_async(self.config.url.as_str()).await {
                Ok((ws_stream, _)) => {
                    info!("Connected to bridge hub");
                    backoff.reset();
                    metrics::increment_connections();
                    liveness.mark_connected();
                    let end = self
                        .session(ws_stream, &mut updates, &mut shutdown, &liveness, &mut latest)
                        .await;
                    liveness.mark_disconnected();
                    if let SessionEnd::Shutdown = end {
                        break;
                    }
                    warn!("Bridge connection lost");
                }
                Err(e) => {
                    warn!("Bridge connect failed: {}", e);
                }
            }

            let delay = backoff.next_delay();
            debug!("Reconnecting in {:?}", delay);
            let sleep = tokio::time::sleep(delay);
            tokio::pin!(sleep);
            loop {
                tokio::select! {
                    _ = &mut sleep => break,
                    update = updates.recv() => match update {
                        Some((context, _)) => latest = Some(context),
                        None => return,
                    },
                    _ = shutdown.changed() => return,
                }
            }
        }
        info!("Bridge client stopped");
    }

    async fn session<S>(
        &self,
        ws_stream: tokio_tungstenite::WebSocketStream<S>,
        updates: &mut mpsc::Receiver<ContextUpdate>,
        shutdown: &mut watch::Receiver<bool>,
        liveness: &Liveness,
        latest: &mut Option<DesktopContext>,
    ) -> SessionEnd
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    {
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let (command_tx, mut command_rx) = mpsc::unbounded_channel::<BridgeCommand>();
        let (result_tx, mut result_rx) = mpsc::unbounded_channel::<BridgeResult>();
        let handler = self.handler.clone();
        let worker = tokio::spawn(async move {
            while let Some(command) = command_rx.recv().await {
                let id = command.id;
                let action = command.action;
                let result = handler.handle(command).await;
                debug!("Command {} ({}) finished ok={}", id, action, result.ok);
                if result_tx.send(result).is_err() {
                    break;
                }
            }
        });

        if let Some(context) = latest.take() {
            let frame = WireMessage::Context {
                context,
                event: None,
            };
            if let Err(e) = send_frame(&mut ws_sender, &frame).await {
                warn!("Failed to replay context after reconnect: {}", e);
                if let WireMessage::Context { context, .. } = frame {
                    *latest = Some(context);
                }
                worker.abort();
                return SessionEnd::Reconnect;
            }
        }

        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval());
        let end = loop {
            tokio::select! {
                frame = ws_receiver.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        liveness.beat();
                        match WireMessage::decode(&text) {
                            Ok(WireMessage::Command(command)) => {
                                debug!("Received command {} ({})", command.id, command.action);
                                let _ = command_tx.send(command);
                            }
                            Ok(WireMessage::Ping) => {
                                if send_frame(&mut ws_sender, &WireMessage::Pong).await.is_err() {
                                    break SessionEnd::Reconnect;
                                }
                            }
                            Ok(WireMessage::Pong) => {}
                            Ok(other) => debug!("Ignoring {} frame from hub", other.kind()),
                            Err(e) => match rejected_command(&text) {
                                Some(result) => {
                                    warn!("Rejecting command {}: {}", result.id, result.error.as_deref().unwrap_or_default());
                                    if send_frame(&mut ws_sender, &WireMessage::Result(result)).await.is_err() {
                                        break SessionEnd::Reconnect;
                                    }
                                }
                                None => warn!("Malformed frame from hub: {}", e),
                            },
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break SessionEnd::Reconnect,
                    Some(Ok(_)) => liveness.beat(),
                    Some(Err(e)) => {
                        warn!("Bridge read error: {}", e);
                        break SessionEnd::Reconnect;
                    }
                },
                result = result_rx.recv() => {
                    let Some(result) = result else { break SessionEnd::Reconnect };
                    if let Err(e) = send_frame(&mut ws_sender, &WireMessage::Result(result)).await {
                        error!("Failed to send command result: {}", e);
                        break SessionEnd::Reconnect;
                    }
                }
                update = updates.recv() => {
                    let Some((context, event)) = update else { break SessionEnd::Shutdown };
                    let frame = WireMessage::Context { context, event };
                    if let Err(e) = send_frame(&mut ws_sender, &frame).await {
                        warn!("Failed to send context: {}", e);
                        if let WireMessage::Context { context, .. } = frame {
                            *latest = Some(context);
                        }
                        break SessionEnd::Reconnect;
                    }
                }
                _ = heartbeat.tick() => {
                    if !liveness.is_fresh() {
                        warn!("No heartbeat from hub for {:?}", liveness.since_last_beat());
                        break SessionEnd::Reconnect;
                    }
                    if send_frame(&mut ws_sender, &WireMessage::Ping).await.is_err() {
                        break SessionEnd::Reconnect;
                    }
                }
                _ = shutdown.changed() => break SessionEnd::Shutdown,
            }
        };

        worker.abort();
        let _ = ws_sender.close().await;
        end
    }
}

/// A command frame whose action is outside the catalog still gets a result
/// so the hub does not wait for the timeout.
fn rejected_command(text: &str) -> Option<BridgeResult> {
    let value: serde_json::Value = serde_json::from_str(text).ok()?;
    if value.get("type")?.as_str()? != "command" {
        return None;
    }
    let id = value.get("id")?.as_u64()?;
    let action = value.get("action").and_then(|a| a.as_str()).unwrap_or_default();
    let reason = match action.parse::<DesktopAction>() {
        Ok(_) => "malformed command".to_string(),
        Err(e) => e,
    };
    Some(BridgeResult::failure(id, reason))
}

async fn send_frame<W>(sink: &mut W, frame: &WireMessage) -> Result<(), crate::error::BridgeError>
where
    W: futures::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    let text = frame.encode()?;
    sink.send(Message::Text(text)).await?;
    Ok(())
}
