//! Orchestration-side end of the bridge.
//!
//! The hub accepts the desktop client's WebSocket, keeps the latest
//! [`DesktopContext`] it reports, and correlates dispatched commands with the
//! results that come back. A single writer task per connection serializes all
//! outbound frames. Desktop events are persisted by a separate task so a slow
//! store never holds up frame handling.

use crate::config::BridgeConfig;
use crate::error::BridgeError;
use crate::liveness::Liveness;
use crate::metrics::{self, MetricTimer, DISPATCH_LATENCY};
use crate::protocol::WireMessage;
use async_trait::async_trait;
use deskpilot_core::{
    BridgeCommand, BridgeResult, ChannelFailure, CommandChannel, ContextCell, DesktopAction, DesktopEvent,
    EventSink,
};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

const EVENT_QUEUE: usize = 1024;

/// Bounded queue in front of the event sink. The writer task starts with the
/// first queued event.
struct EventQueue {
    tx: mpsc::Sender<DesktopEvent>,
    rx: Mutex<Option<mpsc::Receiver<DesktopEvent>>>,
    sink: Arc<dyn EventSink>,
}

impl EventQueue {
    fn new(sink: Arc<dyn EventSink>) -> Self {
        let (tx, rx) = mpsc::channel(EVENT_QUEUE);
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
            sink,
        }
    }

    fn push(&self, event: DesktopEvent) {
        if let Some(rx) = self.rx.lock().take() {
            tokio::spawn(persist_events(self.sink.clone(), rx));
        }
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                warn!("Event queue full, dropping {} event", event.kind.as_str());
            }
            Err(mpsc::error::TrySendError::Closed(_)) => debug!("Event writer stopped"),
        }
    }
}

async fn persist_events(sink: Arc<dyn EventSink>, mut events: mpsc::Receiver<DesktopEvent>) {
    while let Some(event) = events.recv().await {
        if let Err(e) = sink.record_event(&event).await {
            warn!("Failed to persist {} event: {}", event.kind.as_str(), e);
        }
    }
    debug!("Event writer drained");
}

struct Session {
    id: u64,
    outbound: mpsc::UnboundedSender<WireMessage>,
    closed: Arc<Notify>,
}

struct PendingCommand {
    session: u64,
    action: DesktopAction,
    sent_at: Instant,
    tx: oneshot::Sender<BridgeResult>,
}

/// Removes a pending entry when the dispatching future finishes or is dropped.
struct PendingGuard<'a> {
    pending: &'a Mutex<HashMap<u64, PendingCommand>>,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.lock().remove(&self.id);
    }
}

pub struct BridgeHub {
    config: BridgeConfig,
    next_command_id: AtomicU64,
    next_session_id: AtomicU64,
    session: Mutex<Option<Session>>,
    pending: Mutex<HashMap<u64, PendingCommand>>,
    liveness: Liveness,
    context: Arc<ContextCell>,
    events: Option<EventQueue>,
    shutdown: watch::Sender<bool>,
    started: Mutex<bool>,
}

impl BridgeHub {
    pub fn new(config: BridgeConfig, context: Arc<ContextCell>) -> Self {
        let liveness = Liveness::new(config.heartbeat_timeout());
        let (shutdown, _) = watch::channel(false);
        Self {
            config,
            next_command_id: AtomicU64::new(1),
            next_session_id: AtomicU64::new(1),
            session: Mutex::new(None),
            pending: Mutex::new(HashMap::new()),
            liveness,
            context,
            events: None,
            shutdown,
            started: Mutex::new(false),
        }
    }

    /// Persist desktop events carried by inbound context frames.
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.events = Some(EventQueue::new(sink));
        self
    }

    pub fn context(&self) -> Arc<ContextCell> {
        self.context.clone()
    }

    pub fn pending_commands(&self) -> usize {
        self.pending.lock().len()
    }

    /// Bind the listener and spawn the accept and heartbeat loops.
    /// Returns the bound address (useful with port 0).
    pub async fn start(self: &Arc<Self>) -> Result<SocketAddr, BridgeError> {
        {
            let mut started = self.started.lock();
            if *started {
                return Err(BridgeError::AlreadyStarted);
            }
            *started = true;
        }

        let listener = TcpListener::bind(&self.config.listen_addr).await?;
        let addr = listener.local_addr()?;
        info!("Bridge hub listening on: {}", addr);

        let hub = self.clone();
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            info!("Accepted bridge connection from: {}", peer);
                            tokio::spawn(hub.clone().serve_connection(stream));
                        }
                        Err(e) => {
                            error!("Bridge accept failed: {}", e);
                        }
                    },
                    _ = shutdown.changed() => break,
                }
            }
            debug!("Bridge accept loop ended");
        });

        let hub = self.clone();
        tokio::spawn(async move { hub.heartbeat_loop().await });

        Ok(addr)
    }

    /// Stop accepting connections and drop the active session.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        let session = self.session.lock().take();
        if let Some(session) = session {
            session.closed.notify_one();
            self.fail_pending(session.id, ChannelFailure::ConnectionLost);
        }
        self.liveness.mark_disconnected();
    }

    async fn heartbeat_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        let mut ticker = tokio::time::interval(self.config.heartbeat_interval());
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => return,
            }

            let stale = {
                let session = self.session.lock();
                match session.as_ref() {
                    Some(session) => {
                        if !self.liveness.is_fresh() {
                            Some(session.id)
                        } else {
                            let _ = session.outbound.send(WireMessage::Ping);
                            None
                        }
                    }
                    None => None,
                }
            };

            if let Some(session_id) = stale {
                warn!(
                    "Bridge heartbeat stale for {:?}, dropping session {}",
                    self.liveness.since_last_beat(),
                    session_id
                );
                self.end_session(session_id);
            }
        }
    }

    async fn serve_connection(self: Arc<Self>, stream: TcpStream) {
        let ws_stream = match accept_async(stream).await {
            Ok(ws) => ws,
            Err(e) => {
                error!("Error during the websocket handshake occurred: {}", e);
                return;
            }
        };

        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<WireMessage>();
        let closed = Arc::new(Notify::new());
        let session_id = self.install_session(outbound_tx, closed.clone());
        metrics::increment_connections();

        let writer = tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                let text = match frame.encode() {
                    Ok(text) => text,
                    Err(e) => {
                        error!("Failed to encode {} frame: {}", frame.kind(), e);
                        continue;
                    }
                };
                if let Err(e) = ws_sender.send(Message::Text(text)).await {
                    warn!("Failed to send bridge frame: {}", e);
                    break;
                }
            }
            let _ = ws_sender.close().await;
        });

        loop {
            tokio::select! {
                frame = ws_receiver.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        self.liveness.beat();
                        self.handle_frame(session_id, &text).await;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!("Bridge connection {} closed", session_id);
                        break;
                    }
                    Some(Ok(_)) => self.liveness.beat(),
                    Some(Err(e)) => {
                        warn!("Bridge connection {} error: {}", session_id, e);
                        break;
                    }
                },
                _ = closed.notified() => {
                    debug!("Bridge session {} closed locally", session_id);
                    break;
                }
            }
        }

        self.end_session(session_id);
        writer.abort();
    }

    fn install_session(&self, outbound: mpsc::UnboundedSender<WireMessage>, closed: Arc<Notify>) -> u64 {
        let id = self.next_session_id.fetch_add(1, Ordering::SeqCst);
        let previous = self.session.lock().replace(Session {
            id,
            outbound,
            closed,
        });
        if let Some(previous) = previous {
            info!("Bridge session {} replaced by {}", previous.id, id);
            previous.closed.notify_one();
            self.fail_pending(previous.id, ChannelFailure::ConnectionLost);
        }
        self.liveness.mark_connected();
        id
    }

    fn end_session(&self, session_id: u64) {
        let ended = {
            let mut session = self.session.lock();
            match session.as_ref() {
                Some(current) if current.id == session_id => session.take(),
                _ => None,
            }
        };
        if let Some(ended) = ended {
            ended.closed.notify_one();
            self.liveness.mark_disconnected();
            info!("Bridge session {} ended", session_id);
        }
        self.fail_pending(session_id, ChannelFailure::ConnectionLost);
    }

    fn fail_pending(&self, session_id: u64, reason: ChannelFailure) {
        let failed: Vec<(u64, PendingCommand)> = {
            let mut pending = self.pending.lock();
            let ids: Vec<u64> = pending
                .iter()
                .filter(|(_, p)| p.session == session_id)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| pending.remove(&id).map(|p| (id, p)))
                .collect()
        };
        for (id, waiter) in failed {
            warn!("Failing in-flight command {} ({}): {}", id, waiter.action, reason);
            let _ = waiter.tx.send(BridgeResult::channel_failure(id, reason));
        }
    }

    async fn handle_frame(&self, session_id: u64, text: &str) {
        let message = match WireMessage::decode(text) {
            Ok(message) => message,
            Err(e) => {
                warn!("Malformed bridge frame on session {}: {}", session_id, e);
                return;
            }
        };

        match message {
            WireMessage::Result(result) => self.complete(result),
            WireMessage::Context { context, event } => {
                let published = self.context.publish(context);
                debug!(
                    "Context v{} from desktop: {}",
                    published.version, published.window_title
                );
                if let (Some(event), Some(queue)) = (event, self.events.as_ref()) {
                    queue.push(event);
                }
            }
            WireMessage::Ping => {
                if let Some(session) = self.session.lock().as_ref() {
                    let _ = session.outbound.send(WireMessage::Pong);
                }
            }
            WireMessage::Pong => {}
            WireMessage::Command(command) => {
                warn!("Ignoring command {} sent towards the hub", command.id);
            }
        }
    }

    fn complete(&self, result: BridgeResult) {
        let waiter = self.pending.lock().remove(&result.id);
        match waiter {
            Some(waiter) => {
                debug!(
                    "Result for command {} ({}) after {:?}",
                    result.id,
                    waiter.action,
                    waiter.sent_at.elapsed()
                );
                if waiter.tx.send(result).is_err() {
                    metrics::increment_discarded_results();
                    debug!("Caller gave up before result arrived");
                }
            }
            None => {
                metrics::increment_discarded_results();
                warn!(
                    "Discarding result for unknown or expired command id {}",
                    result.id
                );
            }
        }
    }

    /// Send a command and wait for the correlated result.
    ///
    /// The id is assigned here. On timeout a synthetic failure is returned and
    /// a late result is discarded when it arrives.
    pub async fn dispatch(&self, mut command: BridgeCommand, timeout: Duration) -> BridgeResult {
        let _timer = MetricTimer::new(DISPATCH_LATENCY);
        let id = self.next_command_id.fetch_add(1, Ordering::SeqCst);
        command.id = id;
        command.timeout_ms = timeout.as_millis() as u64;

        if !self.liveness.is_fresh() {
            return BridgeResult::channel_failure(id, ChannelFailure::NotConnected);
        }

        let (tx, rx) = oneshot::channel();
        {
            let guard = self.session.lock();
            let Some(session) = guard.as_ref() else {
                return BridgeResult::channel_failure(id, ChannelFailure::NotConnected);
            };
            self.pending.lock().insert(
                id,
                PendingCommand {
                    session: session.id,
                    action: command.action,
                    sent_at: Instant::now(),
                    tx,
                },
            );
            info!("Dispatching command {} ({})", id, command.action);
            if session.outbound.send(WireMessage::Command(command)).is_err() {
                self.pending.lock().remove(&id);
                return BridgeResult::channel_failure(id, ChannelFailure::ConnectionLost);
            }
        }
        metrics::increment_dispatched();
        let _guard = PendingGuard {
            pending: &self.pending,
            id,
        };

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => BridgeResult::channel_failure(id, ChannelFailure::ConnectionLost),
            Err(_) => {
                metrics::increment_timeouts();
                warn!("Command {} timed out after {:?}", id, timeout);
                BridgeResult::failure(
                    id,
                    format!("command timed out after {}ms", timeout.as_millis()),
                )
            }
        }
    }

    pub fn is_connected(&self) -> bool {
        self.liveness.is_fresh() && self.session.lock().is_some()
    }
}

#[async_trait]
impl CommandChannel for BridgeHub {
    async fn dispatch(&self, command: BridgeCommand, timeout: Duration) -> BridgeResult {
        BridgeHub::dispatch(self, command, timeout).await
    }

    fn is_connected(&self) -> bool {
        BridgeHub::is_connected(self)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use deskpilot_core::DesktopContext;

    fn hub() -> BridgeHub {
        BridgeHub::new(BridgeConfig::default(), Arc::new(ContextCell::new()))
    }

    fn fake_session(hub: &BridgeHub) -> (u64, mpsc::UnboundedReceiver<WireMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = hub.install_session(tx, Arc::new(Notify::new()));
        (id, rx)
    }

    #[tokio::test]
    async fn test_dispatch_without_session_fails_fast() {
        let hub = hub();
        let result = hub
            .dispatch(
                BridgeCommand::new(DesktopAction::Observe, Default::default()),
                Duration::from_secs(1),
            )
            .await;
        assert!(!result.ok);
        assert_eq!(result.channel, Some(ChannelFailure::NotConnected));
        assert!(!hub.is_connected());
    }

    #[tokio::test]
    async fn test_result_is_correlated_by_id() {
        let hub = Arc::new(hub());
        let (session, mut rx) = fake_session(&hub);

        let dispatcher = hub.clone();
        let call = tokio::spawn(async move {
            dispatcher
                .dispatch(
                    BridgeCommand::new(DesktopAction::Observe, Default::default()),
                    Duration::from_secs(2),
                )
                .await
        });

        let sent = match rx.recv().await.unwrap() {
            WireMessage::Command(command) => command,
            other => panic!("expected command, got {:?}", other),
        };
        let frame = WireMessage::Result(BridgeResult::success(sent.id, serde_json::json!({"ok": 1})))
            .encode()
            .unwrap();
        hub.handle_frame(session, &frame).await;

        let result = call.await.unwrap();
        assert!(result.ok);
        assert_eq!(result.id, sent.id);
        assert_eq!(hub.pending_commands(), 0);
    }

    #[tokio::test]
    async fn test_timeout_discards_late_result() {
        let hub = Arc::new(hub());
        let (session, mut rx) = fake_session(&hub);

        let result = hub
            .dispatch(
                BridgeCommand::new(DesktopAction::Scroll, Default::default()),
                Duration::from_millis(20),
            )
            .await;
        assert!(!result.ok);
        assert!(result.error.unwrap().contains("timed out"));
        assert_eq!(hub.pending_commands(), 0);

        let sent = match rx.recv().await.unwrap() {
            WireMessage::Command(command) => command,
            other => panic!("expected command, got {:?}", other),
        };
        let late = WireMessage::Result(BridgeResult::success(sent.id, serde_json::json!({})))
            .encode()
            .unwrap();
        hub.handle_frame(session, &late).await;
        assert_eq!(hub.pending_commands(), 0);
    }

    #[tokio::test]
    async fn test_session_end_fails_in_flight_commands() {
        let hub = Arc::new(hub());
        let (session, _rx) = fake_session(&hub);

        let dispatcher = hub.clone();
        let call = tokio::spawn(async move {
            dispatcher
                .dispatch(
                    BridgeCommand::new(DesktopAction::Click, Default::default()),
                    Duration::from_secs(5),
                )
                .await
        });
        while hub.pending_commands() == 0 {
            tokio::task::yield_now().await;
        }
        hub.end_session(session);

        let result = call.await.unwrap();
        assert_eq!(result.channel, Some(ChannelFailure::ConnectionLost));
        assert!(!hub.is_connected());
    }

    #[tokio::test]
    async fn test_context_frame_updates_cell() {
        let hub = hub();
        let (session, _rx) = fake_session(&hub);
        let frame = WireMessage::Context {
            context: DesktopContext {
                window_title: "Inbox".into(),
                ..Default::default()
            },
            event: None,
        }
        .encode()
        .unwrap();
        hub.handle_frame(session, &frame).await;
        assert_eq!(hub.context().load().window_title, "Inbox");
        assert_eq!(hub.context().version(), 1);
    }

    /// Holds every write until released.
    #[derive(Default)]
    struct GatedSink {
        open: Notify,
        recorded: Mutex<Vec<DesktopEvent>>,
    }

    #[async_trait]
    impl EventSink for GatedSink {
        async fn record_event(&self, event: &DesktopEvent) -> Result<(), deskpilot_core::StoreError> {
            self.open.notified().await;
            self.recorded.lock().push(event.clone());
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_slow_event_store_does_not_block_frames() {
        let sink = Arc::new(GatedSink::default());
        let hub = hub().with_event_sink(sink.clone());
        let (session, _rx) = fake_session(&hub);
        let frame = WireMessage::Context {
            context: DesktopContext {
                window_title: "Editor".into(),
                ..Default::default()
            },
            event: Some(DesktopEvent::foreground("Editor", "/usr/bin/code", 4, 1)),
        }
        .encode()
        .unwrap();

        tokio::time::timeout(Duration::from_millis(200), hub.handle_frame(session, &frame))
            .await
            .expect("frame handling waited on the event store");
        assert_eq!(hub.context().load().window_title, "Editor");
        assert!(sink.recorded.lock().is_empty());

        for _ in 0..200 {
            sink.open.notify_one();
            if !sink.recorded.lock().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let recorded = sink.recorded.lock();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].window_title, "Editor");
    }

    #[tokio::test]
    async fn test_ids_are_monotonic() {
        let hub = hub();
        let first = hub
            .dispatch(BridgeCommand::new(DesktopAction::Observe, Default::default()), Duration::from_millis(1))
            .await;
        let second = hub
            .dispatch(BridgeCommand::new(DesktopAction::Observe, Default::default()), Duration::from_millis(1))
            .await;
        assert!(second.id > first.id);
    }
}
