//! Persistent stream connection: reconnect, heartbeat, outbound queue, and
//! inbound dispatch.
//!
//! All state transitions of one connection are serialized through a single
//! mutex. Every socket worker and reconnect timer carries the epoch it was
//! started under; callbacks from a superseded epoch are ignored, which makes
//! [`StreamConnection::disconnect`] effective immediately even when the
//! runtime still delivers an event that was already in flight.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, trace, warn};
use url::Url;

use crate::retry::with_timeout;
use crate::stream::client::{StreamClient, StreamClientError};
use crate::stream::dispatch::{ConnectionEvent, EventHandlers, MessageHandler};
use crate::stream::proto::{is_heartbeat_ack, Channel, ClientMessage, InboundMessage};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;
type SocketSink = SplitSink<Socket, Message>;
type SocketStream = SplitStream<Socket>;

/// Connection lifecycle state.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectionState {
    /// Created, never connected.
    Idle,
    /// Transport is being opened.
    Connecting,
    /// Transport is open; sends go straight to the socket.
    Open,
    /// The client is closing a live socket after a local liveness failure.
    Closing,
    /// No transport. A reconnect may be pending unless the connection was
    /// disconnected explicitly.
    Closed,
}

/// Progress of automatic recovery.
#[derive(Clone, Debug, PartialEq)]
pub struct ReconnectState {
    /// Consecutive reconnects scheduled since the last successful open.
    pub attempt_count: usize,
    pub next_delay: Duration,
    pub last_error: Option<String>,
}

/// Result of [`StreamConnection::send`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SendOutcome {
    /// Handed to the open transport.
    Sent,
    /// Buffered until the next open.
    Queued,
}

/// One logical persistent connection for a session key.
///
/// Cloning yields another handle to the same connection.
#[derive(Clone)]
pub struct StreamConnection {
    shared: Arc<Shared>,
}

struct Shared {
    session_key: String,
    client: StreamClient,
    core: Mutex<Core>,
    handlers: RwLock<EventHandlers>,
}

struct Core {
    state: ConnectionState,
    should_reconnect: bool,
    disconnected: bool,
    reconnect: ReconnectState,
    exhausted_notified: bool,
    queue: VecDeque<String>,
    epoch: u64,
    worker: Option<Worker>,
    reconnect_timer: Option<JoinHandle<()>>,
}

struct Worker {
    outbound: Option<mpsc::UnboundedSender<String>>,
    shutdown: Option<oneshot::Sender<()>>,
    /// Wakes the open session to drain frames put back into the queue.
    requeued: Arc<Notify>,
}

enum Unsent {
    /// Popped from the front of the queue while draining.
    Front(String),
    /// Taken from the live outbound channel.
    Back(String),
}

enum SessionEnd {
    Shutdown,
    Lost {
        reason: String,
        unsent: Option<Unsent>,
    },
}

impl StreamConnection {
    pub(crate) fn new(client: StreamClient, session_key: String) -> Self {
        let base_delay = client.options().reconnect_policy.base_delay;
        let should_reconnect = client.options().reconnect_enabled;
        Self {
            shared: Arc::new(Shared {
                session_key,
                client,
                core: Mutex::new(Core {
                    state: ConnectionState::Idle,
                    should_reconnect,
                    disconnected: false,
                    reconnect: ReconnectState::fresh(base_delay),
                    exhausted_notified: false,
                    queue: VecDeque::new(),
                    epoch: 0,
                    worker: None,
                    reconnect_timer: None,
                }),
                handlers: RwLock::new(EventHandlers::new()),
            }),
        }
    }

    pub fn session_key(&self) -> &str {
        &self.shared.session_key
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.lock_core().state
    }

    pub fn reconnect_state(&self) -> ReconnectState {
        self.shared.lock_core().reconnect.clone()
    }

    /// Number of messages waiting for the next open.
    pub fn queued_len(&self) -> usize {
        self.shared.lock_core().queue.len()
    }

    /// True once [`disconnect`](Self::disconnect) has torn the connection
    /// down.
    pub fn is_terminated(&self) -> bool {
        self.shared.lock_core().disconnected
    }

    /// Whether both handles refer to the same connection.
    pub fn same_as(&self, other: &StreamConnection) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// Registers `handler` for `channel`, replacing any previous handler.
    pub fn on<F>(&self, channel: Channel, handler: F)
    where
        F: Fn(&InboundMessage) + Send + Sync + 'static,
    {
        let handler: MessageHandler = Arc::new(handler);
        self.shared.write_handlers().set(channel, handler);
    }

    /// Registers the lifecycle handler, replacing any previous one.
    pub fn on_lifecycle<F>(&self, handler: F)
    where
        F: Fn(&ConnectionEvent) + Send + Sync + 'static,
    {
        self.shared.write_handlers().set_lifecycle(Arc::new(handler));
    }

    pub fn off(&self, channel: Channel) -> bool {
        self.shared.write_handlers().off(channel)
    }

    /// Folds a handler set into this connection. Handlers in `handlers` win.
    pub fn merge_handlers(&self, handlers: EventHandlers) {
        self.shared.write_handlers().merge(handlers);
    }

    /// Starts connecting unless a transport is already opening or open.
    ///
    /// Fails immediately with [`StreamClientError::MissingCredential`] when
    /// the credential provider has no token. Must be called from within a
    /// Tokio runtime.
    pub fn connect(&self) -> Result<(), StreamClientError> {
        let mut events = Vec::new();
        let result = {
            let mut core = self.shared.lock_core();
            if matches!(
                core.state,
                ConnectionState::Connecting | ConnectionState::Open | ConnectionState::Closing
            ) {
                return Ok(());
            }
            core.should_reconnect = self.shared.client.options().reconnect_enabled;
            core.disconnected = false;
            if let Some(timer) = core.reconnect_timer.take() {
                timer.abort();
            }
            self.shared.begin_connect(&mut core, &mut events)
        };
        self.shared.emit_all(events);
        result
    }

    /// Resets the reconnect counter and connects again.
    ///
    /// This is the deliberate retry path after reconnects were exhausted.
    pub fn reconnect(&self) -> Result<(), StreamClientError> {
        {
            let mut core = self.shared.lock_core();
            let base_delay = self.shared.client.options().reconnect_policy.base_delay;
            core.reconnect = ReconnectState::fresh(base_delay);
            core.exhausted_notified = false;
        }
        self.connect()
    }

    /// Tears the connection down and stops automatic reconnects.
    ///
    /// Idempotent. A pending reconnect timer and the heartbeat are cancelled
    /// before this returns. Queued messages are kept for a later
    /// [`connect`](Self::connect).
    pub fn disconnect(&self) {
        let was_live = {
            let mut core = self.shared.lock_core();
            core.should_reconnect = false;
            core.disconnected = true;
            if let Some(timer) = core.reconnect_timer.take() {
                timer.abort();
            }
            core.epoch += 1;
            if let Some(mut worker) = core.worker.take() {
                worker.outbound = None;
                if let Some(shutdown) = worker.shutdown.take() {
                    let _ = shutdown.send(());
                }
            }
            let was_live = matches!(
                core.state,
                ConnectionState::Connecting | ConnectionState::Open | ConnectionState::Closing
            );
            core.state = ConnectionState::Closed;
            was_live
        };

        if was_live {
            info!(
                event = "stream_disconnected",
                session_key = %self.shared.session_key
            );
            self.shared.emit(&ConnectionEvent::Closed {
                reason: "disconnected".to_string(),
            });
        }
    }

    /// Sends `message` now when open, otherwise queues it.
    ///
    /// Queued messages are transmitted in order on the next open, before any
    /// message sent after that open.
    pub fn send<T: Serialize + ?Sized>(
        &self,
        message: &T,
    ) -> Result<SendOutcome, StreamClientError> {
        let frame = serde_json::to_string(message)?;
        let mut core = self.shared.lock_core();

        let frame = match core.live_sender() {
            Some(outbound) if core.queue.is_empty() => match outbound.send(frame) {
                Ok(()) => return Ok(SendOutcome::Sent),
                Err(mpsc::error::SendError(frame)) => frame,
            },
            _ => frame,
        };

        // Frames still waiting in the queue go first.
        core.queue.push_back(frame);
        if core.wake_worker() {
            return Ok(SendOutcome::Sent);
        }
        trace!(
            event = "stream_message_queued",
            session_key = %self.shared.session_key,
            queued = core.queue.len()
        );
        Ok(SendOutcome::Queued)
    }
}

impl fmt::Debug for StreamConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let core = self.shared.lock_core();
        f.debug_struct("StreamConnection")
            .field("session_key", &self.shared.session_key)
            .field("state", &core.state)
            .field("reconnect", &core.reconnect)
            .field("queued", &core.queue.len())
            .finish()
    }
}

impl ReconnectState {
    fn fresh(base_delay: Duration) -> Self {
        Self {
            attempt_count: 0,
            next_delay: base_delay,
            last_error: None,
        }
    }
}

impl Core {
    fn live_sender(&self) -> Option<&mpsc::UnboundedSender<String>> {
        if self.state != ConnectionState::Open {
            return None;
        }
        self.worker.as_ref()?.outbound.as_ref()
    }

    /// Asks an open session to drain the queue. Returns false when no
    /// session is open.
    fn wake_worker(&self) -> bool {
        match self.worker.as_ref() {
            Some(worker) if self.state == ConnectionState::Open => {
                worker.requeued.notify_one();
                true
            }
            _ => false,
        }
    }

    /// Puts frames from a superseded session back at the head of the
    /// queue, oldest first.
    fn restore_front(&mut self, frames: Vec<String>) {
        if frames.is_empty() {
            return;
        }
        for frame in frames.into_iter().rev() {
            self.queue.push_front(frame);
        }
        self.wake_worker();
    }
}

impl Shared {
    fn lock_core(&self) -> MutexGuard<'_, Core> {
        self.core
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_handlers(&self) -> std::sync::RwLockWriteGuard<'_, EventHandlers> {
        self.handlers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn handlers_snapshot(&self) -> EventHandlers {
        self.handlers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn emit(&self, event: &ConnectionEvent) {
        self.handlers_snapshot().notify(event);
    }

    fn emit_all(&self, events: Vec<ConnectionEvent>) {
        if events.is_empty() {
            return;
        }
        let handlers = self.handlers_snapshot();
        for event in &events {
            handlers.notify(event);
        }
    }

    /// Acquires the credential and spawns a socket worker.
    fn begin_connect(
        self: &Arc<Self>,
        core: &mut Core,
        events: &mut Vec<ConnectionEvent>,
    ) -> Result<(), StreamClientError> {
        core.epoch += 1;
        let epoch = core.epoch;

        let Some(token) = self.client.credentials().bearer_token() else {
            warn!(
                event = "stream_credential_missing",
                session_key = %self.session_key
            );
            core.state = ConnectionState::Closed;
            core.reconnect.last_error = Some("missing credential".to_string());
            events.push(ConnectionEvent::MissingCredential);
            self.schedule_reconnect(core, events);
            return Err(StreamClientError::MissingCredential);
        };

        let url = match self.client.session_url(&self.session_key, &token) {
            Ok(url) => url,
            Err(err) => {
                core.state = ConnectionState::Closed;
                core.reconnect.last_error = Some(err.to_string());
                return Err(err);
            }
        };

        core.state = ConnectionState::Connecting;
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let requeued = Arc::new(Notify::new());
        core.worker = Some(Worker {
            outbound: None,
            shutdown: Some(shutdown_tx),
            requeued: Arc::clone(&requeued),
        });
        debug!(
            event = "stream_connecting",
            session_key = %self.session_key,
            epoch,
            attempt = core.reconnect.attempt_count
        );
        tokio::spawn(run_worker(
            Arc::clone(self),
            epoch,
            url,
            shutdown_rx,
            requeued,
        ));
        Ok(())
    }

    fn schedule_reconnect(self: &Arc<Self>, core: &mut Core, events: &mut Vec<ConnectionEvent>) {
        let options = self.client.options();
        if !core.should_reconnect || !options.reconnect_enabled {
            return;
        }

        let policy = &options.reconnect_policy;
        if core.reconnect.attempt_count >= policy.max_attempts {
            if !core.exhausted_notified {
                core.exhausted_notified = true;
                warn!(
                    event = "stream_reconnect_exhausted",
                    session_key = %self.session_key,
                    attempts = core.reconnect.attempt_count,
                    last_error = core.reconnect.last_error.as_deref().unwrap_or("")
                );
                events.push(ConnectionEvent::ReconnectFailed {
                    attempts: core.reconnect.attempt_count,
                });
            }
            return;
        }

        let delay = policy.delay_for_attempt(core.reconnect.attempt_count + 1);
        core.reconnect.attempt_count += 1;
        core.reconnect.next_delay = delay;
        let attempt = core.reconnect.attempt_count;
        let epoch = core.epoch;

        debug!(
            event = "stream_reconnect_scheduled",
            session_key = %self.session_key,
            attempt,
            delay_ms = delay.as_millis() as u64
        );

        let shared = Arc::clone(self);
        core.reconnect_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            shared.fire_reconnect(epoch);
        }));
        events.push(ConnectionEvent::ReconnectScheduled { attempt, delay });
    }

    fn fire_reconnect(self: &Arc<Self>, epoch: u64) {
        let mut events = Vec::new();
        {
            let mut core = self.lock_core();
            if core.epoch != epoch
                || !core.should_reconnect
                || core.state != ConnectionState::Closed
            {
                return;
            }
            core.reconnect_timer = None;
            // Surfaced through lifecycle events; nobody awaits this result.
            let _ = self.begin_connect(&mut core, &mut events);
        }
        self.emit_all(events);
    }

    /// Moves a connecting worker to `Open`. Returns false when the worker
    /// was superseded.
    fn mark_open(&self, epoch: u64, outbound: mpsc::UnboundedSender<String>) -> bool {
        let mut core = self.lock_core();
        if core.epoch != epoch || core.state != ConnectionState::Connecting {
            return false;
        }
        let base_delay = self.client.options().reconnect_policy.base_delay;
        core.state = ConnectionState::Open;
        core.reconnect = ReconnectState::fresh(base_delay);
        core.exhausted_notified = false;
        if let Some(worker) = core.worker.as_mut() {
            worker.outbound = Some(outbound);
        }
        info!(
            event = "stream_opened",
            session_key = %self.session_key,
            queued = core.queue.len()
        );
        true
    }

    /// Pops the oldest queued frame while `epoch` is still the open session.
    fn pop_queued(&self, epoch: u64) -> Option<String> {
        let mut core = self.lock_core();
        if core.epoch != epoch || core.state != ConnectionState::Open {
            return None;
        }
        core.queue.pop_front()
    }

    fn is_current_open(&self, epoch: u64) -> bool {
        let core = self.lock_core();
        core.epoch == epoch && core.state == ConnectionState::Open
    }

    fn mark_closing(&self, epoch: u64) {
        let mut core = self.lock_core();
        if core.epoch == epoch && core.state == ConnectionState::Open {
            core.state = ConnectionState::Closing;
        }
    }

    /// Records an unintentional closure and schedules a reconnect.
    ///
    /// Frames that never reached the socket go back to the queue ahead of
    /// anything sent later.
    fn handle_loss(
        self: &Arc<Self>,
        epoch: u64,
        reason: String,
        unsent: Option<Unsent>,
        outbound_rx: Option<mpsc::UnboundedReceiver<String>>,
    ) {
        let mut events = Vec::new();
        {
            let mut core = self.lock_core();
            if core.epoch != epoch {
                let mut stale = Vec::new();
                if let Some(Unsent::Front(frame) | Unsent::Back(frame)) = unsent {
                    stale.push(frame);
                }
                if let Some(mut outbound_rx) = outbound_rx {
                    while let Ok(frame) = outbound_rx.try_recv() {
                        stale.push(frame);
                    }
                }
                core.restore_front(stale);
                return;
            }
            core.worker = None;

            match unsent {
                Some(Unsent::Front(frame)) => core.queue.push_front(frame),
                Some(Unsent::Back(frame)) => core.queue.push_back(frame),
                None => {}
            }
            if let Some(mut outbound_rx) = outbound_rx {
                while let Ok(frame) = outbound_rx.try_recv() {
                    core.queue.push_back(frame);
                }
            }

            info!(
                event = "stream_closed",
                session_key = %self.session_key,
                reason = %reason,
                queued = core.queue.len()
            );
            core.state = ConnectionState::Closed;
            core.reconnect.last_error = Some(reason.clone());
            events.push(ConnectionEvent::Closed { reason });
            self.schedule_reconnect(&mut core, &mut events);
        }
        self.emit_all(events);
    }

    /// Puts frames accepted by a session that was shut down back at the
    /// front of the queue, keeping their order.
    fn restore_unsent(&self, outbound_rx: &mut mpsc::UnboundedReceiver<String>) {
        let mut unsent = Vec::new();
        while let Ok(frame) = outbound_rx.try_recv() {
            unsent.push(frame);
        }
        self.lock_core().restore_front(unsent);
    }

    fn handle_frame(&self, epoch: u64, text: &str) {
        if !self.is_current_open(epoch) {
            return;
        }
        if is_heartbeat_ack(text) {
            trace!(event = "stream_heartbeat_ack", session_key = %self.session_key);
            return;
        }

        match InboundMessage::from_text(text) {
            Ok(message) => {
                let handlers = self.handlers_snapshot();
                if !handlers.dispatch(&message) {
                    warn!(
                        event = "stream_message_unrecognized",
                        session_key = %self.session_key,
                        message_type = message.message_type()
                    );
                }
            }
            Err(err) => {
                warn!(
                    event = "stream_frame_malformed",
                    session_key = %self.session_key,
                    error = %err
                );
            }
        }
    }
}

async fn open_socket(url: Url, timeout: Option<Duration>) -> Result<Socket, StreamClientError> {
    let connecting = connect_async(url.to_string());
    let (socket, _) = match timeout {
        Some(limit) => with_timeout(limit, connecting)
            .await
            .map_err(|_| StreamClientError::ConnectTimeout(limit))??,
        None => connecting.await?,
    };
    Ok(socket)
}

async fn run_worker(
    shared: Arc<Shared>,
    epoch: u64,
    url: Url,
    mut shutdown: oneshot::Receiver<()>,
    requeued: Arc<Notify>,
) {
    let connect_timeout = shared.client.options().connect_timeout;
    let opened = tokio::select! {
        _ = &mut shutdown => return,
        opened = open_socket(url, connect_timeout) => opened,
    };

    let socket = match opened {
        Ok(socket) => socket,
        Err(err) => {
            debug!(
                event = "stream_connect_failed",
                session_key = %shared.session_key,
                error = %err
            );
            shared.handle_loss(epoch, err.to_string(), None, None);
            return;
        }
    };

    let (mut sink, mut stream) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
    if !shared.mark_open(epoch, outbound_tx) {
        let _ = sink.close().await;
        return;
    }
    shared.emit(&ConnectionEvent::Opened);

    match run_open_session(
        &shared,
        epoch,
        &mut sink,
        &mut stream,
        &mut outbound_rx,
        &mut shutdown,
        &requeued,
    )
    .await
    {
        SessionEnd::Shutdown => {
            shared.restore_unsent(&mut outbound_rx);
            let _ = sink.close().await;
        }
        SessionEnd::Lost { reason, unsent } => {
            let _ = sink.close().await;
            shared.handle_loss(epoch, reason, unsent, Some(outbound_rx));
        }
    }
}

/// Sends queued frames in order. Stops at the first failed send, which
/// goes back to the head of the queue.
async fn flush_queue(
    shared: &Shared,
    epoch: u64,
    sink: &mut SocketSink,
) -> Result<(), SessionEnd> {
    while let Some(frame) = shared.pop_queued(epoch) {
        if let Err(err) = sink.send(Message::text(frame.clone())).await {
            return Err(SessionEnd::Lost {
                reason: format!("send failed while flushing queue: {err}"),
                unsent: Some(Unsent::Front(frame)),
            });
        }
    }
    Ok(())
}

async fn run_open_session(
    shared: &Arc<Shared>,
    epoch: u64,
    sink: &mut SocketSink,
    stream: &mut SocketStream,
    outbound_rx: &mut mpsc::UnboundedReceiver<String>,
    shutdown: &mut oneshot::Receiver<()>,
    requeued: &Notify,
) -> SessionEnd {
    if let Err(end) = flush_queue(shared, epoch, sink).await {
        return end;
    }

    let options = shared.client.options();
    let mut heartbeat = tokio::time::interval_at(
        Instant::now() + options.heartbeat_interval,
        options.heartbeat_interval,
    );
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let ping = match ClientMessage::Ping.to_text() {
        Ok(ping) => ping,
        Err(err) => {
            return SessionEnd::Lost {
                reason: format!("failed to encode heartbeat: {err}"),
                unsent: None,
            }
        }
    };

    let idle_timeout = options.idle_timeout;
    let idle = tokio::time::sleep(idle_timeout.unwrap_or(options.heartbeat_interval));
    tokio::pin!(idle);

    loop {
        tokio::select! {
            _ = &mut *shutdown => return SessionEnd::Shutdown,
            _ = requeued.notified() => {
                if let Err(end) = flush_queue(shared, epoch, sink).await {
                    return end;
                }
            }
            maybe_outbound = outbound_rx.recv() => {
                let Some(frame) = maybe_outbound else {
                    return SessionEnd::Shutdown;
                };
                if let Err(err) = sink.send(Message::text(frame.clone())).await {
                    return SessionEnd::Lost {
                        reason: format!("send failed: {err}"),
                        unsent: Some(Unsent::Back(frame)),
                    };
                }
            }
            _ = heartbeat.tick() => {
                trace!(event = "stream_heartbeat", session_key = %shared.session_key);
                if let Err(err) = sink.send(Message::text(ping.clone())).await {
                    return SessionEnd::Lost {
                        reason: format!("heartbeat failed: {err}"),
                        unsent: None,
                    };
                }
            }
            _ = &mut idle, if idle_timeout.is_some() => {
                warn!(
                    event = "stream_idle_timeout",
                    session_key = %shared.session_key,
                    idle_ms = idle_timeout.map(|limit| limit.as_millis() as u64)
                );
                shared.mark_closing(epoch);
                return SessionEnd::Lost {
                    reason: "idle timeout".to_string(),
                    unsent: None,
                };
            }
            maybe_inbound = stream.next() => {
                if let Some(limit) = idle_timeout {
                    idle.as_mut().reset(Instant::now() + limit);
                }
                match maybe_inbound {
                    Some(Ok(Message::Text(text))) => shared.handle_frame(epoch, &text),
                    Some(Ok(Message::Ping(payload))) => {
                        if let Err(err) = sink.send(Message::Pong(payload)).await {
                            return SessionEnd::Lost {
                                reason: format!("pong failed: {err}"),
                                unsent: None,
                            };
                        }
                    }
                    Some(Ok(Message::Binary(_))) => {
                        warn!(
                            event = "stream_frame_malformed",
                            session_key = %shared.session_key,
                            error = "binary frame"
                        );
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        return SessionEnd::Lost {
                            reason: "closed by peer".to_string(),
                            unsent: None,
                        };
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        return SessionEnd::Lost {
                            reason: format!("websocket error: {err}"),
                            unsent: None,
                        };
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use serde_json::json;
    use tokio::sync::{mpsc, Notify};

    use super::{ConnectionState, SendOutcome, StreamConnection, Unsent, Worker};
    use crate::credentials::StaticCredentials;
    use crate::retry::RetryPolicy;
    use crate::stream::client::{StreamClient, StreamClientError, StreamOptions};
    use crate::stream::dispatch::ConnectionEvent;

    fn client(reconnect_enabled: bool) -> StreamClient {
        StreamClient::new(Arc::new(StaticCredentials::empty()))
            .with_endpoint("ws://127.0.0.1:9")
            .with_options(StreamOptions {
                reconnect_enabled,
                reconnect_policy: RetryPolicy {
                    max_attempts: 2,
                    base_delay: Duration::from_millis(10),
                    max_delay: Duration::from_millis(20),
                    ..RetryPolicy::reconnect_default()
                },
                ..StreamOptions::default()
            })
            .expect("valid options")
    }

    fn vote(tag: &str) -> serde_json::Value {
        json!({"type":"vote","tag":tag})
    }

    fn queued(connection: &StreamConnection) -> Vec<String> {
        connection.shared.lock_core().queue.iter().cloned().collect()
    }

    /// Puts the connection into `Open` under a fresh epoch, standing in for
    /// a socket worker.
    fn open_session(
        connection: &StreamConnection,
    ) -> (u64, mpsc::UnboundedReceiver<String>, Arc<Notify>) {
        let mut core = connection.shared.lock_core();
        core.epoch += 1;
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let requeued = Arc::new(Notify::new());
        core.worker = Some(Worker {
            outbound: Some(outbound_tx),
            shutdown: None,
            requeued: Arc::clone(&requeued),
        });
        core.state = ConnectionState::Open;
        (core.epoch, outbound_rx, requeued)
    }

    #[test]
    fn idle_connection_queues_sends() {
        let connection = client(false).open("42");
        assert_eq!(connection.state(), ConnectionState::Idle);
        assert_eq!(
            connection.send(&json!({"type":"vote","side":"pro"})).expect("send"),
            SendOutcome::Queued
        );
        assert_eq!(
            connection.send(&json!({"type":"vote","side":"con"})).expect("send"),
            SendOutcome::Queued
        );
        assert_eq!(connection.queued_len(), 2);
    }

    #[tokio::test]
    async fn missing_credential_fails_without_transport() {
        let connection = client(false).open("42");
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        connection.on_lifecycle(move |event| sink.lock().expect("lock").push(event.clone()));

        let error = connection.connect().expect_err("no credential");
        assert!(matches!(error, StreamClientError::MissingCredential));
        assert_eq!(connection.state(), ConnectionState::Closed);
        assert_eq!(
            *events.lock().expect("lock"),
            vec![ConnectionEvent::MissingCredential]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn missing_credential_retries_then_gives_up_once() {
        let connection = client(true).open("42");
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        connection.on_lifecycle(move |event| sink.lock().expect("lock").push(event.clone()));

        assert!(connection.connect().is_err());
        tokio::time::sleep(Duration::from_secs(1)).await;

        let events = events.lock().expect("lock").clone();
        let failed = events
            .iter()
            .filter(|event| matches!(event, ConnectionEvent::ReconnectFailed { .. }))
            .count();
        let scheduled = events
            .iter()
            .filter(|event| matches!(event, ConnectionEvent::ReconnectScheduled { .. }))
            .count();
        assert_eq!(failed, 1);
        assert_eq!(scheduled, 2);
        assert_eq!(connection.reconnect_state().attempt_count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_cancels_pending_reconnect() {
        let connection = client(true).open("42");
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        connection.on_lifecycle(move |event| sink.lock().expect("lock").push(event.clone()));

        assert!(connection.connect().is_err());
        connection.disconnect();
        connection.disconnect();
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(connection.state(), ConnectionState::Closed);
        assert!(connection.is_terminated());
        assert_eq!(connection.reconnect_state().attempt_count, 1);
        assert_eq!(
            *events.lock().expect("lock"),
            vec![
                ConnectionEvent::MissingCredential,
                ConnectionEvent::ReconnectScheduled {
                    attempt: 1,
                    delay: Duration::from_millis(10)
                }
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_resets_the_counter() {
        let connection = client(true).open("42");
        assert!(connection.connect().is_err());
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(connection.reconnect_state().attempt_count, 2);

        assert!(connection.reconnect().is_err());
        assert_eq!(connection.reconnect_state().attempt_count, 1);
    }

    #[tokio::test]
    async fn failed_flush_keeps_the_rest_queued_in_order() {
        let connection = client(false).open("42");
        for tag in ["a", "b", "c"] {
            connection.send(&vote(tag)).expect("send");
        }
        let (epoch, _outbound_rx, _requeued) = open_session(&connection);

        let first = connection.shared.pop_queued(epoch).expect("queued frame");
        connection.shared.handle_loss(
            epoch,
            "send failed while flushing queue".to_string(),
            Some(Unsent::Front(first)),
            None,
        );

        assert_eq!(connection.state(), ConnectionState::Closed);
        assert_eq!(
            queued(&connection),
            vec![
                vote("a").to_string(),
                vote("b").to_string(),
                vote("c").to_string()
            ]
        );
    }

    #[tokio::test]
    async fn frames_of_a_superseded_session_survive_disconnect() {
        let connection = client(false).open("42");
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        connection.on_lifecycle(move |event| sink.lock().expect("lock").push(event.clone()));

        let (epoch, mut outbound_rx, _requeued) = open_session(&connection);
        assert_eq!(connection.send(&vote("x")).expect("send"), SendOutcome::Sent);
        assert_eq!(connection.send(&vote("y")).expect("send"), SendOutcome::Sent);
        let in_flight = outbound_rx.try_recv().expect("x reached the worker");

        // The worker lost its socket but has not reported yet.
        connection.disconnect();
        assert_eq!(connection.send(&vote("z")).expect("send"), SendOutcome::Queued);
        connection.shared.handle_loss(
            epoch,
            "closed by peer".to_string(),
            Some(Unsent::Back(in_flight)),
            Some(outbound_rx),
        );

        assert_eq!(
            queued(&connection),
            vec![
                vote("x").to_string(),
                vote("y").to_string(),
                vote("z").to_string()
            ]
        );
        assert_eq!(
            *events.lock().expect("lock"),
            vec![ConnectionEvent::Closed {
                reason: "disconnected".to_string()
            }]
        );
    }

    #[tokio::test]
    async fn restored_frames_wake_the_live_session_and_go_first() {
        let connection = client(false).open("42");
        let (stale_epoch, mut stale_rx, _) = open_session(&connection);
        connection.send(&vote("old")).expect("send");
        connection.disconnect();

        let (_, _live_rx, live_requeued) = open_session(&connection);
        let mut unsent = Vec::new();
        while let Ok(frame) = stale_rx.try_recv() {
            unsent.push(frame);
        }
        assert_eq!(unsent.len(), 1);
        connection.shared.handle_loss(
            stale_epoch,
            "closed by peer".to_string(),
            Some(Unsent::Back(unsent.remove(0))),
            Some(stale_rx),
        );

        tokio::time::timeout(Duration::from_millis(50), live_requeued.notified())
            .await
            .expect("live session should be woken");
        assert_eq!(connection.state(), ConnectionState::Open);

        assert_eq!(connection.send(&vote("new")).expect("send"), SendOutcome::Sent);
        assert_eq!(
            queued(&connection),
            vec![vote("old").to_string(), vote("new").to_string()]
        );
    }
}
