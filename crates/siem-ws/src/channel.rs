//! Resilient event channel.
//!
//! Wraps one logical real-time connection. A single driver task owns the
//! supervision state machine, the current session and the reconnect timer,
//! and processes commands, session events and timer expiry strictly one at
//! a time. The public handle only reads snapshots and posts commands.

use crate::backoff::BackoffPolicy;
use crate::error::{ChannelError, ChannelResult};
use crate::message::MessageHandler;
use crate::session::{
    Connector, EventSink, Generation, SessionConfig, SessionEvent, SessionEventKind,
    SessionHandle, WsConnector,
};
use crate::supervisor::{Action, ChannelState, Supervisor};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Capacity of the notification broadcast buffer.
const NOTIFICATION_CAPACITY: usize = 256;

/// Channel options.
#[derive(Debug, Clone)]
pub struct ChannelOptions {
    /// Maximum reconnect attempts after an abnormal close.
    pub max_attempts: u32,
    /// Delay before the first reconnect attempt; doubles per attempt.
    pub base_delay: Duration,
    /// Inbound silence before a heartbeat ping. `None` disables heartbeats.
    pub heartbeat_interval: Option<Duration>,
    /// How long a heartbeat ping may go unanswered.
    pub heartbeat_timeout: Duration,
    /// Upper bound on the closing handshake.
    pub close_timeout: Duration,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(1000),
            heartbeat_interval: Some(Duration::from_secs(30)),
            heartbeat_timeout: Duration::from_secs(10),
            close_timeout: Duration::from_secs(5),
        }
    }
}

impl ChannelOptions {
    fn session_config(&self) -> SessionConfig {
        SessionConfig {
            heartbeat_interval: self.heartbeat_interval,
            heartbeat_timeout: self.heartbeat_timeout,
            close_timeout: self.close_timeout,
        }
    }
}

/// Lifecycle notification for the channel's owner.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelNotification {
    StateChanged {
        from: ChannelState,
        to: ChannelState,
    },
    ReconnectScheduled {
        attempt: u32,
        delay: Duration,
    },
    /// Terminal: the channel will not reconnect until `connect` is called.
    RetriesExhausted {
        attempts: u32,
    },
    /// An inbound frame was dropped because it was not valid JSON.
    DecodeFailed {
        reason: String,
    },
}

enum Command {
    Connect(Box<dyn MessageHandler>),
    Disconnect,
}

/// Snapshot shared between the driver and the public handle.
struct ChannelShared {
    state: RwLock<ChannelState>,
    retry_count: RwLock<u32>,
    generation: RwLock<Generation>,
    session: RwLock<Option<SessionHandle>>,
}

/// Auto-reconnecting channel over one logical connection.
pub struct ResilientChannel {
    endpoint: String,
    options: ChannelOptions,
    connector: Arc<dyn Connector>,
    shared: Arc<ChannelShared>,
    notifications: broadcast::Sender<ChannelNotification>,
    /// Command queue of the driver task, spawned on first `connect`.
    commands: Mutex<Option<mpsc::UnboundedSender<Command>>>,
    /// Cancelled on drop; stops the driver.
    shutdown_token: CancellationToken,
}

impl ResilientChannel {
    /// Create an idle channel for `endpoint` using WebSocket transport.
    pub fn new(endpoint: impl Into<String>, options: ChannelOptions) -> Self {
        Self::with_connector(endpoint, options, Arc::new(WsConnector))
    }

    /// Create an idle channel with a custom transport.
    pub fn with_connector(
        endpoint: impl Into<String>,
        options: ChannelOptions,
        connector: Arc<dyn Connector>,
    ) -> Self {
        let (notifications, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        Self {
            endpoint: endpoint.into(),
            options,
            connector,
            shared: Arc::new(ChannelShared {
                state: RwLock::new(ChannelState::Idle),
                retry_count: RwLock::new(0),
                generation: RwLock::new(0),
                session: RwLock::new(None),
            }),
            notifications,
            commands: Mutex::new(None),
            shutdown_token: CancellationToken::new(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn options(&self) -> &ChannelOptions {
        &self.options
    }

    pub fn state(&self) -> ChannelState {
        *self.shared.state.read()
    }

    pub fn retry_count(&self) -> u32 {
        *self.shared.retry_count.read()
    }

    /// Generation of the most recently opened session (0 before the first).
    pub fn generation(&self) -> Generation {
        *self.shared.generation.read()
    }

    /// Subscribe to lifecycle notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<ChannelNotification> {
        self.notifications.subscribe()
    }

    /// Start connecting and register `handler` for inbound messages.
    ///
    /// Returns immediately. Has no effect on the connection if the channel is
    /// already connecting or open, but `handler` still replaces the previous
    /// one for messages processed from now on. Must be called from within a
    /// tokio runtime.
    pub fn connect<H: MessageHandler>(&self, handler: H) -> ChannelResult<()> {
        let commands = self.command_sender()?;
        commands
            .send(Command::Connect(Box::new(handler)))
            .map_err(|_| ChannelError::NoRuntime)
    }

    /// Stop the channel: cancel any pending reconnect, close the current
    /// session and end in `Closed`. The channel never reconnects on its own
    /// afterwards.
    pub fn disconnect(&self) {
        let commands = self.commands.lock().clone();
        match commands {
            Some(tx) if tx.send(Command::Disconnect).is_ok() => {}
            _ => {
                // No driver: nothing to close or cancel.
                let from = std::mem::replace(&mut *self.shared.state.write(), ChannelState::Closed);
                if from != ChannelState::Closed {
                    info!(endpoint = %self.endpoint, %from, "Channel closed");
                    let _ = self.notifications.send(ChannelNotification::StateChanged {
                        from,
                        to: ChannelState::Closed,
                    });
                }
            }
        }
    }

    /// Serialize and send `payload` on the current session.
    ///
    /// # Errors
    ///
    /// - `ChannelError::NotOpen`: channel is not `Open`; nothing is sent
    /// - `ChannelError::Encode`: payload could not be serialized
    pub fn send<T: Serialize + ?Sized>(&self, payload: &T) -> ChannelResult<()> {
        if self.state() != ChannelState::Open {
            return Err(ChannelError::NotOpen);
        }
        match self.shared.session.read().as_ref() {
            Some(session) => session.send(payload),
            None => Err(ChannelError::NotOpen),
        }
    }

    fn command_sender(&self) -> ChannelResult<mpsc::UnboundedSender<Command>> {
        let mut guard = self.commands.lock();
        if let Some(tx) = guard.as_ref().filter(|tx| !tx.is_closed()) {
            return Ok(tx.clone());
        }

        let runtime = tokio::runtime::Handle::try_current().map_err(|_| ChannelError::NoRuntime)?;
        let (tx, rx) = mpsc::unbounded_channel();
        let driver = ChannelDriver::new(
            self.endpoint.clone(),
            &self.options,
            self.connector.clone(),
            self.shared.clone(),
            self.notifications.clone(),
            self.shutdown_token.clone(),
        );
        runtime.spawn(driver.run(rx));
        debug!(endpoint = %self.endpoint, "Channel driver started");

        *guard = Some(tx.clone());
        Ok(tx)
    }
}

impl Drop for ResilientChannel {
    fn drop(&mut self) {
        self.shutdown_token.cancel();
    }
}

impl std::fmt::Debug for ResilientChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilientChannel")
            .field("endpoint", &self.endpoint)
            .field("state", &self.state())
            .field("retry_count", &self.retry_count())
            .field("generation", &self.generation())
            .finish()
    }
}

/// Task that owns all mutable supervision state.
struct ChannelDriver {
    endpoint: String,
    session_config: SessionConfig,
    connector: Arc<dyn Connector>,
    supervisor: Supervisor,
    handler: Option<Box<dyn MessageHandler>>,
    shared: Arc<ChannelShared>,
    notifications: broadcast::Sender<ChannelNotification>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    events_rx: mpsc::UnboundedReceiver<SessionEvent>,
    reconnect_timer: Pin<Box<Sleep>>,
    shutdown_token: CancellationToken,
}

impl ChannelDriver {
    fn new(
        endpoint: String,
        options: &ChannelOptions,
        connector: Arc<dyn Connector>,
        shared: Arc<ChannelShared>,
        notifications: broadcast::Sender<ChannelNotification>,
        shutdown_token: CancellationToken,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            endpoint,
            session_config: options.session_config(),
            connector,
            supervisor: Supervisor::new(
                options.max_attempts,
                BackoffPolicy::new(options.base_delay),
            ),
            handler: None,
            shared,
            notifications,
            events_tx,
            events_rx,
            reconnect_timer: Box::pin(tokio::time::sleep(Duration::ZERO)),
            shutdown_token,
        }
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        loop {
            tokio::select! {
                biased;

                () = self.shutdown_token.cancelled() => {
                    debug!(endpoint = %self.endpoint, "Channel dropped, stopping driver");
                    break;
                }

                command = commands.recv() => match command {
                    Some(Command::Connect(handler)) => {
                        self.handler = Some(handler);
                        let actions = self.supervisor.connect();
                        self.apply(actions);
                    }
                    Some(Command::Disconnect) => {
                        info!(endpoint = %self.endpoint, "Disconnect requested");
                        let actions = self.supervisor.disconnect();
                        self.apply(actions);
                    }
                    None => break,
                },

                Some(event) = self.events_rx.recv() => {
                    self.handle_event(event);
                }

                () = &mut self.reconnect_timer, if self.supervisor.reconnect_pending() => {
                    let actions = self.supervisor.on_reconnect_timer();
                    self.apply(actions);
                }
            }
        }

        let actions = self.supervisor.disconnect();
        self.apply(actions);
    }

    fn handle_event(&mut self, event: SessionEvent) {
        let SessionEvent { generation, kind } = event;
        if !self.supervisor.is_current(generation) {
            debug!(
                generation,
                current = self.supervisor.generation(),
                "Ignoring event from superseded session"
            );
            return;
        }

        match kind {
            SessionEventKind::Opened => {
                let actions = self.supervisor.on_open(generation);
                self.apply(actions);
            }
            SessionEventKind::Message(message) => {
                if !self.supervisor.accepts_messages(generation) {
                    debug!(generation, state = %self.supervisor.state(), "Dropping message outside Open state");
                    return;
                }
                if let Some(handler) = self.handler.as_mut() {
                    handler.on_message(message);
                }
            }
            SessionEventKind::DecodeFailed(reason) => {
                let _ = self
                    .notifications
                    .send(ChannelNotification::DecodeFailed { reason });
            }
            SessionEventKind::Closed { was_clean, reason } => {
                debug!(generation, was_clean, %reason, "Session closed");
                let actions = self.supervisor.on_close(generation, was_clean);
                self.release_session(generation);
                self.apply(actions);
            }
        }
    }

    fn apply(&mut self, actions: Vec<Action>) {
        // Announced only after the snapshot reflects every action.
        let mut announcements = Vec::new();
        for action in actions {
            match action {
                Action::OpenSession { generation } => {
                    let sink = EventSink::new(generation, self.events_tx.clone());
                    let session = self
                        .connector
                        .open(&self.endpoint, &self.session_config, sink);
                    *self.shared.session.write() = Some(session);
                }
                Action::CloseSession { generation } => {
                    if let Some(session) = self
                        .shared
                        .session
                        .read()
                        .as_ref()
                        .filter(|s| s.generation() == generation)
                    {
                        session.close();
                    }
                }
                Action::ScheduleReconnect { attempt, delay } => {
                    self.reconnect_timer = Box::pin(tokio::time::sleep(delay));
                    warn!(
                        endpoint = %self.endpoint,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Reconnecting"
                    );
                    announcements.push(ChannelNotification::ReconnectScheduled { attempt, delay });
                }
                Action::CancelReconnect => {
                    debug!(endpoint = %self.endpoint, "Pending reconnect cancelled");
                }
                Action::RetriesExhausted { attempts } => {
                    error!(endpoint = %self.endpoint, attempts, "Max reconnection attempts reached");
                    announcements.push(ChannelNotification::RetriesExhausted { attempts });
                }
            }
        }
        self.publish();
        for notification in announcements {
            let _ = self.notifications.send(notification);
        }
    }

    fn release_session(&mut self, generation: Generation) {
        let mut session = self.shared.session.write();
        if session.as_ref().is_some_and(|s| s.generation() == generation) {
            *session = None;
        }
    }

    /// Copy supervisor state into the shared snapshot.
    fn publish(&self) {
        let to = self.supervisor.state();
        let from = std::mem::replace(&mut *self.shared.state.write(), to);
        *self.shared.retry_count.write() = self.supervisor.retry_count();
        *self.shared.generation.write() = self.supervisor.generation();

        if from != to {
            info!(
                endpoint = %self.endpoint,
                %from,
                %to,
                generation = self.supervisor.generation(),
                retry_count = self.supervisor.retry_count(),
                "Channel state changed"
            );
            let _ = self
                .notifications
                .send(ChannelNotification::StateChanged { from, to });
        }
    }
}
