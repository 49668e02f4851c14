//! Transport session: one attempt to hold a WebSocket connection.
//!
//! A session never reports back through return values. Everything it has to
//! say (opened, message, decode failure, closed) goes to its owner as a
//! [`SessionEvent`] tagged with the generation the owner assigned when it
//! opened the session. Exactly one `Closed` event is emitted per session.

use crate::error::{ChannelError, ChannelResult};
use crate::heartbeat::HeartbeatMonitor;
use crate::message::{decode_binary_frame, decode_frame, encode_payload};
use futures_util::{SinkExt, Stream, StreamExt};
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{connect_async_tls_with_config, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Identity of one session within its channel. Strictly increasing.
pub type Generation = u64;

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Lifecycle event reported by a session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionEvent {
    pub generation: Generation,
    pub kind: SessionEventKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEventKind {
    /// Connection is ready for sending and receiving.
    Opened,
    /// One decoded inbound frame.
    Message(Value),
    /// An inbound frame was not valid JSON and was dropped.
    DecodeFailed(String),
    /// The session ended. `was_clean` is false for network/protocol failures.
    Closed { was_clean: bool, reason: String },
}

/// Sender half a session uses to report events, pre-tagged with its generation.
#[derive(Debug, Clone)]
pub struct EventSink {
    generation: Generation,
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl EventSink {
    pub fn new(generation: Generation, tx: mpsc::UnboundedSender<SessionEvent>) -> Self {
        Self { generation, tx }
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn opened(&self) {
        self.emit(SessionEventKind::Opened);
    }

    pub fn message(&self, message: Value) {
        self.emit(SessionEventKind::Message(message));
    }

    pub fn decode_failed(&self, reason: String) {
        self.emit(SessionEventKind::DecodeFailed(reason));
    }

    pub fn closed(&self, was_clean: bool, reason: String) {
        self.emit(SessionEventKind::Closed { was_clean, reason });
    }

    fn emit(&self, kind: SessionEventKind) {
        // Owner gone means nobody cares about this session any more.
        let _ = self.tx.send(SessionEvent {
            generation: self.generation,
            kind,
        });
    }
}

/// Per-session transport settings.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Inbound silence before a ping is sent. `None` disables heartbeats.
    pub heartbeat_interval: Option<Duration>,
    /// How long a ping may go unanswered.
    pub heartbeat_timeout: Duration,
    /// Upper bound on the closing handshake.
    pub close_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Some(Duration::from_secs(30)),
            heartbeat_timeout: Duration::from_secs(10),
            close_timeout: Duration::from_secs(5),
        }
    }
}

/// Owner-side handle to a running session.
#[derive(Debug)]
pub struct SessionHandle {
    generation: Generation,
    state: Arc<RwLock<SessionState>>,
    outbound_tx: mpsc::UnboundedSender<String>,
    close_token: CancellationToken,
}

impl SessionHandle {
    /// Assemble a handle from its parts. Connectors call this; the session
    /// side keeps the outbound receiver, the state and a clone of the token.
    pub fn new(
        generation: Generation,
        state: Arc<RwLock<SessionState>>,
        outbound_tx: mpsc::UnboundedSender<String>,
        close_token: CancellationToken,
    ) -> Self {
        Self {
            generation,
            state,
            outbound_tx,
            close_token,
        }
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn state(&self) -> SessionState {
        *self.state.read()
    }

    pub fn is_open(&self) -> bool {
        self.state() == SessionState::Open && !self.close_token.is_cancelled()
    }

    /// Serialize and transmit a payload, fire-and-forget.
    ///
    /// # Errors
    ///
    /// - `ChannelError::NotOpen`: session is not open (nothing is written)
    /// - `ChannelError::Encode`: payload could not be serialized
    pub fn send<T: Serialize + ?Sized>(&self, payload: &T) -> ChannelResult<()> {
        if !self.is_open() {
            return Err(ChannelError::NotOpen);
        }
        let text = encode_payload(payload)?;
        self.outbound_tx
            .send(text)
            .map_err(|_| ChannelError::NotOpen)?;
        debug!(generation = self.generation, "Payload queued for sending");
        Ok(())
    }

    /// Request a graceful shutdown. Idempotent.
    pub fn close(&self) {
        if !self.close_token.is_cancelled() {
            debug!(generation = self.generation, "Session close requested");
            self.close_token.cancel();
        }
    }
}

/// Opens transport sessions. The seam between the channel's supervision
/// logic and the network.
pub trait Connector: Send + Sync + 'static {
    /// Begin connecting to `endpoint` without blocking. All further progress
    /// is reported through `events`.
    fn open(&self, endpoint: &str, config: &SessionConfig, events: EventSink) -> SessionHandle;
}

/// WebSocket connector backed by tokio-tungstenite.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

impl Connector for WsConnector {
    fn open(&self, endpoint: &str, config: &SessionConfig, events: EventSink) -> SessionHandle {
        let generation = events.generation();
        let state = Arc::new(RwLock::new(SessionState::Connecting));
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let close_token = CancellationToken::new();

        let task = SessionTask {
            endpoint: endpoint.to_string(),
            config: config.clone(),
            state: state.clone(),
            outbound_rx,
            close_token: close_token.clone(),
            events,
        };
        tokio::spawn(task.run());

        SessionHandle::new(generation, state, outbound_tx, close_token)
    }
}

/// Why the message loop ended without an error.
enum LoopExit {
    /// Close requested locally (or every handle dropped).
    Local,
    /// Peer sent a Close frame with a normal status.
    PeerNormal { code: u16, reason: String },
}

struct SessionTask {
    endpoint: String,
    config: SessionConfig,
    state: Arc<RwLock<SessionState>>,
    outbound_rx: mpsc::UnboundedReceiver<String>,
    close_token: CancellationToken,
    events: EventSink,
}

impl SessionTask {
    async fn run(mut self) {
        let generation = self.events.generation();
        let result = self.drive().await;
        *self.state.write() = SessionState::Closed;

        match result {
            Ok(LoopExit::Local) => {
                info!(generation, "Session closed locally");
                self.events.closed(true, "closed locally".to_string());
            }
            Ok(LoopExit::PeerNormal { code, reason }) => {
                info!(generation, code, %reason, "Session closed by peer");
                self.events
                    .closed(true, format!("peer closed: code={code}, reason={reason}"));
            }
            Err(e) => {
                warn!(generation, error = %e, "Session ended abnormally");
                self.events.closed(false, e.to_string());
            }
        }
    }

    async fn drive(&mut self) -> ChannelResult<LoopExit> {
        let generation = self.events.generation();
        info!(generation, endpoint = %self.endpoint, "Opening transport session");

        // TCP_NODELAY on, default TLS connector.
        let connect = connect_async_tls_with_config(self.endpoint.as_str(), None, true, None);
        let ws_stream = tokio::select! {
            biased;
            () = self.close_token.cancelled() => {
                debug!(generation, "Close requested before connect completed");
                return Ok(LoopExit::Local);
            }
            result = connect => {
                let (ws_stream, _response) =
                    result.map_err(|e| ChannelError::ConnectFailed(e.to_string()))?;
                ws_stream
            }
        };
        let (mut write, mut read) = ws_stream.split();

        *self.state.write() = SessionState::Open;
        info!(generation, "Transport session open");
        self.events.opened();

        let mut heartbeat = self
            .config
            .heartbeat_interval
            .map(|interval| HeartbeatMonitor::new(interval, self.config.heartbeat_timeout));
        let check_period = heartbeat
            .as_ref()
            .map_or(Duration::from_secs(3600), HeartbeatMonitor::check_period);
        let mut heartbeat_check = tokio::time::interval(check_period);
        heartbeat_check.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                () = self.close_token.cancelled() => {
                    *self.state.write() = SessionState::Closing;
                    if let Err(e) = write.send(Message::Close(None)).await {
                        warn!(generation, ?e, "Failed to send Close frame");
                        return Ok(LoopExit::Local);
                    }
                    await_close_echo(&mut read, self.config.close_timeout).await;
                    return Ok(LoopExit::Local);
                }

                msg = read.next() => {
                    if let Some(hb) = heartbeat.as_mut() {
                        hb.record_inbound();
                    }
                    match msg {
                        Some(Ok(Message::Text(text))) => match decode_frame(&text) {
                            Ok(value) => self.events.message(value),
                            Err(e) => {
                                warn!(generation, error = %e, "Dropping undecodable text frame");
                                self.events.decode_failed(e.to_string());
                            }
                        },
                        Some(Ok(Message::Binary(data))) => match decode_binary_frame(&data) {
                            Ok(value) => self.events.message(value),
                            Err(e) => {
                                warn!(generation, error = %e, "Dropping undecodable binary frame");
                                self.events.decode_failed(e.to_string());
                            }
                        },
                        Some(Ok(Message::Ping(data))) => {
                            debug!(generation, "Received ping, sending pong");
                            write.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Pong(_))) => {
                            debug!(generation, "Received pong");
                        }
                        Some(Ok(Message::Close(frame))) => {
                            let (code, reason) = frame
                                .map(|f| (u16::from(f.code), f.reason.to_string()))
                                .unwrap_or((u16::from(CloseCode::Normal), "Normal close".to_string()));
                            // Flush the automatic close reply.
                            let _ = write.close().await;
                            if code == u16::from(CloseCode::Normal) {
                                return Ok(LoopExit::PeerNormal { code, reason });
                            }
                            return Err(ChannelError::AbnormalClose { code, reason });
                        }
                        Some(Ok(Message::Frame(_))) => {}
                        Some(Err(e)) => {
                            return Err(e.into());
                        }
                        None => {
                            return Err(ChannelError::AbnormalClose {
                                code: u16::from(CloseCode::Abnormal),
                                reason: "Stream ended without close frame".to_string(),
                            });
                        }
                    }
                }

                outbound = self.outbound_rx.recv() => {
                    match outbound {
                        Some(text) => {
                            write.send(Message::Text(text)).await?;
                        }
                        None => {
                            // Every handle dropped: nobody owns this session any more.
                            *self.state.write() = SessionState::Closing;
                            let _ = write.send(Message::Close(None)).await;
                            await_close_echo(&mut read, self.config.close_timeout).await;
                            return Ok(LoopExit::Local);
                        }
                    }
                }

                _ = heartbeat_check.tick(), if heartbeat.is_some() => {
                    if let Some(hb) = heartbeat.as_mut() {
                        if hb.is_timed_out() {
                            warn!(generation, stats = ?hb.stats(), "Heartbeat timeout");
                            return Err(ChannelError::HeartbeatTimeout);
                        }
                        if hb.should_send_ping() {
                            write.send(Message::Ping(Vec::new())).await?;
                            hb.record_ping();
                            debug!(generation, "Sent heartbeat ping");
                        }
                    }
                }
            }
        }
    }
}

/// Read until the peer echoes our Close frame, the stream ends, or the
/// timeout elapses.
async fn await_close_echo<S>(read: &mut S, close_timeout: Duration)
where
    S: Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    let echoed = tokio::time::timeout(close_timeout, async {
        while let Some(msg) = read.next().await {
            match msg {
                Ok(Message::Close(_)) | Err(_) => break,
                Ok(_) => {}
            }
        }
    })
    .await;
    if echoed.is_err() {
        debug!("Peer did not complete closing handshake in time");
    }
}
