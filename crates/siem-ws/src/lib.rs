//! Resilient real-time event channel for the SIEM live stream.
//!
//! Provides a single auto-reconnecting WebSocket channel with:
//! - Exponential backoff reconnection (base * 2^(n-1), bounded attempt count)
//! - Session generations so late events from superseded connections are ignored
//! - Heartbeat liveness checks (ping on silence, abnormal close on timeout)
//! - JSON frame decoding with per-frame decode failures that never close the channel
//! - Lifecycle notifications (state changes, reconnect schedule, retries exhausted)

pub mod backoff;
pub mod channel;
pub mod error;
pub mod heartbeat;
pub mod message;
pub mod session;
pub mod supervisor;

pub use backoff::BackoffPolicy;
pub use channel::{ChannelNotification, ChannelOptions, ResilientChannel};
pub use error::{ChannelError, ChannelResult};
pub use message::{typed_handler, MessageHandler, TypedHandler};
pub use session::{
    Connector, EventSink, Generation, SessionConfig, SessionEvent, SessionEventKind,
    SessionHandle, SessionState, WsConnector,
};
pub use supervisor::ChannelState;

use std::sync::Once;

static INIT_CRYPTO: Once = Once::new();

/// Initialize the TLS crypto provider.
/// Must be called before any `wss://` connections are made.
pub fn init_crypto() {
    INIT_CRYPTO.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}
