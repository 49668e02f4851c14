//! Inbound/outbound payload handling.
//!
//! Frames are JSON text. The channel only turns a frame into a generic
//! [`serde_json::Value`]; what the value means is up to the handler.

use crate::error::{ChannelError, ChannelResult};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::marker::PhantomData;
use tracing::warn;

/// Consumer callback for decoded inbound messages.
///
/// Called once per message, in receipt order, never concurrently with itself.
pub trait MessageHandler: Send + 'static {
    fn on_message(&mut self, message: Value);
}

impl<F> MessageHandler for F
where
    F: FnMut(Value) + Send + 'static,
{
    fn on_message(&mut self, message: Value) {
        self(message)
    }
}

/// Handler that decodes each message into `T` before calling `f`.
///
/// Messages that do not fit `T` are logged and dropped.
pub struct TypedHandler<T, F> {
    f: F,
    _payload: PhantomData<fn() -> T>,
}

/// Wrap a closure taking a concrete payload type as a [`MessageHandler`].
pub fn typed_handler<T, F>(f: F) -> TypedHandler<T, F>
where
    T: DeserializeOwned + 'static,
    F: FnMut(T) + Send + 'static,
{
    TypedHandler {
        f,
        _payload: PhantomData,
    }
}

impl<T, F> MessageHandler for TypedHandler<T, F>
where
    T: DeserializeOwned + 'static,
    F: FnMut(T) + Send + 'static,
{
    fn on_message(&mut self, message: Value) {
        match serde_json::from_value::<T>(message) {
            Ok(payload) => (self.f)(payload),
            Err(e) => {
                warn!(error = %e, payload_type = std::any::type_name::<T>(), "Message does not match handler payload type, dropped");
            }
        }
    }
}

/// Parse a text frame.
pub fn decode_frame(text: &str) -> ChannelResult<Value> {
    serde_json::from_str(text).map_err(|e| ChannelError::Decode(e.to_string()))
}

/// Parse a binary frame holding UTF-8 JSON.
pub fn decode_binary_frame(data: &[u8]) -> ChannelResult<Value> {
    serde_json::from_slice(data).map_err(|e| ChannelError::Decode(e.to_string()))
}

/// Serialize an outbound payload into a text frame.
pub fn encode_payload<T: Serialize + ?Sized>(payload: &T) -> ChannelResult<String> {
    serde_json::to_string(payload).map_err(|e| ChannelError::Encode(e.to_string()))
}
