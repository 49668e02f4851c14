//! Event channel error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChannelError {
    /// `send` was called while the channel or session was not open.
    #[error("Channel is not open")]
    NotOpen,

    #[error("Connection failed: {0}")]
    ConnectFailed(String),

    #[error("Connection closed abnormally: code={code}, reason={reason}")]
    AbnormalClose { code: u16, reason: String },

    #[error("Frame decode error: {0}")]
    Decode(String),

    #[error("Payload encode error: {0}")]
    Encode(String),

    #[error("Heartbeat timeout")]
    HeartbeatTimeout,

    #[error("No tokio runtime available to drive the channel")]
    NoRuntime,

    #[error("Tungstenite error: {0}")]
    Tungstenite(#[from] tokio_tungstenite::tungstenite::Error),
}

pub type ChannelResult<T> = Result<T, ChannelError>;
