//! Application error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Channel error: {0}")]
    Channel(#[from] siem_ws::ChannelError),

    #[error("Telemetry error: {0}")]
    Telemetry(#[from] siem_telemetry::TelemetryError),

    #[error("Event channel gave up after {attempts} reconnect attempts ({restarts} restarts)")]
    ChannelExhausted { attempts: u32, restarts: u32 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type AppResult<T> = Result<T, AppError>;
