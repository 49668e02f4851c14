//! Prometheus metrics and structured logging for the SIEM live stream.
//!
//! - Event channel state, reconnects and retry exhaustion
//! - Stream events by type and alerts by severity
//! - Structured JSON logging with tracing

pub mod error;
pub mod logging;
pub mod metrics;

pub use error::{TelemetryError, TelemetryResult};
pub use logging::init_logging;
pub use metrics::Metrics;
