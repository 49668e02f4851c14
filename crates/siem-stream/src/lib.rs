//! Headless consumer for the SIEM live event stream.
//!
//! Orchestrates:
//! - Configuration loading
//! - One resilient event channel to the backend's stream endpoint
//! - Decoding, logging and counting of alert, log and metric events
//! - Restart after the channel exhausts its retry budget

pub mod app;
pub mod config;
pub mod error;
pub mod event;
pub mod router;

pub use app::Application;
pub use config::AppConfig;
pub use error::{AppError, AppResult};
pub use event::{Inbound, Severity, StreamEvent};
pub use router::{EventRouter, StreamStats, StreamSummary};
