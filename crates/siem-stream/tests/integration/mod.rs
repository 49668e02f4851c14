//! Integration tests for siem-stream.
//!
//! These tests run the application against an in-process stream server:
//! - Event routing into totals
//! - Exit and restart after retry exhaustion

pub mod common;
