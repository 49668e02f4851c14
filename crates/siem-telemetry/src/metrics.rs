//! Prometheus metrics for the SIEM live stream.
//!
//! Covers:
//! - Event channel state and connectivity
//! - Reconnect scheduling and retry exhaustion
//! - Frame and event decode failures
//! - Stream events by type and alerts by severity
//!
//! # Panics
//!
//! Metric registration uses `unwrap()`. A registration failure means duplicate
//! metric names, which is a startup bug. These panics only occur during static
//! initialization, never while recording.

use crate::error::TelemetryResult;
use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_gauge, register_gauge_vec, register_histogram,
    register_int_counter, CounterVec, Encoder, Gauge, GaugeVec, Histogram, IntCounter,
    TextEncoder,
};

/// Channel states exported on `siem_channel_state`.
pub const CHANNEL_STATES: [&str; 6] = [
    "idle",
    "connecting",
    "open",
    "reconnecting",
    "closing",
    "closed",
];

/// Event channel connectivity (1 = open).
pub static CHANNEL_CONNECTED: Lazy<Gauge> = Lazy::new(|| {
    register_gauge!(
        "siem_channel_connected",
        "Event channel connectivity (1=open)"
    )
    .unwrap()
});

/// Event channel lifecycle state.
/// Labels: state (idle/connecting/open/reconnecting/closing/closed)
pub static CHANNEL_STATE: Lazy<GaugeVec> = Lazy::new(|| {
    register_gauge_vec!(
        "siem_channel_state",
        "Event channel current state (1=active, 0=inactive)",
        &["state"]
    )
    .unwrap()
});

/// Total reconnect attempts scheduled.
pub static RECONNECT_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "siem_channel_reconnects_total",
        "Total reconnect attempts scheduled"
    )
    .unwrap()
});

/// Scheduled reconnect delay in milliseconds.
pub static RECONNECT_DELAY_MS: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "siem_channel_reconnect_delay_ms",
        "Scheduled reconnect delay in milliseconds",
        vec![100.0, 500.0, 1000.0, 2000.0, 4000.0, 8000.0, 16000.0, 32000.0, 64000.0]
    )
    .unwrap()
});

/// Times the channel gave up after exhausting its retry budget.
pub static RETRIES_EXHAUSTED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "siem_channel_retries_exhausted_total",
        "Times the event channel exhausted its retry budget"
    )
    .unwrap()
});

/// Decode failures.
/// Labels: stage (frame = not JSON, event = JSON but not a stream event)
pub static DECODE_FAILURES_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "siem_decode_failures_total",
        "Total inbound payloads that failed to decode",
        &["stage"]
    )
    .unwrap()
});

/// Stream events received.
/// Labels: type (alert/log/metric/unknown)
pub static EVENTS_RECEIVED_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "siem_events_received_total",
        "Total stream events received by type",
        &["type"]
    )
    .unwrap()
});

/// Alerts received.
/// Labels: severity (critical/high/medium/low/info)
pub static ALERTS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "siem_alerts_total",
        "Total alerts received by severity",
        &["severity"]
    )
    .unwrap()
});

/// Channel restarts performed by the application after retry exhaustion.
pub static APP_RESTARTS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "siem_app_restarts_total",
        "Event channel restarts after retry exhaustion"
    )
    .unwrap()
});

/// Metrics helper.
pub struct Metrics;

impl Metrics {
    /// Set the channel state. Only the active state is 1.
    pub fn channel_state_set(state: &str) {
        for s in CHANNEL_STATES {
            CHANNEL_STATE.with_label_values(&[s]).set(0.0);
        }
        CHANNEL_STATE.with_label_values(&[state]).set(1.0);
        CHANNEL_CONNECTED.set(if state == "open" { 1.0 } else { 0.0 });
    }

    /// Record a scheduled reconnect.
    pub fn reconnect_scheduled(delay_ms: f64) {
        RECONNECT_TOTAL.inc();
        RECONNECT_DELAY_MS.observe(delay_ms);
    }

    pub fn retries_exhausted() {
        RETRIES_EXHAUSTED_TOTAL.inc();
    }

    /// Record a payload that was not valid JSON.
    pub fn frame_decode_failed() {
        DECODE_FAILURES_TOTAL.with_label_values(&["frame"]).inc();
    }

    /// Record valid JSON that did not map to a stream event.
    pub fn event_decode_failed() {
        DECODE_FAILURES_TOTAL.with_label_values(&["event"]).inc();
    }

    pub fn event_received(event_type: &str) {
        EVENTS_RECEIVED_TOTAL.with_label_values(&[event_type]).inc();
    }

    pub fn alert_received(severity: &str) {
        ALERTS_TOTAL.with_label_values(&[severity]).inc();
    }

    pub fn app_restarted() {
        APP_RESTARTS_TOTAL.inc();
    }

    /// Render every registered metric in the Prometheus text format.
    pub fn gather_text() -> TelemetryResult<String> {
        let encoder = TextEncoder::new();
        let mut buf = Vec::new();
        encoder.encode(&prometheus::gather(), &mut buf)?;
        String::from_utf8(buf).map_err(|e| crate::TelemetryError::Metrics(e.to_string()))
    }
}
