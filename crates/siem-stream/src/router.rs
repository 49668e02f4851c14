//! Routing of decoded stream events to logs, metrics and running totals.

use crate::event::{Inbound, Severity, StreamEvent};
use parking_lot::Mutex;
use serde_json::Value;
use siem_telemetry::Metrics;
use siem_ws::MessageHandler;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Running totals for the lifetime of the application.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamSummary {
    pub alerts: u64,
    pub logs: u64,
    pub metrics: u64,
    pub unrecognized: u64,
    pub decode_failures: u64,
    pub reconnects: u64,
    pub restarts: u32,
    pub alerts_by_severity: BTreeMap<&'static str, u64>,
}

impl StreamSummary {
    pub fn events(&self) -> u64 {
        self.alerts + self.logs + self.metrics
    }
}

/// Shared, thread-safe view of the running totals.
#[derive(Debug, Clone, Default)]
pub struct StreamStats {
    inner: Arc<Mutex<StreamSummary>>,
}

impl StreamStats {
    pub fn snapshot(&self) -> StreamSummary {
        self.inner.lock().clone()
    }

    pub(crate) fn update(&self, f: impl FnOnce(&mut StreamSummary)) {
        f(&mut self.inner.lock());
    }
}

/// Message handler that classifies each payload and records it.
#[derive(Debug, Clone)]
pub struct EventRouter {
    min_severity: Severity,
    stats: StreamStats,
}

impl EventRouter {
    pub fn new(min_severity: Severity, stats: StreamStats) -> Self {
        Self {
            min_severity,
            stats,
        }
    }

    pub fn route(&self, value: Value) {
        match Inbound::classify(value) {
            Inbound::Event(event) => self.record(event),
            Inbound::Unrecognized {
                type_tag, reason, ..
            } => {
                Metrics::event_received("unknown");
                Metrics::event_decode_failed();
                self.stats.update(|s| s.unrecognized += 1);
                warn!(type_tag = ?type_tag, %reason, "Unrecognized stream payload");
            }
        }
    }

    fn record(&self, event: StreamEvent) {
        Metrics::event_received(event.type_name());

        match event {
            StreamEvent::Alert(alert) => {
                Metrics::alert_received(alert.severity.as_str());
                self.stats.update(|s| {
                    s.alerts += 1;
                    *s.alerts_by_severity
                        .entry(alert.severity.as_str())
                        .or_default() += 1;
                });

                if !alert.severity.is_at_least(self.min_severity) {
                    debug!(id = %alert.id, severity = %alert.severity, title = %alert.title, "Alert");
                } else if alert.severity.is_at_least(Severity::High) {
                    error!(
                        id = %alert.id,
                        severity = %alert.severity,
                        source = ?alert.source,
                        source_ip = ?alert.source_ip,
                        title = %alert.title,
                        "Alert"
                    );
                } else {
                    warn!(
                        id = %alert.id,
                        severity = %alert.severity,
                        source = ?alert.source,
                        title = %alert.title,
                        "Alert"
                    );
                }
            }
            StreamEvent::Log(log) => {
                self.stats.update(|s| s.logs += 1);
                debug!(level = ?log.level, source = %log.source, host = ?log.host, message = %log.message, "Log");
            }
            StreamEvent::Metric(metric) => {
                self.stats.update(|s| s.metrics += 1);
                debug!(name = %metric.name, value = metric.value, labels = ?metric.labels, "Metric");
            }
        }
    }
}

impl MessageHandler for EventRouter {
    fn on_message(&mut self, message: Value) {
        self.route(message);
    }
}

/// Log the running totals.
pub fn log_summary(summary: &StreamSummary, label: &str) {
    info!(
        events = summary.events(),
        alerts = summary.alerts,
        logs = summary.logs,
        metrics = summary.metrics,
        unrecognized = summary.unrecognized,
        decode_failures = summary.decode_failures,
        reconnects = summary.reconnects,
        restarts = summary.restarts,
        by_severity = ?summary.alerts_by_severity,
        "{label}"
    );
}
