//! Heartbeat tracking for a single transport session.
//!
//! Any inbound frame counts as proof of life. A ping is only sent after a
//! full interval of inbound silence, and the session is declared dead if
//! nothing at all arrives within the timeout of that ping.

use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Heartbeat monitor owned by one session task.
#[derive(Debug)]
pub struct HeartbeatMonitor {
    /// Inbound silence that triggers a ping.
    interval: Duration,
    /// How long to wait for any frame after a ping.
    timeout: Duration,
    /// Last inbound frame of any kind.
    last_inbound: Instant,
    /// Outstanding ping, if any.
    ping_sent_at: Option<Instant>,
}

impl HeartbeatMonitor {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self {
            interval,
            timeout,
            last_inbound: Instant::now(),
            ping_sent_at: None,
        }
    }

    /// How often the owner should call [`Self::is_timed_out`] and
    /// [`Self::should_send_ping`].
    pub fn check_period(&self) -> Duration {
        (self.interval.min(self.timeout) / 2).max(Duration::from_millis(10))
    }

    /// Record that a frame arrived.
    pub fn record_inbound(&mut self) {
        let now = Instant::now();
        if let Some(ping_time) = self.ping_sent_at.take() {
            let rtt_ms = now.duration_since(ping_time).as_millis();
            debug!(rtt_ms, "Inbound frame after ping");
        }
        self.last_inbound = now;
    }

    /// Record that a ping was sent.
    pub fn record_ping(&mut self) {
        self.ping_sent_at = Some(Instant::now());
    }

    pub fn is_timed_out(&self) -> bool {
        self.ping_sent_at
            .is_some_and(|sent| sent.elapsed() > self.timeout)
    }

    pub fn should_send_ping(&self) -> bool {
        self.ping_sent_at.is_none() && self.last_inbound.elapsed() >= self.interval
    }

    pub fn stats(&self) -> HeartbeatStats {
        HeartbeatStats {
            silence_ms: self.last_inbound.elapsed().as_millis() as u64,
            waiting_for_pong: self.ping_sent_at.is_some(),
        }
    }
}

/// Heartbeat statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatStats {
    pub silence_ms: u64,
    pub waiting_for_pong: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_initial_state() {
        let hb = HeartbeatMonitor::new(Duration::from_secs(30), Duration::from_secs(10));
        assert!(!hb.is_timed_out());
        assert!(!hb.should_send_ping());
        assert!(!hb.stats().waiting_for_pong);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ping_after_silence() {
        let hb = HeartbeatMonitor::new(Duration::from_secs(30), Duration::from_secs(10));
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(hb.should_send_ping());
    }

    #[tokio::test(start_paused = true)]
    async fn test_inbound_clears_outstanding_ping() {
        let mut hb = HeartbeatMonitor::new(Duration::from_secs(30), Duration::from_secs(10));
        tokio::time::advance(Duration::from_secs(30)).await;
        hb.record_ping();
        assert!(!hb.should_send_ping());
        assert!(hb.stats().waiting_for_pong);

        hb.record_inbound();
        assert!(!hb.stats().waiting_for_pong);
        assert!(!hb.is_timed_out());
    }

    #[tokio::test(start_paused = true)]
    async fn test_times_out_without_inbound() {
        let mut hb = HeartbeatMonitor::new(Duration::from_secs(30), Duration::from_secs(10));
        hb.record_ping();
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(!hb.is_timed_out());
        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(hb.is_timed_out());
    }

    #[test]
    fn test_check_period() {
        let hb = HeartbeatMonitor::new(Duration::from_secs(30), Duration::from_secs(10));
        assert_eq!(hb.check_period(), Duration::from_secs(5));
    }
}
