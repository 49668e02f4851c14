//! Reconnection supervision state machine.
//!
//! Pure bookkeeping: every input (connect, disconnect, session opened,
//! session closed, reconnect timer fired) updates the state and returns the
//! side effects the driver must perform. No I/O and no clocks live here.
//!
//! ```text
//!   Idle --connect--> Connecting --opened--> Open
//!                        ^                    |
//!                        |              abnormal close
//!                  timer fired                |
//!                        |                    v
//!                        +--------------- Reconnecting
//!
//!   abnormal close with budget spent  -> Closed (retries exhausted)
//!   clean close                        -> Closed
//!   disconnect with a live session     -> Closing -> Closed
//! ```

use crate::backoff::BackoffPolicy;
use crate::session::Generation;
use std::time::Duration;

/// Externally visible channel state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelState {
    Idle,
    Connecting,
    Open,
    Reconnecting,
    Closing,
    Closed,
}

impl ChannelState {
    pub const ALL: [ChannelState; 6] = [
        Self::Idle,
        Self::Connecting,
        Self::Open,
        Self::Reconnecting,
        Self::Closing,
        Self::Closed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Reconnecting => "reconnecting",
            Self::Closing => "closing",
            Self::Closed => "closed",
        }
    }
}

impl std::fmt::Display for ChannelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Side effect requested by a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Open a new session tagged with `generation`. It becomes the current one.
    OpenSession { generation: Generation },
    /// Ask the session tagged with `generation` to close gracefully.
    CloseSession { generation: Generation },
    /// Arm the one-shot reconnect timer.
    ScheduleReconnect { attempt: u32, delay: Duration },
    /// Disarm the reconnect timer.
    CancelReconnect,
    /// Retry budget spent; tell the owner.
    RetriesExhausted { attempts: u32 },
}

/// Supervision state for one channel.
#[derive(Debug)]
pub struct Supervisor {
    state: ChannelState,
    retry_count: u32,
    max_attempts: u32,
    backoff: BackoffPolicy,
    /// Generation of the most recently opened session.
    generation: Generation,
    /// Whether the session tagged `generation` is still current.
    session_live: bool,
    reconnect_pending: bool,
    /// Set by `disconnect`, cleared by `connect`.
    disconnect_requested: bool,
}

impl Supervisor {
    pub fn new(max_attempts: u32, backoff: BackoffPolicy) -> Self {
        Self {
            state: ChannelState::Idle,
            retry_count: 0,
            max_attempts,
            backoff,
            generation: 0,
            session_live: false,
            reconnect_pending: false,
            disconnect_requested: false,
        }
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn reconnect_pending(&self) -> bool {
        self.reconnect_pending
    }

    /// Whether events tagged `generation` come from the current session.
    pub fn is_current(&self, generation: Generation) -> bool {
        self.session_live && generation == self.generation
    }

    /// Whether a message from `generation` should reach the handler.
    pub fn accepts_messages(&self, generation: Generation) -> bool {
        self.is_current(generation) && self.state == ChannelState::Open
    }

    /// Explicit connect request.
    pub fn connect(&mut self) -> Vec<Action> {
        match self.state {
            ChannelState::Connecting | ChannelState::Open => Vec::new(),
            ChannelState::Reconnecting => {
                // Skip the rest of the wait; the retry budget carries over.
                self.reconnect_pending = false;
                let mut actions = vec![Action::CancelReconnect];
                actions.push(self.begin_attempt());
                actions
            }
            ChannelState::Idle | ChannelState::Closing | ChannelState::Closed => {
                // A closing session is abandoned here; its late close event
                // carries an old generation and is ignored.
                self.disconnect_requested = false;
                self.retry_count = 0;
                vec![self.begin_attempt()]
            }
        }
    }

    /// Explicit disconnect request.
    pub fn disconnect(&mut self) -> Vec<Action> {
        let mut actions = Vec::new();
        if matches!(self.state, ChannelState::Closing | ChannelState::Closed) {
            return actions;
        }
        self.disconnect_requested = true;

        if self.reconnect_pending {
            self.reconnect_pending = false;
            actions.push(Action::CancelReconnect);
        }

        if self.session_live {
            actions.push(Action::CloseSession {
                generation: self.generation,
            });
            self.state = ChannelState::Closing;
        } else {
            self.state = ChannelState::Closed;
        }
        actions
    }

    /// The current session became ready.
    pub fn on_open(&mut self, generation: Generation) -> Vec<Action> {
        if !self.is_current(generation) || self.state != ChannelState::Connecting {
            return Vec::new();
        }
        self.state = ChannelState::Open;
        self.retry_count = 0;
        Vec::new()
    }

    /// The current session ended.
    pub fn on_close(&mut self, generation: Generation, was_clean: bool) -> Vec<Action> {
        if !self.is_current(generation) {
            return Vec::new();
        }
        self.session_live = false;

        if self.disconnect_requested || was_clean {
            self.state = ChannelState::Closed;
            return Vec::new();
        }

        if self.retry_count < self.max_attempts {
            self.retry_count += 1;
            let delay = self.backoff.delay(self.retry_count);
            self.reconnect_pending = true;
            self.state = ChannelState::Reconnecting;
            vec![Action::ScheduleReconnect {
                attempt: self.retry_count,
                delay,
            }]
        } else {
            self.state = ChannelState::Closed;
            vec![Action::RetriesExhausted {
                attempts: self.retry_count,
            }]
        }
    }

    /// The reconnect timer elapsed.
    pub fn on_reconnect_timer(&mut self) -> Vec<Action> {
        if !self.reconnect_pending || self.state != ChannelState::Reconnecting {
            return Vec::new();
        }
        self.reconnect_pending = false;
        vec![self.begin_attempt()]
    }

    fn begin_attempt(&mut self) -> Action {
        self.generation += 1;
        self.session_live = true;
        self.state = ChannelState::Connecting;
        Action::OpenSession {
            generation: self.generation,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn supervisor(max_attempts: u32) -> Supervisor {
        Supervisor::new(max_attempts, BackoffPolicy::new(Duration::from_millis(1000)))
    }

    /// Drive an abnormal close on the current session and, if a reconnect
    /// was scheduled, fire the timer. Returns the close actions.
    fn fail_current(sup: &mut Supervisor) -> Vec<Action> {
        let actions = sup.on_close(sup.generation(), false);
        if sup.reconnect_pending() {
            sup.on_reconnect_timer();
        }
        actions
    }

    fn scheduled_delay(actions: &[Action]) -> Option<Duration> {
        actions.iter().find_map(|a| match a {
            Action::ScheduleReconnect { delay, .. } => Some(*delay),
            _ => None,
        })
    }

    #[test]
    fn test_connect_from_idle() {
        let mut sup = supervisor(5);
        assert_eq!(sup.state(), ChannelState::Idle);
        assert_eq!(
            sup.connect(),
            vec![Action::OpenSession { generation: 1 }]
        );
        assert_eq!(sup.state(), ChannelState::Connecting);
        sup.on_open(1);
        assert_eq!(sup.state(), ChannelState::Open);
    }

    #[test]
    fn test_connect_is_noop_when_connecting_or_open() {
        let mut sup = supervisor(5);
        sup.connect();
        assert!(sup.connect().is_empty());
        sup.on_open(1);
        assert!(sup.connect().is_empty());
        assert_eq!(sup.generation(), 1);
    }

    #[test]
    fn test_exhaustion_scenario_delays() {
        let mut sup = supervisor(3);
        sup.connect();
        sup.on_open(1);

        let mut delays = Vec::new();
        let mut exhausted = 0;
        for _ in 0..4 {
            let actions = fail_current(&mut sup);
            if let Some(delay) = scheduled_delay(&actions) {
                delays.push(delay.as_millis());
            }
            exhausted += actions
                .iter()
                .filter(|a| matches!(a, Action::RetriesExhausted { attempts: 3 }))
                .count();
        }

        assert_eq!(delays, vec![1000, 2000, 4000]);
        assert_eq!(exhausted, 1);
        assert_eq!(sup.state(), ChannelState::Closed);
        assert!(!sup.reconnect_pending());
        assert!(sup.on_reconnect_timer().is_empty());
    }

    #[test]
    fn test_retry_count_never_exceeds_max() {
        let mut sup = supervisor(2);
        sup.connect();
        for _ in 0..10 {
            fail_current(&mut sup);
            assert!(sup.retry_count() <= 2);
        }
        assert_eq!(sup.state(), ChannelState::Closed);
    }

    #[test]
    fn test_successful_open_resets_budget() {
        let mut sup = supervisor(5);
        sup.connect();
        sup.on_open(sup.generation());

        for _ in 0..3 {
            fail_current(&mut sup);
        }
        assert_eq!(sup.retry_count(), 3);

        sup.on_open(sup.generation());
        assert_eq!(sup.retry_count(), 0);
        assert_eq!(sup.state(), ChannelState::Open);

        // The next failure starts again from the base delay.
        let actions = fail_current(&mut sup);
        assert_eq!(scheduled_delay(&actions), Some(Duration::from_millis(1000)));

        for _ in 0..4 {
            let actions = fail_current(&mut sup);
            assert!(scheduled_delay(&actions).is_some());
        }
        // 3 + 5 failures so far and still retrying.
        assert_eq!(sup.state(), ChannelState::Connecting);
        assert_eq!(sup.retry_count(), 5);

        let actions = fail_current(&mut sup);
        assert_eq!(actions, vec![Action::RetriesExhausted { attempts: 5 }]);
        assert_eq!(sup.state(), ChannelState::Closed);
    }

    #[test]
    fn test_clean_close_never_retries() {
        let mut sup = supervisor(5);
        sup.connect();
        sup.on_open(1);
        assert!(sup.on_close(1, true).is_empty());
        assert_eq!(sup.state(), ChannelState::Closed);
        assert!(!sup.reconnect_pending());
    }

    #[test]
    fn test_disconnect_during_backoff_cancels_timer() {
        let mut sup = supervisor(5);
        sup.connect();
        sup.on_open(1);
        sup.on_close(1, false);
        assert_eq!(sup.state(), ChannelState::Reconnecting);

        assert_eq!(sup.disconnect(), vec![Action::CancelReconnect]);
        assert_eq!(sup.state(), ChannelState::Closed);
        assert!(sup.on_reconnect_timer().is_empty());
        assert_eq!(sup.state(), ChannelState::Closed);
    }

    #[test]
    fn test_disconnect_with_live_session_waits_for_close() {
        let mut sup = supervisor(5);
        sup.connect();
        sup.on_open(1);

        assert_eq!(
            sup.disconnect(),
            vec![Action::CloseSession { generation: 1 }]
        );
        assert_eq!(sup.state(), ChannelState::Closing);
        assert!(!sup.accepts_messages(1));

        // Even an abnormal close after disconnect is terminal.
        assert!(sup.on_close(1, false).is_empty());
        assert_eq!(sup.state(), ChannelState::Closed);
    }

    #[test]
    fn test_disconnect_is_idempotent() {
        let mut sup = supervisor(5);
        sup.connect();
        sup.disconnect();
        assert!(sup.disconnect().is_empty());
        assert_eq!(sup.state(), ChannelState::Closing);
    }

    #[test]
    fn test_disconnect_mid_connect_ignores_late_open() {
        let mut sup = supervisor(5);
        sup.connect();
        sup.disconnect();
        assert!(sup.on_open(1).is_empty());
        assert_eq!(sup.state(), ChannelState::Closing);
        sup.on_close(1, true);
        assert_eq!(sup.state(), ChannelState::Closed);
    }

    #[test]
    fn test_stale_generation_events_ignored() {
        let mut sup = supervisor(5);
        sup.connect();
        sup.on_open(1);
        sup.disconnect();
        // Reconnect before the old session finished closing.
        assert_eq!(sup.connect(), vec![Action::OpenSession { generation: 2 }]);

        assert!(!sup.is_current(1));
        assert!(sup.on_close(1, false).is_empty());
        assert!(sup.on_open(1).is_empty());
        assert_eq!(sup.state(), ChannelState::Connecting);

        sup.on_open(2);
        assert_eq!(sup.state(), ChannelState::Open);
        assert!(sup.accepts_messages(2));
        assert!(!sup.accepts_messages(1));
    }

    #[test]
    fn test_connect_after_exhaustion_restarts_from_first_attempt() {
        let mut sup = supervisor(1);
        sup.connect();
        fail_current(&mut sup);
        fail_current(&mut sup);
        assert_eq!(sup.state(), ChannelState::Closed);

        sup.connect();
        assert_eq!(sup.retry_count(), 0);
        let actions = sup.on_close(sup.generation(), false);
        assert_eq!(
            actions,
            vec![Action::ScheduleReconnect {
                attempt: 1,
                delay: Duration::from_millis(1000)
            }]
        );
    }

    #[test]
    fn test_connect_while_reconnecting_skips_wait() {
        let mut sup = supervisor(5);
        sup.connect();
        sup.on_close(1, false);
        assert_eq!(
            sup.connect(),
            vec![
                Action::CancelReconnect,
                Action::OpenSession { generation: 2 }
            ]
        );
        assert_eq!(sup.retry_count(), 1);
        assert!(!sup.reconnect_pending());
    }

    #[test]
    fn test_message_gate_follows_state() {
        let mut sup = supervisor(5);
        assert!(!sup.accepts_messages(0));
        sup.connect();
        assert!(!sup.accepts_messages(1));
        sup.on_open(1);
        assert!(sup.accepts_messages(1));
    }

    #[test]
    fn test_zero_max_attempts_exhausts_immediately() {
        let mut sup = supervisor(0);
        sup.connect();
        sup.on_open(1);
        assert_eq!(
            sup.on_close(1, false),
            vec![Action::RetriesExhausted { attempts: 0 }]
        );
    }
}
