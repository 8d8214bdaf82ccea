//! Reconnect policy for the controller transport.
//!
//! ```text
//! Disconnected ──attempt──► Connecting ──ok──► Connected
//!      ▲                        │                  │
//!      └────────fail────────────┘◄──drop / pause───┘
//! ```
//!
//! # Backoff
//!
//! On each failed attempt the delay doubles (capped at `max_delay`) and the
//! next attempt is scheduled `current_delay` from now. Entering `Connected`
//! resets the delay to `initial_delay`. Between successful connects the
//! delay never decreases.

use std::time::{Duration, Instant};

use crate::constants::MAX_RECONNECT_DELAY;

/// Connection phase of the controller link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    /// No session; a retry may be scheduled.
    Disconnected,
    /// An open attempt is in flight.
    Connecting,
    /// A session is live.
    Connected,
}

/// Mutable backoff bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffState {
    /// Delay that will precede the next retry.
    pub current_delay: Duration,
    /// Consecutive failed attempts since the last successful connect.
    pub attempts: u32,
    /// When the last attempt started.
    pub last_attempt_time: Option<Instant>,
}

/// Exponential-backoff state machine driving (re)connection.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    initial_delay: Duration,
    max_delay: Duration,
    phase: ConnectionPhase,
    state: BackoffState,
    next_attempt: Option<Instant>,
}

impl ReconnectPolicy {
    /// New policy in `Disconnected` with an attempt due immediately.
    pub fn new(initial_delay: Duration, max_delay: Duration) -> Self {
        let initial_delay = initial_delay.min(MAX_RECONNECT_DELAY);
        let max_delay = max_delay.clamp(initial_delay, MAX_RECONNECT_DELAY);
        Self {
            initial_delay,
            max_delay,
            phase: ConnectionPhase::Disconnected,
            state: BackoffState {
                current_delay: initial_delay,
                attempts: 0,
                last_attempt_time: None,
            },
            next_attempt: Some(Instant::now()),
        }
    }

    /// Current phase.
    pub fn phase(&self) -> ConnectionPhase {
        self.phase
    }

    /// Backoff bookkeeping (read-only).
    pub fn state(&self) -> &BackoffState {
        &self.state
    }

    /// When the next attempt is due, if one is scheduled.
    pub fn next_attempt(&self) -> Option<Instant> {
        self.next_attempt
    }

    /// Whether an attempt should start at `now`.
    pub fn is_due(&self, now: Instant) -> bool {
        self.phase == ConnectionPhase::Disconnected
            && self.next_attempt.is_some_and(|at| at <= now)
    }

    /// Enter `Connecting`.
    pub fn begin_attempt(&mut self, now: Instant) {
        self.phase = ConnectionPhase::Connecting;
        self.state.last_attempt_time = Some(now);
        self.next_attempt = None;
    }

    /// The attempt failed: grow the delay and schedule the next one.
    ///
    /// Returns the delay until the next attempt.
    pub fn on_failure(&mut self, now: Instant) -> Duration {
        self.state.current_delay = self.state.current_delay.saturating_mul(2).min(self.max_delay);
        self.state.attempts = self.state.attempts.saturating_add(1);
        self.phase = ConnectionPhase::Disconnected;
        self.next_attempt = Some(deadline(now, self.state.current_delay));
        self.state.current_delay
    }

    /// The attempt succeeded: reset the backoff.
    pub fn on_connected(&mut self) {
        self.phase = ConnectionPhase::Connected;
        self.state.current_delay = self.initial_delay;
        self.state.attempts = 0;
        self.next_attempt = None;
    }

    /// A live session dropped; retry after the initial delay.
    pub fn on_disconnected(&mut self, now: Instant) {
        self.phase = ConnectionPhase::Disconnected;
        self.next_attempt = Some(deadline(now, self.state.current_delay));
    }

    /// Stop scheduling attempts (pause).
    pub fn suspend(&mut self) {
        self.phase = ConnectionPhase::Disconnected;
        self.next_attempt = None;
    }

    /// Resume scheduling with a fresh backoff and an immediate attempt.
    pub fn resume(&mut self, now: Instant) {
        self.phase = ConnectionPhase::Disconnected;
        self.state.current_delay = self.initial_delay;
        self.state.attempts = 0;
        self.next_attempt = Some(now);
    }

    /// Apply new bounds (config reload). The current delay is clamped.
    pub fn reconfigure(&mut self, initial_delay: Duration, max_delay: Duration) {
        self.initial_delay = initial_delay.min(MAX_RECONNECT_DELAY);
        self.max_delay = max_delay.clamp(self.initial_delay, MAX_RECONNECT_DELAY);
        self.state.current_delay = self
            .state
            .current_delay
            .clamp(self.initial_delay, self.max_delay);
    }
}

/// `now + delay`, or `now` if the clock cannot represent it.
fn deadline(now: Instant, delay: Duration) -> Instant {
    now.checked_add(delay).unwrap_or(now)
}
