//! Reconnection Controller
//!
//! Pure state machine for one channel's connection lifecycle. It decides;
//! the channel driver sleeps and reopens.
//!
//! ```text
//! IDLE -> CONNECTING -> OPEN -> (CLOSED | abnormal) -> RECONNECTING -> CONNECTING ...
//!                                                   \-> FAILED (after max attempts)
//! ```

use std::time::Duration;
use serde::{Serialize, Deserialize};
use tracing::{debug, warn};

use crate::config::ReconnectPolicy;

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Not started.
    #[default]
    Idle,
    /// Opening and awaiting the subscription ack.
    Connecting,
    /// Subscribed.
    Open,
    /// Closed normally; no retry.
    Closed,
    /// Waiting out a backoff delay.
    Reconnecting,
    /// Gave up; only a manual reconnect leaves this state.
    Failed,
}

/// Decision after an abnormal closure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Sleep, then reopen.
    Retry {
        /// Attempt number (1-based).
        attempt: u32,
        /// Delay before reopening.
        delay: Duration,
    },
    /// Stop retrying.
    Exhausted {
        /// Attempts made.
        attempts: u32,
    },
}

/// Per-channel reconnection state machine.
#[derive(Debug, Clone)]
pub struct ReconnectController {
    policy: ReconnectPolicy,
    state: ConnectionState,
    attempt: u32,
}

impl ReconnectController {
    /// Idle controller.
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self { policy, state: ConnectionState::Idle, attempt: 0 }
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Retries made since the last successful open.
    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    /// An open is starting.
    pub fn connecting(&mut self) {
        self.state = ConnectionState::Connecting;
    }

    /// The subscription was acknowledged.
    pub fn on_open(&mut self) {
        self.state = ConnectionState::Open;
        self.attempt = 0;
    }

    /// Clean close; never retried.
    pub fn on_normal_close(&mut self) {
        self.state = ConnectionState::Closed;
    }

    /// Failed open, broken connection or dead heartbeat.
    pub fn on_abnormal_close(&mut self) -> Backoff {
        if self.attempt >= self.policy.max_attempts {
            warn!(attempts = self.attempt, "reconnect attempts exhausted");
            self.state = ConnectionState::Failed;
            return Backoff::Exhausted { attempts: self.attempt };
        }
        let delay = self.policy.delay_for(self.attempt);
        self.attempt += 1;
        self.state = ConnectionState::Reconnecting;
        debug!(attempt = self.attempt, ?delay, "scheduling reconnect");
        Backoff::Retry { attempt: self.attempt, delay }
    }

    /// Failure backoff cannot fix.
    pub fn fail(&mut self) {
        self.state = ConnectionState::Failed;
    }

    /// Manual reconnect: reset the counter and skip the backoff.
    pub fn manual_reconnect(&mut self) {
        self.attempt = 0;
        self.state = ConnectionState::Connecting;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_attempts: u32) -> ReconnectPolicy {
        ReconnectPolicy { max_attempts, ..Default::default() }
    }

    #[test]
    fn test_backoff_then_failed() {
        let mut controller = ReconnectController::new(policy(3));
        controller.connecting();

        let mut delays = Vec::new();
        loop {
            match controller.on_abnormal_close() {
                Backoff::Retry { delay, .. } => {
                    delays.push(delay.as_millis());
                    controller.connecting();
                }
                Backoff::Exhausted { attempts } => {
                    assert_eq!(attempts, 3);
                    break;
                }
            }
        }
        assert_eq!(delays, vec![1000, 1500, 2250]);
        assert_eq!(controller.state(), ConnectionState::Failed);
    }

    #[test]
    fn test_open_resets_attempts() {
        let mut controller = ReconnectController::new(policy(5));
        controller.on_abnormal_close();
        controller.on_abnormal_close();
        assert_eq!(controller.attempts(), 2);

        controller.on_open();
        assert_eq!(controller.attempts(), 0);
        assert_eq!(
            controller.on_abnormal_close(),
            Backoff::Retry { attempt: 1, delay: Duration::from_millis(1000) }
        );
    }

    #[test]
    fn test_manual_reconnect_leaves_failed() {
        let mut controller = ReconnectController::new(policy(0));
        assert_eq!(controller.on_abnormal_close(), Backoff::Exhausted { attempts: 0 });
        assert_eq!(controller.state(), ConnectionState::Failed);

        controller.manual_reconnect();
        assert_eq!(controller.state(), ConnectionState::Connecting);
        assert_eq!(controller.attempts(), 0);
    }

    #[test]
    fn test_normal_close_is_terminal_without_retry() {
        let mut controller = ReconnectController::new(policy(3));
        controller.on_open();
        controller.on_normal_close();
        assert_eq!(controller.state(), ConnectionState::Closed);
        assert_eq!(controller.attempts(), 0);
    }
}
