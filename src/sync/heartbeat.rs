//! Heartbeat Monitor
//!
//! Tracks ping/pong timing for an open connection. The connection is dead
//! once twice the interval passes without a pong, measured from the open or
//! the last pong.

use std::time::Duration;
use tokio::time::Instant;

/// Liveness bookkeeping for one open connection.
#[derive(Debug, Clone)]
pub struct HeartbeatMonitor {
    interval: Duration,
    opened_at: Instant,
    last_ping_sent_at: Option<Instant>,
    last_pong_received_at: Option<Instant>,
    latency: Option<Duration>,
    next_nonce: u64,
}

impl HeartbeatMonitor {
    /// Start monitoring a connection opened at `now`.
    pub fn new(interval: Duration, now: Instant) -> Self {
        Self {
            interval,
            opened_at: now,
            last_ping_sent_at: None,
            last_pong_received_at: None,
            latency: None,
            next_nonce: 1,
        }
    }

    /// When the next ping is due.
    pub fn next_ping_at(&self) -> Instant {
        self.last_ping_sent_at.unwrap_or(self.opened_at) + self.interval
    }

    /// When the connection is declared dead without a pong.
    pub fn deadline(&self) -> Instant {
        self.last_pong_received_at.unwrap_or(self.opened_at) + self.interval * 2
    }

    /// Whether the connection is dead at `now`.
    pub fn is_dead(&self, now: Instant) -> bool {
        now >= self.deadline()
    }

    /// Record a ping, returning its nonce.
    pub fn ping_sent(&mut self, now: Instant) -> u64 {
        self.last_ping_sent_at = Some(now);
        let nonce = self.next_nonce;
        self.next_nonce += 1;
        nonce
    }

    /// Record a pong; returns the measured latency.
    pub fn pong_received(&mut self, now: Instant) -> Option<Duration> {
        self.last_pong_received_at = Some(now);
        let latency = self.last_ping_sent_at.map(|sent| now.saturating_duration_since(sent));
        if latency.is_some() {
            self.latency = latency;
        }
        latency
    }

    /// Record an unsolicited server heartbeat. Extends the deadline only.
    pub fn keep_alive(&mut self, now: Instant) {
        self.last_pong_received_at = Some(now);
    }

    /// Latest measured latency.
    pub fn latency(&self) -> Option<Duration> {
        self.latency
    }

    /// Last ping time.
    pub fn last_ping_sent_at(&self) -> Option<Instant> {
        self.last_ping_sent_at
    }

    /// Last pong time.
    pub fn last_pong_received_at(&self) -> Option<Instant> {
        self.last_pong_received_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INTERVAL: Duration = Duration::from_secs(30);

    #[test]
    fn test_dead_after_two_intervals_without_pong() {
        let opened = Instant::now();
        let mut monitor = HeartbeatMonitor::new(INTERVAL, opened);
        assert_eq!(monitor.next_ping_at(), opened + INTERVAL);

        monitor.ping_sent(opened + INTERVAL);
        assert!(!monitor.is_dead(opened + Duration::from_secs(59)));
        assert!(monitor.is_dead(opened + Duration::from_secs(60)));
    }

    #[test]
    fn test_pong_measures_latency_and_extends_deadline() {
        let opened = Instant::now();
        let mut monitor = HeartbeatMonitor::new(INTERVAL, opened);
        let sent = opened + INTERVAL;
        assert_eq!(monitor.ping_sent(sent), 1);

        let latency = monitor.pong_received(sent + Duration::from_millis(40));
        assert_eq!(latency, Some(Duration::from_millis(40)));
        assert_eq!(monitor.latency(), Some(Duration::from_millis(40)));
        assert_eq!(monitor.deadline(), sent + Duration::from_millis(40) + INTERVAL * 2);
        assert_eq!(monitor.next_ping_at(), sent + INTERVAL);
    }

    #[test]
    fn test_keep_alive_has_no_latency() {
        let opened = Instant::now();
        let mut monitor = HeartbeatMonitor::new(INTERVAL, opened);
        monitor.keep_alive(opened + Duration::from_secs(50));
        assert_eq!(monitor.latency(), None);
        assert!(!monitor.is_dead(opened + Duration::from_secs(100)));
    }

    #[test]
    fn test_nonces_increase() {
        let now = Instant::now();
        let mut monitor = HeartbeatMonitor::new(INTERVAL, now);
        assert_eq!(monitor.ping_sent(now), 1);
        assert_eq!(monitor.ping_sent(now), 2);
    }
}
