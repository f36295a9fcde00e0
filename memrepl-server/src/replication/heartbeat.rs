//! Liveness tracking for one replication session

use tokio::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatDecision {
    /// Nothing was sent for a full interval
    SendHeartbeat,
    /// Nothing was received within the timeout
    TimedOut,
}

/// Tracks inbound and outbound traffic of a session
///
/// Any inbound message counts as liveness, not only heartbeats.
#[derive(Debug, Clone)]
pub struct HeartbeatMonitor {
    interval: Duration,
    timeout: Duration,
    last_recv: Instant,
    last_send: Instant,
}

impl HeartbeatMonitor {
    pub fn new(interval: Duration, timeout: Duration, now: Instant) -> Self {
        Self {
            interval,
            timeout,
            last_recv: now,
            last_send: now,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn note_recv(&mut self, now: Instant) {
        self.last_recv = now;
    }

    pub fn note_send(&mut self, now: Instant) {
        self.last_send = now;
    }

    /// Earliest instant at which [`poll`](Self::poll) may have something to say
    pub fn next_deadline(&self) -> Instant {
        (self.last_send + self.interval).min(self.last_recv + self.timeout)
    }

    /// Instant at which the peer is considered gone
    pub fn timeout_deadline(&self) -> Instant {
        self.last_recv + self.timeout
    }

    /// A heartbeat is owed to the peer, whatever the inbound traffic looks like
    pub fn heartbeat_due(&self, now: Instant) -> bool {
        now >= self.last_send + self.interval
    }

    pub fn poll(&self, now: Instant) -> Option<HeartbeatDecision> {
        if now >= self.timeout_deadline() {
            return Some(HeartbeatDecision::TimedOut);
        }
        if self.heartbeat_due(now) {
            return Some(HeartbeatDecision::SendHeartbeat);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heartbeat_after_idle_interval() {
        let start = Instant::now();
        let mut monitor =
            HeartbeatMonitor::new(Duration::from_millis(100), Duration::from_secs(1), start);

        assert_eq!(monitor.poll(start + Duration::from_millis(99)), None);
        assert_eq!(
            monitor.poll(start + Duration::from_millis(100)),
            Some(HeartbeatDecision::SendHeartbeat)
        );

        monitor.note_send(start + Duration::from_millis(100));
        assert_eq!(monitor.poll(start + Duration::from_millis(150)), None);
        assert_eq!(
            monitor.next_deadline(),
            start + Duration::from_millis(200)
        );
    }

    #[test]
    fn test_timeout_trumps_heartbeat() {
        let start = Instant::now();
        let monitor =
            HeartbeatMonitor::new(Duration::from_millis(50), Duration::from_millis(100), start);

        assert_eq!(
            monitor.poll(start + Duration::from_millis(101)),
            Some(HeartbeatDecision::TimedOut)
        );
    }

    #[test]
    fn test_recv_pushes_deadline() {
        let start = Instant::now();
        let mut monitor =
            HeartbeatMonitor::new(Duration::from_secs(10), Duration::from_millis(100), start);

        monitor.note_recv(start + Duration::from_millis(80));
        assert_eq!(monitor.poll(start + Duration::from_millis(150)), None);
        assert_eq!(
            monitor.poll(start + Duration::from_millis(180)),
            Some(HeartbeatDecision::TimedOut)
        );
    }

    #[test]
    fn test_heartbeat_due_while_receiving() {
        let start = Instant::now();
        let mut monitor =
            HeartbeatMonitor::new(Duration::from_millis(100), Duration::from_millis(500), start);

        // Steady inbound traffic does not excuse us from sending
        for ms in (10..=250).step_by(10) {
            monitor.note_recv(start + Duration::from_millis(ms));
        }
        let now = start + Duration::from_millis(250);
        assert!(monitor.heartbeat_due(now));
        assert_eq!(monitor.poll(now), Some(HeartbeatDecision::SendHeartbeat));
        assert_eq!(
            monitor.timeout_deadline(),
            start + Duration::from_millis(750)
        );

        monitor.note_send(now);
        assert!(!monitor.heartbeat_due(now + Duration::from_millis(99)));
    }
}
