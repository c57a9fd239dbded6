//! Ping Monitor
//!
//! Tracks two independent deadlines derived from the negotiated ping timeout
//! `T`: a send cadence of `T/3` and a peer-silence tolerance of `T`. One
//! wall-clock check per dispatch cycle; the monitor never blocks and never
//! touches the socket itself - it only tells the caller what to do.

use std::time::{Duration, Instant};

/// Verdict of one monitor check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PingVerdict {
    /// Nothing due this cycle
    Idle,
    /// The send cadence elapsed; caller should send a keep-alive
    SendPing,
    /// The peer has been silent for a full timeout; channel is lost
    Lost,
}

/// Per-channel keep-alive deadline tracking
#[derive(Debug)]
pub struct PingMonitor {
    timeout: Duration,
    next_send: Instant,
    next_receive: Instant,
    received_since_check: bool,
}

impl PingMonitor {
    /// Start monitoring with the negotiated ping timeout
    pub fn new(timeout: Duration) -> Self {
        let now = Instant::now();
        Self::with_start(timeout, now)
    }

    /// Start monitoring from an explicit instant (used by tests)
    pub fn with_start(timeout: Duration, now: Instant) -> Self {
        Self {
            timeout,
            next_send: now + timeout / 3,
            next_receive: now + timeout,
            received_since_check: false,
        }
    }

    /// The timeout this monitor was built with
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Record that data or a ping arrived from the peer
    pub fn on_activity_received(&mut self) {
        self.received_since_check = true;
    }

    /// Record that anything was written to the peer (pushes the send cadence)
    pub fn on_activity_sent(&mut self, now: Instant) {
        self.next_send = now + self.timeout / 3;
    }

    /// One per-cycle check against the wall clock
    ///
    /// `Lost` fires only when a full timeout elapsed with no received
    /// activity since the previous check. `SendPing` rearms the send
    /// deadline; the caller still reports the actual send via
    /// [`on_activity_sent`](Self::on_activity_sent).
    pub fn check(&mut self, now: Instant) -> PingVerdict {
        if self.received_since_check {
            self.received_since_check = false;
            self.next_receive = now + self.timeout;
        } else if now >= self.next_receive {
            return PingVerdict::Lost;
        }

        if now >= self.next_send {
            self.next_send = now + self.timeout / 3;
            return PingVerdict::SendPing;
        }

        PingVerdict::Idle
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T: Duration = Duration::from_secs(30);

    #[test]
    fn test_idle_before_any_deadline() {
        let start = Instant::now();
        let mut monitor = PingMonitor::with_start(T, start);
        assert_eq!(monitor.check(start + Duration::from_secs(1)), PingVerdict::Idle);
    }

    #[test]
    fn test_send_ping_due_at_third_of_timeout() {
        let start = Instant::now();
        let mut monitor = PingMonitor::with_start(T, start);

        assert_eq!(monitor.check(start + Duration::from_secs(10)), PingVerdict::SendPing);
        // Rearmed; not due again immediately
        assert_eq!(monitor.check(start + Duration::from_secs(11)), PingVerdict::Idle);
        assert_eq!(monitor.check(start + Duration::from_secs(21)), PingVerdict::SendPing);
    }

    #[test]
    fn test_outbound_traffic_defers_ping() {
        let start = Instant::now();
        let mut monitor = PingMonitor::with_start(T, start);

        monitor.on_activity_sent(start + Duration::from_secs(9));
        monitor.on_activity_received();
        assert_eq!(monitor.check(start + Duration::from_secs(10)), PingVerdict::Idle);
        assert_eq!(monitor.check(start + Duration::from_secs(19)), PingVerdict::SendPing);
    }

    #[test]
    fn test_silence_for_full_timeout_is_lost() {
        let start = Instant::now();
        let mut monitor = PingMonitor::with_start(T, start);

        monitor.on_activity_sent(start + Duration::from_secs(29));
        assert_eq!(monitor.check(start + T), PingVerdict::Lost);
    }

    #[test]
    fn test_received_activity_resets_silence_window() {
        let start = Instant::now();
        let mut monitor = PingMonitor::with_start(T, start);

        monitor.on_activity_received();
        monitor.on_activity_sent(start + Duration::from_secs(29));
        // Receive deadline pushed to t=29+30 at this check
        assert_eq!(monitor.check(start + Duration::from_secs(29)), PingVerdict::Idle);
        monitor.on_activity_received();
        // Silence window survives, though the send cadence is due again
        assert_eq!(monitor.check(start + Duration::from_secs(58)), PingVerdict::SendPing);

        // Then a full quiet timeout kills the channel
        monitor.on_activity_sent(start + Duration::from_secs(80));
        assert_eq!(monitor.check(start + Duration::from_secs(88)), PingVerdict::Lost);
    }
}
