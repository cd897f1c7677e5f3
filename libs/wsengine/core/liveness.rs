//! Inbound activity and ping/pong tracking
//!
//! Timestamps are stored as milliseconds since an internal epoch so they can
//! live in atomics and be read from the watchdog thread without locking.
//! A stored value of zero means "never".

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Tracks when the peer was last heard from
pub struct LivenessTracker {
    epoch: Instant,
    last_activity_ms: AtomicU64,
    last_ping_sent_ms: AtomicU64,
    last_pong_received_ms: AtomicU64,
    idle_timeout: Option<Duration>,
}

impl LivenessTracker {
    /// Create a tracker; `None` disables idle expiry
    pub fn new(idle_timeout: Option<Duration>) -> Self {
        let tracker = Self {
            epoch: Instant::now(),
            last_activity_ms: AtomicU64::new(0),
            last_ping_sent_ms: AtomicU64::new(0),
            last_pong_received_ms: AtomicU64::new(0),
            idle_timeout,
        };
        tracker.record_activity();
        tracker
    }

    #[inline]
    fn now_ms(&self) -> u64 {
        // Offset by one so that a timestamp taken at the epoch is not "never"
        self.epoch.elapsed().as_millis() as u64 + 1
    }

    /// Push the idle deadline out; called for every inbound frame
    #[inline]
    pub fn record_activity(&self) {
        self.last_activity_ms.store(self.now_ms(), Ordering::Release);
    }

    pub fn record_ping_sent(&self) {
        self.last_ping_sent_ms.store(self.now_ms(), Ordering::Release);
    }

    pub fn record_pong_received(&self) {
        self.last_pong_received_ms.store(self.now_ms(), Ordering::Release);
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout
    }

    /// Time since the last inbound frame
    pub fn idle_time(&self) -> Duration {
        let last = self.last_activity_ms.load(Ordering::Acquire);
        Duration::from_millis(self.now_ms().saturating_sub(last))
    }

    /// Whether the idle deadline has passed
    pub fn is_idle_expired(&self) -> bool {
        match self.idle_timeout {
            Some(timeout) => self.idle_time() >= timeout,
            None => false,
        }
    }

    /// Whether the last ping we sent is still unanswered
    ///
    /// False when no ping is outstanding.
    pub fn is_pong_pending(&self) -> bool {
        let ping_ms = self.last_ping_sent_ms.load(Ordering::Acquire);
        let pong_ms = self.last_pong_received_ms.load(Ordering::Acquire);
        ping_ms != 0 && pong_ms < ping_ms
    }

    /// Time since the last pong, `None` if none was ever received
    pub fn time_since_last_pong(&self) -> Option<Duration> {
        let pong_ms = self.last_pong_received_ms.load(Ordering::Acquire);
        if pong_ms == 0 {
            return None;
        }
        Some(Duration::from_millis(self.now_ms().saturating_sub(pong_ms)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    #[test]
    fn test_not_idle_when_disabled() {
        let tracker = LivenessTracker::new(None);
        sleep(Duration::from_millis(5));
        assert!(!tracker.is_idle_expired());
    }

    #[test]
    fn test_idle_expires_without_activity() {
        let tracker = LivenessTracker::new(Some(Duration::from_millis(30)));
        assert!(!tracker.is_idle_expired());
        sleep(Duration::from_millis(45));
        assert!(tracker.is_idle_expired());
    }

    #[test]
    fn test_activity_resets_deadline() {
        let tracker = LivenessTracker::new(Some(Duration::from_millis(60)));
        for _ in 0..4 {
            sleep(Duration::from_millis(20));
            tracker.record_activity();
        }
        assert!(!tracker.is_idle_expired());
        assert!(tracker.idle_time() < Duration::from_millis(60));
    }

    #[test]
    fn test_pong_pending() {
        let tracker = LivenessTracker::new(None);
        assert!(!tracker.is_pong_pending());
        assert!(tracker.time_since_last_pong().is_none());

        tracker.record_ping_sent();
        assert!(tracker.is_pong_pending());

        sleep(Duration::from_millis(2));
        tracker.record_pong_received();
        assert!(!tracker.is_pong_pending());
        assert!(tracker.time_since_last_pong().is_some());
    }
}
