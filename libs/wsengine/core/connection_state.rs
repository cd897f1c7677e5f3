//! Atomic session state and counters
//!
//! The session state is the single authoritative lifecycle variable. All
//! transitions go through `compare_exchange`, so when several triggers race
//! (peer close, local close, idle timeout, transport error) exactly one of
//! them performs each transition.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SessionState {
    /// Created, connection not yet attached
    Connecting = 0,
    /// Open for reading and writing
    Open = 1,
    /// A close frame was sent or received, waiting for the other half
    Closing = 2,
    /// Close handshake completed
    Closed = 3,
    /// Terminated without completing the handshake
    AbnormalClosed = 4,
}

impl SessionState {
    #[inline]
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SessionState::Connecting,
            1 => SessionState::Open,
            2 => SessionState::Closing,
            3 => SessionState::Closed,
            _ => SessionState::AbnormalClosed,
        }
    }

    #[inline]
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Closed | SessionState::AbnormalClosed)
    }
}

/// Lock-free holder for `SessionState`
#[derive(Debug)]
pub struct AtomicSessionState {
    inner: AtomicU8,
}

impl AtomicSessionState {
    pub fn new(state: SessionState) -> Self {
        Self {
            inner: AtomicU8::new(state as u8),
        }
    }

    #[inline]
    pub fn get(&self) -> SessionState {
        SessionState::from_u8(self.inner.load(Ordering::Acquire))
    }

    /// Transition `current -> new` if the state is still `current`
    ///
    /// Returns the actual state on failure.
    #[inline]
    pub fn compare_exchange(
        &self,
        current: SessionState,
        new: SessionState,
    ) -> Result<SessionState, SessionState> {
        self.inner
            .compare_exchange(current as u8, new as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(SessionState::from_u8)
            .map_err(SessionState::from_u8)
    }

    /// Move to a terminal state from whatever non-terminal state is current
    ///
    /// Returns the state that was left, or `None` if another caller already
    /// terminated the session.
    pub fn terminate(&self, terminal: SessionState) -> Option<SessionState> {
        debug_assert!(terminal.is_terminal());
        let mut current = self.get();
        loop {
            if current.is_terminal() {
                return None;
            }
            match self.compare_exchange(current, terminal) {
                Ok(previous) => return Some(previous),
                Err(actual) => current = actual,
            }
        }
    }

    #[inline]
    pub fn is_open(&self) -> bool {
        self.get() == SessionState::Open
    }

    #[inline]
    pub fn is_closing(&self) -> bool {
        self.get() == SessionState::Closing
    }

    #[inline]
    pub fn is_terminal(&self) -> bool {
        self.get().is_terminal()
    }
}

/// Per-session counters
#[derive(Debug, Default)]
pub struct AtomicMetrics {
    frames_received: AtomicU64,
    frames_sent: AtomicU64,
    messages_received: AtomicU64,
    messages_dropped: AtomicU64,
}

impl AtomicMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn increment_frames_received(&self) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn increment_frames_sent(&self) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn increment_messages_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn increment_messages_dropped(&self) {
        self.messages_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frames_received(&self) -> u64 {
        self.frames_received.load(Ordering::Relaxed)
    }

    pub fn frames_sent(&self) -> u64 {
        self.frames_sent.load(Ordering::Relaxed)
    }

    pub fn messages_received(&self) -> u64 {
        self.messages_received.load(Ordering::Relaxed)
    }

    pub fn messages_dropped(&self) -> u64 {
        self.messages_dropped.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> Metrics {
        Metrics {
            frames_received: self.frames_received(),
            frames_sent: self.frames_sent(),
            messages_received: self.messages_received(),
            messages_dropped: self.messages_dropped(),
        }
    }
}

/// Session metrics snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Metrics {
    pub frames_received: u64,
    pub frames_sent: u64,
    pub messages_received: u64,
    pub messages_dropped: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_basic_transitions() {
        let state = AtomicSessionState::new(SessionState::Connecting);
        assert_eq!(state.get(), SessionState::Connecting);

        assert!(state
            .compare_exchange(SessionState::Connecting, SessionState::Open)
            .is_ok());
        assert!(state.is_open());

        assert_eq!(
            state.compare_exchange(SessionState::Connecting, SessionState::Open),
            Err(SessionState::Open)
        );
    }

    #[test]
    fn test_terminate_only_once() {
        let state = AtomicSessionState::new(SessionState::Closing);
        assert_eq!(state.terminate(SessionState::Closed), Some(SessionState::Closing));
        assert_eq!(state.terminate(SessionState::AbnormalClosed), None);
        assert_eq!(state.get(), SessionState::Closed);
    }

    #[test]
    fn test_terminate_race_has_one_winner() {
        for _ in 0..50 {
            let state = Arc::new(AtomicSessionState::new(SessionState::Open));
            let winners = Arc::new(AtomicUsize::new(0));

            let handles: Vec<_> = (0..8)
                .map(|i| {
                    let state = Arc::clone(&state);
                    let winners = Arc::clone(&winners);
                    thread::spawn(move || {
                        let target = if i % 2 == 0 {
                            SessionState::Closed
                        } else {
                            SessionState::AbnormalClosed
                        };
                        if state.terminate(target).is_some() {
                            winners.fetch_add(1, Ordering::Relaxed);
                        }
                    })
                })
                .collect();

            for handle in handles {
                handle.join().unwrap();
            }

            assert_eq!(winners.load(Ordering::Relaxed), 1);
            assert!(state.is_terminal());
        }
    }

    #[test]
    fn test_metrics_snapshot() {
        let metrics = AtomicMetrics::new();
        metrics.increment_frames_received();
        metrics.increment_frames_received();
        metrics.increment_messages_received();
        metrics.increment_messages_dropped();
        metrics.increment_frames_sent();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.frames_received, 2);
        assert_eq!(snapshot.messages_received, 1);
        assert_eq!(snapshot.messages_dropped, 1);
        assert_eq!(snapshot.frames_sent, 1);
    }
}
