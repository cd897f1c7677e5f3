//! Per-session deadline watchdog
//!
//! ```text
//! ┌──────────────────────────┐
//! │ ws-watchdog-{id} thread  │
//! │                          │
//! │ every timer_resolution:  │
//! │  OPEN    → idle expired? ├──> Session::fail(Timeout) → 1006
//! │  CLOSING → echo overdue? ├──> Session::fail(Timeout) → 1006
//! └──────────────────────────┘
//! ```
//!
//! The thread holds only a weak handle and exits when the session's close
//! signal fires, when the session reaches a terminal state, or when the
//! last session handle is dropped.

use crate::core::session::{Session, SessionInner};
use crate::traits::{Result, WsError};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use std::sync::Weak;
use std::thread;
use std::time::Duration;
use tracing::debug;

/// Start the watchdog for an opened session
pub(crate) fn spawn(session: &Session) -> Result<()> {
    let weak = session.downgrade();
    let closed = session.close_signal().subscribe();
    let resolution = session.config().timer_resolution;
    let id = session.id();

    thread::Builder::new()
        .name(format!("ws-watchdog-{}", id))
        .spawn(move || {
            debug!(session = %id, "Watchdog started with resolution {:?}", resolution);
            watch(weak, closed, resolution);
            debug!(session = %id, "Watchdog stopped");
        })
        .map(|_| ())
        .map_err(|e| WsError::Configuration(format!("failed to spawn watchdog: {}", e)))
}

fn watch(weak: Weak<SessionInner>, closed: Receiver<()>, resolution: Duration) {
    loop {
        match closed.recv_timeout(resolution) {
            Err(RecvTimeoutError::Timeout) => {}
            // The signal never carries a message; anything else means it fired
            _ => return,
        }

        let Some(session) = Session::upgrade(&weak) else {
            return;
        };
        session.check_deadlines();
        if session.state().is_terminal() {
            return;
        }
    }
}
