use crate::core::session::Session;

/// Observer of session open/close transitions across a client
///
/// Listeners are called on whichever thread performed the transition and
/// must not block.
pub trait SessionListener: Send + Sync + 'static {
    fn on_session_opened(&self, _session: &Session) {}

    fn on_session_closed(&self, _session: &Session) {}
}

/// Listener that ignores every notification
pub struct NoOpListener;

impl SessionListener for NoOpListener {}
