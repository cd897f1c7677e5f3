use crate::core::session::{Session, SessionId};
use crate::traits::SessionListener;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Open sessions of one client plus the listeners observing them
///
/// Sessions enter on their OPEN transition and leave on their terminal
/// transition; the registry never keeps a closed session around. Sessions
/// point back at the registry weakly.
///
/// # Example
/// ```ignore
/// let registry = Arc::new(SessionRegistry::new());
/// registry.add_listener(Arc::new(MyListener));
///
/// let session = Session::builder(endpoint)
///     .registry(&registry)
///     .build()?;
/// session.open(connection)?;
///
/// assert_eq!(registry.len(), 1);
/// ```
#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<SessionId, Session>>,
    listeners: RwLock<Vec<Arc<dyn SessionListener>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a listener; it sees transitions from now on
    pub fn add_listener(&self, listener: Arc<dyn SessionListener>) {
        self.listeners.write().push(listener);
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }

    /// Track an opened session and notify listeners
    pub(crate) fn register(&self, session: &Session) {
        let total = {
            let mut sessions = self.sessions.write();
            sessions.insert(session.id(), session.clone());
            sessions.len()
        };
        info!("Registered session {} ({} open)", session.id(), total);

        let listeners = self.listeners.read().clone();
        for listener in listeners {
            listener.on_session_opened(session);
        }
    }

    /// Stop tracking a session and notify listeners
    ///
    /// Listeners are only called if the session was actually tracked.
    pub(crate) fn unregister(&self, session: &Session) {
        let removed = self.sessions.write().remove(&session.id());
        if removed.is_none() {
            debug!("Session {} was not registered", session.id());
            return;
        }
        info!("Unregistered session {} ({} open)", session.id(), self.len());

        let listeners = self.listeners.read().clone();
        for listener in listeners {
            listener.on_session_closed(session);
        }
    }

    /// Snapshot of the open sessions
    pub fn open_sessions(&self) -> Vec<Session> {
        self.sessions.read().values().cloned().collect()
    }

    pub fn get(&self, id: SessionId) -> Option<Session> {
        self.sessions.read().get(&id).cloned()
    }

    pub fn contains(&self, id: SessionId) -> bool {
        self.sessions.read().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }
}
