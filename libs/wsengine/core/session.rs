//! Session: one WebSocket conversation over one connection
//!
//! # State machine
//!
//! ```text
//!              open()            close() / peer close
//! CONNECTING ─────────> OPEN ──────────────────────────> CLOSING
//!                        │                                  │
//!                        │ peer close (echoed at once)      │ close echo
//!                        └───────────────> CLOSED <─────────┘
//!
//! any non-terminal state ──(transport error, idle timeout,
//!                            protocol violation, close timeout)──> ABNORMAL_CLOSED
//! ```
//!
//! Every transition is a compare-and-swap on one atomic. The trigger that
//! wins the terminal transition alone records the close status, fires the
//! close signal, disconnects the transport, unregisters the session and runs
//! the close handler.
//!
//! # Threads
//!
//! The transport calls `receive_frame` from a single dispatch thread. Sends
//! may come from any thread and are serialized by the write lock. The
//! watchdog thread enforces the idle and close deadlines. Streaming handlers
//! run on the executor.

use crate::core::config::SessionConfig;
use crate::core::connection_state::{AtomicMetrics, AtomicSessionState, Metrics, SessionState};
use crate::core::dispatch::{guarded, DispatchTable};
use crate::core::endpoint::{Endpoint, Lifecycle};
use crate::core::frame::{CloseCode, CloseStatus, Frame, OpCode, MAX_CONTROL_PAYLOAD};
use crate::core::liveness::LivenessTracker;
use crate::core::registry::CodecRegistry;
use crate::core::stream::CloseSignal;
use crate::core::watchdog;
use crate::manager::SessionRegistry;
use crate::traits::{
    Connection, Executor, MessageKind, OutboundPayload, Result, ThreadExecutor, WsError,
};
use parking_lot::Mutex;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique session identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    fn next() -> Self {
        SessionId(NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What the upgrade handshake negotiated
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Handshake {
    pub sub_protocol: Option<String>,
    pub extensions: Vec<String>,
    pub local_addr: Option<SocketAddr>,
    pub remote_addr: Option<SocketAddr>,
}

#[derive(Default)]
struct Writer {
    /// Kind of the outgoing fragmented message, if one is in progress
    outgoing: Option<MessageKind>,
}

pub(crate) struct SessionInner {
    id: SessionId,
    handshake: Handshake,
    config: SessionConfig,
    state: AtomicSessionState,
    connection: OnceLock<Arc<dyn Connection>>,
    dispatch: Mutex<Option<DispatchTable>>,
    lifecycle: Lifecycle,
    codecs: Arc<CodecRegistry>,
    liveness: LivenessTracker,
    metrics: AtomicMetrics,
    /// Status this side sent or received; replaced by the terminal status
    close_status: Mutex<Option<CloseStatus>>,
    closing_since: Mutex<Option<Instant>>,
    writer: Mutex<Writer>,
    close_signal: CloseSignal,
    registry: Option<Weak<SessionRegistry>>,
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        // Releases the watchdog and any blocked stream reader
        self.close_signal.fire();
    }
}

/// Handle to a session; clones share the same session
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl PartialEq for Session {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Session {}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .finish()
    }
}

/// Builder for [`Session`]
pub struct SessionBuilder {
    endpoint: Endpoint,
    config: SessionConfig,
    codecs: Option<Arc<CodecRegistry>>,
    executor: Option<Arc<dyn Executor>>,
    handshake: Handshake,
    registry: Option<Weak<SessionRegistry>>,
}

impl SessionBuilder {
    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn codecs(mut self, codecs: Arc<CodecRegistry>) -> Self {
        self.codecs = Some(codecs);
        self
    }

    /// Where streaming handlers run; defaults to one thread per message
    pub fn executor(mut self, executor: Arc<dyn Executor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn handshake(mut self, handshake: Handshake) -> Self {
        self.handshake = handshake;
        self
    }

    /// Track the session in `registry` while it is open
    pub fn registry(mut self, registry: &Arc<SessionRegistry>) -> Self {
        self.registry = Some(Arc::downgrade(registry));
        self
    }

    /// Bind the endpoint and create the session in CONNECTING
    pub fn build(self) -> Result<Session> {
        self.config.validate()?;

        let codecs = self.codecs.unwrap_or_else(|| Arc::new(CodecRegistry::new()));
        let executor = self
            .executor
            .unwrap_or_else(|| Arc::new(ThreadExecutor) as Arc<dyn Executor>);
        let close_signal = CloseSignal::new();
        let Endpoint {
            lifecycle,
            registrations,
        } = self.endpoint;

        let dispatch = DispatchTable::bind(
            registrations,
            &codecs,
            &self.config,
            executor,
            close_signal.subscribe(),
        )?;

        let inner = SessionInner {
            id: SessionId::next(),
            handshake: self.handshake,
            liveness: LivenessTracker::new(self.config.idle_timeout),
            config: self.config,
            state: AtomicSessionState::new(SessionState::Connecting),
            connection: OnceLock::new(),
            dispatch: Mutex::new(Some(dispatch)),
            lifecycle,
            codecs,
            metrics: AtomicMetrics::new(),
            close_status: Mutex::new(None),
            closing_since: Mutex::new(None),
            writer: Mutex::new(Writer::default()),
            close_signal,
            registry: self.registry,
        };
        debug!(session = %inner.id, "Session created");

        Ok(Session {
            inner: Arc::new(inner),
        })
    }
}

impl Session {
    pub fn builder(endpoint: Endpoint) -> SessionBuilder {
        SessionBuilder {
            endpoint,
            config: SessionConfig::default(),
            codecs: None,
            executor: None,
            handshake: Handshake::default(),
            registry: None,
        }
    }

    pub(crate) fn downgrade(&self) -> Weak<SessionInner> {
        Arc::downgrade(&self.inner)
    }

    pub(crate) fn upgrade(weak: &Weak<SessionInner>) -> Option<Session> {
        weak.upgrade().map(|inner| Session { inner })
    }

    pub(crate) fn close_signal(&self) -> &CloseSignal {
        &self.inner.close_signal
    }

    pub(crate) fn counters(&self) -> &AtomicMetrics {
        &self.inner.metrics
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub fn id(&self) -> SessionId {
        self.inner.id
    }

    pub fn state(&self) -> SessionState {
        self.inner.state.get()
    }

    pub fn is_open(&self) -> bool {
        self.inner.state.is_open()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    pub fn codecs(&self) -> &Arc<CodecRegistry> {
        &self.inner.codecs
    }

    pub fn sub_protocol(&self) -> Option<&str> {
        self.inner.handshake.sub_protocol.as_deref()
    }

    pub fn extensions(&self) -> &[String] {
        &self.inner.handshake.extensions
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner
            .handshake
            .local_addr
            .or_else(|| self.inner.connection.get().and_then(|c| c.local_addr()))
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.inner
            .handshake
            .remote_addr
            .or_else(|| self.inner.connection.get().and_then(|c| c.remote_addr()))
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.inner.liveness.idle_timeout()
    }

    /// Time since the last inbound frame
    pub fn idle_time(&self) -> Duration {
        self.inner.liveness.idle_time()
    }

    /// Time since the last pong, if one was ever received
    pub fn time_since_last_pong(&self) -> Option<Duration> {
        self.inner.liveness.time_since_last_pong()
    }

    /// Whether the last ping sent is still unanswered
    pub fn is_pong_pending(&self) -> bool {
        self.inner.liveness.is_pong_pending()
    }

    /// Final close status; `None` until the session is closed
    pub fn close_status(&self) -> Option<CloseStatus> {
        if !self.state().is_terminal() {
            return None;
        }
        self.inner.close_status.lock().clone()
    }

    pub fn metrics(&self) -> Metrics {
        self.inner.metrics.snapshot()
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Attach the connection and move CONNECTING -> OPEN
    ///
    /// Starts the watchdog, registers the session and runs the open
    /// handler. An error from the open handler is reported, the session
    /// stays open.
    pub fn open(&self, connection: Arc<dyn Connection>) -> Result<()> {
        self.inner
            .connection
            .set(connection)
            .map_err(|_| WsError::Handshake("session already has a connection".into()))?;

        self.inner
            .state
            .compare_exchange(SessionState::Connecting, SessionState::Open)
            .map_err(|state| {
                WsError::Handshake(format!("cannot open a session in state {:?}", state))
            })?;

        self.inner.liveness.record_activity();

        if let Err(e) = watchdog::spawn(self) {
            self.fail(e.clone());
            return Err(e);
        }

        let registry = self.registry();
        if let Some(registry) = &registry {
            registry.register(self);
        }
        // A failure that won since the OPEN transition has already released
        if self.state().is_terminal() {
            if let Some(registry) = &registry {
                registry.unregister(self);
            }
            return Err(WsError::InvalidState("session closed while opening".into()));
        }

        info!(
            session = %self.id(),
            sub_protocol = ?self.sub_protocol(),
            "Session opened"
        );

        if let Some(on_open) = self.inner.lifecycle.on_open.clone() {
            if let Err(e) = guarded(|| on_open(self)) {
                self.report_error(&e);
            }
        }
        Ok(())
    }

    /// Feed one inbound frame
    ///
    /// Fails with `InvalidState` before `open` and after the session closed
    /// (a late close frame is ignored). A fatal protocol error closes the
    /// session abnormally and is also returned, so the transport can stop
    /// reading.
    pub fn receive_frame(&self, frame: Frame) -> Result<()> {
        match self.state() {
            SessionState::Connecting => {
                return Err(WsError::InvalidState("session is not open yet".into()));
            }
            state if state.is_terminal() => {
                if frame.opcode == OpCode::Close {
                    trace!(session = %self.id(), "Ignoring close frame after termination");
                    return Ok(());
                }
                return Err(WsError::InvalidState("session is closed".into()));
            }
            _ => {}
        }

        self.inner.liveness.record_activity();
        self.inner.metrics.increment_frames_received();

        let result = self.route(frame);
        if let Err(e) = &result {
            if e.is_fatal() {
                self.fail(e.clone());
            }
        }
        result
    }

    fn route(&self, frame: Frame) -> Result<()> {
        let Frame {
            opcode,
            payload,
            fin,
        } = frame;

        if opcode.is_control() {
            if !fin {
                return Err(WsError::protocol(format!("fragmented {:?} frame", opcode)));
            }
            if payload.len() > MAX_CONTROL_PAYLOAD {
                return Err(WsError::protocol(format!(
                    "{:?} payload of {} bytes exceeds {}",
                    opcode,
                    payload.len(),
                    MAX_CONTROL_PAYLOAD
                )));
            }
        }

        match opcode {
            OpCode::Ping => {
                if self.inner.config.auto_pong && self.is_open() {
                    self.write(Frame::pong(payload))?;
                }
                Ok(())
            }
            OpCode::Pong => {
                self.inner.liveness.record_pong_received();
                if let Some(table) = self.inner.dispatch.lock().as_mut() {
                    table.on_pong(self, &payload);
                }
                Ok(())
            }
            OpCode::Close => self.on_close_frame(&payload),
            OpCode::Text | OpCode::Binary | OpCode::Continuation => {
                let mut dispatch = self.inner.dispatch.lock();
                match dispatch.as_mut() {
                    Some(table) => table.on_data(self, opcode, payload, fin),
                    None => Ok(()),
                }
            }
        }
    }

    fn on_close_frame(&self, payload: &[u8]) -> Result<()> {
        let received = CloseStatus::parse(payload)?;

        let peer_initiated = {
            let mut recorded = self.inner.close_status.lock();
            match self
                .inner
                .state
                .compare_exchange(SessionState::Open, SessionState::Closing)
            {
                Ok(_) => {
                    *recorded = Some(received.clone());
                    true
                }
                Err(SessionState::Closing) => false,
                Err(_) => return Ok(()),
            }
        };

        if peer_initiated {
            debug!(session = %self.id(), status = %received, "Peer initiated close");
            let echo = match received.code {
                CloseCode::NoStatus => CloseStatus::normal(),
                code => CloseStatus::new(code, received.reason.clone()),
            };
            {
                let mut writer = self.inner.writer.lock();
                writer.outgoing = None;
                self.write_locked(&mut writer, Frame::close(&echo))?;
            }
            self.finish(received);
        } else {
            let sent = self
                .inner
                .close_status
                .lock()
                .clone()
                .unwrap_or_else(CloseStatus::normal);
            debug!(session = %self.id(), status = %received, "Close echo received");
            self.finish(sent);
        }
        Ok(())
    }

    /// Begin the close handshake
    ///
    /// Returns the status this side sent. Once a close is under way (or
    /// done) further calls change nothing and return the recorded status.
    pub fn close(&self, code: CloseCode, reason: impl Into<String>) -> Result<CloseStatus> {
        if !code.is_valid_on_wire() {
            return Err(WsError::InvalidState(format!(
                "close code {} cannot be sent",
                code
            )));
        }

        let status = CloseStatus::new(code, reason);
        let initiated = {
            let mut recorded = self.inner.close_status.lock();
            match self
                .inner
                .state
                .compare_exchange(SessionState::Open, SessionState::Closing)
            {
                Ok(_) => {
                    *recorded = Some(status.clone());
                    *self.inner.closing_since.lock() = Some(Instant::now());
                    true
                }
                Err(SessionState::Connecting) => {
                    return Err(WsError::Handshake("session is not open yet".into()));
                }
                Err(_) => false,
            }
        };

        if !initiated {
            return Ok(self
                .inner
                .close_status
                .lock()
                .clone()
                .unwrap_or_else(CloseStatus::normal));
        }

        info!(session = %self.id(), status = %status, "Closing session");
        self.write(Frame::close(&status))?;
        Ok(status)
    }

    /// Report a transport failure; closes the session abnormally (1006)
    pub fn transport_failed(&self, cause: impl Into<String>) {
        self.fail(WsError::Transport(cause.into()));
    }

    // ------------------------------------------------------------------
    // Sending
    // ------------------------------------------------------------------

    fn ensure_open(&self) -> Result<()> {
        match self.state() {
            SessionState::Open => Ok(()),
            state => Err(WsError::InvalidState(format!(
                "cannot send in state {:?}",
                state
            ))),
        }
    }

    /// Encode `value` with the codec registry and send it as one message
    pub fn send<T: 'static>(&self, value: &T) -> Result<()> {
        let payload = self.inner.codecs.encode(value)?;
        self.send_payload(payload)
    }

    pub fn send_text(&self, text: impl Into<String>) -> Result<()> {
        self.send_payload(OutboundPayload::Text(text.into()))
    }

    pub fn send_binary(&self, data: impl Into<Vec<u8>>) -> Result<()> {
        self.send_payload(OutboundPayload::Binary(data.into()))
    }

    fn send_payload(&self, payload: OutboundPayload) -> Result<()> {
        self.ensure_open()?;
        let frame = match payload {
            OutboundPayload::Text(text) => Frame::text(text),
            OutboundPayload::Binary(data) => Frame::binary(data),
        };

        let result = {
            let mut writer = self.inner.writer.lock();
            if writer.outgoing.is_some() {
                return Err(WsError::InvalidState(
                    "a fragmented message is being sent".into(),
                ));
            }
            self.write_locked(&mut writer, frame)
        };
        self.after_write(result)
    }

    /// Send one fragment of a message; `is_last` ends the message
    ///
    /// All fragments of one message must encode to the same kind.
    pub fn send_partial<T: 'static>(&self, value: &T, is_last: bool) -> Result<()> {
        let payload = self.inner.codecs.encode(value)?;
        self.ensure_open()?;

        let kind = payload.kind();
        let result = {
            let mut writer = self.inner.writer.lock();
            let opcode = match writer.outgoing {
                None => match kind {
                    MessageKind::Text => OpCode::Text,
                    MessageKind::Binary => OpCode::Binary,
                },
                Some(current) if current == kind => OpCode::Continuation,
                Some(current) => {
                    return Err(WsError::InvalidState(format!(
                        "fragment of kind {:?} inside a {:?} message",
                        kind, current
                    )));
                }
            };
            let frame = Frame::new(opcode, payload.into_bytes(), is_last);
            let written = self.write_locked(&mut writer, frame);
            if written.is_ok() {
                writer.outgoing = if is_last { None } else { Some(kind) };
            }
            written
        };
        self.after_write(result)
    }

    pub fn send_ping(&self, payload: impl Into<Vec<u8>>) -> Result<()> {
        let payload = payload.into();
        self.ensure_open()?;
        check_control_payload(&payload)?;
        self.write(Frame::ping(payload))?;
        self.inner.liveness.record_ping_sent();
        Ok(())
    }

    pub fn send_pong(&self, payload: impl Into<Vec<u8>>) -> Result<()> {
        let payload = payload.into();
        self.ensure_open()?;
        check_control_payload(&payload)?;
        self.write(Frame::pong(payload))
    }

    fn write(&self, frame: Frame) -> Result<()> {
        let result = {
            let mut writer = self.inner.writer.lock();
            self.write_locked(&mut writer, frame)
        };
        self.after_write(result)
    }

    fn write_locked(&self, _writer: &mut Writer, frame: Frame) -> Result<()> {
        let connection = self
            .inner
            .connection
            .get()
            .ok_or_else(|| WsError::InvalidState("no connection attached".into()))?;
        connection.write_frame(frame)?;
        self.inner.metrics.increment_frames_sent();
        Ok(())
    }

    /// A fatal write error terminates the session; called without the write lock
    fn after_write(&self, result: Result<()>) -> Result<()> {
        if let Err(e) = &result {
            if e.is_fatal() {
                self.fail(e.clone());
            }
        }
        result
    }

    // ------------------------------------------------------------------
    // Termination
    // ------------------------------------------------------------------

    fn registry(&self) -> Option<Arc<SessionRegistry>> {
        self.inner.registry.as_ref().and_then(Weak::upgrade)
    }

    /// Deliver an error to the error handler
    pub(crate) fn report_error(&self, error: &WsError) {
        debug!(session = %self.id(), "Session error: {}", error);
        match self.inner.lifecycle.on_error.clone() {
            Some(on_error) => {
                let outcome = guarded(|| {
                    on_error(self, error);
                    Ok(())
                });
                if let Err(e) = outcome {
                    error!(session = %self.id(), "Error handler failed: {}", e);
                }
            }
            None => warn!(session = %self.id(), "Unhandled session error: {}", error),
        }
    }

    /// Terminate abnormally with the code `cause` maps to
    pub(crate) fn fail(&self, cause: WsError) {
        let status = CloseStatus::new(cause.close_code(), cause.close_reason());
        let Some(previous) = self.inner.state.terminate(SessionState::AbnormalClosed) else {
            trace!(session = %self.id(), "Already terminated, dropping: {}", cause);
            return;
        };
        *self.inner.close_status.lock() = Some(status.clone());

        warn!(session = %self.id(), status = %status, "Session closed abnormally: {}", cause);
        self.report_error(&cause);

        if matches!(cause, WsError::Protocol { .. }) && previous == SessionState::Open {
            let written = {
                let mut writer = self.inner.writer.lock();
                self.write_locked(&mut writer, Frame::close(&status))
            };
            if let Err(e) = written {
                debug!(session = %self.id(), "Failed to send close frame: {}", e);
            }
        }

        self.release(&status);
    }

    /// Complete the handshake: -> CLOSED
    fn finish(&self, status: CloseStatus) {
        if self.inner.state.terminate(SessionState::Closed).is_none() {
            return;
        }
        *self.inner.close_status.lock() = Some(status.clone());
        info!(session = %self.id(), status = %status, "Session closed");
        self.release(&status);
    }

    /// Tear down after the terminal transition; runs once per session
    fn release(&self, status: &CloseStatus) {
        self.inner.close_signal.fire();

        // Busy means a handler on the dispatch thread got us here
        if let Some(mut dispatch) = self.inner.dispatch.try_lock() {
            dispatch.take();
        }

        if let Some(connection) = self.inner.connection.get() {
            connection.disconnect(status);
        }

        if let Some(registry) = self.registry() {
            registry.unregister(self);
        }

        if let Some(on_close) = self.inner.lifecycle.on_close.clone() {
            let outcome = guarded(|| {
                on_close(self, status);
                Ok(())
            });
            if let Err(e) = outcome {
                error!(session = %self.id(), "Close handler failed: {}", e);
            }
        }
    }

    /// Enforce the idle and close deadlines; called by the watchdog
    pub(crate) fn check_deadlines(&self) {
        match self.state() {
            SessionState::Open => {
                if self.inner.liveness.is_idle_expired() {
                    self.fail(WsError::Timeout(format!(
                        "no frame received for {:?}",
                        self.idle_time()
                    )));
                }
            }
            SessionState::Closing => {
                let since = *self.inner.closing_since.lock();
                if let Some(since) = since {
                    if since.elapsed() >= self.inner.config.close_timeout {
                        self.fail(WsError::Timeout("close handshake timed out".into()));
                    }
                }
            }
            _ => {}
        }
    }
}

fn check_control_payload(payload: &[u8]) -> Result<()> {
    if payload.len() > MAX_CONTROL_PAYLOAD {
        return Err(WsError::Encode(format!(
            "control payload of {} bytes exceeds {}",
            payload.len(),
            MAX_CONTROL_PAYLOAD
        )));
    }
    Ok(())
}
