use crate::core::config::ClientConfig;
use crate::core::endpoint::Endpoint;
use crate::core::frame::CloseCode;
use crate::core::registry::CodecRegistry;
use crate::core::session::{Handshake, Session};
use crate::core::transport;
use crate::manager::SessionRegistry;
use crate::traits::*;
use parking_lot::RwLock;
use std::sync::Arc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http;
use tracing::{debug, info, warn};

/// Owner of the sessions it creates
///
/// The client holds the defaults every session starts from, the codec
/// registry, the executor for streaming handlers and, while started, the
/// session registry. `stop` closes every open session with 1001 and drops
/// the registry.
///
/// # Example
/// ```ignore
/// let client = WebSocketClient::builder()
///     .config(ClientConfig::load("config/client.yaml")?)
///     .build()?;
/// client.start()?;
///
/// let endpoint = Endpoint::builder()
///     .on_text::<String, _>(|_, text| {
///         println!("{}", text);
///         Ok(())
///     })
///     .build()?;
/// let session = client.connect("ws://127.0.0.1:9001", endpoint).await?;
/// session.send_text("Hello World!")?;
///
/// client.stop();
/// ```
pub struct WebSocketClient {
    config: ClientConfig,
    codecs: Arc<CodecRegistry>,
    executor: Arc<dyn Executor>,
    headers: Arc<dyn HeaderProvider>,
    listeners: RwLock<Vec<Arc<dyn SessionListener>>>,
    registry: RwLock<Option<Arc<SessionRegistry>>>,
}

impl WebSocketClient {
    pub fn builder() -> WebSocketClientBuilder {
        WebSocketClientBuilder::new()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn codecs(&self) -> &Arc<CodecRegistry> {
        &self.codecs
    }

    /// Create the session registry; listeners added so far are attached
    pub fn start(&self) -> Result<()> {
        let mut registry = self.registry.write();
        if registry.is_some() {
            return Err(WsError::InvalidState("client already started".into()));
        }

        let sessions = Arc::new(SessionRegistry::new());
        for listener in self.listeners.read().iter() {
            sessions.add_listener(Arc::clone(listener));
        }
        *registry = Some(sessions);
        info!("WebSocket client started");
        Ok(())
    }

    /// Close every open session with 1001 and drop the registry
    ///
    /// Sessions finish their handshakes on their own; each either receives
    /// the echo or hits its close timeout.
    pub fn stop(&self) {
        let Some(registry) = self.registry.write().take() else {
            debug!("Client not running, nothing to stop");
            return;
        };

        let sessions = registry.open_sessions();
        info!("Stopping WebSocket client, closing {} session(s)", sessions.len());
        for session in sessions {
            if let Err(e) = session.close(CloseCode::Away, "client stopping") {
                warn!(session = %session.id(), "Failed to close session: {}", e);
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.registry.read().is_some()
    }

    pub fn add_session_listener(&self, listener: Arc<dyn SessionListener>) {
        if let Some(registry) = self.registry.read().as_ref() {
            registry.add_listener(Arc::clone(&listener));
        }
        self.listeners.write().push(listener);
    }

    /// Sessions currently open; empty when stopped
    pub fn open_sessions(&self) -> Vec<Session> {
        self.registry
            .read()
            .as_ref()
            .map(|registry| registry.open_sessions())
            .unwrap_or_default()
    }

    pub fn session_registry(&self) -> Option<Arc<SessionRegistry>> {
        self.registry.read().clone()
    }

    fn running_registry(&self) -> Result<Arc<SessionRegistry>> {
        self.session_registry()
            .ok_or_else(|| WsError::InvalidState("client is not started".into()))
    }

    /// Create a tracked session in CONNECTING with the client's defaults
    pub fn session(&self, endpoint: Endpoint, handshake: Handshake) -> Result<Session> {
        let registry = self.running_registry()?;
        Session::builder(endpoint)
            .config(self.config.session.clone())
            .codecs(Arc::clone(&self.codecs))
            .executor(Arc::clone(&self.executor))
            .handshake(handshake)
            .registry(&registry)
            .build()
    }

    /// Open a session over a caller-supplied connection
    ///
    /// The caller's transport then feeds `Session::receive_frame` and
    /// reports failures through `Session::transport_failed`.
    pub fn attach(
        &self,
        connection: Arc<dyn Connection>,
        endpoint: Endpoint,
        handshake: Handshake,
    ) -> Result<Session> {
        let session = self.session(endpoint, handshake)?;
        session.open(connection)?;
        Ok(session)
    }

    /// Connect to `url` over tokio-tungstenite and open a session
    pub async fn connect(&self, url: &str, endpoint: Endpoint) -> Result<Session> {
        let registry = self.running_registry()?;

        let mut request = url
            .into_client_request()
            .map_err(|e| WsError::Handshake(format!("invalid request for {}: {}", url, e)))?;

        let headers = self.headers.get_headers().await;
        for (key, value) in headers {
            match (
                key.parse::<http::header::HeaderName>(),
                value.parse::<http::header::HeaderValue>(),
            ) {
                (Ok(name), Ok(value)) => {
                    request.headers_mut().insert(name, value);
                }
                (Err(_), _) => warn!("Invalid header name: {}", key),
                (_, Err(_)) => warn!("Invalid header value for key '{}': {}", key, value),
            }
        }

        if !self.config.sub_protocols.is_empty() {
            let offered = self.config.sub_protocols.join(", ");
            match offered.parse::<http::header::HeaderValue>() {
                Ok(value) => {
                    request
                        .headers_mut()
                        .insert(http::header::SEC_WEBSOCKET_PROTOCOL, value);
                }
                Err(_) => {
                    return Err(WsError::Configuration(format!(
                        "invalid sub-protocol list: {}",
                        offered
                    )));
                }
            }
        }

        let (stream, response) = connect_async(request)
            .await
            .map_err(|e| WsError::Handshake(format!("failed to connect to {}: {}", url, e)))?;
        info!("Connected to {}", url);

        let mut handshake = transport::handshake_from_response(&response);
        let (local_addr, remote_addr) = transport::tcp_addrs(&stream);
        handshake.local_addr = local_addr;
        handshake.remote_addr = remote_addr;

        // tungstenite answers pings itself
        let mut config = self.config.session.clone();
        config.auto_pong = false;

        let session = Session::builder(endpoint)
            .config(config)
            .codecs(Arc::clone(&self.codecs))
            .executor(Arc::clone(&self.executor))
            .handshake(handshake)
            .registry(&registry)
            .build()?;

        transport::run_session(session.clone(), stream, self.config.dispatch_queue_capacity)?;
        Ok(session)
    }
}

impl Drop for WebSocketClient {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Builder for [`WebSocketClient`]
pub struct WebSocketClientBuilder {
    config: ClientConfig,
    codecs: CodecRegistry,
    executor: Arc<dyn Executor>,
    headers: Arc<dyn HeaderProvider>,
    listeners: Vec<Arc<dyn SessionListener>>,
}

impl Default for WebSocketClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl WebSocketClientBuilder {
    pub fn new() -> Self {
        Self {
            config: ClientConfig::default(),
            codecs: CodecRegistry::new(),
            executor: Arc::new(ThreadExecutor),
            headers: Arc::new(NoHeaders),
            listeners: Vec::new(),
        }
    }

    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Replace the codec registry (built-ins are included by `CodecRegistry::new`)
    pub fn codecs(mut self, codecs: CodecRegistry) -> Self {
        self.codecs = codecs;
        self
    }

    /// Register extra converters on the default registry
    pub fn with_codecs(mut self, register: impl FnOnce(&mut CodecRegistry)) -> Self {
        register(&mut self.codecs);
        self
    }

    pub fn executor(mut self, executor: Arc<dyn Executor>) -> Self {
        self.executor = executor;
        self
    }

    pub fn headers<H: HeaderProvider + 'static>(mut self, headers: H) -> Self {
        self.headers = Arc::new(headers);
        self
    }

    pub fn listener(mut self, listener: Arc<dyn SessionListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn build(self) -> Result<WebSocketClient> {
        self.config.validate()?;
        Ok(WebSocketClient {
            config: self.config,
            codecs: Arc::new(self.codecs),
            executor: self.executor,
            headers: self.headers,
            listeners: RwLock::new(self.listeners),
            registry: RwLock::new(None),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::frame::{CloseStatus, Frame};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct NullConnection;

    impl Connection for NullConnection {
        fn write_frame(&self, _frame: Frame) -> Result<()> {
            Ok(())
        }

        fn disconnect(&self, _status: &CloseStatus) {}
    }

    #[derive(Default)]
    struct Opened(AtomicUsize);

    impl SessionListener for Opened {
        fn on_session_opened(&self, _session: &Session) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn empty_endpoint() -> Endpoint {
        Endpoint::builder().build().unwrap()
    }

    #[test]
    fn test_sessions_need_a_started_client() {
        let client = WebSocketClient::builder().build().unwrap();
        assert!(!client.is_running());
        assert!(matches!(
            client.attach(Arc::new(NullConnection), empty_endpoint(), Handshake::default()),
            Err(WsError::InvalidState(_))
        ));

        client.start().unwrap();
        assert!(matches!(client.start(), Err(WsError::InvalidState(_))));
        client
            .attach(Arc::new(NullConnection), empty_endpoint(), Handshake::default())
            .unwrap();
        assert_eq!(client.open_sessions().len(), 1);
    }

    #[test]
    fn test_stop_closes_sessions_going_away() {
        let client = WebSocketClient::builder().build().unwrap();
        client.start().unwrap();
        let session = client
            .attach(Arc::new(NullConnection), empty_endpoint(), Handshake::default())
            .unwrap();

        client.stop();
        assert!(!client.is_running());
        assert!(client.open_sessions().is_empty());

        // The session answers the echo on its own
        session
            .receive_frame(Frame::close(&CloseStatus::normal()))
            .unwrap();
        assert_eq!(session.close_status().unwrap().code, CloseCode::Away);
    }

    #[test]
    fn test_listeners_attached_before_and_after_start() {
        let early = Arc::new(Opened::default());
        let late = Arc::new(Opened::default());
        let client = WebSocketClient::builder()
            .listener(early.clone())
            .build()
            .unwrap();
        client.start().unwrap();
        client.add_session_listener(late.clone());

        client
            .attach(Arc::new(NullConnection), empty_endpoint(), Handshake::default())
            .unwrap();
        assert_eq!(early.0.load(Ordering::SeqCst), 1);
        assert_eq!(late.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_client_codecs_reach_sessions() {
        #[derive(serde::Serialize, serde::Deserialize)]
        struct Ping {
            seq: u32,
        }

        let client = WebSocketClient::builder()
            .with_codecs(|codecs| {
                codecs.register_json::<Ping>();
            })
            .build()
            .unwrap();
        client.start().unwrap();

        let endpoint = Endpoint::builder()
            .on_text::<Ping, _>(|_, _| Ok(()))
            .build()
            .unwrap();
        let session = client
            .attach(Arc::new(NullConnection), endpoint, Handshake::default())
            .unwrap();
        session.send(&Ping { seq: 1 }).unwrap();
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = ClientConfig::default();
        config.dispatch_queue_capacity = 0;
        assert!(WebSocketClient::builder().config(config).build().is_err());
    }
}
