use async_trait::async_trait;
use std::collections::HashMap;

/// HTTP headers to send with the upgrade request
pub type Headers = HashMap<String, String>;

/// Trait for providing upgrade request headers
///
/// Called once per `WebSocketClient::connect`, so tokens or nonces can be
/// generated fresh for every session.
///
/// # Example
/// ```ignore
/// struct ApiKey(String);
///
/// #[async_trait::async_trait]
/// impl HeaderProvider for ApiKey {
///     async fn get_headers(&self) -> Headers {
///         let mut headers = HashMap::new();
///         headers.insert("X-API-Key".to_string(), self.0.clone());
///         headers
///     }
/// }
/// ```
#[async_trait]
pub trait HeaderProvider: Send + Sync {
    async fn get_headers(&self) -> Headers;
}

/// A no-op header provider that doesn't add any headers
pub struct NoHeaders;

#[async_trait]
impl HeaderProvider for NoHeaders {
    async fn get_headers(&self) -> Headers {
        HashMap::new()
    }
}

/// Fixed set of headers sent with every request
pub struct StaticHeaders(pub Headers);

#[async_trait]
impl HeaderProvider for StaticHeaders {
    async fn get_headers(&self) -> Headers {
        self.0.clone()
    }
}
