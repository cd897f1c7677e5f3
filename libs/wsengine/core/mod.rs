//! # wsengine core
//!
//! Session lifecycle, endpoint dispatch and the streaming bridge.
//!
//! ## Example
//!
//! ```rust,ignore
//! use wsengine::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let client = WebSocketClient::builder().build()?;
//!     client.start()?;
//!
//!     let endpoint = Endpoint::builder()
//!         .on_text::<String, _>(|session, text| {
//!             println!("echo: {}", text);
//!             session.close(CloseCode::Normal, "done").map(|_| ())
//!         })
//!         .on_close(|_, status| println!("closed: {}", status))
//!         .build()?;
//!
//!     let session = client.connect("ws://127.0.0.1:9001", endpoint).await?;
//!     session.send_text("Hello World!")?;
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod config;
pub mod connection_state;
pub(crate) mod dispatch;
pub mod endpoint;
pub mod frame;
pub mod liveness;
pub mod registry;
pub mod session;
pub mod stream;
pub mod transport;
pub(crate) mod watchdog;

pub use client::{WebSocketClient, WebSocketClientBuilder};
pub use config::{ClientConfig, SessionConfig};
pub use connection_state::{AtomicMetrics, AtomicSessionState, Metrics, SessionState};
pub use endpoint::{DeliveryMode, Endpoint, EndpointBuilder, HandlerRegistration, MessageCategory};
pub use frame::{CloseCode, CloseStatus, Frame, OpCode};
pub use liveness::LivenessTracker;
pub use registry::{CodecRegistry, DeclaredType, DecoderChain, JsonCodec};
pub use session::{Handshake, Session, SessionBuilder, SessionId};
pub use stream::{MessageInputStream, MessageReader};
pub use transport::TungsteniteConnection;
