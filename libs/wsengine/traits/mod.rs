//! # wsengine traits
//!
//! Seams between the session engine and the code around it:
//!
//! - **Connection**: the transport a session writes frames to
//! - **Decoder / Encoder**: payload conversion for typed handlers and sends
//! - **SessionListener**: open/close notifications across a client
//! - **Executor**: where streaming handlers run
//! - **HeaderProvider**: extra upgrade request headers for `connect`

pub mod codec;
pub mod connection;
pub mod error;
pub mod executor;
pub mod headers;
pub mod listener;

pub use codec::{Decoder, Encoder, MessageKind, OutboundPayload, Payload};
pub use connection::Connection;
pub use error::{Result, WsError};
pub use executor::{Executor, Job, ThreadExecutor};
pub use headers::{HeaderProvider, Headers, NoHeaders, StaticHeaders};
pub use listener::{NoOpListener, SessionListener};
