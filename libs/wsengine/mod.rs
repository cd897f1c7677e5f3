//! # wsengine
//!
//! A WebSocket session engine: session lifecycle and close handshake,
//! typed dispatch of inbound messages to endpoint handlers, and a blocking
//! stream bridge for messages consumed as they arrive.
//!
//! ## Features
//!
//! - **One atomic state machine**: racing close triggers resolve by
//!   compare-and-swap, the close handler runs exactly once
//! - **Typed handlers**: payloads decoded through a registry of converters,
//!   user converters ahead of the built-ins
//! - **Streaming with backpressure**: bounded crossbeam queue between the
//!   dispatch thread and the worker reading the message
//! - **Transport-agnostic core**: any `Connection` works; a tokio-tungstenite
//!   transport is included

pub mod traits;
pub mod core;
pub mod manager;

// Re-export all traits
pub use traits::*;

// Re-export core functionality
pub use core::{
    client, config, connection_state, endpoint, frame, registry, session, stream, transport,
    client::{WebSocketClient, WebSocketClientBuilder},
    config::{ClientConfig, SessionConfig},
    connection_state::{Metrics, SessionState},
    endpoint::{DeliveryMode, Endpoint, EndpointBuilder, MessageCategory},
    frame::{CloseCode, CloseStatus, Frame, OpCode},
    registry::{CodecRegistry, DeclaredType, JsonCodec},
    session::{Handshake, Session, SessionBuilder, SessionId},
    stream::{MessageInputStream, MessageReader},
};

// Re-export manager
pub use manager::SessionRegistry;
