//! Endpoint definition: the handler set bound to one session
//!
//! An [`Endpoint`] is assembled with [`EndpointBuilder`] by registering at
//! most one message handler per category plus optional lifecycle handlers.
//! The builder only records registrations; selecting and invoking them is
//! the dispatch table's job once the endpoint is bound to a session.
//!
//! # Example
//!
//! ```ignore
//! let endpoint = Endpoint::builder()
//!     .on_open(|session| {
//!         session.send_text("hello")?;
//!         Ok(())
//!     })
//!     .on_text::<String, _>(|session, text| session.send_text(text))
//!     .on_binary_stream(|_session, mut stream| {
//!         let mut sink = Vec::new();
//!         std::io::copy(&mut stream, &mut sink).map_err(|e| WsError::Handler(e.to_string()))?;
//!         Ok(())
//!     })
//!     .on_close(|_session, status| println!("closed: {}", status))
//!     .build()?;
//! ```

use crate::core::frame::CloseStatus;
use crate::core::registry::DeclaredType;
use crate::core::session::Session;
use crate::core::stream::{MessageInputStream, MessageReader};
use crate::traits::{Result, WsError};
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// Which inbound messages a handler receives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageCategory {
    Text,
    Binary,
    Pong,
}

impl fmt::Display for MessageCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageCategory::Text => write!(f, "text"),
            MessageCategory::Binary => write!(f, "binary"),
            MessageCategory::Pong => write!(f, "pong"),
        }
    }
}

/// How a handler receives a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeliveryMode {
    /// Buffered until the final frame, decoded once
    Whole,
    /// Each fragment decoded on its own, with an `is_last` flag
    Partial,
    /// Pulled through a blocking stream on a worker thread
    Stream,
}

pub type OpenHandler = Arc<dyn Fn(&Session) -> Result<()> + Send + Sync>;
pub type CloseHandler = Arc<dyn Fn(&Session, &CloseStatus) + Send + Sync>;
pub type ErrorHandler = Arc<dyn Fn(&Session, &WsError) + Send + Sync>;

pub(crate) type WholeFn = Box<dyn FnMut(&Session, Box<dyn Any + Send>) -> Result<()> + Send>;
pub(crate) type PartialFn =
    Box<dyn FnMut(&Session, Box<dyn Any + Send>, bool) -> Result<()> + Send>;
pub(crate) type StreamFn = Arc<dyn Fn(&Session, MessageInputStream) -> Result<()> + Send + Sync>;

/// Invocation strategy chosen when the handler is registered
pub(crate) enum Invoker {
    Whole(WholeFn),
    Partial(PartialFn),
    Stream(StreamFn),
}

impl Invoker {
    fn mode(&self) -> DeliveryMode {
        match self {
            Invoker::Whole(_) => DeliveryMode::Whole,
            Invoker::Partial(_) => DeliveryMode::Partial,
            Invoker::Stream(_) => DeliveryMode::Stream,
        }
    }
}

/// One registered message handler
pub struct HandlerRegistration {
    category: MessageCategory,
    declared: DeclaredType,
    pub(crate) invoker: Invoker,
}

impl HandlerRegistration {
    pub fn category(&self) -> MessageCategory {
        self.category
    }

    pub fn mode(&self) -> DeliveryMode {
        self.invoker.mode()
    }

    /// Type the handler's payload is decoded into
    pub fn declared(&self) -> DeclaredType {
        self.declared
    }
}

impl fmt::Debug for HandlerRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistration")
            .field("category", &self.category)
            .field("mode", &self.mode())
            .field("declared", &self.declared.name)
            .finish()
    }
}

/// Open/close/error handlers shared by the session and its dispatch table
#[derive(Clone, Default)]
pub(crate) struct Lifecycle {
    pub on_open: Option<OpenHandler>,
    pub on_close: Option<CloseHandler>,
    pub on_error: Option<ErrorHandler>,
}

/// Validated handler set, consumed when a session is created
pub struct Endpoint {
    pub(crate) lifecycle: Lifecycle,
    pub(crate) registrations: Vec<HandlerRegistration>,
}

impl Endpoint {
    pub fn builder() -> EndpointBuilder {
        EndpointBuilder::new()
    }

    pub fn registrations(&self) -> &[HandlerRegistration] {
        &self.registrations
    }

    pub fn handles(&self, category: MessageCategory) -> bool {
        self.registrations.iter().any(|r| r.category == category)
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("registrations", &self.registrations)
            .field("on_open", &self.lifecycle.on_open.is_some())
            .field("on_close", &self.lifecycle.on_close.is_some())
            .field("on_error", &self.lifecycle.on_error.is_some())
            .finish()
    }
}

/// Builder for [`Endpoint`]
///
/// Registrations are checked by `build`; the first conflict is reported.
#[derive(Default)]
pub struct EndpointBuilder {
    lifecycle: Lifecycle,
    registrations: Vec<HandlerRegistration>,
}

fn whole<T, F>(mut handler: F) -> Invoker
where
    T: Send + 'static,
    F: FnMut(&Session, T) -> Result<()> + Send + 'static,
{
    Invoker::Whole(Box::new(move |session: &Session, value: Box<dyn Any + Send>| {
        let value = crate::core::registry::downcast::<T>(value)?;
        handler(session, value)
    }))
}

fn partial<T, F>(mut handler: F) -> Invoker
where
    T: Send + 'static,
    F: FnMut(&Session, T, bool) -> Result<()> + Send + 'static,
{
    Invoker::Partial(Box::new(
        move |session: &Session, value: Box<dyn Any + Send>, is_last: bool| {
            let value = crate::core::registry::downcast::<T>(value)?;
            handler(session, value, is_last)
        },
    ))
}

impl EndpointBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(
        mut self,
        category: MessageCategory,
        declared: DeclaredType,
        invoker: Invoker,
    ) -> Self {
        self.registrations.push(HandlerRegistration {
            category,
            declared,
            invoker,
        });
        self
    }

    /// Called once after the session opens; an error is reported, not fatal
    pub fn on_open<F>(mut self, handler: F) -> Self
    where
        F: Fn(&Session) -> Result<()> + Send + Sync + 'static,
    {
        self.lifecycle.on_open = Some(Arc::new(handler));
        self
    }

    /// Called exactly once with the session's close status
    pub fn on_close<F>(mut self, handler: F) -> Self
    where
        F: Fn(&Session, &CloseStatus) + Send + Sync + 'static,
    {
        self.lifecycle.on_close = Some(Arc::new(handler));
        self
    }

    pub fn on_error<F>(mut self, handler: F) -> Self
    where
        F: Fn(&Session, &WsError) + Send + Sync + 'static,
    {
        self.lifecycle.on_error = Some(Arc::new(handler));
        self
    }

    /// Whole text messages decoded into `T`
    pub fn on_text<T, F>(self, handler: F) -> Self
    where
        T: Send + 'static,
        F: FnMut(&Session, T) -> Result<()> + Send + 'static,
    {
        self.register(MessageCategory::Text, DeclaredType::of::<T>(), whole(handler))
    }

    /// Text fragments decoded into `T` as they arrive
    pub fn on_text_partial<T, F>(self, handler: F) -> Self
    where
        T: Send + 'static,
        F: FnMut(&Session, T, bool) -> Result<()> + Send + 'static,
    {
        self.register(MessageCategory::Text, DeclaredType::of::<T>(), partial(handler))
    }

    /// Text messages read as characters on a worker thread
    pub fn on_text_stream<F>(self, handler: F) -> Self
    where
        F: Fn(&Session, MessageReader) -> Result<()> + Send + Sync + 'static,
    {
        let invoker = Invoker::Stream(Arc::new(
            move |session: &Session, stream: MessageInputStream| {
                handler(session, MessageReader::new(stream))
            },
        ));
        self.register(
            MessageCategory::Text,
            DeclaredType::of::<MessageReader>(),
            invoker,
        )
    }

    /// Whole binary messages decoded into `T`
    pub fn on_binary<T, F>(self, handler: F) -> Self
    where
        T: Send + 'static,
        F: FnMut(&Session, T) -> Result<()> + Send + 'static,
    {
        self.register(MessageCategory::Binary, DeclaredType::of::<T>(), whole(handler))
    }

    pub fn on_binary_partial<T, F>(self, handler: F) -> Self
    where
        T: Send + 'static,
        F: FnMut(&Session, T, bool) -> Result<()> + Send + 'static,
    {
        self.register(MessageCategory::Binary, DeclaredType::of::<T>(), partial(handler))
    }

    /// Binary messages read as bytes on a worker thread
    pub fn on_binary_stream<F>(self, handler: F) -> Self
    where
        F: Fn(&Session, MessageInputStream) -> Result<()> + Send + Sync + 'static,
    {
        self.register(
            MessageCategory::Binary,
            DeclaredType::of::<MessageInputStream>(),
            Invoker::Stream(Arc::new(handler)),
        )
    }

    /// Pong payloads decoded into `T`
    pub fn on_pong<T, F>(self, handler: F) -> Self
    where
        T: Send + 'static,
        F: FnMut(&Session, T) -> Result<()> + Send + 'static,
    {
        self.register(MessageCategory::Pong, DeclaredType::of::<T>(), whole(handler))
    }

    /// Validate and finish the endpoint
    ///
    /// Fails if a category has more than one handler, or if a pong handler
    /// is anything other than a whole-message handler.
    pub fn build(self) -> Result<Endpoint> {
        for (i, registration) in self.registrations.iter().enumerate() {
            if let Some(other) = self.registrations[..i]
                .iter()
                .find(|r| r.category == registration.category)
            {
                return Err(WsError::Configuration(format!(
                    "{} messages already have a {:?} handler for {}; \
                     cannot add a {:?} handler for {}",
                    registration.category,
                    other.mode(),
                    other.declared.name,
                    registration.mode(),
                    registration.declared.name
                )));
            }
            if registration.category == MessageCategory::Pong
                && registration.mode() != DeliveryMode::Whole
            {
                return Err(WsError::Configuration(format!(
                    "pong handlers must be whole-message handlers, got {:?}",
                    registration.mode()
                )));
            }
        }

        Ok(Endpoint {
            lifecycle: self.lifecycle,
            registrations: self.registrations,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn test_empty_endpoint_builds() {
        let endpoint = Endpoint::builder().build().unwrap();
        assert!(endpoint.registrations().is_empty());
        assert!(!endpoint.handles(MessageCategory::Text));
    }

    #[test]
    fn test_one_handler_per_category() {
        let endpoint = Endpoint::builder()
            .on_text::<String, _>(|_, _| Ok(()))
            .on_binary_stream(|_, mut stream| {
                let mut sink = Vec::new();
                let _ = stream.read_to_end(&mut sink);
                Ok(())
            })
            .on_pong::<Vec<u8>, _>(|_, _| Ok(()))
            .build()
            .unwrap();

        let modes: Vec<_> = endpoint
            .registrations()
            .iter()
            .map(|r| (r.category(), r.mode()))
            .collect();
        assert_eq!(
            modes,
            vec![
                (MessageCategory::Text, DeliveryMode::Whole),
                (MessageCategory::Binary, DeliveryMode::Stream),
                (MessageCategory::Pong, DeliveryMode::Whole),
            ]
        );
        assert_eq!(
            endpoint.registrations()[0].declared(),
            DeclaredType::of::<String>()
        );
    }

    #[test]
    fn test_whole_and_stream_for_text_rejected() {
        let result = Endpoint::builder()
            .on_text::<String, _>(|_, _| Ok(()))
            .on_text_stream(|_, _| Ok(()))
            .build();

        match result {
            Err(WsError::Configuration(msg)) => assert!(msg.contains("text")),
            other => panic!("expected configuration error, got {:?}", other),
        }
    }

    #[test]
    fn test_whole_and_partial_for_binary_rejected() {
        let result = Endpoint::builder()
            .on_binary::<Vec<u8>, _>(|_, _| Ok(()))
            .on_binary_partial::<Vec<u8>, _>(|_, _, _| Ok(()))
            .build();
        assert!(matches!(result, Err(WsError::Configuration(_))));
    }

    #[test]
    fn test_two_whole_handlers_rejected() {
        let result = Endpoint::builder()
            .on_text::<String, _>(|_, _| Ok(()))
            .on_text::<i64, _>(|_, _| Ok(()))
            .build();
        assert!(matches!(result, Err(WsError::Configuration(_))));
    }

    #[test]
    fn test_partial_pong_rejected() {
        let result = EndpointBuilder::new()
            .register(
                MessageCategory::Pong,
                DeclaredType::of::<Vec<u8>>(),
                partial::<Vec<u8>, _>(|_, _, _| Ok(())),
            )
            .build();
        assert!(matches!(result, Err(WsError::Configuration(_))));
    }

    #[test]
    fn test_lifecycle_handlers_recorded() {
        let endpoint = Endpoint::builder()
            .on_open(|_| Ok(()))
            .on_close(|_, _| {})
            .build()
            .unwrap();

        assert!(endpoint.lifecycle.on_open.is_some());
        assert!(endpoint.lifecycle.on_close.is_some());
        assert!(endpoint.lifecycle.on_error.is_none());
    }
}
