//! Dispatch table: routes inbound data messages and pongs to handlers
//!
//! Built once per session from an [`Endpoint`](crate::core::endpoint::Endpoint).
//! Decoder chains are resolved at bind time, so an endpoint whose handler
//! type has no decoder is rejected before the session opens.
//!
//! Per category the table picks one of three paths:
//!
//! - whole: buffer fragments, decode once on the final frame, invoke
//! - partial: decode each fragment with a chunk-capable decoder, invoke
//!   with `is_last`
//! - stream: open a bridge on the first fragment, start the handler on the
//!   executor, push every fragment into the bridge
//!
//! Errors returned from `on_data` are fatal for the session. Decode and
//! handler failures are message-local and go to the session's error handler.

use crate::core::config::SessionConfig;
use crate::core::endpoint::{
    DeliveryMode, HandlerRegistration, Invoker, MessageCategory, PartialFn, StreamFn, WholeFn,
};
use crate::core::frame::{CloseCode, OpCode};
use crate::core::registry::{CodecRegistry, DecoderChain};
use crate::core::session::Session;
use crate::core::stream::{bridge, BridgeProducer, Completion};
use crate::traits::{Executor, Payload, Result, WsError};
use crossbeam_channel::Receiver;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, trace};

enum Bound {
    Whole {
        chain: DecoderChain,
        invoke: WholeFn,
    },
    Partial {
        chain: DecoderChain,
        invoke: PartialFn,
        utf8_tail: Vec<u8>,
    },
    Stream {
        invoke: StreamFn,
        previous: Option<Completion>,
    },
}

enum Target {
    Buffer(Vec<u8>),
    Fragments,
    Bridge(BridgeProducer),
    Discard,
}

/// Data message currently being received
struct Assembly {
    category: MessageCategory,
    size: usize,
    target: Target,
    utf8_tail: Vec<u8>,
}

pub(crate) struct DispatchTable {
    text: Option<Bound>,
    binary: Option<Bound>,
    pong: Option<Bound>,
    assembly: Option<Assembly>,
    executor: Arc<dyn Executor>,
    closed: Receiver<()>,
    allow_coercion: bool,
    max_text_message_size: usize,
    max_binary_message_size: usize,
    stream_queue_capacity: usize,
}

/// Run user code, turning a panic into a handler error
pub(crate) fn guarded<R>(f: impl FnOnce() -> Result<R>) -> Result<R> {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(panic) => {
            let msg = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "handler panicked".to_string());
            Err(WsError::Handler(msg))
        }
    }
}

fn invalid_utf8() -> WsError {
    WsError::Protocol {
        code: CloseCode::Invalid,
        reason: "text message is not valid UTF-8".into(),
    }
}

/// Prepend the held-back bytes, hold back a trailing incomplete sequence
fn split_utf8(tail: &mut Vec<u8>, payload: Vec<u8>, fin: bool) -> Result<String> {
    let mut bytes = std::mem::take(tail);
    if bytes.is_empty() {
        bytes = payload;
    } else {
        bytes.extend_from_slice(&payload);
    }

    let valid = match std::str::from_utf8(&bytes) {
        Ok(_) => bytes.len(),
        Err(e) if e.error_len().is_none() && !fin => e.valid_up_to(),
        Err(_) => return Err(invalid_utf8()),
    };
    *tail = bytes.split_off(valid);
    String::from_utf8(bytes).map_err(|_| invalid_utf8())
}

/// Validate a text fragment in place, keeping a trailing incomplete sequence
fn check_utf8(tail: &mut Vec<u8>, payload: &[u8], fin: bool) -> Result<()> {
    let joined;
    let bytes: &[u8] = if tail.is_empty() {
        payload
    } else {
        joined = [tail.as_slice(), payload].concat();
        &joined
    };

    let rest = match std::str::from_utf8(bytes) {
        Ok(_) => &[][..],
        Err(e) if e.error_len().is_none() && !fin => &bytes[e.valid_up_to()..],
        Err(_) => return Err(invalid_utf8()),
    };
    *tail = rest.to_vec();
    Ok(())
}

impl DispatchTable {
    /// Resolve decoders and slot every registration
    pub(crate) fn bind(
        registrations: Vec<HandlerRegistration>,
        codecs: &CodecRegistry,
        config: &SessionConfig,
        executor: Arc<dyn Executor>,
        closed: Receiver<()>,
    ) -> Result<Self> {
        let mut table = Self {
            text: None,
            binary: None,
            pong: None,
            assembly: None,
            executor,
            closed,
            allow_coercion: config.allow_cross_type_coercion,
            max_text_message_size: config.max_text_message_size,
            max_binary_message_size: config.max_binary_message_size,
            stream_queue_capacity: config.stream_queue_capacity,
        };

        for registration in registrations {
            let category = registration.category();
            let declared = registration.declared();
            let mode = registration.mode();

            if category == MessageCategory::Pong && mode != DeliveryMode::Whole {
                return Err(WsError::Configuration(format!(
                    "pong handlers must be whole-message handlers, got {:?}",
                    mode
                )));
            }

            let resolve = || -> Result<DecoderChain> {
                let chain = codecs.decoders_for(declared);
                if chain.is_empty() {
                    return Err(WsError::Configuration(format!(
                        "no decoder registered for {} ({} handler)",
                        declared.name, category
                    )));
                }
                Ok(chain)
            };

            let bound = match registration.invoker {
                Invoker::Whole(invoke) => Bound::Whole {
                    chain: resolve()?,
                    invoke,
                },
                Invoker::Partial(invoke) => {
                    let chain = resolve()?;
                    if !chain.has_chunk_decoder() {
                        return Err(WsError::Configuration(format!(
                            "no chunk-capable decoder registered for {} ({} partial handler)",
                            declared.name, category
                        )));
                    }
                    Bound::Partial {
                        chain,
                        invoke,
                        utf8_tail: Vec::new(),
                    }
                }
                Invoker::Stream(invoke) => Bound::Stream {
                    invoke,
                    previous: None,
                },
            };

            let slot = table.slot_mut(category);
            if slot.is_some() {
                return Err(WsError::Configuration(format!(
                    "more than one handler registered for {} messages",
                    category
                )));
            }
            *slot = Some(bound);
        }

        Ok(table)
    }

    fn slot_mut(&mut self, category: MessageCategory) -> &mut Option<Bound> {
        match category {
            MessageCategory::Text => &mut self.text,
            MessageCategory::Binary => &mut self.binary,
            MessageCategory::Pong => &mut self.pong,
        }
    }

    fn limit(&self, category: MessageCategory) -> usize {
        match category {
            MessageCategory::Binary => self.max_binary_message_size,
            _ => self.max_text_message_size,
        }
    }

    /// Handle one text, binary or continuation frame
    pub(crate) fn on_data(
        &mut self,
        session: &Session,
        opcode: OpCode,
        payload: Vec<u8>,
        fin: bool,
    ) -> Result<()> {
        let mut assembly = match opcode {
            OpCode::Text | OpCode::Binary => {
                if self.assembly.is_some() {
                    return Err(WsError::protocol(
                        "new data frame while a fragmented message is in progress",
                    ));
                }
                let category = if opcode == OpCode::Text {
                    MessageCategory::Text
                } else {
                    MessageCategory::Binary
                };
                Assembly {
                    category,
                    size: 0,
                    target: self.begin(session, category),
                    utf8_tail: Vec::new(),
                }
            }
            OpCode::Continuation => self.assembly.take().ok_or_else(|| {
                WsError::protocol("continuation frame without a message in progress")
            })?,
            other => {
                return Err(WsError::protocol(format!("{:?} is not a data opcode", other)));
            }
        };

        let category = assembly.category;
        assembly.size += payload.len();
        let limit = self.limit(category);
        if assembly.size > limit {
            return Err(WsError::Protocol {
                code: CloseCode::Size,
                reason: format!("{} message exceeds {} bytes", category, limit),
            });
        }

        let delivered = !matches!(assembly.target, Target::Discard);
        let mut abandoned = false;
        match &mut assembly.target {
            Target::Discard => {}
            Target::Buffer(buffer) => {
                buffer.extend_from_slice(&payload);
                if fin {
                    let data = std::mem::take(buffer);
                    self.deliver_whole(session, category, data)?;
                }
            }
            Target::Fragments => self.deliver_fragment(session, category, payload, fin)?,
            Target::Bridge(producer) => {
                if category == MessageCategory::Text {
                    check_utf8(&mut assembly.utf8_tail, &payload, fin)?;
                }
                if producer.push(payload, fin).is_err() {
                    debug!(
                        session = %session.id(),
                        "Session closed while streaming a {} message", category
                    );
                    abandoned = true;
                }
            }
        }
        if abandoned {
            assembly.target = Target::Discard;
        }

        if fin {
            if delivered {
                session.counters().increment_messages_received();
            }
        } else {
            self.assembly = Some(assembly);
        }
        Ok(())
    }

    /// Pick the target for a new message
    fn begin(&mut self, session: &Session, category: MessageCategory) -> Target {
        let executor = Arc::clone(&self.executor);
        let closed = self.closed.clone();
        let capacity = self.stream_queue_capacity;

        match self.slot_mut(category) {
            None => {
                session.counters().increment_messages_dropped();
                debug!(
                    session = %session.id(),
                    "No {} handler registered, dropping message", category
                );
                Target::Discard
            }
            Some(Bound::Whole { .. }) => Target::Buffer(Vec::new()),
            Some(Bound::Partial { .. }) => Target::Fragments,
            Some(Bound::Stream { invoke, previous }) => {
                // One consumer per category at a time keeps messages in order
                if let Some(previous) = previous.take() {
                    if !previous.wait(&closed) {
                        trace!(
                            session = %session.id(),
                            "Session closed before previous stream finished"
                        );
                        return Target::Discard;
                    }
                }

                let (producer, stream) = bridge(capacity, closed);
                *previous = Some(producer.completion());

                let invoke = Arc::clone(invoke);
                let worker_session = session.clone();
                let job = Box::new(move || {
                    if let Err(e) = guarded(|| invoke(&worker_session, stream)) {
                        worker_session.report_error(&e);
                    }
                });

                match executor.execute(format!("ws-stream-{}", session.id()), job) {
                    Ok(()) => Target::Bridge(producer),
                    Err(e) => {
                        session.report_error(&e);
                        Target::Discard
                    }
                }
            }
        }
    }

    fn deliver_whole(
        &mut self,
        session: &Session,
        category: MessageCategory,
        data: Vec<u8>,
    ) -> Result<()> {
        let allow = self.allow_coercion;
        let Some(Bound::Whole { chain, invoke }) = self.slot_mut(category) else {
            return Ok(());
        };

        let decoded = match category {
            MessageCategory::Text => {
                let text = String::from_utf8(data).map_err(|_| invalid_utf8())?;
                chain.decode(Payload::Text(&text), allow)
            }
            _ => chain.decode(Payload::Binary(&data), allow),
        };

        match decoded.and_then(|value| guarded(|| invoke(session, value))) {
            Ok(()) => {}
            Err(e) => session.report_error(&e),
        }
        Ok(())
    }

    fn deliver_fragment(
        &mut self,
        session: &Session,
        category: MessageCategory,
        payload: Vec<u8>,
        fin: bool,
    ) -> Result<()> {
        let allow = self.allow_coercion;
        let Some(Bound::Partial {
            chain,
            invoke,
            utf8_tail,
        }) = self.slot_mut(category)
        else {
            return Ok(());
        };

        let decoded = match category {
            MessageCategory::Text => {
                let text = split_utf8(utf8_tail, payload, fin)?;
                chain.decode_chunk(Payload::Text(&text), allow)
            }
            _ => chain.decode_chunk(Payload::Binary(&payload), allow),
        };

        match decoded.and_then(|value| guarded(|| invoke(session, value, fin))) {
            Ok(()) => {}
            Err(e) => session.report_error(&e),
        }
        Ok(())
    }

    /// Deliver a pong payload; pongs have no text/binary kind, so any
    /// registered decoder for the declared type may take it
    pub(crate) fn on_pong(&mut self, session: &Session, payload: &[u8]) {
        let Some(Bound::Whole { chain, invoke }) = self.pong.as_mut() else {
            trace!(session = %session.id(), "Pong received, no pong handler");
            return;
        };

        session.counters().increment_messages_received();
        let decoded = chain.decode(Payload::Binary(payload), true);
        if let Err(e) = decoded.and_then(|value| guarded(|| invoke(session, value))) {
            session.report_error(&e);
        }
    }
}
