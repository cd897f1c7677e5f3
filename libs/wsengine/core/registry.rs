//! Decoder/encoder registry
//!
//! Converters are keyed by the Rust type they produce or consume. For each
//! type the registry keeps user-registered converters ahead of the built-in
//! ones, in registration order, and always picks the first converter that
//! claims a payload. The same declared type therefore resolves to the same
//! converter for every message.

use crate::traits::{Decoder, Encoder, MessageKind, OutboundPayload, Payload, Result, WsError};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

/// Type a handler declares for its payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeclaredType {
    pub id: TypeId,
    pub name: &'static str,
}

impl DeclaredType {
    pub fn of<T: 'static>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
        }
    }
}

/// Decoder with its output type erased
pub(crate) trait ErasedDecoder: Send + Sync {
    fn consumes(&self) -> MessageKind;
    fn will_decode(&self, payload: &Payload<'_>) -> bool;
    fn chunk_capable(&self) -> bool;
    fn decode_any(&self, payload: Payload<'_>) -> Result<Box<dyn Any + Send>>;
}

struct DecoderAdapter<T, D> {
    decoder: D,
    _output: PhantomData<fn() -> T>,
}

impl<T, D> ErasedDecoder for DecoderAdapter<T, D>
where
    T: Send + 'static,
    D: Decoder<T>,
{
    fn consumes(&self) -> MessageKind {
        self.decoder.consumes()
    }

    fn will_decode(&self, payload: &Payload<'_>) -> bool {
        self.decoder.will_decode(payload)
    }

    fn chunk_capable(&self) -> bool {
        self.decoder.chunk_capable()
    }

    fn decode_any(&self, payload: Payload<'_>) -> Result<Box<dyn Any + Send>> {
        self.decoder
            .decode(payload)
            .map(|value| Box::new(value) as Box<dyn Any + Send>)
    }
}

trait ErasedEncoder: Send + Sync {
    fn encode_any(&self, value: &dyn Any) -> Result<OutboundPayload>;
}

struct EncoderAdapter<T, E> {
    encoder: E,
    _input: PhantomData<fn(&T)>,
}

impl<T, E> ErasedEncoder for EncoderAdapter<T, E>
where
    T: 'static,
    E: Encoder<T>,
{
    fn encode_any(&self, value: &dyn Any) -> Result<OutboundPayload> {
        let value = value.downcast_ref::<T>().ok_or_else(|| {
            WsError::Encode(format!("encoder expected {}", std::any::type_name::<T>()))
        })?;
        self.encoder.encode(value)
    }
}

/// Decoders resolved for one declared type, in selection order
///
/// Resolved once when a handler is bound so later registrations cannot
/// change which decoder a live session uses.
#[derive(Clone)]
pub struct DecoderChain {
    declared: DeclaredType,
    decoders: Vec<Arc<dyn ErasedDecoder>>,
}

impl DecoderChain {
    pub fn declared(&self) -> DeclaredType {
        self.declared
    }

    pub fn is_empty(&self) -> bool {
        self.decoders.is_empty()
    }

    /// Whether any decoder in the chain can decode single fragments
    pub fn has_chunk_decoder(&self) -> bool {
        self.decoders.iter().any(|decoder| decoder.chunk_capable())
    }

    /// Decode a complete message
    pub fn decode(
        &self,
        payload: Payload<'_>,
        allow_coercion: bool,
    ) -> Result<Box<dyn Any + Send>> {
        self.select(payload, allow_coercion, false)
    }

    /// Decode one fragment using only chunk-capable decoders
    pub fn decode_chunk(
        &self,
        payload: Payload<'_>,
        allow_coercion: bool,
    ) -> Result<Box<dyn Any + Send>> {
        self.select(payload, allow_coercion, true)
    }

    fn select(
        &self,
        payload: Payload<'_>,
        allow_coercion: bool,
        chunked: bool,
    ) -> Result<Box<dyn Any + Send>> {
        if self.decoders.is_empty() {
            return Err(WsError::Decode(format!(
                "no decoder registered for {}",
                self.declared.name
            )));
        }

        let usable = || {
            self.decoders
                .iter()
                .filter(move |decoder| !chunked || decoder.chunk_capable())
        };

        for decoder in usable().filter(|d| d.consumes() == payload.kind()) {
            if decoder.will_decode(&payload) {
                return decoder.decode_any(payload);
            }
        }

        if allow_coercion {
            for decoder in usable().filter(|d| d.consumes() != payload.kind()) {
                let coerced = coerce(payload)?;
                if decoder.will_decode(&coerced) {
                    return decoder.decode_any(coerced);
                }
            }
        }

        let kind = match payload.kind() {
            MessageKind::Text => "text",
            MessageKind::Binary => "binary",
        };
        Err(WsError::Decode(format!(
            "no {}{} decoder for {} accepted the payload",
            if chunked { "chunk-capable " } else { "" },
            kind,
            self.declared.name
        )))
    }
}

/// Reinterpret a payload as the other kind
fn coerce(payload: Payload<'_>) -> Result<Payload<'_>> {
    match payload {
        Payload::Text(text) => Ok(Payload::Binary(text.as_bytes())),
        Payload::Binary(data) => std::str::from_utf8(data)
            .map(Payload::Text)
            .map_err(|_| WsError::Decode("binary payload is not valid UTF-8".into())),
    }
}

/// Registry of payload converters
pub struct CodecRegistry {
    user_decoders: HashMap<TypeId, Vec<Arc<dyn ErasedDecoder>>>,
    builtin_decoders: HashMap<TypeId, Vec<Arc<dyn ErasedDecoder>>>,
    user_encoders: HashMap<TypeId, Vec<Arc<dyn ErasedEncoder>>>,
    builtin_encoders: HashMap<TypeId, Vec<Arc<dyn ErasedEncoder>>>,
}

impl Default for CodecRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CodecRegistry {
    /// Registry with the built-in converters installed
    pub fn new() -> Self {
        let mut registry = Self::empty();
        builtins::install(&mut registry);
        registry
    }

    /// Registry without any converters
    pub fn empty() -> Self {
        Self {
            user_decoders: HashMap::new(),
            builtin_decoders: HashMap::new(),
            user_encoders: HashMap::new(),
            builtin_encoders: HashMap::new(),
        }
    }

    /// Register a decoder for `T`, ahead of the built-ins
    pub fn register_decoder<T, D>(&mut self, decoder: D) -> &mut Self
    where
        T: Send + 'static,
        D: Decoder<T>,
    {
        push_decoder::<T, D>(&mut self.user_decoders, decoder);
        self
    }

    /// Register an encoder for `T`, ahead of the built-ins
    pub fn register_encoder<T, E>(&mut self, encoder: E) -> &mut Self
    where
        T: 'static,
        E: Encoder<T>,
    {
        push_encoder::<T, E>(&mut self.user_encoders, encoder);
        self
    }

    /// Register `JsonCodec<T>` as both decoder and encoder for `T`
    pub fn register_json<T>(&mut self) -> &mut Self
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        self.register_decoder::<T, _>(JsonCodec::<T>::new());
        self.register_encoder::<T, _>(JsonCodec::<T>::new());
        self
    }

    pub fn has_decoder<T: 'static>(&self) -> bool {
        !self.decoders_for(DeclaredType::of::<T>()).is_empty()
    }

    pub fn has_encoder<T: 'static>(&self) -> bool {
        let id = TypeId::of::<T>();
        self.user_encoders.contains_key(&id) || self.builtin_encoders.contains_key(&id)
    }

    /// Resolve the decoders for a declared type
    pub fn decoders_for(&self, declared: DeclaredType) -> DecoderChain {
        let decoders = self
            .user_decoders
            .get(&declared.id)
            .into_iter()
            .chain(self.builtin_decoders.get(&declared.id))
            .flatten()
            .cloned()
            .collect();
        DecoderChain { declared, decoders }
    }

    /// Decode a payload into `T` without cross-type coercion
    pub fn decode<T: Send + 'static>(&self, payload: Payload<'_>) -> Result<T> {
        self.decode_with::<T>(payload, false)
    }

    pub fn decode_with<T: Send + 'static>(
        &self,
        payload: Payload<'_>,
        allow_coercion: bool,
    ) -> Result<T> {
        let value = self
            .decoders_for(DeclaredType::of::<T>())
            .decode(payload, allow_coercion)?;
        downcast::<T>(value)
    }

    /// Encode a value with the first encoder registered for its type
    pub fn encode<T: 'static>(&self, value: &T) -> Result<OutboundPayload> {
        let id = TypeId::of::<T>();
        let encoder = self
            .user_encoders
            .get(&id)
            .into_iter()
            .chain(self.builtin_encoders.get(&id))
            .flatten()
            .next()
            .ok_or_else(|| {
                WsError::Encode(format!(
                    "no encoder registered for {}",
                    std::any::type_name::<T>()
                ))
            })?;
        encoder.encode_any(value)
    }
}

/// Unbox a decoded value as `T`
pub(crate) fn downcast<T: 'static>(value: Box<dyn Any + Send>) -> Result<T> {
    value.downcast::<T>().map(|boxed| *boxed).map_err(|_| {
        WsError::Decode(format!(
            "decoded value is not a {}",
            std::any::type_name::<T>()
        ))
    })
}

fn push_decoder<T, D>(map: &mut HashMap<TypeId, Vec<Arc<dyn ErasedDecoder>>>, decoder: D)
where
    T: Send + 'static,
    D: Decoder<T>,
{
    map.entry(TypeId::of::<T>())
        .or_default()
        .push(Arc::new(DecoderAdapter {
            decoder,
            _output: PhantomData::<fn() -> T>,
        }));
}

fn push_encoder<T, E>(map: &mut HashMap<TypeId, Vec<Arc<dyn ErasedEncoder>>>, encoder: E)
where
    T: 'static,
    E: Encoder<T>,
{
    map.entry(TypeId::of::<T>())
        .or_default()
        .push(Arc::new(EncoderAdapter {
            encoder,
            _input: PhantomData::<fn(&T)>,
        }));
}

/// JSON text converter for any serde type
pub struct JsonCodec<T> {
    _type: PhantomData<fn() -> T>,
}

impl<T> JsonCodec<T> {
    pub fn new() -> Self {
        Self { _type: PhantomData }
    }
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Decoder<T> for JsonCodec<T>
where
    T: DeserializeOwned + Send + 'static,
{
    fn consumes(&self) -> MessageKind {
        MessageKind::Text
    }

    fn decode(&self, payload: Payload<'_>) -> Result<T> {
        serde_json::from_slice(payload.as_bytes())
            .map_err(|e| WsError::Decode(format!("invalid JSON: {}", e)))
    }
}

impl<T> Encoder<T> for JsonCodec<T>
where
    T: Serialize + 'static,
{
    fn encode(&self, value: &T) -> Result<OutboundPayload> {
        serde_json::to_string(value)
            .map(OutboundPayload::Text)
            .map_err(|e| WsError::Encode(e.to_string()))
    }
}

mod builtins {
    use super::*;

    pub(super) struct TextPassthrough;

    impl Decoder<String> for TextPassthrough {
        fn consumes(&self) -> MessageKind {
            MessageKind::Text
        }

        fn decode(&self, payload: Payload<'_>) -> Result<String> {
            match payload {
                Payload::Text(text) => Ok(text.to_string()),
                Payload::Binary(_) => Err(WsError::Decode("expected text payload".into())),
            }
        }

        fn chunk_capable(&self) -> bool {
            true
        }
    }

    impl Encoder<String> for TextPassthrough {
        fn encode(&self, value: &String) -> Result<OutboundPayload> {
            Ok(OutboundPayload::Text(value.clone()))
        }
    }

    impl Encoder<&'static str> for TextPassthrough {
        fn encode(&self, value: &&'static str) -> Result<OutboundPayload> {
            Ok(OutboundPayload::Text((*value).to_string()))
        }
    }

    pub(super) struct BinaryPassthrough;

    impl Decoder<Vec<u8>> for BinaryPassthrough {
        fn consumes(&self) -> MessageKind {
            MessageKind::Binary
        }

        fn decode(&self, payload: Payload<'_>) -> Result<Vec<u8>> {
            Ok(payload.as_bytes().to_vec())
        }

        fn chunk_capable(&self) -> bool {
            true
        }
    }

    impl Encoder<Vec<u8>> for BinaryPassthrough {
        fn encode(&self, value: &Vec<u8>) -> Result<OutboundPayload> {
            Ok(OutboundPayload::Binary(value.clone()))
        }
    }

    /// Text-encoded primitive parsed with `FromStr`
    pub(super) struct Primitive;

    macro_rules! primitive_codecs {
        ($($ty:ty),* $(,)?) => {
            $(
                impl Decoder<$ty> for Primitive {
                    fn consumes(&self) -> MessageKind {
                        MessageKind::Text
                    }

                    fn decode(&self, payload: Payload<'_>) -> Result<$ty> {
                        let text = payload
                            .as_text()
                            .ok_or_else(|| WsError::Decode("expected text payload".into()))?;
                        text.parse::<$ty>().map_err(|e| {
                            WsError::Decode(format!(
                                "cannot parse {:?} as {}: {}",
                                text,
                                stringify!($ty),
                                e
                            ))
                        })
                    }
                }

                impl Encoder<$ty> for Primitive {
                    fn encode(&self, value: &$ty) -> Result<OutboundPayload> {
                        Ok(OutboundPayload::Text(value.to_string()))
                    }
                }
            )*

            fn install_primitives(registry: &mut CodecRegistry) {
                $(
                    push_decoder::<$ty, _>(&mut registry.builtin_decoders, Primitive);
                    push_encoder::<$ty, _>(&mut registry.builtin_encoders, Primitive);
                )*
            }
        };
    }

    primitive_codecs!(bool, char, i8, i16, i32, i64, i128, u8, u16, u32, u64, u128, f32, f64);

    pub(super) fn install(registry: &mut CodecRegistry) {
        push_decoder::<String, _>(&mut registry.builtin_decoders, TextPassthrough);
        push_encoder::<String, _>(&mut registry.builtin_encoders, TextPassthrough);
        push_encoder::<&'static str, _>(&mut registry.builtin_encoders, TextPassthrough);
        push_decoder::<Vec<u8>, _>(&mut registry.builtin_decoders, BinaryPassthrough);
        push_encoder::<Vec<u8>, _>(&mut registry.builtin_encoders, BinaryPassthrough);
        install_primitives(registry);
    }
}
