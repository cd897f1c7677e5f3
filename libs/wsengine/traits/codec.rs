use crate::error::Result;

/// Data message category as far as conversion is concerned
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Text,
    Binary,
}

/// Borrowed view of an inbound payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Payload<'a> {
    Text(&'a str),
    Binary(&'a [u8]),
}

impl<'a> Payload<'a> {
    pub fn kind(&self) -> MessageKind {
        match self {
            Payload::Text(_) => MessageKind::Text,
            Payload::Binary(_) => MessageKind::Binary,
        }
    }

    pub fn as_bytes(&self) -> &'a [u8] {
        match self {
            Payload::Text(text) => text.as_bytes(),
            Payload::Binary(data) => data,
        }
    }

    pub fn as_text(&self) -> Option<&'a str> {
        match self {
            Payload::Text(text) => Some(text),
            Payload::Binary(_) => None,
        }
    }
}

/// Owned payload produced by an encoder
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundPayload {
    Text(String),
    Binary(Vec<u8>),
}

impl OutboundPayload {
    pub fn kind(&self) -> MessageKind {
        match self {
            OutboundPayload::Text(_) => MessageKind::Text,
            OutboundPayload::Binary(_) => MessageKind::Binary,
        }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            OutboundPayload::Text(text) => text.into_bytes(),
            OutboundPayload::Binary(data) => data,
        }
    }
}

/// Converts an inbound payload into `T`
///
/// # Example
///
/// ```ignore
/// struct CsvRow;
///
/// impl Decoder<Vec<String>> for CsvRow {
///     fn consumes(&self) -> MessageKind {
///         MessageKind::Text
///     }
///
///     fn decode(&self, payload: Payload<'_>) -> Result<Vec<String>> {
///         let text = payload.as_text().unwrap_or_default();
///         Ok(text.split(',').map(str::to_string).collect())
///     }
/// }
/// ```
pub trait Decoder<T>: Send + Sync + 'static {
    /// Payload kind this decoder reads
    fn consumes(&self) -> MessageKind;

    /// Whether this decoder claims the payload
    ///
    /// The registry uses the first registered decoder that returns true.
    fn will_decode(&self, _payload: &Payload<'_>) -> bool {
        true
    }

    /// Convert the payload
    ///
    /// Failures should be reported as `WsError::Decode`.
    fn decode(&self, payload: Payload<'_>) -> Result<T>;

    /// Whether fragments of one message can be decoded independently
    fn chunk_capable(&self) -> bool {
        false
    }
}

/// Converts a `T` into an outbound payload
pub trait Encoder<T>: Send + Sync + 'static {
    fn encode(&self, value: &T) -> Result<OutboundPayload>;
}
