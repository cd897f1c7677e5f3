use crate::core::frame::CloseCode;
use thiserror::Error;

/// Main error type for wsengine
#[derive(Error, Debug, Clone)]
pub enum WsError {
    /// Lifecycle call made in the wrong order (e.g. opening twice)
    #[error("Handshake error: {0}")]
    Handshake(String),

    /// Malformed frame or control-frame sequencing
    #[error("Protocol error ({code}): {reason}")]
    Protocol { code: CloseCode, reason: String },

    /// Payload could not be converted to the declared type
    #[error("Decode error: {0}")]
    Decode(String),

    /// Value could not be converted to a payload
    #[error("Encode error: {0}")]
    Encode(String),

    /// I/O failure reported by the connection
    #[error("Transport error: {0}")]
    Transport(String),

    /// Idle or close-handshake timeout
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Failure raised by user handler code
    #[error("Handler error: {0}")]
    Handler(String),

    /// Operation not permitted in the current session state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Endpoint or client configuration rejected
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The transport's outbound channel is gone
    #[error("Channel send error: {0}")]
    ChannelSend(String),
}

impl WsError {
    /// Protocol violation with the 1002 close code
    pub fn protocol(reason: impl Into<String>) -> Self {
        WsError::Protocol {
            code: CloseCode::Protocol,
            reason: reason.into(),
        }
    }

    /// Whether this error terminates the session
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            WsError::Protocol { .. }
                | WsError::Transport(_)
                | WsError::Timeout(_)
                | WsError::ChannelSend(_)
        )
    }

    /// Close code recorded when this error terminates a session
    pub fn close_code(&self) -> CloseCode {
        match self {
            WsError::Protocol { code, .. } => *code,
            WsError::Transport(_) | WsError::Timeout(_) | WsError::ChannelSend(_) => {
                CloseCode::Abnormal
            }
            WsError::Handler(_) => CloseCode::Error,
            _ => CloseCode::Protocol,
        }
    }

    /// Reason text recorded alongside `close_code`
    pub fn close_reason(&self) -> String {
        match self {
            WsError::Protocol { reason, .. } => reason.clone(),
            WsError::Handshake(msg)
            | WsError::Decode(msg)
            | WsError::Encode(msg)
            | WsError::Transport(msg)
            | WsError::Timeout(msg)
            | WsError::Handler(msg)
            | WsError::InvalidState(msg)
            | WsError::Configuration(msg)
            | WsError::ChannelSend(msg) => msg.clone(),
        }
    }
}

/// Result type for wsengine operations
pub type Result<T> = std::result::Result<T, WsError>;
