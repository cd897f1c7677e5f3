//! Frame-level vocabulary shared between the session and its connection.
//!
//! The engine never parses wire bytes. An external framer hands it
//! `(opcode, payload, fin)` triples and accepts the same triples back for
//! writing. Close payloads are the one structure the engine interprets
//! itself (RFC 6455 Section 5.5.1).

use crate::traits::{Result, WsError};
use std::fmt;

/// Largest payload a control frame may carry
pub const MAX_CONTROL_PAYLOAD: usize = 125;

/// Largest close reason in bytes (control payload minus the status code)
pub const MAX_CLOSE_REASON: usize = MAX_CONTROL_PAYLOAD - 2;

/// Frame opcode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpCode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl OpCode {
    #[inline]
    pub fn is_control(self) -> bool {
        matches!(self, OpCode::Close | OpCode::Ping | OpCode::Pong)
    }

    #[inline]
    pub fn is_data(self) -> bool {
        !self.is_control()
    }
}

/// One decoded frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub opcode: OpCode,
    pub payload: Vec<u8>,
    pub fin: bool,
}

impl Frame {
    pub fn new(opcode: OpCode, payload: impl Into<Vec<u8>>, fin: bool) -> Self {
        Self {
            opcode,
            payload: payload.into(),
            fin,
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self::new(OpCode::Text, text.into().into_bytes(), true)
    }

    pub fn binary(data: impl Into<Vec<u8>>) -> Self {
        Self::new(OpCode::Binary, data, true)
    }

    pub fn ping(data: impl Into<Vec<u8>>) -> Self {
        Self::new(OpCode::Ping, data, true)
    }

    pub fn pong(data: impl Into<Vec<u8>>) -> Self {
        Self::new(OpCode::Pong, data, true)
    }

    pub fn close(status: &CloseStatus) -> Self {
        Self::new(OpCode::Close, status.encode(), true)
    }
}

/// Close status codes (RFC 6455 Section 7.4.1)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseCode {
    /// 1000
    Normal,
    /// 1001, endpoint going away
    Away,
    /// 1002
    Protocol,
    /// 1003, unacceptable data type
    Unsupported,
    /// 1005, never sent on the wire
    NoStatus,
    /// 1006, never sent on the wire
    Abnormal,
    /// 1007, payload inconsistent with message type
    Invalid,
    /// 1008
    Policy,
    /// 1009, message too big
    Size,
    /// 1010, client expected an extension
    Extension,
    /// 1011, unexpected condition
    Error,
    /// 1012
    Restart,
    /// 1013
    Again,
    /// Registered or private code without a named variant
    Other(u16),
}

impl CloseCode {
    /// Whether a peer may legitimately carry this code in a close frame
    pub fn is_valid_on_wire(self) -> bool {
        match u16::from(self) {
            1000..=1003 | 1007..=1014 => true,
            3000..=4999 => true,
            _ => false,
        }
    }
}

impl From<u16> for CloseCode {
    fn from(code: u16) -> Self {
        match code {
            1000 => CloseCode::Normal,
            1001 => CloseCode::Away,
            1002 => CloseCode::Protocol,
            1003 => CloseCode::Unsupported,
            1005 => CloseCode::NoStatus,
            1006 => CloseCode::Abnormal,
            1007 => CloseCode::Invalid,
            1008 => CloseCode::Policy,
            1009 => CloseCode::Size,
            1010 => CloseCode::Extension,
            1011 => CloseCode::Error,
            1012 => CloseCode::Restart,
            1013 => CloseCode::Again,
            other => CloseCode::Other(other),
        }
    }
}

impl From<CloseCode> for u16 {
    fn from(code: CloseCode) -> u16 {
        match code {
            CloseCode::Normal => 1000,
            CloseCode::Away => 1001,
            CloseCode::Protocol => 1002,
            CloseCode::Unsupported => 1003,
            CloseCode::NoStatus => 1005,
            CloseCode::Abnormal => 1006,
            CloseCode::Invalid => 1007,
            CloseCode::Policy => 1008,
            CloseCode::Size => 1009,
            CloseCode::Extension => 1010,
            CloseCode::Error => 1011,
            CloseCode::Restart => 1012,
            CloseCode::Again => 1013,
            CloseCode::Other(code) => code,
        }
    }
}

impl fmt::Display for CloseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", u16::from(*self))
    }
}

/// Status code plus reason recorded for a close
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseStatus {
    pub code: CloseCode,
    pub reason: String,
}

impl CloseStatus {
    /// Create a status, truncating the reason to fit a control frame
    pub fn new(code: CloseCode, reason: impl Into<String>) -> Self {
        let mut reason = reason.into();
        truncate_reason(&mut reason);
        Self { code, reason }
    }

    pub fn normal() -> Self {
        Self::new(CloseCode::Normal, "")
    }

    /// Parse the payload of a received close frame
    ///
    /// An empty payload means the peer sent no status (1005). A single byte,
    /// a code that may not appear on the wire, or a non-UTF-8 reason is a
    /// protocol violation.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        match payload.len() {
            0 => Ok(Self::new(CloseCode::NoStatus, "")),
            1 => Err(WsError::protocol("close payload of one byte")),
            _ => {
                let code = CloseCode::from(u16::from_be_bytes([payload[0], payload[1]]));
                if !code.is_valid_on_wire() {
                    return Err(WsError::protocol(format!("invalid close code {}", code)));
                }
                let reason = std::str::from_utf8(&payload[2..])
                    .map_err(|_| WsError::protocol("close reason is not valid UTF-8"))?;
                Ok(Self::new(code, reason))
            }
        }
    }

    /// Encode as a close frame payload
    ///
    /// Codes that must not be sent (1005, 1006) produce an empty payload.
    pub fn encode(&self) -> Vec<u8> {
        if matches!(self.code, CloseCode::NoStatus | CloseCode::Abnormal) {
            return Vec::new();
        }
        let code: u16 = self.code.into();
        let mut buf = Vec::with_capacity(2 + self.reason.len());
        buf.extend_from_slice(&code.to_be_bytes());
        buf.extend_from_slice(self.reason.as_bytes());
        buf
    }
}

impl fmt::Display for CloseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.reason.is_empty() {
            write!(f, "{}", self.code)
        } else {
            write!(f, "{} ({})", self.code, self.reason)
        }
    }
}

/// Cut a reason down to `MAX_CLOSE_REASON` bytes on a char boundary
fn truncate_reason(reason: &mut String) {
    if reason.len() <= MAX_CLOSE_REASON {
        return;
    }
    let mut end = MAX_CLOSE_REASON;
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    reason.truncate(end);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_code_and_reason() {
        let status = CloseStatus::parse(&[0x03, 0xE8, b'b', b'y', b'e']).unwrap();
        assert_eq!(status.code, CloseCode::Normal);
        assert_eq!(status.reason, "bye");
    }

    #[test]
    fn test_parse_empty_is_no_status() {
        let status = CloseStatus::parse(&[]).unwrap();
        assert_eq!(status.code, CloseCode::NoStatus);
        assert!(status.reason.is_empty());
    }

    #[test]
    fn test_parse_rejects_one_byte_and_reserved_codes() {
        assert!(CloseStatus::parse(&[0x03]).is_err());
        // 1006 may never be sent by a peer
        assert!(CloseStatus::parse(&[0x03, 0xEE]).is_err());
        // 999 is below the valid range
        assert!(CloseStatus::parse(&[0x03, 0xE7]).is_err());
        // private range is accepted
        let private = CloseStatus::parse(&[0x0F, 0xA0]).unwrap();
        assert_eq!(private.code, CloseCode::Other(4000));
    }

    #[test]
    fn test_parse_rejects_invalid_utf8_reason() {
        assert!(CloseStatus::parse(&[0x03, 0xE8, 0xFF, 0xFE]).is_err());
    }

    #[test]
    fn test_oversized_reason_truncated_on_char_boundary() {
        // 'é' is two bytes, so 62 of them is 124 bytes
        let reason = "é".repeat(62);
        let status = CloseStatus::new(CloseCode::Normal, reason);
        assert!(status.reason.len() <= MAX_CLOSE_REASON);
        assert_eq!(status.reason.chars().count(), 61);
        assert!(status.encode().len() <= MAX_CONTROL_PAYLOAD);
    }

    #[test]
    fn test_local_only_codes_encode_empty() {
        assert!(CloseStatus::new(CloseCode::Abnormal, "gone").encode().is_empty());
        assert!(CloseStatus::new(CloseCode::NoStatus, "").encode().is_empty());
    }

    #[test]
    fn test_code_conversions() {
        for raw in [1000u16, 1001, 1002, 1003, 1007, 1008, 1009, 1010, 1011, 3000, 4999] {
            assert_eq!(u16::from(CloseCode::from(raw)), raw);
        }
        assert_eq!(CloseCode::Size.to_string(), "1009");
    }
}
