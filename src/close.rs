//! Close status codes and close frame payloads.
//!
//! A close frame carries an optional payload: a 2-byte big-endian status code followed by a
//! UTF-8 reason. Status codes are defined in [RFC 6455 Section 7.4](https://datatracker.ietf.org/doc/html/rfc6455#section-7.4);
//! `NoStatus`, `Abnormal` and `Tls` are reserved values that are never sent on the wire and are
//! only used to report how a connection ended.
use std::fmt;

use bytes::{BufMut, BytesMut};
use thiserror::Error;

use crate::{frame::MAX_CONTROL_PAYLOAD, ProtocolError, WebSocketError};

/// Longest reason that fits in a close frame next to the status code.
pub const MAX_REASON_LEN: usize = MAX_CONTROL_PAYLOAD - 2;

/// Status code of a close frame.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum CloseCode {
    /// 1000: the purpose of the connection has been fulfilled.
    Normal,
    /// 1001: an endpoint is going away, such as a server shutting down.
    Away,
    /// 1002: the peer violated the protocol.
    Protocol,
    /// 1003: a message of a type the endpoint cannot accept.
    Unsupported,
    /// 1005: no status code was present. Never sent.
    NoStatus,
    /// 1006: the connection dropped without a close frame. Never sent.
    Abnormal,
    /// 1007: message data inconsistent with its type, e.g. invalid UTF-8 in text.
    Invalid,
    /// 1008: a policy violation.
    Policy,
    /// 1009: a message too big to process.
    Size,
    /// 1010: the client expected an extension the server didn't negotiate.
    Extension,
    /// 1011: an unexpected condition on the server.
    Error,
    /// 1012: the service is restarting.
    Restart,
    /// 1013: try again later.
    Again,
    /// 1014: a gateway received an invalid response.
    BadGateway,
    /// 1015: TLS handshake failure. Never sent.
    Tls,
    /// Any other code, including registered (3000-3999) and private (4000-4999) ones.
    Other(u16),
}

impl CloseCode {
    /// Returns whether the code may appear in a close frame on the wire.
    ///
    /// Applies to codes received from the peer and to codes set locally:
    /// 1000 through 1014 except 1004, 1005 and 1006, plus 3000 through 4999.
    pub fn is_allowed(self) -> bool {
        let code = u16::from(self);
        matches!(code, 1000..=1003 | 1007..=1014 | 3000..=4999)
    }
}

impl From<u16> for CloseCode {
    fn from(code: u16) -> Self {
        match code {
            1000 => Self::Normal,
            1001 => Self::Away,
            1002 => Self::Protocol,
            1003 => Self::Unsupported,
            1005 => Self::NoStatus,
            1006 => Self::Abnormal,
            1007 => Self::Invalid,
            1008 => Self::Policy,
            1009 => Self::Size,
            1010 => Self::Extension,
            1011 => Self::Error,
            1012 => Self::Restart,
            1013 => Self::Again,
            1014 => Self::BadGateway,
            1015 => Self::Tls,
            other => Self::Other(other),
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
            CloseCode::BadGateway => 1014,
            CloseCode::Tls => 1015,
            CloseCode::Other(code) => code,
        }
    }
}

impl fmt::Display for CloseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Normal => "normal closure",
            Self::Away => "going away",
            Self::Protocol => "protocol error",
            Self::Unsupported => "unsupported data",
            Self::NoStatus => "no status received",
            Self::Abnormal => "abnormal closure",
            Self::Invalid => "invalid payload data",
            Self::Policy => "policy violation",
            Self::Size => "message too big",
            Self::Extension => "mandatory extension",
            Self::Error => "internal error",
            Self::Restart => "service restart",
            Self::Again => "try again later",
            Self::BadGateway => "bad gateway",
            Self::Tls => "TLS handshake",
            Self::Other(_) => "other",
        };
        write!(f, "{} ({})", u16::from(*self), name)
    }
}

/// The status code and reason a connection was closed with.
///
/// Returned as [`WebSocketError::Closed`] once the close handshake completes, when the
/// peer initiates a close, or when the stream ends without a handshake (`Abnormal`).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("received close frame: status = {code} and reason = {reason:?}")]
pub struct CloseError {
    pub code: CloseCode,
    pub reason: String,
}

impl CloseError {
    pub fn new(code: CloseCode, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    /// Parses the payload of a received close frame.
    ///
    /// An empty payload reports [`CloseCode::NoStatus`]. A 1-byte payload, a code that is not
    /// allowed on the wire or a reason that isn't UTF-8 is a protocol violation.
    pub fn parse(payload: &[u8]) -> Result<Self, ProtocolError> {
        match payload {
            [] => Ok(Self::new(CloseCode::NoStatus, "")),
            [_] => Err(ProtocolError::InvalidCloseFrame),
            [hi, lo, reason @ ..] => {
                let code = CloseCode::from(u16::from_be_bytes([*hi, *lo]));
                if !code.is_allowed() {
                    return Err(ProtocolError::InvalidCloseCode(code.into()));
                }
                let reason =
                    std::str::from_utf8(reason).map_err(|_| ProtocolError::InvalidUtf8)?;
                Ok(Self::new(code, reason))
            }
        }
    }

    /// Encodes the close frame payload, validating the code and the reason length.
    ///
    /// Nothing is sent when this fails; both checks are local.
    pub fn encode(&self) -> Result<BytesMut, WebSocketError> {
        if !self.code.is_allowed() {
            return Err(WebSocketError::InvalidCloseCode(self.code.into()));
        }
        if self.reason.len() > MAX_REASON_LEN {
            return Err(WebSocketError::CloseReasonTooLong(self.reason.len()));
        }

        let mut payload = BytesMut::with_capacity(2 + self.reason.len());
        payload.put_u16(self.code.into());
        payload.extend_from_slice(self.reason.as_bytes());
        Ok(payload)
    }

    /// Builds a close error from a local failure, cutting the reason to fit a close frame.
    pub(crate) fn truncated(code: CloseCode, reason: &str) -> Self {
        let mut end = reason.len().min(MAX_REASON_LEN);
        while !reason.is_char_boundary(end) {
            end -= 1;
        }
        Self::new(code, &reason[..end])
    }
}
