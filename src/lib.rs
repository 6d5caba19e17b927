//! # wsengine
//! Implementation of the WebSocket protocol (RFC 6455) and permessage-deflate compression (RFC 7692)
//! as a message-oriented connection over an already upgraded byte stream.
//!
//! The crate covers everything that happens after the HTTP upgrade: frame encoding and decoding,
//! fragmentation, per-message compression, ping/pong keepalive and the close handshake. The
//! upgrade itself (dialing, accepting, header negotiation) happens elsewhere; its outcome is
//! handed to [`WebSocket::new`] as a stream, a [`Role`] and [`Options`].
//!
//! # Features
//!
//! - `logging`: Enables debug logging for compression setup, close frames and connection
//!   failures using the `log` crate.
//!
//! - `simd`: Validates UTF-8 in text messages with `simdutf8`.
//!
//! - `json`: Enables [`WebSocket::read_json`] and [`WebSocket::write_json`].
//!
//! # Example
//! ```no_run
//! use tokio::net::TcpStream;
//! use wsengine::{CloseCode, MessageType, Options, Role, WebSocket};
//!
//! async fn echo(stream: TcpStream) -> wsengine::Result<()> {
//!     // `stream` has already completed the HTTP upgrade.
//!     let ws = WebSocket::new(stream, Role::Server, Options::default());
//!
//!     loop {
//!         match ws.read().await {
//!             Ok((typ, payload)) => ws.write(typ, payload).await?,
//!             Err(err) if wsengine::close_status(&err) == Some(CloseCode::Normal) => return Ok(()),
//!             Err(err) => return Err(err),
//!         }
//!     }
//! }
//! ```
//!
//! # Concurrency
//! A [`WebSocket`] is a cheap handle that can be cloned across tasks. Any number of tasks may
//! write, ping or close concurrently; writes are serialized per message so frames of different
//! messages never interleave. Only one task may read at a time. Control frames are handled by
//! whoever is reading, so a connection that is never read should call
//! [`WebSocket::close_read`].
//!
//! # Cancellation
//! Dropping a read, a write in progress or a pending ping fails the whole connection: a frame
//! that was partially written or read leaves the framing of both peers out of sync.

#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod close;
pub mod codec;
mod compression;
mod conn;
pub mod frame;
#[cfg(feature = "json")]
mod json;
mod mask;
mod netconn;

use std::{io, sync::Arc};

use thiserror::Error;

pub use close::{CloseCode, CloseError};
pub use conn::{
    CompressionLevel, CompressionMode, DeflateOptions, MessageReader, MessageWriter, Options,
    Role, State, WebSocket,
};
pub use frame::{Frame, MessageType, OpCode};
pub use netconn::NetConn;

/// A result type for WebSocket operations, using `WebSocketError` as the error type.
pub type Result<T> = std::result::Result<T, WebSocketError>;

/// Represents errors that can occur during WebSocket operations.
///
/// Once a connection fails, the error that caused it becomes the connection's terminal error
/// and is returned, cloned, by every later operation. The errors fall into:
///
/// - Protocol errors: the peer sent something malformed. The connection is closed with the
///   matching close status.
/// - Close errors: the connection was closed by a handshake, by the peer or by EOF.
/// - Local validation errors: rejected before anything is written, the connection is unaffected.
/// - Cancellation, timeouts and I/O errors, all of which tear the connection down.
#[derive(Error, Debug, Clone)]
pub enum WebSocketError {
    /// The peer violated RFC 6455 or RFC 7692.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// A message exceeded the read limit. The connection is closed with [`CloseCode::Size`].
    #[error("read limited at {limit} bytes")]
    MessageTooBig { limit: usize },

    /// The connection was closed; carries the status the close handshake settled on.
    #[error(transparent)]
    Closed(CloseError),

    /// An operation was dropped while it was in progress, failing the connection.
    #[error("{0} cancelled")]
    Cancelled(&'static str),

    /// An internal timeout elapsed, such as the pong wait or the close handshake.
    #[error("timed out: {0}")]
    Timeout(&'static str),

    /// The status code cannot be set on a close frame.
    #[error("failed to marshal close frame: status code {0} cannot be set")]
    InvalidCloseCode(u16),

    /// The close reason does not fit in a control frame.
    #[error("failed to marshal close frame: reason is {0} bytes, at most 123 are allowed")]
    CloseReasonTooLong(usize),

    /// Another reader is already consuming a message.
    #[error("concurrent read detected")]
    ConcurrentRead,

    /// [`WebSocket::close_read`] was called and reads are no longer possible.
    #[error("reads are closed")]
    ReadClosed,

    /// A new message was requested before the previous one was read to completion.
    #[error("previous message not read to completion")]
    IncompleteMessage,

    /// The limit of outstanding pings was reached.
    #[error("too many outstanding pings (limit {0})")]
    TooManyPings(usize),

    /// The message writer was already closed.
    #[error("message writer closed")]
    WriterClosed,

    /// A message of one type arrived where another was expected.
    #[error("unexpected message type (expected {expected}): {got}")]
    UnexpectedMessageType {
        expected: MessageType,
        got: MessageType,
    },

    /// The underlying stream failed.
    #[error(transparent)]
    Io(Arc<io::Error>),

    /// Occurs when serialization or deserialization of JSON data fails.
    /// Only available when the `json` feature is enabled.
    #[cfg(feature = "json")]
    #[error(transparent)]
    Json(Arc<serde_json::Error>),
}

impl From<io::Error> for WebSocketError {
    fn from(err: io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

#[cfg(feature = "json")]
impl From<serde_json::Error> for WebSocketError {
    fn from(err: serde_json::Error) -> Self {
        Self::Json(Arc::new(err))
    }
}

impl WebSocketError {
    /// The status this side sends to the peer when failing with this error, if any.
    pub(crate) fn close_code(&self) -> Option<CloseCode> {
        match self {
            Self::Protocol(err) => Some(err.close_code()),
            Self::MessageTooBig { .. } => Some(CloseCode::Size),
            _ => None,
        }
    }
}

/// Wire-level violations of the WebSocket protocol.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// RSV2 or RSV3 is set.
    #[error("reserved bits are not zero")]
    ReservedBitsNotZero,

    /// The opcode is one of the reserved values.
    #[error("invalid opcode (byte={0})")]
    InvalidOpCode(u8),

    /// A server received a frame without a masking key.
    #[error("client frame is not masked")]
    UnmaskedClientFrame,

    /// A client received a frame with a masking key.
    #[error("server frame is masked")]
    MaskedServerFrame,

    /// A control frame had FIN unset.
    #[error("control frame must not be fragmented")]
    ControlFrameFragmented,

    /// A control frame carried more than 125 bytes.
    #[error("control frame payload of {0} bytes exceeds 125")]
    ControlFrameTooLarge(u64),

    /// The payload length used a longer encoding than necessary.
    #[error("payload length is not minimally encoded")]
    NonMinimalLength,

    /// The 64-bit payload length had its most significant bit set.
    #[error("invalid payload length")]
    InvalidPayloadLength,

    /// RSV1 is set on a connection without negotiated compression.
    #[error("received compressed frame on stream that doesn't support compression")]
    CompressionNotSupported,

    /// RSV1 is set on a control frame.
    #[error("control frame must not be compressed")]
    CompressedControlFrame,

    /// RSV1 is set on a continuation frame.
    #[error("continuation frame must not set RSV1")]
    CompressedContinuation,

    /// A continuation frame arrived with no message in progress.
    #[error("continuation frame without a message in progress")]
    InvalidContinuationFrame,

    /// A new text or binary frame arrived while a message was still in progress.
    #[error("new message started before the previous one finished")]
    InvalidFragment,

    /// A close frame payload of exactly one byte.
    #[error("invalid close frame")]
    InvalidCloseFrame,

    /// A close frame with a status code that may not appear on the wire.
    #[error("invalid close code {0}")]
    InvalidCloseCode(u16),

    /// A text message or close reason that isn't valid UTF-8.
    #[error("invalid UTF-8")]
    InvalidUtf8,

    /// Compressed data that could not be inflated.
    #[error("corrupt deflate stream: {0}")]
    Deflate(String),
}

impl ProtocolError {
    /// The close status reported to the peer for this violation.
    pub fn close_code(&self) -> CloseCode {
        match self {
            Self::InvalidUtf8 => CloseCode::Invalid,
            _ => CloseCode::Protocol,
        }
    }
}

/// Extracts the close status from an error.
///
/// Returns `None` when the error is not a [`WebSocketError::Closed`] error, i.e. when the
/// connection did not end with a close status.
pub fn close_status(err: &WebSocketError) -> Option<CloseCode> {
    match err {
        WebSocketError::Closed(close) => Some(close.code),
        _ => None,
    }
}
