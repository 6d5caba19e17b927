//! Write path of a connection: whole messages and streamed fragments.
use std::sync::Arc;

use bytes::BytesMut;
use tokio::sync::OwnedMutexGuard;

use super::shared::{Core, FailOnDrop};
use crate::{
    compression::{Compressor, DEFLATE_TRAILER},
    frame::{Frame, MessageType, OpCode},
    Result, WebSocketError,
};

/// State of the message section, held by whoever is sending a message.
pub(crate) struct WriteState {
    deflate: Option<Compressor>,
    /// Messages below this size are sent uncompressed.
    threshold: usize,
}

impl WriteState {
    pub(crate) fn new(deflate: Option<Compressor>, threshold: usize) -> Self {
        Self { deflate, threshold }
    }

    /// Builds the single frame of a whole message, compressing it when worthwhile.
    pub(crate) fn message_frame(&mut self, typ: MessageType, payload: &[u8]) -> Result<Frame> {
        let threshold = self.threshold;
        match self.deflate.as_mut() {
            Some(deflate) if payload.len() >= threshold => {
                let compressed = deflate.compress_message(payload)?;
                Ok(Frame::compress(true, typ.into(), None, &compressed[..]))
            }
            _ => Ok(Frame::new(true, typ.into(), None, payload)),
        }
    }
}

/// How the payload of a streamed message is encoded.
enum Encoding {
    /// Compression is on but the message is still below the threshold.
    Pending(BytesMut),
    Plain,
    Deflate,
}

/// A message being written, one frame per [`write`](MessageWriter::write).
///
/// Obtained from [`WebSocket::writer`](crate::WebSocket::writer). The writer holds the message
/// section of the connection, so other messages wait until it is closed; control frames are still
/// interleaved between its fragments.
///
/// Every call to `write` sends a non-final frame and [`close`](MessageWriter::close) sends the
/// final one. With compression negotiated, data is buffered until it reaches the compression
/// threshold, so a message that stays small is sent uncompressed as a single frame.
///
/// Dropping a writer that already sent frames without closing it fails the connection, as
/// the peer is left in the middle of a message.
pub struct MessageWriter {
    core: Arc<Core>,
    state: OwnedMutexGuard<WriteState>,
    typ: MessageType,
    encoding: Encoding,
    /// The last compressed chunk ended with a sync flush marker that was not sent yet.
    held_trailer: bool,
    started: bool,
    closed: bool,
}

impl MessageWriter {
    pub(crate) fn new(
        core: Arc<Core>,
        state: OwnedMutexGuard<WriteState>,
        typ: MessageType,
    ) -> Self {
        let encoding = if state.deflate.is_some() {
            Encoding::Pending(BytesMut::new())
        } else {
            Encoding::Plain
        };

        Self {
            core,
            state,
            typ,
            encoding,
            held_trailer: false,
            started: false,
            closed: false,
        }
    }

    /// The type of the message being written.
    pub fn message_type(&self) -> MessageType {
        self.typ
    }

    /// Writes `data` as the next fragment of the message.
    pub async fn write(&mut self, data: impl AsRef<[u8]>) -> Result<()> {
        if self.closed {
            return Err(WebSocketError::WriterClosed);
        }

        let data = data.as_ref();
        if data.is_empty() {
            return Ok(());
        }

        match &mut self.encoding {
            Encoding::Pending(buffer) => {
                buffer.extend_from_slice(data);
                if buffer.len() < self.state.threshold {
                    return Ok(());
                }

                let buffered = std::mem::take(buffer);
                self.encoding = Encoding::Deflate;
                if let Some(deflate) = self.state.deflate.as_mut() {
                    deflate.begin_message();
                }
                self.write_compressed(&buffered).await
            }
            Encoding::Plain => self.emit(false, BytesMut::from(data)).await,
            Encoding::Deflate => self.write_compressed(data).await,
        }
    }

    /// Sends the final frame. A second close returns [`WebSocketError::WriterClosed`].
    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Err(WebSocketError::WriterClosed);
        }

        let result = match std::mem::replace(&mut self.encoding, Encoding::Plain) {
            // never reached the threshold: the whole message goes out uncompressed
            Encoding::Pending(buffer) => self.emit(true, buffer).await,
            Encoding::Plain => self.emit(true, BytesMut::new()).await,
            Encoding::Deflate => {
                self.encoding = Encoding::Deflate;
                self.emit(true, BytesMut::new()).await
            }
        };

        self.closed = true;
        result
    }

    /// Compresses `data` into one frame.
    ///
    /// The flush marker ending each chunk is held back and sent at the start of the next frame,
    /// so the marker of the last chunk is dropped as permessage-deflate requires.
    async fn write_compressed(&mut self, data: &[u8]) -> Result<()> {
        let Some(deflate) = self.state.deflate.as_mut() else {
            return self.emit(false, BytesMut::from(data)).await;
        };

        let output = match deflate.compress(data) {
            Ok(output) => output,
            Err(err) => {
                let err = WebSocketError::from(err);
                self.closed = true;
                self.core.fail(err.clone());
                return Err(err);
            }
        };

        let mut payload = BytesMut::with_capacity(output.len());
        if self.held_trailer {
            payload.extend_from_slice(&DEFLATE_TRAILER);
        }

        self.held_trailer = output.ends_with(&DEFLATE_TRAILER);
        let end = if self.held_trailer {
            output.len() - DEFLATE_TRAILER.len()
        } else {
            output.len()
        };
        payload.extend_from_slice(&output[..end]);

        let core = Arc::clone(&self.core);
        let guard = FailOnDrop::new(&core, "message writer");
        let result = self.emit(false, payload).await;
        guard.disarm();
        result
    }

    async fn emit(&mut self, fin: bool, payload: BytesMut) -> Result<()> {
        let frame = if self.started {
            Frame::new(fin, OpCode::Continuation, None, payload)
        } else if matches!(self.encoding, Encoding::Deflate) {
            Frame::compress(fin, self.typ.into(), None, payload)
        } else {
            Frame::new(fin, self.typ.into(), None, payload)
        };

        self.started = true;
        let result = self.core.write_frame(frame).await;
        if result.is_err() {
            self.closed = true;
        }
        result
    }
}

impl Drop for MessageWriter {
    fn drop(&mut self) {
        if self.started && !self.closed {
            self.core.fail(WebSocketError::Cancelled("message writer"));
        }
    }
}
