//! Read path of a connection: frame demultiplexing and message reassembly.
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use tokio::{
    io::{AsyncRead, ReadHalf},
    sync::OwnedMutexGuard,
};
use tokio_util::codec::FramedRead;

use super::shared::{Core, FailOnDrop};
use crate::{
    close::{CloseCode, CloseError},
    codec::Decoder,
    compression::{Decompressor, InflateError},
    frame::{Frame, MessageType, OpCode},
    ProtocolError, Result, WebSocketError,
};

/// Everything owned by the single reader of a connection.
pub(crate) struct ReadState<S> {
    frames: FramedRead<ReadHalf<S>, Decoder>,
    /// Optional decompressor used to decompress incoming payloads.
    inflate: Option<Decompressor>,
    /// Message currently being read, kept until the next one starts.
    message: Option<Incoming>,
}

/// Progress of the message being read.
struct Incoming {
    compressed: bool,
    /// First frame of the message, not yet handed out.
    pending: Option<Frame>,
    /// Payload bytes delivered so far, after decompression.
    received: usize,
    /// Read limit in effect when the message started.
    limit: usize,
    done: bool,
}

impl<S> ReadState<S>
where
    S: AsyncRead,
{
    pub(crate) fn new(
        frames: FramedRead<ReadHalf<S>, Decoder>,
        inflate: Option<Decompressor>,
    ) -> Self {
        Self {
            frames,
            inflate,
            message: None,
        }
    }

    /// Reads frames until a data frame arrives, servicing control frames on the way.
    ///
    /// Pings are answered, pongs wake their pinger and a close frame advances the handshake.
    /// Returns the terminal error once the connection is closed.
    pub(crate) async fn next_frame(&mut self, core: &Core) -> Result<Frame> {
        loop {
            self.frames.decoder_mut().set_read_limit(core.read_limit());

            let next = tokio::select! {
                biased;
                _ = core.closed().cancelled() => return Err(core.terminal_error()),
                next = self.frames.next() => next,
            };

            let frame = match next {
                Some(Ok(frame)) => frame,
                Some(Err(err)) => {
                    #[cfg(feature = "logging")]
                    if let WebSocketError::MessageTooBig { limit } = &err {
                        log::warn!("{} frame exceeds the read limit of {limit} bytes", core.role);
                    }
                    return Err(core.fail_with(err).await);
                }
                None => {
                    core.fail(WebSocketError::Closed(CloseError::new(
                        CloseCode::Abnormal,
                        "unexpected EOF",
                    )));
                    return Err(core.terminal_error());
                }
            };

            match frame.opcode {
                OpCode::Ping => core.write_frame(Frame::pong(&frame.payload)).await?,
                OpCode::Pong => {
                    core.pings.resolve(&frame.payload);
                }
                OpCode::Close => return Err(core.on_close(&frame.payload).await),
                OpCode::Text | OpCode::Binary | OpCode::Continuation => return Ok(frame),
            }
        }
    }

    /// Waits for the first frame of the next message.
    pub(crate) async fn begin_message(&mut self, core: &Core) -> Result<MessageType> {
        if self.message.as_ref().is_some_and(|message| !message.done) {
            core.fail(WebSocketError::IncompleteMessage);
            return Err(WebSocketError::IncompleteMessage);
        }

        let frame = self.next_frame(core).await?;
        let typ = match MessageType::try_from(frame.opcode) {
            Ok(typ) => typ,
            Err(err) => return Err(core.fail_with(err).await),
        };

        let compressed = frame.is_compressed();
        if compressed {
            match self.inflate.as_mut() {
                Some(inflate) => inflate.begin_message(),
                None => {
                    let err = ProtocolError::CompressionNotSupported.into();
                    return Err(core.fail_with(err).await);
                }
            }
        }

        self.message = Some(Incoming {
            compressed,
            pending: Some(frame),
            received: 0,
            limit: core.read_limit(),
            done: false,
        });

        Ok(typ)
    }

    /// Returns the next piece of the current message, or `None` once it is complete.
    pub(crate) async fn next_chunk(&mut self, core: &Core) -> Result<Option<Bytes>> {
        loop {
            let pending = match self.message.as_mut() {
                Some(message) if !message.done => message.pending.take(),
                _ => return Ok(None),
            };

            let frame = match pending {
                Some(frame) => frame,
                None => {
                    let frame = self.next_frame(core).await?;
                    if frame.opcode != OpCode::Continuation {
                        return Err(core.fail_with(ProtocolError::InvalidFragment.into()).await);
                    }
                    frame
                }
            };

            let Some(message) = self.message.as_mut() else {
                return Ok(None);
            };
            let limit = message.limit;
            let remaining = limit.saturating_sub(message.received);

            let chunk = if message.compressed {
                let Some(inflate) = self.inflate.as_mut() else {
                    let err = ProtocolError::CompressionNotSupported.into();
                    return Err(core.fail_with(err).await);
                };
                match inflate.decompress(&frame.payload, frame.fin, remaining) {
                    Ok(data) => Bytes::from(data),
                    Err(InflateError::TooLarge) => {
                        return Err(core.fail_with(WebSocketError::MessageTooBig { limit }).await)
                    }
                    Err(InflateError::Corrupt(reason)) => {
                        return Err(core.fail_with(ProtocolError::Deflate(reason).into()).await)
                    }
                }
            } else {
                if frame.payload.len() > remaining {
                    return Err(core.fail_with(WebSocketError::MessageTooBig { limit }).await);
                }
                frame.payload.freeze()
            };

            message.received += chunk.len();
            message.done = frame.fin;

            if !chunk.is_empty() {
                return Ok(Some(chunk));
            }
            if frame.fin {
                return Ok(None);
            }
        }
    }
}

/// A message being read, frame by frame.
///
/// Obtained from [`WebSocket::reader`](crate::WebSocket::reader). It holds the read side of the
/// connection until dropped; the message should be read to completion before asking for the
/// next one, otherwise the connection fails with [`WebSocketError::IncompleteMessage`].
pub struct MessageReader<S> {
    pub(crate) core: Arc<Core>,
    pub(crate) state: OwnedMutexGuard<ReadState<S>>,
    pub(crate) typ: MessageType,
}

impl<S> MessageReader<S>
where
    S: AsyncRead,
{
    /// The type of the message, taken from its first frame.
    pub fn message_type(&self) -> MessageType {
        self.typ
    }

    /// Reads the next chunk of the message, decompressed. Returns `None` once the message ends.
    ///
    /// Dropping the returned future before it completes fails the connection.
    pub async fn read_chunk(&mut self) -> Result<Option<Bytes>> {
        let guard = FailOnDrop::new(&self.core, "read");
        let result = self.state.next_chunk(&self.core).await;
        guard.disarm();
        result
    }

    /// Reads the rest of the message into one buffer.
    pub async fn read_to_end(mut self) -> Result<Bytes> {
        let Some(first) = self.read_chunk().await? else {
            return Ok(Bytes::new());
        };

        // single-frame messages are handed out without copying
        let Some(second) = self.read_chunk().await? else {
            return Ok(first);
        };

        let mut payload = BytesMut::with_capacity(first.len() + second.len());
        payload.extend_from_slice(&first);
        payload.extend_from_slice(&second);
        while let Some(chunk) = self.read_chunk().await? {
            payload.extend_from_slice(&chunk);
        }

        Ok(payload.freeze())
    }
}
