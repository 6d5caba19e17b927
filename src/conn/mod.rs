//! The connection engine.
//!
//! A [`WebSocket`] is built over a stream that already completed the upgrade handshake. It
//! splits the stream into a read side, owned by at most one reader at a time, and a write side
//! shared by every handle through a write-exclusion section.
mod options;
mod ping;
mod reader;
mod shared;
mod writer;

use std::sync::Arc;

use bytes::Bytes;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::{Mutex as AsyncMutex, OwnedMutexGuard},
};
use tokio_util::{
    codec::{FramedRead, FramedWrite},
    sync::CancellationToken,
};

use self::{
    reader::ReadState,
    shared::{Core, FailOnDrop, FrameSink},
    writer::WriteState,
};
use crate::{
    close::{CloseCode, CloseError},
    codec::{Decoder, Encoder},
    frame::{Frame, MessageType},
    ProtocolError, Result, WebSocketError,
};

pub use self::{
    options::{CompressionLevel, CompressionMode, DeflateOptions, Options, Role},
    reader::MessageReader,
    shared::State,
    writer::MessageWriter,
};

/// A WebSocket connection over an upgraded stream.
///
/// Handles are cheap to clone and share one connection. Writes, pings and closes may be issued
/// from any number of tasks; reads are limited to one at a time.
///
/// # Example
/// ```no_run
/// use wsengine::{CloseCode, MessageType, Options, Role, WebSocket};
///
/// async fn greet(stream: tokio::net::TcpStream) -> wsengine::Result<()> {
///     let ws = WebSocket::new(stream, Role::Client, Options::default());
///     ws.write(MessageType::Text, "hello").await?;
///
///     let (typ, payload) = ws.read().await?;
///     println!("{typ}: {payload:?}");
///
///     ws.close(CloseCode::Normal, "").await
/// }
/// ```
pub struct WebSocket<S> {
    core: Arc<Core>,
    reader: Arc<AsyncMutex<ReadState<S>>>,
    writer: Arc<AsyncMutex<WriteState>>,
}

impl<S> Clone for WebSocket<S> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
            reader: Arc::clone(&self.reader),
            writer: Arc::clone(&self.writer),
        }
    }
}

impl<S> WebSocket<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    /// Creates a connection from an upgraded stream, the local role and the negotiated options.
    pub fn new(stream: S, role: Role, options: Options) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);

        let decoder = Decoder::new(
            role,
            options.read_limit,
            options.compression.is_some(),
            options.strict_length_encoding,
        );
        let frames = FramedRead::new(read_half, decoder);
        let sink: FrameSink = Box::pin(FramedWrite::new(write_half, Encoder::new(role)));

        let threshold = options
            .compression
            .as_ref()
            .map_or(usize::MAX, |compression| compression.threshold(role));
        let read_state = ReadState::new(frames, options.decompressor(role));
        let write_state = WriteState::new(options.compressor(role), threshold);

        Self {
            core: Arc::new(Core::new(role, options, sink)),
            reader: Arc::new(AsyncMutex::new(read_state)),
            writer: Arc::new(AsyncMutex::new(write_state)),
        }
    }

    /// The role this side took in the upgrade.
    pub fn role(&self) -> Role {
        self.core.role
    }

    /// Current lifecycle state.
    pub fn state(&self) -> State {
        self.core.state()
    }

    /// Subprotocol agreed during the upgrade.
    pub fn subprotocol(&self) -> Option<&str> {
        self.core.options.subprotocol.as_deref()
    }

    /// The error that ended the connection, once there is one.
    pub fn error(&self) -> Option<WebSocketError> {
        self.core.error()
    }

    /// Resolves once the connection is closed.
    pub async fn closed(&self) {
        self.core.closed().cancelled().await
    }

    /// Fails the connection with `err` unless it already failed.
    pub(crate) fn fail(&self, err: WebSocketError) {
        self.core.fail(err);
    }

    /// Sets the maximum message size. Applies from the next frame read.
    pub fn set_read_limit(&self, limit: usize) {
        self.core.set_read_limit(limit);
    }

    /// Waits for the next message and returns a reader over its fragments.
    ///
    /// Control frames that arrive meanwhile are handled. Fails with
    /// [`WebSocketError::ConcurrentRead`] if another reader is active and with
    /// [`WebSocketError::ReadClosed`] after [`close_read`](Self::close_read).
    pub async fn reader(&self) -> Result<MessageReader<S>> {
        if self.core.is_read_closed() {
            return Err(WebSocketError::ReadClosed);
        }
        if self.core.state() == State::Closed {
            return Err(self.core.terminal_error());
        }

        let mut state = match Arc::clone(&self.reader).try_lock_owned() {
            Ok(state) => state,
            Err(_) if self.core.state() == State::Open => {
                return Err(WebSocketError::ConcurrentRead)
            }
            // the close handshake is draining the read side
            Err(_) => {
                self.closed().await;
                return Err(self.core.terminal_error());
            }
        };

        let guard = FailOnDrop::new(&self.core, "read");
        let result = state.begin_message(&self.core).await;
        guard.disarm();

        Ok(MessageReader {
            core: Arc::clone(&self.core),
            state,
            typ: result?,
        })
    }

    /// Reads a whole message.
    ///
    /// Text messages are validated as UTF-8 when [`Options::check_utf8`] is set.
    pub async fn read(&self) -> Result<(MessageType, Bytes)> {
        let reader = self.reader().await?;
        let typ = reader.message_type();
        let payload = reader.read_to_end().await?;

        if typ == MessageType::Text && self.core.options.check_utf8 {
            #[cfg(not(feature = "simd"))]
            let valid = std::str::from_utf8(&payload).is_ok();
            #[cfg(feature = "simd")]
            let valid = simdutf8::basic::from_utf8(&payload).is_ok();

            if !valid {
                return Err(self.core.fail_with(ProtocolError::InvalidUtf8.into()).await);
            }
        }

        Ok((typ, payload))
    }

    /// Acquires the message section, giving up once the connection closes.
    async fn lock_writer(&self) -> Result<OwnedMutexGuard<WriteState>> {
        if self.core.state() == State::Closed {
            return Err(self.core.terminal_error());
        }

        tokio::select! {
            biased;
            _ = self.core.closed().cancelled() => Err(self.core.terminal_error()),
            state = Arc::clone(&self.writer).lock_owned() => Ok(state),
        }
    }

    /// Writes a whole message as a single frame.
    ///
    /// With compression negotiated, payloads reaching the threshold are compressed. The
    /// message is either fully sent or the connection fails. Dropping the future while it is
    /// queued behind other frames fails the connection too once the payload was compressed.
    pub async fn write(&self, typ: MessageType, payload: impl AsRef<[u8]>) -> Result<()> {
        let mut state = self.lock_writer().await?;

        let frame = match state.message_frame(typ, payload.as_ref()) {
            Ok(frame) => frame,
            Err(err) => {
                self.core.fail(err.clone());
                return Err(err);
            }
        };

        // the compressor has already consumed the payload
        let guard = frame
            .is_compressed()
            .then(|| FailOnDrop::new(&self.core, "write"));
        let result = self.core.write_frame(frame).await;
        if let Some(guard) = guard {
            guard.disarm();
        }
        result
    }

    /// Starts a message written in fragments.
    ///
    /// Other messages wait until the returned writer is closed.
    pub async fn writer(&self, typ: MessageType) -> Result<MessageWriter> {
        let state = self.lock_writer().await?;
        Ok(MessageWriter::new(Arc::clone(&self.core), state, typ))
    }

    /// Sends a ping and waits for the matching pong.
    ///
    /// The pong is only seen while something reads the connection, either a reader or the
    /// background task started by [`close_read`](Self::close_read). Dropping the future while
    /// waiting fails the connection. The wait is additionally bounded by
    /// [`Options::ping_timeout`].
    pub async fn ping(&self) -> Result<()> {
        if self.core.state() == State::Closed {
            return Err(self.core.terminal_error());
        }

        let token = self.core.next_ping_token();
        let pong = self.core.pings.register(token.clone())?;
        let mut guard = PingGuard {
            core: &self.core,
            token: &token,
            armed: false,
        };

        self.core.write_frame(Frame::ping(&token)).await?;
        guard.armed = true;

        let wait = async {
            tokio::select! {
                biased;
                _ = self.core.closed().cancelled() => Err(self.core.terminal_error()),
                // a dropped sender means the table was cleared on close
                result = pong => result.map_err(|_| self.core.terminal_error()),
            }
        };

        let result = match self.core.options.ping_timeout {
            Some(timeout) => match tokio::time::timeout(timeout, wait).await {
                Ok(result) => result,
                Err(_) => {
                    #[cfg(feature = "logging")]
                    log::debug!("{} ping {token:?} timed out after {timeout:?}", self.core.role);

                    let err = WebSocketError::Timeout("failed to wait for pong");
                    self.core.fail(err.clone());
                    Err(err)
                }
            },
            None => wait.await,
        };

        guard.disarm();
        result
    }

    /// Closes the connection with a close handshake.
    ///
    /// Validates the status and reason first; an invalid one is rejected before anything is
    /// sent and leaves the connection untouched. Otherwise sends the close frame and waits, up
    /// to [`Options::close_timeout`], for the peer's close frame while discarding data frames.
    ///
    /// Returns `Ok` when the connection ended with a close status, including when the peer had
    /// already closed it.
    pub async fn close(&self, code: CloseCode, reason: &str) -> Result<()> {
        let close = CloseError::new(code, reason);
        let payload = close.encode()?;
        let close_timeout = self.core.options.close_timeout;

        if !self.core.begin_closing() {
            // someone else started the handshake
            let _ = tokio::time::timeout(close_timeout, self.closed()).await;
            return self.core.close_result();
        }

        #[cfg(feature = "logging")]
        log::debug!("{} sending close frame: {}", self.core.role, close);

        self.core.record_sent_close(close);
        self.core.write_frame(Frame::close(payload)).await?;

        let handshake = async {
            let mut state = tokio::select! {
                biased;
                _ = self.core.closed().cancelled() => return,
                state = Arc::clone(&self.reader).lock_owned() => state,
            };
            // discard data until the peer's close frame ends the connection
            while state.next_frame(&self.core).await.is_ok() {}
        };

        let guard = FailOnDrop::new(&self.core, "close");
        if tokio::time::timeout(close_timeout, handshake).await.is_err() {
            let err = WebSocketError::Timeout("failed to wait for close frame");
            self.core.fail(err);
        }
        guard.disarm();

        self.core.close_result()
    }

    /// Stops reading messages while still servicing control frames.
    ///
    /// A background task takes over the read side, discarding data frames and answering pings,
    /// pongs and close frames until the connection closes. Later calls to [`read`](Self::read)
    /// or [`reader`](Self::reader) fail with [`WebSocketError::ReadClosed`].
    ///
    /// The returned token is cancelled once the task has exited.
    pub fn close_read(&self) -> CancellationToken {
        let done = self.core.closed().child_token();
        if self.core.close_reads() {
            return done;
        }

        let core = Arc::clone(&self.core);
        let reader = Arc::clone(&self.reader);
        let exited = done.clone();

        let drain = async move {
            let mut state = tokio::select! {
                biased;
                _ = core.closed().cancelled() => return,
                state = reader.lock_owned() => state,
            };
            while state.next_frame(&core).await.is_ok() {}
            exited.cancel();
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(drain);
            }
            Err(_) => {
                self.core.fail(WebSocketError::Cancelled("close read"));
            }
        }

        done
    }
}

/// Removes an outstanding ping from the table, failing the connection if the wait was dropped.
struct PingGuard<'a> {
    core: &'a Core,
    token: &'a [u8],
    armed: bool,
}

impl PingGuard<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for PingGuard<'_> {
    fn drop(&mut self) {
        self.core.pings.cancel(self.token);
        if self.armed {
            self.core.fail(WebSocketError::Cancelled("ping"));
        }
    }
}
