//! Byte-stream view of a connection.
use std::{
    future::Future,
    io,
    pin::Pin,
    task::{ready, Context, Poll},
};

use bytes::Bytes;
use futures::future::BoxFuture;
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    time::Instant,
};

use crate::{
    close::CloseCode, close_status, MessageReader, MessageType, WebSocket, WebSocketError,
};

type ReadResult<S> = io::Result<Option<(MessageReader<S>, Bytes)>>;

/// Presents a [`WebSocket`] as a continuous byte stream.
///
/// Every `poll_write` sends one whole message of the adapter's type, and reads yield the bytes
/// of successive messages back to back. A message of the other type closes the connection with
/// [`CloseCode::Unsupported`] and fails the read with [`io::ErrorKind::InvalidData`]. A close
/// with [`CloseCode::Normal`] or [`CloseCode::Away`] reads as EOF. Shutting the stream down
/// performs a normal close handshake.
///
/// # Example
/// ```no_run
/// use tokio::io::{AsyncReadExt, AsyncWriteExt};
/// use wsengine::{MessageType, NetConn, Options, Role, WebSocket};
///
/// async fn relay(stream: tokio::net::TcpStream) -> std::io::Result<()> {
///     let ws = WebSocket::new(stream, Role::Client, Options::default());
///     let mut conn = NetConn::new(ws, MessageType::Binary);
///
///     conn.write_all(b"ping").await?;
///     let mut buf = Vec::new();
///     conn.read_to_end(&mut buf).await?;
///     Ok(())
/// }
/// ```
pub struct NetConn<S> {
    ws: WebSocket<S>,
    typ: MessageType,
    /// Message being read, if it has more bytes.
    reader: Option<MessageReader<S>>,
    /// Part of the last chunk not handed out yet.
    buffered: Bytes,
    eof: bool,
    pending_read: Option<BoxFuture<'static, ReadResult<S>>>,
    /// In-flight message and the number of bytes it carries.
    pending_write: Option<(BoxFuture<'static, io::Result<()>>, usize)>,
    pending_shutdown: Option<BoxFuture<'static, io::Result<()>>>,
    read_deadline: Option<Instant>,
    write_deadline: Option<Instant>,
}

impl<S> NetConn<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    /// Wraps `ws`, reading and writing messages of type `typ` only.
    pub fn new(ws: WebSocket<S>, typ: MessageType) -> Self {
        Self {
            ws,
            typ,
            reader: None,
            buffered: Bytes::new(),
            eof: false,
            pending_read: None,
            pending_write: None,
            pending_shutdown: None,
            read_deadline: None,
            write_deadline: None,
        }
    }

    /// The wrapped connection.
    pub fn get_ref(&self) -> &WebSocket<S> {
        &self.ws
    }

    /// Bounds reads started from now on. Reaching the deadline fails the connection.
    pub fn set_read_deadline(&mut self, deadline: Option<Instant>) {
        self.read_deadline = deadline;
    }

    /// Bounds writes started from now on. Reaching the deadline fails the connection.
    pub fn set_write_deadline(&mut self, deadline: Option<Instant>) {
        self.write_deadline = deadline;
    }
}

/// Runs `op` until `deadline`, failing the connection if the deadline comes first.
async fn with_deadline<S, T>(
    ws: &WebSocket<S>,
    deadline: Option<Instant>,
    what: &'static str,
    op: impl Future<Output = io::Result<T>>,
) -> io::Result<T>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let Some(deadline) = deadline else {
        return op.await;
    };

    tokio::pin!(op);
    tokio::select! {
        biased;
        result = &mut op => result,
        _ = tokio::time::sleep_until(deadline) => {
            // fail before `op` is dropped so the timeout becomes the terminal error
            ws.fail(WebSocketError::Timeout(what));
            Err(io::Error::new(io::ErrorKind::TimedOut, what))
        }
    }
}

/// Reads the next chunk of the stream, moving on to the next message as each one ends.
///
/// Returns `None` at EOF.
async fn next_chunk<S>(
    ws: WebSocket<S>,
    typ: MessageType,
    mut reader: Option<MessageReader<S>>,
    deadline: Option<Instant>,
) -> ReadResult<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let read = async {
        loop {
            let mut current = match reader.take() {
                Some(current) => current,
                None => ws.reader().await?,
            };

            if current.message_type() != typ {
                return Err(WebSocketError::UnexpectedMessageType {
                    expected: typ,
                    got: current.message_type(),
                });
            }

            if let Some(chunk) = current.read_chunk().await? {
                return Ok((current, chunk));
            }
        }
    };

    let result = async {
        match read.await {
            Ok(next) => Ok(Some(next)),
            Err(WebSocketError::UnexpectedMessageType { expected, got }) => {
                let reason = format!("unexpected frame type read (expected {expected}): {got}");
                let _ = ws.close(CloseCode::Unsupported, &reason).await;
                Err(io::Error::new(io::ErrorKind::InvalidData, reason))
            }
            Err(err) => match close_status(&err) {
                Some(CloseCode::Normal | CloseCode::Away) => Ok(None),
                _ => Err(io::Error::other(err)),
            },
        }
    };

    with_deadline(&ws, deadline, "read deadline exceeded", result).await
}

impl<S> AsyncRead for NetConn<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        loop {
            if !this.buffered.is_empty() {
                let n = this.buffered.len().min(buf.remaining());
                buf.put_slice(&this.buffered.split_to(n));
                return Poll::Ready(Ok(()));
            }

            if this.eof {
                return Poll::Ready(Ok(()));
            }

            let read = this.pending_read.get_or_insert_with(|| {
                Box::pin(next_chunk(
                    this.ws.clone(),
                    this.typ,
                    this.reader.take(),
                    this.read_deadline,
                ))
            });

            let result = ready!(read.as_mut().poll(cx));
            this.pending_read = None;

            match result? {
                Some((reader, chunk)) => {
                    this.reader = Some(reader);
                    this.buffered = chunk;
                }
                None => this.eof = true,
            }
        }
    }
}

impl<S> NetConn<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    fn poll_pending_write(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<usize>> {
        let Some((write, len)) = self.pending_write.as_mut() else {
            return Poll::Ready(Ok(0));
        };

        let result = ready!(write.as_mut().poll(cx));
        let len = *len;
        self.pending_write = None;
        Poll::Ready(result.map(|()| len))
    }
}

impl<S> AsyncWrite for NetConn<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        // a previous call returned pending: finish that message first
        if this.pending_write.is_none() {
            let ws = this.ws.clone();
            let typ = this.typ;
            let deadline = this.write_deadline;
            let payload = Bytes::copy_from_slice(buf);

            let write = async move {
                let send = async {
                    ws.write(typ, &payload).await.map_err(io::Error::other)
                };
                with_deadline(&ws, deadline, "write deadline exceeded", send).await
            };
            this.pending_write = Some((Box::pin(write), buf.len()));
        }

        this.poll_pending_write(cx)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_pending_write(cx))?;
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_pending_write(cx))?;

        // the close handshake needs the read side
        this.reader = None;
        this.buffered = Bytes::new();

        let shutdown = this.pending_shutdown.get_or_insert_with(|| {
            let ws = this.ws.clone();
            Box::pin(async move {
                ws.close(CloseCode::Normal, "")
                    .await
                    .map_err(io::Error::other)
            })
        });

        let result = ready!(shutdown.as_mut().poll(cx));
        this.pending_shutdown = None;
        Poll::Ready(result)
    }
}
