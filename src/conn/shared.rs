//! State shared by every handle of a connection.
//!
//! [`Core`] owns the write half of the stream, the lifecycle latch and the terminal error. All
//! frame emission goes through [`Core::write_frame`], which holds the sink lock for exactly one
//! frame so control frames can be interleaved between the fragments of a message.
use std::{
    pin::Pin,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering},
        Arc, Mutex, PoisonError,
    },
    time::Duration,
};

use bytes::Bytes;
use futures::{Sink, SinkExt};
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;

use super::{ping::PingTable, Options, Role};
use crate::{
    close::{CloseCode, CloseError},
    frame::Frame,
    Result, WebSocketError,
};

/// Bound on writing a close frame triggered by a failure or a peer's close.
const CONTROL_TIMEOUT: Duration = Duration::from_secs(5);

/// Frames are written through a type-erased sink so the core does not depend on the stream type.
pub(crate) type FrameSink = Pin<Box<dyn Sink<Frame, Error = WebSocketError> + Send>>;

/// Lifecycle of a connection. Transitions only move forward.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum State {
    /// Messages flow in both directions.
    Open,
    /// A close frame was sent or received; waiting for the other side.
    Closing,
    /// The stream is being torn down. Every operation returns the terminal error.
    Closed,
}

impl State {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Open,
            1 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

/// One-way latch over [`State`].
struct StateLatch(AtomicU8);

impl StateLatch {
    fn new() -> Self {
        Self(AtomicU8::new(State::Open as u8))
    }

    fn load(&self) -> State {
        State::from_u8(self.0.load(Ordering::Acquire))
    }

    fn transition(&self, from: State, to: State) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Moves to `Closed`, returning the previous state.
    fn close(&self) -> State {
        State::from_u8(self.0.swap(State::Closed as u8, Ordering::AcqRel))
    }
}

pub(crate) struct Core {
    pub(crate) role: Role,
    pub(crate) options: Options,
    state: StateLatch,
    closed: CancellationToken,
    /// First error that ended or is ending the connection.
    terminal: Mutex<Option<WebSocketError>>,
    sink: Arc<AsyncMutex<Option<FrameSink>>>,
    pub(crate) pings: PingTable,
    ping_counter: AtomicU64,
    /// Close frame this side sent, if any.
    sent_close: Mutex<Option<CloseError>>,
    read_limit: AtomicUsize,
    read_closed: AtomicBool,
}

impl Core {
    pub(crate) fn new(role: Role, options: Options, sink: FrameSink) -> Self {
        Self {
            role,
            pings: PingTable::new(options.max_outstanding_pings),
            read_limit: AtomicUsize::new(options.read_limit),
            options,
            state: StateLatch::new(),
            closed: CancellationToken::new(),
            terminal: Mutex::new(None),
            sink: Arc::new(AsyncMutex::new(Some(sink))),
            ping_counter: AtomicU64::new(0),
            sent_close: Mutex::new(None),
            read_closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn state(&self) -> State {
        self.state.load()
    }

    /// Token cancelled once the connection is closed.
    pub(crate) fn closed(&self) -> &CancellationToken {
        &self.closed
    }

    pub(crate) fn read_limit(&self) -> usize {
        self.read_limit.load(Ordering::Relaxed)
    }

    pub(crate) fn set_read_limit(&self, limit: usize) {
        self.read_limit.store(limit, Ordering::Relaxed);
    }

    pub(crate) fn is_read_closed(&self) -> bool {
        self.read_closed.load(Ordering::Acquire)
    }

    /// Marks reads as closed, returning whether they already were.
    pub(crate) fn close_reads(&self) -> bool {
        self.read_closed.swap(true, Ordering::AcqRel)
    }

    /// Next ping correlation token: a decimal counter.
    pub(crate) fn next_ping_token(&self) -> Bytes {
        let id = self.ping_counter.fetch_add(1, Ordering::Relaxed);
        Bytes::from(id.to_string())
    }

    /// Starts the close handshake from this side. Fails if it was already started.
    pub(crate) fn begin_closing(&self) -> bool {
        self.state.transition(State::Open, State::Closing)
    }

    pub(crate) fn record_sent_close(&self, close: CloseError) {
        *self
            .sent_close
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(close);
    }

    fn sent_close(&self) -> Option<CloseError> {
        self.sent_close
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// The terminal error, if one was recorded.
    pub(crate) fn error(&self) -> Option<WebSocketError> {
        self.terminal
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn terminal_error(&self) -> WebSocketError {
        self.error().unwrap_or_else(|| {
            WebSocketError::Closed(CloseError::new(CloseCode::Abnormal, "connection closed"))
        })
    }

    fn record_terminal(&self, err: &WebSocketError) {
        let mut terminal = self.terminal.lock().unwrap_or_else(PoisonError::into_inner);
        if terminal.is_none() {
            *terminal = Some(err.clone());
        }
    }

    /// `Ok` when the connection ended with a close status, the terminal error otherwise.
    pub(crate) fn close_result(&self) -> Result<()> {
        match self.terminal_error() {
            WebSocketError::Closed(_) => Ok(()),
            err => Err(err),
        }
    }

    /// Tears the connection down.
    ///
    /// The first error recorded stays the terminal error. Waiters are woken and the sink is
    /// shut down in the background, which delivers EOF to the peer.
    pub(crate) fn fail(&self, err: WebSocketError) {
        self.record_terminal(&err);
        if self.state.close() == State::Closed {
            return;
        }

        #[cfg(feature = "logging")]
        log::debug!("{} connection closed: {}", self.role, self.terminal_error());

        self.closed.cancel();
        self.pings.clear();

        let sink = Arc::clone(&self.sink);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let mut sink = sink.lock().await;
                if let Some(mut stream) = sink.take() {
                    let _ = tokio::time::timeout(CONTROL_TIMEOUT, stream.close()).await;
                }
            });
        }
    }

    /// Fails the connection, first telling the peer why when the error has a close status.
    pub(crate) async fn fail_with(&self, err: WebSocketError) -> WebSocketError {
        self.record_terminal(&err);

        if let Some(code) = err.close_code() {
            if self.begin_closing() {
                let close = CloseError::truncated(code, &err.to_string());
                self.send_close(close).await;
            }
        }

        self.fail(err.clone());
        err
    }

    /// Writes a close frame with a bounded wait, ignoring failures.
    async fn send_close(&self, close: CloseError) {
        let Ok(payload) = close.encode() else {
            return;
        };

        #[cfg(feature = "logging")]
        log::debug!("{} sending close frame: {}", self.role, close);

        self.record_sent_close(close);
        let _ = tokio::time::timeout(CONTROL_TIMEOUT, self.write_frame(Frame::close(payload))).await;
    }

    /// Advances the close handshake on a received close frame and returns the terminal error.
    pub(crate) async fn on_close(&self, payload: &[u8]) -> WebSocketError {
        let received = match CloseError::parse(payload) {
            Ok(close) => close,
            Err(err) => return self.fail_with(err.into()).await,
        };

        #[cfg(feature = "logging")]
        log::debug!("{} received close frame: {}", self.role, received);

        if self.begin_closing() {
            // the peer started the handshake: echo its status back
            self.record_terminal(&WebSocketError::Closed(received.clone()));
            let reply = match received.code {
                CloseCode::NoStatus => CloseError::new(CloseCode::Normal, ""),
                _ => received.clone(),
            };
            self.send_close(reply).await;
            self.fail(WebSocketError::Closed(received));
        } else {
            let close = match self.sent_close() {
                Some(sent) if !matches!(received.code, CloseCode::Protocol | CloseCode::Invalid) => {
                    sent
                }
                _ => received,
            };
            self.fail(WebSocketError::Closed(close));
        }

        self.terminal_error()
    }

    /// Whether `frame` may be written in the current state.
    ///
    /// Control frames still go out while closing; data frames do not.
    fn accepts(&self, frame: &Frame) -> bool {
        match self.state.load() {
            State::Open => true,
            State::Closing => frame.opcode.is_control(),
            State::Closed => false,
        }
    }

    /// Writes one frame under the write-exclusion section.
    ///
    /// Dropping the future while the frame is being written fails the connection. Dropping
    /// it while queued for the section does not.
    pub(crate) async fn write_frame(&self, frame: Frame) -> Result<()> {
        if !self.accepts(&frame) {
            self.closed.cancelled().await;
            return Err(self.terminal_error());
        }

        let mut sink = tokio::select! {
            biased;
            _ = self.closed.cancelled() => return Err(self.terminal_error()),
            sink = self.sink.lock() => sink,
        };

        if !self.accepts(&frame) {
            drop(sink);
            self.closed.cancelled().await;
            return Err(self.terminal_error());
        }

        let Some(stream) = sink.as_mut() else {
            return Err(self.terminal_error());
        };

        let guard = FailOnDrop::new(self, "write");
        let result = tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(self.terminal_error()),
            result = stream.send(frame) => result,
        };
        guard.disarm();
        drop(sink);

        if let Err(err) = &result {
            self.fail(err.clone());
        }
        result
    }
}

/// Fails the connection with [`WebSocketError::Cancelled`] unless disarmed before being dropped.
pub(crate) struct FailOnDrop<'a> {
    core: &'a Core,
    what: Option<&'static str>,
}

impl<'a> FailOnDrop<'a> {
    pub(crate) fn new(core: &'a Core, what: &'static str) -> Self {
        Self {
            core,
            what: Some(what),
        }
    }

    pub(crate) fn disarm(mut self) {
        self.what = None;
    }
}

impl Drop for FailOnDrop<'_> {
    fn drop(&mut self) {
        if let Some(what) = self.what.take() {
            self.core.fail(WebSocketError::Cancelled(what));
        }
    }
}
