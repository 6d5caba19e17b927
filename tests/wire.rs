//! Connections driven by a hand-rolled peer that writes frames directly.
mod common;

use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf},
    task::JoinHandle,
    time::{timeout, Instant},
};
use tokio_util::codec::{FramedRead, FramedWrite};
use wsengine::{
    codec::{Decoder, Encoder},
    close_status, CloseCode, Frame, OpCode, Options, ProtocolError, Role, State, WebSocket,
    WebSocketError,
};

/// Client side of a connection, speaking raw frames.
struct RawClient {
    frames: FramedRead<ReadHalf<DuplexStream>, Decoder>,
    sink: FramedWrite<WriteHalf<DuplexStream>, Encoder>,
}

impl RawClient {
    async fn send(&mut self, frame: Frame) {
        self.sink.send(frame).await.unwrap();
    }

    async fn recv(&mut self) -> Frame {
        self.frames.next().await.expect("frame").unwrap()
    }

    async fn recv_close(&mut self) -> u16 {
        let frame = self.recv().await;
        assert_eq!(frame.opcode, OpCode::Close);
        u16::from_be_bytes([frame.payload[0], frame.payload[1]])
    }
}

fn server() -> (RawClient, common::Conn) {
    server_with(Options::default())
}

fn server_with(options: Options) -> (RawClient, common::Conn) {
    common::init_logger();
    let (a, b) = tokio::io::duplex(64 * 1024);
    let (read_half, write_half) = tokio::io::split(a);
    let raw = RawClient {
        frames: FramedRead::new(read_half, Decoder::new(Role::Client, 1 << 20, false, false)),
        sink: FramedWrite::new(write_half, Encoder::new(Role::Client)),
    };
    (raw, WebSocket::new(b, Role::Server, options))
}

fn protocol_error(err: WebSocketError) -> ProtocolError {
    match err {
        WebSocketError::Protocol(err) => err,
        other => panic!("unexpected error {other:?}"),
    }
}

#[tokio::test]
async fn test_unmasked_client_frame() {
    common::init_logger();
    let (mut raw, io) = tokio::io::duplex(1024);
    let server = WebSocket::new(io, Role::Server, Options::default());

    raw.write_all(&[0x81, 0x02, b'h', b'i']).await.unwrap();

    let err = server.read().await.unwrap_err();
    assert_eq!(protocol_error(err), ProtocolError::UnmaskedClientFrame);
    assert_eq!(server.state(), State::Closed);

    let mut head = [0; 2];
    raw.read_exact(&mut head).await.unwrap();
    assert_eq!(head[0], 0x88);
    let mut body = vec![0; head[1] as usize];
    raw.read_exact(&mut body).await.unwrap();
    assert_eq!(u16::from_be_bytes([body[0], body[1]]), 1002);
}

#[tokio::test]
async fn test_control_frames_between_fragments() {
    let (mut raw, server) = server();

    raw.send(Frame::new(false, OpCode::Text, None, "hel")).await;
    raw.send(Frame::ping("abc")).await;
    raw.send(Frame::new(true, OpCode::Continuation, None, "lo")).await;

    let (_, payload) = server.read().await.unwrap();
    assert_eq!(payload, Bytes::from_static(b"hello"));

    let pong = raw.recv().await;
    assert_eq!(pong.opcode, OpCode::Pong);
    assert_eq!(&pong.payload[..], b"abc");
}

#[tokio::test]
async fn test_unsolicited_pong_is_ignored() {
    let (mut raw, server) = server();

    raw.send(Frame::pong("nobody asked")).await;
    raw.send(Frame::new(true, OpCode::Binary, None, "data")).await;

    let (_, payload) = server.read().await.unwrap();
    assert_eq!(payload, Bytes::from_static(b"data"));
    assert_eq!(server.state(), State::Open);
}

#[tokio::test]
async fn test_continuation_without_message() {
    let (mut raw, server) = server();

    raw.send(Frame::new(true, OpCode::Continuation, None, "orphan")).await;

    let err = server.read().await.unwrap_err();
    assert_eq!(protocol_error(err), ProtocolError::InvalidContinuationFrame);
    assert_eq!(raw.recv_close().await, 1002);
}

#[tokio::test]
async fn test_new_message_inside_fragmented_one() {
    let (mut raw, server) = server();

    raw.send(Frame::new(false, OpCode::Binary, None, "first")).await;
    raw.send(Frame::new(true, OpCode::Binary, None, "second")).await;

    let err = server.read().await.unwrap_err();
    assert_eq!(protocol_error(err), ProtocolError::InvalidFragment);
    assert_eq!(raw.recv_close().await, 1002);
}

#[tokio::test]
async fn test_compressed_frame_without_extension() {
    let (mut raw, server) = server();

    raw.send(Frame::compress(true, OpCode::Text, None, "xyz")).await;

    let err = server.read().await.unwrap_err();
    assert_eq!(protocol_error(err), ProtocolError::CompressionNotSupported);
    assert_eq!(raw.recv_close().await, 1002);
}

#[tokio::test]
async fn test_invalid_close_code_from_peer() {
    let (mut raw, server) = server();

    raw.send(Frame::close(1005u16.to_be_bytes())).await;

    let err = server.read().await.unwrap_err();
    assert_eq!(protocol_error(err), ProtocolError::InvalidCloseCode(1005));
    assert_eq!(raw.recv_close().await, 1002);
}

#[tokio::test]
async fn test_empty_close_is_answered_with_normal() {
    let (mut raw, server) = server();

    raw.send(Frame::close(b"")).await;

    match server.read().await {
        Err(WebSocketError::Closed(close)) => assert_eq!(close.code, CloseCode::NoStatus),
        other => panic!("unexpected result {other:?}"),
    }
    assert_eq!(raw.recv_close().await, 1000);
    assert_eq!(server.state(), State::Closed);
}

#[tokio::test]
async fn test_unexpected_eof() {
    let (raw, server) = server();
    drop(raw);

    match server.read().await {
        Err(WebSocketError::Closed(close)) => {
            assert_eq!(close.code, CloseCode::Abnormal);
            assert_eq!(close.reason, "unexpected EOF");
        }
        other => panic!("unexpected result {other:?}"),
    }
}

/// Starts a normal close from the server and waits for its close frame to reach the peer.
async fn start_close(
    raw: &mut RawClient,
    server: &common::Conn,
) -> JoinHandle<wsengine::Result<()>> {
    let closing = tokio::spawn({
        let server = server.clone();
        async move { server.close(CloseCode::Normal, "").await }
    });
    assert_eq!(raw.recv_close().await, 1000);
    closing
}

#[tokio::test]
async fn test_close_without_reply_times_out() {
    let close_timeout = Duration::from_millis(100);
    let (mut raw, server) = server_with(Options::default().with_close_timeout(close_timeout));

    let started = Instant::now();
    let closing = start_close(&mut raw, &server).await;

    let result = timeout(Duration::from_secs(2), closing)
        .await
        .expect("close returns")
        .unwrap();
    assert!(matches!(result, Err(WebSocketError::Timeout(_))));
    assert!(started.elapsed() >= close_timeout);
    assert_eq!(server.state(), State::Closed);
}

#[tokio::test]
async fn test_protocol_error_reply_replaces_sent_status() {
    let (mut raw, server) = server();
    let closing = start_close(&mut raw, &server).await;

    raw.send(Frame::close(1002u16.to_be_bytes())).await;

    closing.await.unwrap().unwrap();
    assert_eq!(server.state(), State::Closed);
    assert_eq!(
        server.error().as_ref().and_then(close_status),
        Some(CloseCode::Protocol)
    );
}

#[tokio::test]
async fn test_going_away_reply_keeps_sent_status() {
    let (mut raw, server) = server();
    let closing = start_close(&mut raw, &server).await;

    raw.send(Frame::close(1001u16.to_be_bytes())).await;

    closing.await.unwrap().unwrap();
    assert_eq!(
        server.error().as_ref().and_then(close_status),
        Some(CloseCode::Normal)
    );
}
