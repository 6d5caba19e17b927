mod common;

use std::{collections::HashSet, time::Duration};

use bytes::Bytes;
use common::{payload, pipe, spawn_echo};
use tokio::time::{sleep, timeout};
use wsengine::{
    close_status, CloseCode, CompressionMode, MessageType, Options, ProtocolError, Role, State,
    WebSocket, WebSocketError,
};

const MODES: [CompressionMode; 3] = [
    CompressionMode::Disabled,
    CompressionMode::NoContextTakeover,
    CompressionMode::ContextTakeover,
];

fn options(mode: CompressionMode) -> Options {
    Options::default()
        .with_read_limit(1 << 20)
        .with_compression_mode(mode)
}

mod messages {
    use super::*;

    #[tokio::test]
    async fn test_round_trip() {
        for mode in MODES {
            let (client, server) = pipe(options(mode), options(mode));
            let echo = spawn_echo(server);

            for typ in [MessageType::Text, MessageType::Binary] {
                for size in [0, 1, 125, 126, 65535, 65536, 300_000] {
                    let data = payload(size);
                    client.write(typ, &data).await.unwrap();

                    let (got_typ, got) = client.read().await.unwrap();
                    assert_eq!(got_typ, typ, "{mode:?} {size}");
                    assert_eq!(&got[..], &data[..], "{mode:?} {typ} {size}");
                }
            }

            client.close(CloseCode::Normal, "").await.unwrap();
            let err = echo.await.unwrap();
            assert_eq!(close_status(&err), Some(CloseCode::Normal));
        }
    }

    #[tokio::test]
    async fn test_incompressible_payloads() {
        for mode in MODES {
            let (client, server) = pipe(options(mode), options(mode));
            let _echo = spawn_echo(server);

            let data: Vec<u8> = (0..200_000).map(|_| rand::random::<u8>()).collect();
            client.write(MessageType::Binary, &data).await.unwrap();
            let (_, got) = client.read().await.unwrap();
            assert_eq!(&got[..], &data[..], "{mode:?}");
        }
    }

    #[tokio::test]
    async fn test_fragmented_writes_are_reassembled() {
        let splits: [&[usize]; 4] = [
            &[80_000],
            &[1, 7, 126, 4096, 75_770],
            &[40_000, 0, 40_000],
            &[100, 100, 100, 79_700],
        ];

        for mode in MODES {
            let (client, server) = pipe(options(mode), options(mode));
            let _echo = spawn_echo(server);
            let data = payload(80_000);

            for split in splits {
                let mut writer = client.writer(MessageType::Binary).await.unwrap();
                let mut offset = 0;
                for &len in split {
                    writer.write(&data[offset..offset + len]).await.unwrap();
                    offset += len;
                }
                writer.close().await.unwrap();

                let (typ, got) = client.read().await.unwrap();
                assert_eq!(typ, MessageType::Binary);
                assert_eq!(&got[..], &data[..], "{mode:?} {split:?}");
            }
        }
    }

    #[tokio::test]
    async fn test_small_streamed_message_below_threshold() {
        let mode = CompressionMode::NoContextTakeover;
        let (client, server) = pipe(options(mode), options(mode));
        let _echo = spawn_echo(server);

        let mut writer = client.writer(MessageType::Text).await.unwrap();
        writer.write("tiny ").await.unwrap();
        writer.write("message").await.unwrap();
        writer.close().await.unwrap();

        let (typ, got) = client.read().await.unwrap();
        assert_eq!(typ, MessageType::Text);
        assert_eq!(&got[..], b"tiny message");

        let mut empty = client.writer(MessageType::Binary).await.unwrap();
        empty.close().await.unwrap();
        let (typ, got) = client.read().await.unwrap();
        assert_eq!(typ, MessageType::Binary);
        assert!(got.is_empty());
    }

    #[tokio::test]
    async fn test_streaming_reader_chunks() {
        let (client, server) = pipe(Options::default(), Options::default());

        let mut writer = client.writer(MessageType::Binary).await.unwrap();
        writer.write("one").await.unwrap();
        writer.write("two").await.unwrap();
        writer.close().await.unwrap();

        let mut reader = server.reader().await.unwrap();
        assert_eq!(reader.message_type(), MessageType::Binary);
        assert_eq!(reader.read_chunk().await.unwrap(), Some(Bytes::from_static(b"one")));
        assert_eq!(reader.read_chunk().await.unwrap(), Some(Bytes::from_static(b"two")));
        assert_eq!(reader.read_chunk().await.unwrap(), None);
        assert_eq!(reader.read_chunk().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_concurrent_writers() {
        let (client, server) = pipe(Options::default(), Options::default());

        let message = |i: usize| format!("message {i} ").repeat(i % 7 + 1);
        let mut tasks = Vec::new();
        for i in 0..100 {
            let client = client.clone();
            tasks.push(tokio::spawn(async move {
                client.write(MessageType::Binary, message(i)).await
            }));
        }

        let mut seen = HashSet::new();
        for _ in 0..100 {
            let (_, payload) = server.read().await.unwrap();
            seen.insert(payload);
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let expected: HashSet<Bytes> = (0..100).map(|i| Bytes::from(message(i))).collect();
        assert_eq!(seen, expected);
    }
}

mod control {
    use super::*;

    #[tokio::test]
    async fn test_ping_pong() {
        let (client, server) = pipe(Options::default(), Options::default());
        let _ = server.close_read();
        let _ = client.close_read();

        for _ in 0..10 {
            timeout(Duration::from_secs(1), client.ping())
                .await
                .expect("pong")
                .unwrap();
        }

        client.close(CloseCode::Normal, "").await.unwrap();
    }

    #[tokio::test]
    async fn test_ping_without_reader_times_out() {
        let (client, server) = pipe(Options::default(), Options::default());
        let _ = server.close_read();

        // nothing reads the client side, so the pong is never seen
        let result = timeout(Duration::from_millis(100), client.ping()).await;
        assert!(result.is_err());

        assert_eq!(client.state(), State::Closed);
        assert!(matches!(client.error(), Some(WebSocketError::Cancelled("ping"))));
    }

    #[tokio::test]
    async fn test_ping_timeout_option() {
        let (client, _server) = pipe(
            Options::default().with_ping_timeout(Duration::from_millis(50)),
            Options::default(),
        );

        let err = client.ping().await.unwrap_err();
        assert!(matches!(err, WebSocketError::Timeout(_)));
        assert_eq!(client.state(), State::Closed);
    }

    #[tokio::test]
    async fn test_outstanding_pings_are_bounded() {
        let (client, _server) = pipe(
            Options::default().with_max_outstanding_pings(2),
            Options::default(),
        );

        let mut waiting = Vec::new();
        for _ in 0..2 {
            let client = client.clone();
            waiting.push(tokio::spawn(async move { client.ping().await }));
        }
        sleep(Duration::from_millis(50)).await;

        assert!(matches!(
            client.ping().await,
            Err(WebSocketError::TooManyPings(2))
        ));
        assert_eq!(client.state(), State::Open);
    }

    #[tokio::test]
    async fn test_close_handshake() {
        let (client, server) = pipe(Options::default(), Options::default());
        let echo = spawn_echo(server.clone());

        client.close(CloseCode::Normal, "").await.unwrap();

        assert_eq!(client.state(), State::Closed);
        assert_eq!(
            client.error().as_ref().and_then(close_status),
            Some(CloseCode::Normal)
        );

        let err = echo.await.unwrap();
        assert_eq!(close_status(&err), Some(CloseCode::Normal));
        assert_eq!(server.state(), State::Closed);

        // every later operation reports the terminal error
        let err = client.write(MessageType::Text, "late").await.unwrap_err();
        assert_eq!(close_status(&err), Some(CloseCode::Normal));
    }

    #[tokio::test]
    async fn test_peer_initiated_close() {
        let (client, server) = pipe(Options::default(), Options::default());

        let reading = tokio::spawn({
            let client = client.clone();
            async move { client.read().await }
        });

        server.close(CloseCode::Away, "restarting").await.unwrap();

        match reading.await.unwrap() {
            Err(WebSocketError::Closed(close)) => {
                assert_eq!(close.code, CloseCode::Away);
                assert_eq!(close.reason, "restarting");
            }
            other => panic!("unexpected result {other:?}"),
        }

        // the handshake already completed
        assert!(client.close(CloseCode::Normal, "").await.is_ok());
    }

    #[tokio::test]
    async fn test_invalid_close_is_rejected_locally() {
        let (client, server) = pipe(Options::default(), Options::default());
        let _echo = spawn_echo(server);

        assert!(matches!(
            client.close(CloseCode::NoStatus, "").await,
            Err(WebSocketError::InvalidCloseCode(1005))
        ));
        assert!(matches!(
            client.close(CloseCode::Other(1004), "").await,
            Err(WebSocketError::InvalidCloseCode(1004))
        ));
        assert!(matches!(
            client.close(CloseCode::Other(0), "").await,
            Err(WebSocketError::InvalidCloseCode(0))
        ));
        assert!(matches!(
            client.close(CloseCode::Normal, &"x".repeat(124)).await,
            Err(WebSocketError::CloseReasonTooLong(124))
        ));

        assert_eq!(client.state(), State::Open);
        client.write(MessageType::Text, "still open").await.unwrap();
        let (_, got) = client.read().await.unwrap();
        assert_eq!(&got[..], b"still open");
    }

    #[tokio::test]
    async fn test_close_read() {
        let (client, server) = pipe(Options::default(), Options::default());
        let done = server.close_read();

        assert!(matches!(
            server.read().await,
            Err(WebSocketError::ReadClosed)
        ));

        client.write(MessageType::Binary, "discarded").await.unwrap();
        client.close(CloseCode::Normal, "").await.unwrap();

        timeout(Duration::from_secs(1), done.cancelled())
            .await
            .expect("drain exits");
        assert_eq!(server.state(), State::Closed);
    }
}

mod limits {
    use super::*;

    #[tokio::test]
    async fn test_oversized_message() {
        let (client, server) = pipe(Options::default(), Options::default().with_read_limit(1024));

        let reading = tokio::spawn({
            let client = client.clone();
            async move { client.read().await }
        });

        client.write(MessageType::Binary, payload(2048)).await.unwrap();

        let err = server.read().await.unwrap_err();
        assert!(matches!(err, WebSocketError::MessageTooBig { limit: 1024 }));
        assert_eq!(server.state(), State::Closed);

        let err = reading.await.unwrap().unwrap_err();
        assert_eq!(close_status(&err), Some(CloseCode::Size));
    }

    #[tokio::test]
    async fn test_oversized_compressed_message() {
        let mode = CompressionMode::ContextTakeover;
        let (client, server) = pipe(
            Options::default().with_compression_mode(mode),
            Options::default()
                .with_compression_mode(mode)
                .with_read_limit(4096),
        );

        let reading = tokio::spawn({
            let client = client.clone();
            async move { client.read().await }
        });

        // inflates far beyond the limit from a tiny frame
        client.write(MessageType::Binary, vec![b'a'; 100_000]).await.unwrap();

        let err = server.read().await.unwrap_err();
        assert!(matches!(err, WebSocketError::MessageTooBig { limit: 4096 }));

        let err = reading.await.unwrap().unwrap_err();
        assert_eq!(close_status(&err), Some(CloseCode::Size));
    }

    #[tokio::test]
    async fn test_set_read_limit() {
        let (client, server) = pipe(Options::default(), Options::default());
        server.set_read_limit(4096);

        client.write(MessageType::Binary, payload(4096)).await.unwrap();
        assert_eq!(server.read().await.unwrap().1.len(), 4096);

        client.write(MessageType::Binary, payload(5000)).await.unwrap();
        assert!(matches!(
            server.read().await,
            Err(WebSocketError::MessageTooBig { limit: 4096 })
        ));
    }

    #[tokio::test]
    async fn test_invalid_utf8() {
        let (client, server) = pipe(Options::default(), Options::default().with_utf8());

        client.write(MessageType::Text, "héllo").await.unwrap();
        let (_, got) = server.read().await.unwrap();
        assert_eq!(std::str::from_utf8(&got).unwrap(), "héllo");

        let reading = tokio::spawn({
            let client = client.clone();
            async move { client.read().await }
        });

        client.write(MessageType::Text, [0xffu8, 0xfe, 0xfd]).await.unwrap();
        assert!(matches!(
            server.read().await,
            Err(WebSocketError::Protocol(ProtocolError::InvalidUtf8))
        ));

        let err = reading.await.unwrap().unwrap_err();
        assert_eq!(close_status(&err), Some(CloseCode::Invalid));
    }
}

mod concurrency {
    use super::*;

    #[tokio::test]
    async fn test_concurrent_read() {
        let (client, server) = pipe(Options::default(), Options::default());

        let pending = tokio::spawn({
            let server = server.clone();
            async move { server.read().await }
        });
        sleep(Duration::from_millis(20)).await;

        assert!(matches!(
            server.read().await,
            Err(WebSocketError::ConcurrentRead)
        ));
        assert_eq!(server.state(), State::Open);

        client.write(MessageType::Text, "first").await.unwrap();
        let (typ, got) = pending.await.unwrap().unwrap();
        assert_eq!(typ, MessageType::Text);
        assert_eq!(&got[..], b"first");
    }

    #[tokio::test]
    async fn test_writes_wait_for_open_writer() {
        let (client, server) = pipe(Options::default(), Options::default());

        let mut writer = client.writer(MessageType::Binary).await.unwrap();
        writer.write("part one, ").await.unwrap();

        // queued behind the writer; giving up leaves the connection intact
        let queued = timeout(Duration::from_millis(50), client.write(MessageType::Text, "x")).await;
        assert!(queued.is_err());
        assert_eq!(client.state(), State::Open);

        writer.write("part two").await.unwrap();
        writer.close().await.unwrap();
        assert!(matches!(
            writer.write("late").await,
            Err(WebSocketError::WriterClosed)
        ));
        drop(writer);

        client.write(MessageType::Text, "after").await.unwrap();

        let (typ, got) = server.read().await.unwrap();
        assert_eq!(typ, MessageType::Binary);
        assert_eq!(&got[..], b"part one, part two");

        let (typ, got) = server.read().await.unwrap();
        assert_eq!(typ, MessageType::Text);
        assert_eq!(&got[..], b"after");
    }

    #[tokio::test]
    async fn test_abandoned_writer_fails_connection() {
        let (client, _server) = pipe(Options::default(), Options::default());

        let mut writer = client.writer(MessageType::Binary).await.unwrap();
        writer.write("half a message").await.unwrap();
        drop(writer);

        assert_eq!(client.state(), State::Closed);
        assert!(matches!(
            client.error(),
            Some(WebSocketError::Cancelled("message writer"))
        ));
    }

    #[tokio::test]
    async fn test_cancelled_read_fails_connection() {
        let (_client, server) = pipe(Options::default(), Options::default());

        let result = timeout(Duration::from_millis(20), server.read()).await;
        assert!(result.is_err());

        assert_eq!(server.state(), State::Closed);
        assert!(matches!(
            server.read().await,
            Err(WebSocketError::Cancelled("read"))
        ));
    }

    #[tokio::test]
    async fn test_dropped_compressed_write_fails_connection() {
        common::init_logger();
        let options = Options::default()
            .with_compression_mode(CompressionMode::ContextTakeover)
            .with_compression_threshold(200);
        let (a, b) = tokio::io::duplex(64);
        let client = WebSocket::new(a, Role::Client, options.clone());
        let _server = WebSocket::new(b, Role::Server, options);

        // 64 bytes on the wire: the pipe is full and nobody drains it
        client.write(MessageType::Binary, payload(58)).await.unwrap();
        let pinging = tokio::spawn({
            let client = client.clone();
            async move { client.ping().await }
        });
        sleep(Duration::from_millis(20)).await;

        // an uncompressed message queued behind the ping can be abandoned
        let small = client.write(MessageType::Binary, "small");
        let queued = timeout(Duration::from_millis(50), small).await;
        assert!(queued.is_err());
        assert_eq!(client.state(), State::Open);

        // a compressed one already advanced the deflate context
        let queued = timeout(
            Duration::from_millis(50),
            client.write(MessageType::Binary, payload(1000)),
        )
        .await;
        assert!(queued.is_err());
        assert_eq!(client.state(), State::Closed);
        assert!(matches!(client.error(), Some(WebSocketError::Cancelled("write"))));

        assert!(pinging.await.unwrap().is_err());
    }
}
