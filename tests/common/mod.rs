#![allow(dead_code)]

use tokio::{io::DuplexStream, task::JoinHandle};
use wsengine::{Options, Role, WebSocket, WebSocketError};

pub type Conn = WebSocket<DuplexStream>;

/// Initializes logging from `RUST_LOG`, once per test binary.
pub fn init_logger() {
    let _ = simple_logger::SimpleLogger::new()
        .with_level(log::LevelFilter::Warn)
        .env()
        .init();
}

/// A client and a server connected through an in-memory pipe.
pub fn pipe(client: Options, server: Options) -> (Conn, Conn) {
    init_logger();
    let (a, b) = tokio::io::duplex(64 * 1024);
    (
        WebSocket::new(a, Role::Client, client),
        WebSocket::new(b, Role::Server, server),
    )
}

/// Echoes every message back until the connection fails, returning that error.
pub fn spawn_echo(ws: Conn) -> JoinHandle<WebSocketError> {
    tokio::spawn(async move {
        loop {
            let (typ, payload) = match ws.read().await {
                Ok(message) => message,
                Err(err) => return err,
            };
            if let Err(err) = ws.write(typ, payload).await {
                return err;
            }
        }
    })
}

/// Deterministic, mildly compressible payload.
pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| b'a' + ((i * 7 + i / 13) % 26) as u8).collect()
}
