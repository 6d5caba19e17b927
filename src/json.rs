//! JSON messages over a connection.
use tokio::io::{AsyncRead, AsyncWrite};

use crate::{close::CloseCode, MessageType, Result, WebSocket, WebSocketError};

impl<S> WebSocket<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    /// Serializes data to JSON and sends it as a text message.
    #[cfg_attr(docsrs, doc(cfg(feature = "json")))]
    pub async fn write_json<T: serde::Serialize>(&self, data: &T) -> Result<()> {
        let bytes = serde_json::to_vec(data)?;
        self.write(MessageType::Text, bytes).await
    }

    /// Reads one text message and deserializes it from JSON.
    ///
    /// A binary message closes the connection with [`CloseCode::Unsupported`]; a payload that
    /// fails to deserialize closes it with [`CloseCode::Invalid`].
    #[cfg_attr(docsrs, doc(cfg(feature = "json")))]
    pub async fn read_json<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        let (typ, payload) = self.read().await?;

        if typ != MessageType::Text {
            let _ = self
                .close(CloseCode::Unsupported, "expected text message")
                .await;
            return Err(WebSocketError::UnexpectedMessageType {
                expected: MessageType::Text,
                got: typ,
            });
        }

        match serde_json::from_slice(&payload) {
            Ok(value) => Ok(value),
            Err(err) => {
                let _ = self
                    .close(CloseCode::Invalid, "failed to unmarshal JSON")
                    .await;
                Err(err.into())
            }
        }
    }
}
