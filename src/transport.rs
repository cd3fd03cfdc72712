//! Transport abstraction and the default WebSocket implementation.
//!
//! A [`Transport`] is a connection factory; each successful open yields an
//! exclusive [`Connection`] the channel drives until it closes or errors.
//! The channel depends only on these traits, so test suites and embedders can
//! inject their own transport instead of the `tokio-tungstenite` default.

use std::sync::Arc;

use async_trait::async_trait;
use futures::{SinkExt as _, StreamExt as _};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest as _;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use crate::Result;
use crate::config::Config;
use crate::error::Error;

/// One unit of transmission on the wire.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A text payload
    Text(String),
    /// A raw binary payload
    Binary(Vec<u8>),
}

/// Factory for transport connections.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Open a new connection to the configured address.
    async fn open(&self, config: &Config) -> Result<Box<dyn Connection>>;
}

/// A single live transport connection, exclusively owned by the channel's
/// reconnection controller.
#[async_trait]
pub trait Connection: Send {
    /// Transmit one frame.
    async fn send(&mut self, frame: Frame) -> Result<()>;

    /// Receive the next inbound frame.
    ///
    /// `None` signals a clean close; `Err` signals a transport-level error
    /// while the connection was live.
    async fn recv(&mut self) -> Option<Result<Frame>>;

    /// Close the connection. Best effort, errors are discarded.
    async fn close(&mut self);
}

/// Default [`Transport`] over `tokio-tungstenite`.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, Default)]
pub struct WsTransport;

#[async_trait]
impl Transport for WsTransport {
    async fn open(&self, config: &Config) -> Result<Box<dyn Connection>> {
        let mut request = config
            .address
            .as_str()
            .into_client_request()
            .map_err(|e| Error::Connect(Arc::new(e)))?;

        if !config.protocols.is_empty() {
            let offered = config.protocols.join(", ");
            let value =
                HeaderValue::from_str(&offered).map_err(|e| Error::Connect(Arc::new(e)))?;
            request.headers_mut().insert(SEC_WEBSOCKET_PROTOCOL, value);
        }

        let (stream, _response) = connect_async(request)
            .await
            .map_err(|e| Error::Connect(Arc::new(e)))?;

        Ok(Box::new(WsConnection { inner: stream }))
    }
}

struct WsConnection {
    inner: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Connection for WsConnection {
    async fn send(&mut self, frame: Frame) -> Result<()> {
        let message = match frame {
            Frame::Text(text) => Message::Text(text.into()),
            Frame::Binary(data) => Message::Binary(data.into()),
        };
        self.inner
            .send(message)
            .await
            .map_err(|e| Error::Transport(Arc::new(e)))
    }

    async fn recv(&mut self) -> Option<Result<Frame>> {
        loop {
            match self.inner.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(Frame::Text(text.to_string()))),
                Ok(Message::Binary(data)) => return Some(Ok(Frame::Binary(data.to_vec()))),
                Ok(Message::Ping(payload)) => {
                    if let Err(e) = self.inner.send(Message::Pong(payload)).await {
                        return Some(Err(Error::Transport(Arc::new(e))));
                    }
                }
                Ok(Message::Pong(_) | Message::Frame(_)) => {}
                Ok(Message::Close(_)) => return None,
                Err(e) => return Some(Err(Error::Transport(Arc::new(e)))),
            }
        }
    }

    async fn close(&mut self) {
        _ = self.inner.close(None).await;
    }
}
