use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, trace};

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("failed to connect to {url}: {reason}")]
    Connect { url: String, reason: String },
    #[error("failed to send frame: {0}")]
    Send(String),
    #[error("connection closed")]
    Closed,
}

/// Outcome of one bounded receive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Received {
    Text(String),
    /// The deadline passed with no text frame. Not an error.
    Timeout,
    /// The peer closed or the transport failed. The connection is spent.
    Closed,
}

/// One live connection. Not reused after [`Received::Closed`].
#[async_trait]
pub trait Connection: Send {
    async fn send(&mut self, payload: String) -> Result<(), ConnectionError>;

    /// Wait up to `timeout` for the next text frame. Must be cancel-safe.
    async fn recv_timeout(&mut self, timeout: Duration) -> Received;

    async fn close(&mut self);
}

/// Opens fresh connections to a fixed endpoint.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn Connection>, ConnectionError>;
}

/// WebSocket connector backed by tokio-tungstenite.
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: String,
}

impl WsConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self) -> Result<Box<dyn Connection>, ConnectionError> {
        let (stream, response) =
            connect_async(self.url.as_str())
                .await
                .map_err(|e| ConnectionError::Connect {
                    url: self.url.clone(),
                    reason: e.to_string(),
                })?;
        debug!(url = %self.url, status = %response.status(), "WebSocket connected");
        Ok(Box::new(WsConnection { stream }))
    }
}

struct WsConnection {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Connection for WsConnection {
    async fn send(&mut self, payload: String) -> Result<(), ConnectionError> {
        self.stream
            .send(Message::Text(payload.into()))
            .await
            .map_err(|e| ConnectionError::Send(e.to_string()))
    }

    async fn recv_timeout(&mut self, timeout: Duration) -> Received {
        // Control frames don't extend the deadline.
        let deadline = Instant::now() + timeout;
        loop {
            match tokio::time::timeout_at(deadline, self.stream.next()).await {
                Ok(Some(Ok(Message::Text(text)))) => return Received::Text(text.to_string()),
                Ok(Some(Ok(Message::Close(frame)))) => {
                    debug!(?frame, "WebSocket close frame");
                    return Received::Closed;
                }
                Ok(Some(Ok(other))) => {
                    trace!(kind = ?other, "Skipping non-text frame");
                }
                Ok(Some(Err(e))) => {
                    debug!(error = %e, "WebSocket read error");
                    return Received::Closed;
                }
                Ok(None) => return Received::Closed,
                Err(_) => return Received::Timeout,
            }
        }
    }

    async fn close(&mut self) {
        let _ = self.stream.close(None).await;
    }
}
