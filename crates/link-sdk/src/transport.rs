//! Duplex frame channel to the broker.

use dslink_protocol::Frame;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::error::TransportError;

/// Carries encoded envelopes.  One connection task owns the transport and
/// is the only caller, so methods take `&mut self`.
///
/// `recv` must be cancel-safe: the connection task races it against
/// outbound traffic.
#[async_trait::async_trait]
pub trait Transport: Send + 'static {
    async fn connect(&mut self, url: &str) -> Result<(), TransportError>;

    async fn send(&mut self, frame: Frame) -> Result<(), TransportError>;

    /// Next inbound frame.  `None` once the peer has closed.
    async fn recv(&mut self) -> Option<Frame>;

    async fn disconnect(&mut self);

    fn is_connected(&self) -> bool;
}

/// [`Transport`] over `tokio-tungstenite`.
#[derive(Default)]
pub struct WebSocketTransport {
    ws: Option<WebSocketStream<MaybeTlsStream<TcpStream>>>,
}

impl WebSocketTransport {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl Transport for WebSocketTransport {
    async fn connect(&mut self, url: &str) -> Result<(), TransportError> {
        let (ws, _response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        self.ws = Some(ws);
        Ok(())
    }

    async fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
        let ws = self.ws.as_mut().ok_or(TransportError::NotConnected)?;
        let message = match frame {
            Frame::Text(text) => Message::Text(text),
            Frame::Binary(bytes) => Message::Binary(bytes),
        };
        ws.send(message).await.map_err(|e| TransportError::Send(e.to_string()))
    }

    async fn recv(&mut self) -> Option<Frame> {
        loop {
            let ws = self.ws.as_mut()?;
            match ws.next().await {
                Some(Ok(Message::Text(text))) => return Some(Frame::Text(text)),
                Some(Ok(Message::Binary(bytes))) => return Some(Frame::Binary(bytes)),
                Some(Ok(Message::Close(reason))) => {
                    tracing::info!(reason = ?reason, "broker closed connection");
                    self.ws = None;
                    return None;
                }
                // Ping/pong are answered by tungstenite.
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    tracing::warn!(error = %e, "websocket error");
                    self.ws = None;
                    return None;
                }
                None => {
                    self.ws = None;
                    return None;
                }
            }
        }
    }

    async fn disconnect(&mut self) {
        if let Some(mut ws) = self.ws.take() {
            if let Err(e) = ws.close(None).await {
                tracing::debug!(error = %e, "websocket close failed");
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.ws.is_some()
    }
}
