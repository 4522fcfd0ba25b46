//! Socket transport seam.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;
use url::Url;

use super::{RealtimeError, RealtimeResult};

/// Opens socket connections.
#[async_trait]
pub trait SocketConnector: Send + Sync {
    /// Open a connection to `url`.
    async fn connect(&self, url: &Url) -> RealtimeResult<Box<dyn SocketConnection>>;
}

/// One open socket carrying text frames.
#[async_trait]
pub trait SocketConnection: Send {
    /// Send a text frame.
    async fn send_text(&mut self, text: String) -> RealtimeResult<()>;

    /// Next text frame; `None` once the peer has closed.
    async fn next_text(&mut self) -> Option<RealtimeResult<String>>;

    /// Close from this side. Errors are ignored.
    async fn close(&mut self);
}

/// [`SocketConnector`] on `tokio-tungstenite`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TungsteniteConnector;

#[async_trait]
impl SocketConnector for TungsteniteConnector {
    async fn connect(&self, url: &Url) -> RealtimeResult<Box<dyn SocketConnection>> {
        let (ws, response) = connect_async(url.as_str())
            .await
            .map_err(|e| RealtimeError::Connect(e.to_string()))?;
        debug!(url = %url, status = %response.status(), "WebSocket handshake complete");
        Ok(Box::new(TungsteniteConnection { ws }))
    }
}

struct TungsteniteConnection {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl SocketConnection for TungsteniteConnection {
    async fn send_text(&mut self, text: String) -> RealtimeResult<()> {
        self.ws
            .send(Message::Text(text))
            .await
            .map_err(|e| RealtimeError::Send(e.to_string()))
    }

    async fn next_text(&mut self) -> Option<RealtimeResult<String>> {
        loop {
            match self.ws.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(text)),
                Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                    Ok(text) => return Some(Ok(text)),
                    Err(_) => debug!("Dropping non-UTF-8 binary frame"),
                },
                Ok(Message::Close(frame)) => {
                    debug!(?frame, "Server closed the socket");
                    return None;
                }
                Ok(_) => {}
                Err(e) => return Some(Err(RealtimeError::Receive(e.to_string()))),
            }
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.ws.close(None).await {
            debug!(error = %e, "Socket close failed");
        }
    }
}
