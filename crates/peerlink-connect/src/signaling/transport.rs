//! Relay transport abstraction.
//!
//! The signaling client speaks text frames over a [`RelayTransport`]; the
//! production implementation is a websocket, tests use a scripted relay.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info};

use crate::error::LinkError;
use crate::types::LinkId;

/// Bidirectional text connection to the signaling relay.
#[async_trait]
pub trait RelayTransport: Send + Sync {
    async fn send_text(&self, text: String) -> Result<(), LinkError>;

    /// Next text frame; `None` once the relay has closed the connection.
    async fn next_text(&self) -> Option<Result<String, LinkError>>;

    /// Keepalive ping.
    async fn ping(&self) -> Result<(), LinkError>;

    async fn close(&self);
}

/// Opens one relay connection per link.
#[async_trait]
pub trait RelayConnector: Send + Sync {
    async fn connect(&self, link_id: &LinkId) -> Result<Arc<dyn RelayTransport>, LinkError>;
}

#[async_trait]
impl<T: RelayConnector + ?Sized> RelayConnector for Arc<T> {
    async fn connect(&self, link_id: &LinkId) -> Result<Arc<dyn RelayTransport>, LinkError> {
        (**self).connect(link_id).await
    }
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Websocket connection to the relay.
pub struct WebSocketRelay {
    write: Mutex<SplitSink<WsStream, Message>>,
    read: Mutex<SplitStream<WsStream>>,
}

impl WebSocketRelay {
    pub async fn connect(url: &str) -> Result<Self, LinkError> {
        let (ws, _) = connect_async(url)
            .await
            .map_err(|e| LinkError::RelayUnavailable(e.to_string()))?;
        let (write, read) = ws.split();
        Ok(Self {
            write: Mutex::new(write),
            read: Mutex::new(read),
        })
    }

    async fn send_message(&self, message: Message) -> Result<(), LinkError> {
        self.write
            .lock()
            .await
            .send(message)
            .await
            .map_err(|_| LinkError::SignalingClosed)
    }
}

#[async_trait]
impl RelayTransport for WebSocketRelay {
    async fn send_text(&self, text: String) -> Result<(), LinkError> {
        self.send_message(Message::Text(text.into())).await
    }

    async fn next_text(&self) -> Option<Result<String, LinkError>> {
        let mut read = self.read.lock().await;
        loop {
            match read.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(text.to_string())),
                Ok(Message::Close(frame)) => {
                    debug!(?frame, "Relay closed websocket");
                    return None;
                }
                // Ping replies are queued by tungstenite itself.
                Ok(_) => {}
                Err(e) => {
                    debug!(error = %e, "Relay websocket read failed");
                    return Some(Err(LinkError::SignalingClosed));
                }
            }
        }
    }

    async fn ping(&self) -> Result<(), LinkError> {
        self.send_message(Message::Ping(Vec::new().into())).await
    }

    async fn close(&self) {
        let _ = self.write.lock().await.close().await;
    }
}

/// Connects links to `{base_url}/{link_id}?target=extension&source=wallet`.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    base_url: String,
}

impl WebSocketConnector {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }

    pub fn url_for(&self, link_id: &LinkId) -> String {
        format!(
            "{}/{}?target=extension&source=wallet",
            self.base_url.trim_end_matches('/'),
            link_id
        )
    }
}

#[async_trait]
impl RelayConnector for WebSocketConnector {
    async fn connect(&self, link_id: &LinkId) -> Result<Arc<dyn RelayTransport>, LinkError> {
        let url = self.url_for(link_id);
        info!(%link_id, "Connecting to signaling relay");
        let relay = WebSocketRelay::connect(&url).await?;
        Ok(Arc::new(relay))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_appends_link_id_and_roles() {
        let connector = WebSocketConnector::new("wss://relay.example/");
        assert_eq!(
            connector.url_for(&LinkId::from("abc")),
            "wss://relay.example/abc?target=extension&source=wallet"
        );
    }
}
