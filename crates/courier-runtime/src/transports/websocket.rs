//! WebSocket connector for the server event stream

use async_trait::async_trait;
use courier_core::{CourierError, Result, TransportError};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{HeaderValue, AUTHORIZATION};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};
use url::Url;
use uuid::Uuid;

use super::server::{ServerConnector, ServerLink};

/// Connects to the server's event stream over `ws://` or `wss://`
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: Url,
}

impl WsConnector {
    pub fn new(url: Url) -> Result<Self> {
        match url.scheme() {
            "ws" | "wss" => Ok(Self { url }),
            other => Err(CourierError::config_error(format!(
                "event stream URL must use ws or wss, got {}",
                other
            ))),
        }
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

#[async_trait]
impl ServerConnector for WsConnector {
    async fn connect(&self, bearer_token: &str) -> Result<Box<dyn ServerLink>> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| CourierError::connection_failed(e.to_string()))?;
        let authorization = HeaderValue::from_str(&format!("Bearer {}", bearer_token))
            .map_err(|_| CourierError::connection_failed("bearer token is not a valid header"))?;
        request.headers_mut().insert(AUTHORIZATION, authorization);

        let (stream, response) = connect_async(request)
            .await
            .map_err(|e| CourierError::connection_failed(e.to_string()))?;
        debug!(status = %response.status(), url = %self.url, "WebSocket handshake complete");

        Ok(Box::new(WsLink {
            session_id: Uuid::new_v4().to_string(),
            stream,
        }))
    }
}

struct WsLink {
    session_id: String,
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl ServerLink for WsLink {
    fn session_id(&self) -> &str {
        &self.session_id
    }

    async fn send_text(&mut self, text: String) -> Result<()> {
        self.stream
            .send(Message::Text(text))
            .await
            .map_err(|e| CourierError::send_failed(e.to_string()))
    }

    async fn next_text(&mut self) -> Option<Result<String>> {
        loop {
            match self.stream.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(text)),
                Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                    Ok(text) => return Some(Ok(text)),
                    Err(_) => warn!("Dropping non-UTF-8 binary frame"),
                },
                Ok(Message::Close(frame)) => {
                    debug!(?frame, "Server sent close frame");
                    return None;
                }
                // Ping/pong are answered by tungstenite
                Ok(_) => continue,
                Err(e) => {
                    return Some(Err(TransportError::ReceiveFailed {
                        reason: e.to_string(),
                    }
                    .into()))
                }
            }
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.stream.close(None).await {
            debug!("Close handshake failed: {}", e);
        }
    }
}
