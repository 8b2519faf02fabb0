//! Relay WebSocket connection and frame handling

use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use tokio_tungstenite::{connect_async, tungstenite::Message};

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// One WebSocket connection to the realtime relay. Frames are JSON event
/// envelopes; everything else (pings, close) is handled here.
pub struct RelaySocket {
    stream: WsStream,
}

impl RelaySocket {
    /// Connect to the relay endpoint. Accepts http(s) URLs and rewrites the
    /// scheme.
    pub async fn connect(url: &str) -> Result<Self> {
        let ws_url = url
            .replace("https://", "wss://")
            .replace("http://", "ws://");

        tracing::info!("Connecting WebSocket to {}", ws_url);

        let (stream, response) = connect_async(&ws_url)
            .await
            .context("WebSocket connection failed")?;

        tracing::info!("WebSocket connected (status={})", response.status());

        Ok(Self { stream })
    }

    /// Send a JSON envelope as a text frame.
    pub async fn send_json(&mut self, v: &serde_json::Value) -> Result<()> {
        let text = v.to_string();
        tracing::debug!("WS send: {}", text);
        self.stream
            .send(Message::Text(text))
            .await
            .context("Failed to send WebSocket message")
    }

    /// Send a heartbeat ping.
    pub async fn ping(&mut self) -> Result<()> {
        self.stream
            .send(Message::Ping(Vec::new()))
            .await
            .context("Failed to send ping")
    }

    /// Receive the next JSON envelope, ignoring pings/pongs and non-JSON
    /// text. Returns `None` when the server closes the connection.
    pub async fn recv_json(&mut self) -> Result<Option<serde_json::Value>> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => {
                    tracing::debug!("WS recv: {}", text);
                    match serde_json::from_str(&text) {
                        Ok(v) => return Ok(Some(v)),
                        Err(_) => {
                            tracing::debug!("Non-JSON relay frame ignored: {}", text);
                        }
                    }
                }
                Some(Ok(Message::Ping(data))) => {
                    self.stream
                        .send(Message::Pong(data))
                        .await
                        .context("Failed to send pong")?;
                }
                Some(Ok(Message::Close(frame))) => {
                    tracing::info!("WebSocket closed: {:?}", frame);
                    return Ok(None);
                }
                Some(Ok(other)) => {
                    tracing::debug!("WS frame (ignored): {:?}", other);
                }
                Some(Err(e)) => {
                    return Err(e).context("WebSocket receive error");
                }
                None => {
                    return Ok(None);
                }
            }
        }
    }
}
