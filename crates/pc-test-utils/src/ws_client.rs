//! WebSocket test client
//!
//! Speaks the signaling protocol against a running server. Events that
//! arrive while a request is outstanding are buffered so tests can assert on
//! them afterwards in arrival order.

use common::types::ConnectionId;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

/// How long a single read waits before the test is considered stuck.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// A connected signaling client.
pub struct TestClient {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    connection_id: ConnectionId,
    next_id: u64,
    events: VecDeque<Value>,
    close_reason: Option<String>,
}

impl TestClient {
    /// Connect to `url` and wait for the `welcome` event.
    pub async fn connect(url: &str) -> Result<Self, anyhow::Error> {
        let (ws, _response) = connect_async(url)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to connect to {}: {}", url, e))?;

        let mut client = Self {
            ws,
            connection_id: ConnectionId::default(),
            next_id: 1,
            events: VecDeque::new(),
            close_reason: None,
        };

        let welcome = client.read_frame(DEFAULT_READ_TIMEOUT).await?.ok_or_else(|| {
            anyhow::anyhow!(
                "Connection closed before welcome: {:?}",
                client.close_reason
            )
        })?;
        if welcome["name"] != "welcome" {
            anyhow::bail!("Expected welcome as first frame, got {}", welcome);
        }
        let id = welcome["data"]["connectionId"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("welcome without connectionId: {}", welcome))?;
        client.connection_id = ConnectionId::from(id);

        Ok(client)
    }

    /// Connect, expecting the server to refuse with a close frame.
    ///
    /// Returns the close reason.
    pub async fn connect_refused(url: &str) -> Result<String, anyhow::Error> {
        let (ws, _response) = connect_async(url)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to connect to {}: {}", url, e))?;

        let mut client = Self {
            ws,
            connection_id: ConnectionId::default(),
            next_id: 1,
            events: VecDeque::new(),
            close_reason: None,
        };
        client.wait_closed().await
    }

    /// Connection id assigned by the server's `welcome`.
    pub fn connection_id(&self) -> &ConnectionId {
        &self.connection_id
    }

    /// Send a request and wait for its response `result`.
    ///
    /// Error results (`{"error": ..., "code": ...}`) are returned as values,
    /// not as `Err`, so tests can assert on them.
    pub async fn request(&mut self, method: &str, params: Value) -> Result<Value, anyhow::Error> {
        let id = self.next_id;
        self.next_id += 1;

        self.send_raw(&json!({ "id": id, "method": method, "params": params }).to_string())
            .await?;
        self.response(id).await
    }

    /// Send a request without an id. The server processes it without a reply.
    pub async fn notify(&mut self, method: &str, params: Value) -> Result<(), anyhow::Error> {
        self.send_raw(&json!({ "method": method, "params": params }).to_string())
            .await
    }

    /// Send arbitrary text.
    pub async fn send_raw(&mut self, text: &str) -> Result<(), anyhow::Error> {
        self.ws
            .send(Message::Text(text.to_string()))
            .await
            .map_err(|e| anyhow::anyhow!("Failed to send frame: {}", e))
    }

    /// Wait for the response with correlation `id`, buffering events.
    pub async fn response(&mut self, id: u64) -> Result<Value, anyhow::Error> {
        loop {
            let frame = self
                .read_frame(DEFAULT_READ_TIMEOUT)
                .await?
                .ok_or_else(|| anyhow::anyhow!("Connection closed awaiting response {}", id))?;

            match frame["type"].as_str() {
                Some("response") if frame["id"] == id => return Ok(frame["result"].clone()),
                Some("event") => self.events.push_back(frame),
                _ => anyhow::bail!("Unexpected frame awaiting response {}: {}", id, frame),
            }
        }
    }

    /// Next event named `name`, returning its `data`. Other events are
    /// discarded.
    pub async fn next_event(&mut self, name: &str) -> Result<Value, anyhow::Error> {
        while let Some(event) = self.events.pop_front() {
            if event["name"] == name {
                return Ok(event["data"].clone());
            }
        }

        loop {
            let frame = self
                .read_frame(DEFAULT_READ_TIMEOUT)
                .await?
                .ok_or_else(|| anyhow::anyhow!("Connection closed awaiting {} event", name))?;
            if frame["type"] == "event" && frame["name"] == name {
                return Ok(frame["data"].clone());
            }
        }
    }

    /// All events received within `window`, including buffered ones, as
    /// whole frames.
    pub async fn drain_events(&mut self, window: Duration) -> Result<Vec<Value>, anyhow::Error> {
        let deadline = tokio::time::Instant::now() + window;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                break;
            }
            match self.read_frame(remaining).await {
                Ok(Some(frame)) if frame["type"] == "event" => self.events.push_back(frame),
                Ok(Some(frame)) => anyhow::bail!("Unexpected frame while draining: {}", frame),
                // Closed or timed out
                Ok(None) | Err(_) => break,
            }
        }
        Ok(self.events.drain(..).collect())
    }

    /// Events named `name` seen within `window`, as their `data` values.
    pub async fn events_named(
        &mut self,
        name: &str,
        window: Duration,
    ) -> Result<Vec<Value>, anyhow::Error> {
        Ok(self
            .drain_events(window)
            .await?
            .into_iter()
            .filter(|event| event["name"] == name)
            .map(|event| event["data"].clone())
            .collect())
    }

    /// Read until the server closes the socket; returns the close reason.
    pub async fn wait_closed(&mut self) -> Result<String, anyhow::Error> {
        loop {
            match self.read_frame(DEFAULT_READ_TIMEOUT).await? {
                Some(frame) => self.events.push_back(frame),
                None => return Ok(self.close_reason.clone().unwrap_or_default()),
            }
        }
    }

    /// Close the socket from the client side.
    pub async fn close(mut self) -> Result<(), anyhow::Error> {
        self.ws
            .close(None)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to close: {}", e))
    }

    /// Next text frame as JSON, or `None` once the socket is closed.
    async fn read_frame(&mut self, timeout: Duration) -> Result<Option<Value>, anyhow::Error> {
        if self.close_reason.is_some() {
            return Ok(None);
        }

        loop {
            let message = tokio::time::timeout(timeout, self.ws.next())
                .await
                .map_err(|_| anyhow::anyhow!("Timed out waiting for a frame"))?;

            match message {
                Some(Ok(Message::Text(text))) => {
                    let value: Value = serde_json::from_str(&text)
                        .map_err(|e| anyhow::anyhow!("Invalid JSON frame {}: {}", text, e))?;
                    return Ok(Some(value));
                }
                Some(Ok(Message::Close(frame))) => {
                    self.close_reason = Some(
                        frame
                            .map(|f| f.reason.into_owned())
                            .unwrap_or_default(),
                    );
                    return Ok(None);
                }
                Some(Ok(_)) => continue,
                Some(Err(_)) | None => {
                    self.close_reason.get_or_insert_with(String::new);
                    return Ok(None);
                }
            }
        }
    }
}
