//! The persistent per-camera socket to the inference backend.
//!
//! Inbound messages are either binary (one encoded still image) or textual
//! (an out-of-band server signal).  A reader task feeds them into a bounded
//! channel; the consumer side is a plain stream that ends when the socket
//! closes, and dropping it tears the connection down.

use async_trait::async_trait;
use log::{debug, warn};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use crate::{Result, SessionError};

// back-pressure: socket reader -> channel -> supervisor
const DEPTH: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketMessage {
    /// One encoded still image (one JPEG per frame).
    Frame(Vec<u8>),
    /// Out-of-band server signal, e.g. `inference_stopped`.
    Text(String),
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Open the persistent connection for `camera_id`.  The returned stream
    /// ends when the socket closes; dropping it closes the socket.
    async fn connect(&self, camera_id: &str) -> Result<ReceiverStream<SocketMessage>>;
}

/// Websocket transport: `ws://<host>/ws/<camera_id>`.
pub struct WsTransport {
    base_url: String,
}

impl WsTransport {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn connect(&self, camera_id: &str) -> Result<ReceiverStream<SocketMessage>> {
        let url = format!("{}/ws/{camera_id}", self.base_url);
        let (mut socket, _) = connect_async(&url)
            .await
            .map_err(|err| SessionError::Connect(err.to_string()))?;
        debug!("websocket open: {url}");

        let (tx, rx) = mpsc::channel(DEPTH);
        tokio::spawn(async move {
            while let Some(message) = socket.next().await {
                let item = match message {
                    Ok(Message::Binary(payload)) => SocketMessage::Frame(payload),
                    Ok(Message::Text(text)) => SocketMessage::Text(text),
                    Ok(Message::Ping(_)) | Ok(Message::Pong(_)) | Ok(Message::Frame(_)) => {
                        continue
                    }
                    Ok(Message::Close(_)) => break,
                    Err(err) => {
                        warn!("websocket read failed: {err}");
                        break;
                    }
                };
                if tx.send(item).await.is_err() {
                    break; // consumer dropped
                }
            }
        });

        Ok(ReceiverStream::new(rx))
    }
}
