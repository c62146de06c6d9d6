//! WebSocket protocol adapter.
//!
//! JSON-RPC frames travel as text frames; binary frames are exposed through
//! a side channel for callers that tunnel non-protocol payloads.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use archon_core::{McpMessage, ProtocolKind};
use archon_protocol::codec;
use async_trait::async_trait;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex as SyncMutex;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use crate::core::{AdapterError, AdapterResult, ProtocolAdapter, MESSAGE_QUEUE_CAPACITY};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// WebSocket protocol adapter.
#[derive(Debug)]
pub struct WebSocketAdapter {
    connection_id: String,
    url: String,
    connected: Arc<AtomicBool>,
    writer: Mutex<Option<WsSink>>,
    inbound_rx: Mutex<mpsc::Receiver<McpMessage>>,
    inbound_tx: mpsc::Sender<McpMessage>,
    binary_rx: Mutex<mpsc::Receiver<Vec<u8>>>,
    binary_tx: mpsc::Sender<Vec<u8>>,
    reader: SyncMutex<Option<tokio::task::JoinHandle<()>>>,
}

impl WebSocketAdapter {
    /// Create an adapter for the given `ws://`/`wss://` URL.
    #[must_use]
    pub fn new(connection_id: impl Into<String>, url: impl Into<String>) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(MESSAGE_QUEUE_CAPACITY);
        let (binary_tx, binary_rx) = mpsc::channel(MESSAGE_QUEUE_CAPACITY);
        Self {
            connection_id: connection_id.into(),
            url: url.into(),
            connected: Arc::new(AtomicBool::new(false)),
            writer: Mutex::new(None),
            inbound_rx: Mutex::new(inbound_rx),
            inbound_tx,
            binary_rx: Mutex::new(binary_rx),
            binary_tx,
            reader: SyncMutex::new(None),
        }
    }

    /// Send a binary frame outside the JSON-RPC message plane.
    pub async fn send_binary(&self, data: Vec<u8>) -> AdapterResult<()> {
        if !self.is_connected() {
            return Err(AdapterError::NotConnected);
        }
        let mut writer = self.writer.lock().await;
        match writer.as_mut() {
            Some(sink) => sink
                .send(Message::Binary(data))
                .await
                .map_err(|e| AdapterError::SendFailed(e.to_string())),
            None => Err(AdapterError::NotConnected),
        }
    }

    /// Receive a binary frame, if one arrives within the timeout.
    pub async fn receive_binary(&self, timeout: Duration) -> AdapterResult<Option<Vec<u8>>> {
        if !self.is_connected() {
            return Err(AdapterError::NotConnected);
        }
        let mut binary_rx = self.binary_rx.lock().await;
        match tokio::time::timeout(timeout, binary_rx.recv()).await {
            Ok(Some(data)) => Ok(Some(data)),
            Ok(None) => Err(AdapterError::StreamClosed("websocket closed".to_string())),
            Err(_) => Ok(None),
        }
    }

    /// Send a WebSocket ping frame.
    pub async fn ping(&self) -> AdapterResult<()> {
        if !self.is_connected() {
            return Err(AdapterError::NotConnected);
        }
        let mut writer = self.writer.lock().await;
        match writer.as_mut() {
            Some(sink) => sink
                .send(Message::Ping(Vec::new()))
                .await
                .map_err(|e| AdapterError::SendFailed(e.to_string())),
            None => Err(AdapterError::NotConnected),
        }
    }
}

#[async_trait]
impl ProtocolAdapter for WebSocketAdapter {
    fn connection_id(&self) -> &str {
        &self.connection_id
    }

    fn protocol(&self) -> ProtocolKind {
        ProtocolKind::WebSocket
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn connect(&self) -> AdapterResult<()> {
        if self.is_connected() {
            return Ok(());
        }

        let (stream, _) = connect_async(self.url.as_str())
            .await
            .map_err(|e| AdapterError::ConnectionFailed(e.to_string()))?;
        let (sink, mut source) = stream.split();
        *self.writer.lock().await = Some(sink);
        self.connected.store(true, Ordering::SeqCst);

        let connection_id = self.connection_id.clone();
        let connected = Arc::clone(&self.connected);
        let inbound_tx = self.inbound_tx.clone();
        let binary_tx = self.binary_tx.clone();

        let task = tokio::spawn(async move {
            while let Some(message) = source.next().await {
                match message {
                    Ok(Message::Text(text)) => match codec::decode(&text) {
                        Ok(decoded) => {
                            let decoded = decoded.with_protocol(ProtocolKind::WebSocket);
                            if inbound_tx.send(decoded).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            warn!(connection_id = %connection_id, error = %e, "dropping malformed websocket frame");
                        }
                    },
                    Ok(Message::Binary(data)) => {
                        if binary_tx.send(data).await.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Close(_)) => {
                        debug!(connection_id = %connection_id, "websocket closed by peer");
                        break;
                    }
                    Ok(_) => {} // ping/pong handled by the stack
                    Err(e) => {
                        warn!(connection_id = %connection_id, error = %e, "websocket read failed");
                        break;
                    }
                }
            }
            connected.store(false, Ordering::SeqCst);
        });
        *self.reader.lock() = Some(task);

        debug!(connection_id = %self.connection_id, url = %self.url, "websocket adapter connected");
        Ok(())
    }

    async fn disconnect(&self) {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(mut sink) = self.writer.lock().await.take() {
            let _ = sink.send(Message::Close(None)).await;
        }
        if let Some(task) = self.reader.lock().take() {
            task.abort();
        }
        debug!(connection_id = %self.connection_id, "websocket adapter disconnected");
    }

    async fn send(&self, message: &McpMessage) -> AdapterResult<()> {
        if !self.is_connected() {
            return Err(AdapterError::NotConnected);
        }
        let frame = codec::encode(message)?;
        let mut writer = self.writer.lock().await;
        match writer.as_mut() {
            Some(sink) => sink.send(Message::Text(frame)).await.map_err(|e| {
                self.connected.store(false, Ordering::SeqCst);
                AdapterError::SendFailed(e.to_string())
            }),
            None => Err(AdapterError::NotConnected),
        }
    }

    async fn receive(&self, timeout: Option<Duration>) -> AdapterResult<Option<McpMessage>> {
        if !self.is_connected() {
            return Err(AdapterError::NotConnected);
        }
        let mut inbound_rx = self.inbound_rx.lock().await;
        let message = match timeout {
            Some(window) => match tokio::time::timeout(window, inbound_rx.recv()).await {
                Ok(message) => message,
                Err(_) => return Ok(None),
            },
            None => inbound_rx.recv().await,
        };
        match message {
            Some(message) => Ok(Some(message)),
            None => Err(AdapterError::StreamClosed("websocket closed".to_string())),
        }
    }
}
