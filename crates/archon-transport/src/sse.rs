//! Server-sent-events protocol adapter.
//!
//! Outbound frames are POSTed to the endpoint's companion send URL; inbound
//! frames arrive on the event stream as `data:` lines. Every `data:` line is
//! one complete JSON-RPC frame; lines are never reassembled across events.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use archon_core::{McpMessage, ProtocolKind};
use archon_protocol::codec;
use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex as SyncMutex;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use crate::core::{AdapterError, AdapterResult, ProtocolAdapter, MESSAGE_QUEUE_CAPACITY};

/// Derive the POST endpoint paired with an event-stream URL.
fn derive_send_url(events_url: &str) -> String {
    if let Some(base) = events_url.strip_suffix("/events") {
        format!("{base}/send")
    } else {
        format!("{}/send", events_url.trim_end_matches('/'))
    }
}

/// Extract the payload of an SSE `data:` line, if it is one.
fn data_payload(line: &str) -> Option<&str> {
    let rest = line.strip_prefix("data:")?;
    Some(rest.strip_prefix(' ').unwrap_or(rest))
}

/// SSE protocol adapter.
#[derive(Debug)]
pub struct SseAdapter {
    connection_id: String,
    events_url: String,
    send_url: String,
    client: reqwest::Client,
    connected: Arc<AtomicBool>,
    inbound_rx: Mutex<mpsc::Receiver<McpMessage>>,
    inbound_tx: mpsc::Sender<McpMessage>,
    listener: SyncMutex<Option<tokio::task::JoinHandle<()>>>,
}

impl SseAdapter {
    /// Create an adapter for the given event-stream URL.
    #[must_use]
    pub fn new(connection_id: impl Into<String>, events_url: impl Into<String>) -> Self {
        let events_url = events_url.into();
        let send_url = derive_send_url(&events_url);
        let (inbound_tx, inbound_rx) = mpsc::channel(MESSAGE_QUEUE_CAPACITY);
        Self {
            connection_id: connection_id.into(),
            events_url,
            send_url,
            client: reqwest::Client::new(),
            connected: Arc::new(AtomicBool::new(false)),
            inbound_rx: Mutex::new(inbound_rx),
            inbound_tx,
            listener: SyncMutex::new(None),
        }
    }

    /// The URL outbound frames are POSTed to.
    pub fn send_url(&self) -> &str {
        &self.send_url
    }

    async fn listen(
        client: reqwest::Client,
        events_url: String,
        connection_id: String,
        connected: Arc<AtomicBool>,
        inbound_tx: mpsc::Sender<McpMessage>,
    ) {
        let response = match client.get(&events_url).send().await {
            Ok(resp) if resp.status().is_success() => resp,
            Ok(resp) => {
                warn!(connection_id = %connection_id, status = %resp.status(), "event stream rejected");
                connected.store(false, Ordering::SeqCst);
                return;
            }
            Err(e) => {
                warn!(connection_id = %connection_id, error = %e, "event stream connect failed");
                connected.store(false, Ordering::SeqCst);
                return;
            }
        };

        let mut stream = response.bytes_stream();
        let mut buffer = String::new();

        while let Some(chunk) = stream.next().await {
            if !connected.load(Ordering::SeqCst) {
                break;
            }
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    warn!(connection_id = %connection_id, error = %e, "event stream read failed");
                    break;
                }
            };
            buffer.push_str(&String::from_utf8_lossy(&chunk));

            while let Some(pos) = buffer.find('\n') {
                let line: String = buffer.drain(..=pos).collect();
                let line = line.trim_end_matches(['\n', '\r']);
                let Some(payload) = data_payload(line) else {
                    continue;
                };
                match codec::decode(payload) {
                    Ok(message) => {
                        let message = message.with_protocol(ProtocolKind::Sse);
                        if inbound_tx.send(message).await.is_err() {
                            debug!(connection_id = %connection_id, "inbound queue closed, stopping listener");
                            connected.store(false, Ordering::SeqCst);
                            return;
                        }
                    }
                    Err(e) => {
                        // Drop the frame, keep the stream.
                        warn!(connection_id = %connection_id, error = %e, "dropping malformed event frame");
                    }
                }
            }
        }

        connected.store(false, Ordering::SeqCst);
        debug!(connection_id = %connection_id, "event stream listener stopped");
    }
}

#[async_trait]
impl ProtocolAdapter for SseAdapter {
    fn connection_id(&self) -> &str {
        &self.connection_id
    }

    fn protocol(&self) -> ProtocolKind {
        ProtocolKind::Sse
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn connect(&self) -> AdapterResult<()> {
        if self.is_connected() {
            return Ok(());
        }
        self.connected.store(true, Ordering::SeqCst);

        let task = tokio::spawn(Self::listen(
            self.client.clone(),
            self.events_url.clone(),
            self.connection_id.clone(),
            Arc::clone(&self.connected),
            self.inbound_tx.clone(),
        ));
        *self.listener.lock() = Some(task);
        Ok(())
    }

    async fn disconnect(&self) {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(task) = self.listener.lock().take() {
            task.abort();
        }
        debug!(connection_id = %self.connection_id, "sse adapter disconnected");
    }

    async fn send(&self, message: &McpMessage) -> AdapterResult<()> {
        if !self.is_connected() {
            return Err(AdapterError::NotConnected);
        }

        let wire = codec::to_wire(message)?;
        let response = self
            .client
            .post(&self.send_url)
            .json(&wire)
            .send()
            .await
            .map_err(|e| AdapterError::SendFailed(e.to_string()))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(AdapterError::SendFailed(format!(
                "send endpoint returned {}",
                response.status()
            )))
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
            None => Err(AdapterError::StreamClosed("event stream ended".to_string())),
        }
    }
}
