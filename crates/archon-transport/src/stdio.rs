//! Stdio protocol adapter.
//!
//! Frames are newline-delimited JSON-RPC. The adapter is wired to a pair of
//! bounded queues ([`StdioPipes`]) rather than a concrete byte stream: in
//! production the exec stream handler owns the queues and shuttles them over
//! the Kubernetes exec channel; in tests [`memory_pipes`] provides the same
//! handles over in-memory channels.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use archon_core::{McpMessage, ProtocolKind};
use archon_protocol::codec;
use async_trait::async_trait;
use parking_lot::Mutex as SyncMutex;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use crate::core::{AdapterError, AdapterResult, ProtocolAdapter, MESSAGE_QUEUE_CAPACITY};

/// Queue handles binding a stdio adapter to a worker's streams.
///
/// `stdin_tx` carries newline-terminated frames toward the worker;
/// `stdout_rx` yields newline-stripped lines from it. The stderr tap is
/// optional and only ever logged.
#[derive(Debug)]
pub struct StdioPipes {
    /// Frames toward the worker's stdin
    pub stdin_tx: mpsc::Sender<String>,
    /// Lines from the worker's stdout
    pub stdout_rx: mpsc::Receiver<String>,
    /// Lines from the worker's stderr, if tapped
    pub stderr_rx: Option<mpsc::Receiver<String>>,
}

/// The far ends of [`memory_pipes`], playing the worker's role in tests.
#[derive(Debug)]
pub struct MemoryPipeEnds {
    /// Frames the adapter wrote to stdin
    pub stdin_rx: mpsc::Receiver<String>,
    /// Inject stdout lines toward the adapter
    pub stdout_tx: mpsc::Sender<String>,
    /// Inject stderr lines toward the adapter
    pub stderr_tx: mpsc::Sender<String>,
}

/// Build an in-memory stdio pipe pair.
pub fn memory_pipes(capacity: usize) -> (StdioPipes, MemoryPipeEnds) {
    let (stdin_tx, stdin_rx) = mpsc::channel(capacity);
    let (stdout_tx, stdout_rx) = mpsc::channel(capacity);
    let (stderr_tx, stderr_rx) = mpsc::channel(capacity);
    (
        StdioPipes {
            stdin_tx,
            stdout_rx,
            stderr_rx: Some(stderr_rx),
        },
        MemoryPipeEnds {
            stdin_rx,
            stdout_tx,
            stderr_tx,
        },
    )
}

/// Stdio protocol adapter over a [`StdioPipes`] pair.
#[derive(Debug)]
pub struct StdioAdapter {
    connection_id: String,
    connected: AtomicBool,
    stdin_tx: mpsc::Sender<String>,
    stdout_rx: Mutex<mpsc::Receiver<String>>,
    stderr_task: SyncMutex<Option<tokio::task::JoinHandle<()>>>,
    stderr_rx: SyncMutex<Option<mpsc::Receiver<String>>>,
}

impl StdioAdapter {
    /// Create an adapter bound to the given pipes.
    #[must_use]
    pub fn new(connection_id: impl Into<String>, pipes: StdioPipes) -> Self {
        Self {
            connection_id: connection_id.into(),
            connected: AtomicBool::new(false),
            stdin_tx: pipes.stdin_tx,
            stdout_rx: Mutex::new(pipes.stdout_rx),
            stderr_task: SyncMutex::new(None),
            stderr_rx: SyncMutex::new(pipes.stderr_rx),
        }
    }

    /// Default queue capacity for exec-backed pipes.
    pub const fn queue_capacity() -> usize {
        MESSAGE_QUEUE_CAPACITY
    }
}

#[async_trait]
impl ProtocolAdapter for StdioAdapter {
    fn connection_id(&self) -> &str {
        &self.connection_id
    }

    fn protocol(&self) -> ProtocolKind {
        ProtocolKind::Stdio
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn connect(&self) -> AdapterResult<()> {
        if self.is_connected() {
            return Ok(());
        }

        // The pipes were wired at construction; connecting just starts the
        // stderr tap and flips the flag.
        if let Some(mut stderr_rx) = self.stderr_rx.lock().take() {
            let connection_id = self.connection_id.clone();
            let task = tokio::spawn(async move {
                while let Some(line) = stderr_rx.recv().await {
                    warn!(connection_id = %connection_id, "stderr: {line}");
                }
            });
            *self.stderr_task.lock() = Some(task);
        }

        self.connected.store(true, Ordering::SeqCst);
        debug!(connection_id = %self.connection_id, "stdio adapter connected");
        Ok(())
    }

    async fn disconnect(&self) {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(task) = self.stderr_task.lock().take() {
            task.abort();
        }
        debug!(connection_id = %self.connection_id, "stdio adapter disconnected");
    }

    async fn send(&self, message: &McpMessage) -> AdapterResult<()> {
        if !self.is_connected() {
            return Err(AdapterError::NotConnected);
        }

        let mut frame = codec::encode(message)?;
        frame.push('\n');

        self.stdin_tx
            .send(frame)
            .await
            .map_err(|_| AdapterError::StreamClosed("stdin queue closed".to_string()))
    }

    async fn receive(&self, timeout: Option<Duration>) -> AdapterResult<Option<McpMessage>> {
        if !self.is_connected() {
            return Err(AdapterError::NotConnected);
        }

        let mut stdout_rx = self.stdout_rx.lock().await;
        let line = match timeout {
            Some(window) => match tokio::time::timeout(window, stdout_rx.recv()).await {
                Ok(line) => line,
                Err(_) => return Ok(None),
            },
            None => stdout_rx.recv().await,
        };

        match line {
            Some(line) if line.trim().is_empty() => Ok(None),
            Some(line) => {
                let message = codec::decode(&line)?;
                Ok(Some(message.with_protocol(ProtocolKind::Stdio)))
            }
            None => {
                self.connected.store(false, Ordering::SeqCst);
                Err(AdapterError::StreamClosed("stdout queue closed".to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[tokio::test]
    async fn test_send_frames_are_newline_terminated() {
        let (pipes, mut ends) = memory_pipes(16);
        let adapter = StdioAdapter::new("conn-1", pipes);
        adapter.connect().await.unwrap();

        let request = McpMessage::request("tools/list", None);
        adapter.send(&request).await.unwrap();

        let frame = ends.stdin_rx.recv().await.unwrap();
        assert!(frame.ends_with('\n'));
        assert!(frame.contains("\"method\":\"tools/list\""));
    }

    #[tokio::test]
    async fn test_receive_parses_and_tags_protocol() {
        let (pipes, ends) = memory_pipes(16);
        let adapter = StdioAdapter::new("conn-2", pipes);
        adapter.connect().await.unwrap();

        ends.stdout_tx
            .send(r#"{"jsonrpc":"2.0","result":{"ok":true},"id":"r1"}"#.to_string())
            .await
            .unwrap();

        let message = adapter
            .receive(Some(Duration::from_millis(200)))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message.id, "r1");
        assert_eq!(message.protocol, Some(ProtocolKind::Stdio));
        assert_eq!(message.result, Some(json!({"ok": true})));
    }

    #[tokio::test]
    async fn test_receive_timeout_yields_none() {
        let (pipes, _ends) = memory_pipes(16);
        let adapter = StdioAdapter::new("conn-3", pipes);
        adapter.connect().await.unwrap();

        let got = adapter.receive(Some(Duration::from_millis(20))).await.unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn test_invalid_frame_is_protocol_error_session_survives() {
        let (pipes, ends) = memory_pipes(16);
        let adapter = StdioAdapter::new("conn-4", pipes);
        adapter.connect().await.unwrap();

        ends.stdout_tx.send("not json at all".to_string()).await.unwrap();
        let err = adapter
            .receive(Some(Duration::from_millis(200)))
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::Protocol(_)));
        assert!(adapter.is_connected());

        // A good frame afterwards still comes through.
        ends.stdout_tx
            .send(r#"{"jsonrpc":"2.0","method":"ping","id":"5"}"#.to_string())
            .await
            .unwrap();
        let message = adapter
            .receive(Some(Duration::from_millis(200)))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message.method.as_deref(), Some("ping"));
    }

    #[tokio::test]
    async fn test_closed_stdout_is_stream_closed() {
        let (pipes, ends) = memory_pipes(16);
        let adapter = StdioAdapter::new("conn-5", pipes);
        adapter.connect().await.unwrap();

        drop(ends.stdout_tx);
        drop(ends.stderr_tx);
        let err = adapter.receive(Some(Duration::from_millis(200))).await.unwrap_err();
        assert!(matches!(err, AdapterError::StreamClosed(_)));
        assert!(!adapter.is_connected());
    }

    #[tokio::test]
    async fn test_send_before_connect_fails() {
        let (pipes, _ends) = memory_pipes(16);
        let adapter = StdioAdapter::new("conn-6", pipes);
        let err = adapter
            .send(&McpMessage::notification("initialized", None))
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::NotConnected));
    }
}
