//! Request/response correlation and method dispatch over one adapter, plus
//! cross-adapter forwarding.
//!
//! A [`BridgeSession`] owns a single [`ProtocolAdapter`] and layers the
//! JSON-RPC exchange rules on top of it: outgoing requests install a
//! completion handle keyed by correlation id, incoming requests route to
//! registered method handlers, and late responses are dropped silently.
//! A [`ProtocolBridge`] couples one session to others so frames received on
//! the source are replayed through each target's `send`.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use archon_core::{McpMessage, MessageKind, RpcError};
use archon_protocol::JsonRpcErrorCode;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex as SyncMutex;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

use crate::core::{AdapterError, AdapterResult, ProtocolAdapter, MESSAGE_QUEUE_CAPACITY};

/// Default deadline for correlated requests.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Handler invoked for an incoming request or notification method.
#[async_trait]
pub trait MethodHandler: Send + Sync {
    /// Handle the method call and produce its result payload.
    async fn handle(&self, params: Value) -> Result<Value, AdapterError>;
}

type HandlerFuture = Pin<Box<dyn Future<Output = Result<Value, AdapterError>> + Send>>;

struct FnHandler<F>(F);

#[async_trait]
impl<F> MethodHandler for FnHandler<F>
where
    F: Fn(Value) -> HandlerFuture + Send + Sync,
{
    async fn handle(&self, params: Value) -> Result<Value, AdapterError> {
        (self.0)(params).await
    }
}

/// Wrap an async closure as a [`MethodHandler`].
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn MethodHandler>
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, AdapterError>> + Send + 'static,
{
    Arc::new(FnHandler(move |params| {
        Box::pin(f(params)) as HandlerFuture
    }))
}

/// One correlated session over a single adapter.
pub struct BridgeSession {
    connection_id: String,
    adapter: Arc<dyn ProtocolAdapter>,
    pending: DashMap<String, oneshot::Sender<Result<Value, RpcError>>>,
    handlers: DashMap<String, Arc<dyn MethodHandler>>,
    recent: SyncMutex<VecDeque<McpMessage>>,
    forwards: SyncMutex<Vec<Arc<BridgeSession>>>,
    closed: AtomicBool,
    receive_loop: SyncMutex<Option<tokio::task::JoinHandle<()>>>,
}

impl std::fmt::Debug for BridgeSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeSession")
            .field("connection_id", &self.connection_id)
            .field("pending", &self.pending.len())
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish()
    }
}

impl BridgeSession {
    /// Create a session over the given adapter.
    #[must_use]
    pub fn new(adapter: Arc<dyn ProtocolAdapter>) -> Arc<Self> {
        Arc::new(Self {
            connection_id: adapter.connection_id().to_string(),
            adapter,
            pending: DashMap::new(),
            handlers: DashMap::new(),
            recent: SyncMutex::new(VecDeque::with_capacity(64)),
            forwards: SyncMutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            receive_loop: SyncMutex::new(None),
        })
    }

    /// Connection id shared with the adapter.
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    /// The adapter this session drives.
    pub fn adapter(&self) -> &Arc<dyn ProtocolAdapter> {
        &self.adapter
    }

    /// Number of requests still awaiting a response.
    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }

    /// Whether the session has been closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Register a handler for an incoming method.
    pub fn register_handler(&self, method: impl Into<String>, handler: Arc<dyn MethodHandler>) {
        self.handlers.insert(method.into(), handler);
    }

    /// Start the receive loop pumping the adapter into [`Self::handle_incoming`].
    pub fn start(self: &Arc<Self>) {
        let session = Arc::clone(self);
        let task = tokio::spawn(async move {
            loop {
                if session.is_closed() {
                    break;
                }
                match session.adapter.receive(Some(Duration::from_millis(500))).await {
                    Ok(Some(message)) => session.handle_incoming(message).await,
                    Ok(None) => {}
                    Err(AdapterError::Protocol(e)) => {
                        warn!(connection_id = %session.connection_id, error = %e, "dropping malformed frame");
                    }
                    Err(e) if e.is_terminal() => {
                        debug!(connection_id = %session.connection_id, error = %e, "session stream ended");
                        session.closed.store(true, Ordering::SeqCst);
                        session.fail_pending();
                        break;
                    }
                    Err(e) => {
                        warn!(connection_id = %session.connection_id, error = %e, "receive failed");
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                }
            }
        });
        *self.receive_loop.lock() = Some(task);
    }

    /// Send a request and await its correlated response.
    pub async fn send_request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Option<Duration>,
    ) -> AdapterResult<Value> {
        if self.is_closed() {
            return Err(AdapterError::StreamClosed("session closed".to_string()));
        }

        let request = McpMessage::request(method, params);
        let request_id = request.id.clone();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(request_id.clone(), tx);

        if let Err(e) = self.adapter.send(&request).await {
            self.pending.remove(&request_id);
            return Err(e);
        }

        let window = timeout.unwrap_or(DEFAULT_REQUEST_TIMEOUT);
        match tokio::time::timeout(window, rx).await {
            Ok(Ok(Ok(result))) => Ok(result),
            Ok(Ok(Err(error))) => Err(AdapterError::Rpc(error)),
            // Completer dropped: the session was torn down mid-flight.
            Ok(Err(_)) => Err(AdapterError::StreamClosed("session closed".to_string())),
            Err(_) => {
                self.pending.remove(&request_id);
                Err(AdapterError::RequestTimeout {
                    method: method.to_string(),
                    timeout_ms: window.as_millis() as u64,
                })
            }
        }
    }

    /// Send a notification; no completion handle is installed.
    pub async fn send_notification(&self, method: &str, params: Option<Value>) -> AdapterResult<()> {
        if self.is_closed() {
            return Err(AdapterError::StreamClosed("session closed".to_string()));
        }
        self.adapter
            .send(&McpMessage::notification(method, params))
            .await
    }

    /// Process one inbound message per the JSON-RPC exchange rules.
    pub async fn handle_incoming(self: &Arc<Self>, message: McpMessage) {
        {
            let mut recent = self.recent.lock();
            if recent.len() == MESSAGE_QUEUE_CAPACITY {
                recent.pop_front();
            }
            recent.push_back(message.clone());
        }

        self.forward(&message).await;

        match message.kind {
            MessageKind::Request => self.dispatch_request(message).await,
            MessageKind::Response | MessageKind::Error => self.complete_pending(message),
            MessageKind::Notification => self.dispatch_notification(message).await,
        }
    }

    async fn dispatch_request(&self, message: McpMessage) {
        let method = message.method.clone().unwrap_or_default();
        let request_id = message.id.clone();
        let params = message.params.unwrap_or(Value::Null);

        let reply = match self.handlers.get(&method).map(|h| Arc::clone(h.value())) {
            Some(handler) => match handler.handle(params).await {
                Ok(result) => McpMessage::response(request_id, result),
                Err(e) => McpMessage::error_response(
                    request_id,
                    RpcError::new(
                        JsonRpcErrorCode::InternalError.code(),
                        format!("Internal error: {e}"),
                    ),
                ),
            },
            None => McpMessage::error_response(
                request_id,
                RpcError::new(
                    JsonRpcErrorCode::MethodNotFound.code(),
                    format!("Method not found: {method}"),
                ),
            ),
        };

        if let Err(e) = self.adapter.send(&reply).await {
            warn!(connection_id = %self.connection_id, method = %method, error = %e, "failed to send reply");
        }
    }

    fn complete_pending(&self, message: McpMessage) {
        match self.pending.remove(&message.id) {
            Some((_, tx)) => {
                let outcome = match message.error {
                    Some(error) => Err(error),
                    None => Ok(message.result.unwrap_or(Value::Null)),
                };
                // Receiver gone means the caller already timed out.
                let _ = tx.send(outcome);
            }
            None => {
                // Late response after a timeout; drop silently.
                trace!(connection_id = %self.connection_id, id = %message.id, "dropping uncorrelated response");
            }
        }
    }

    async fn dispatch_notification(&self, message: McpMessage) {
        let method = message.method.clone().unwrap_or_default();
        let Some(handler) = self.handlers.get(&method).map(|h| Arc::clone(h.value())) else {
            trace!(connection_id = %self.connection_id, method = %method, "no handler for notification");
            return;
        };
        if let Err(e) = handler.handle(message.params.unwrap_or(Value::Null)).await {
            warn!(connection_id = %self.connection_id, method = %method, error = %e, "notification handler failed");
        }
    }

    async fn forward(&self, message: &McpMessage) {
        let targets: Vec<Arc<BridgeSession>> = self.forwards.lock().clone();
        for target in targets {
            if let Err(e) = target.adapter.send(message).await {
                warn!(
                    source = %self.connection_id,
                    target = %target.connection_id,
                    error = %e,
                    "forwarding failed"
                );
            }
        }
    }

    /// Couple this session to the given forwarding targets.
    pub fn set_forward_targets(&self, targets: Vec<Arc<BridgeSession>>) {
        *self.forwards.lock() = targets;
    }

    /// Close the session: stop the loop, fail pending requests, disconnect.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(task) = self.receive_loop.lock().take() {
            task.abort();
        }
        self.fail_pending();
        self.adapter.disconnect().await;
        debug!(connection_id = %self.connection_id, "bridge session closed");
    }

    fn fail_pending(&self) {
        // Dropping the completers resolves every waiter with StreamClosed.
        self.pending.clear();
    }
}

/// Registry of bridge sessions with cross-adapter coupling.
#[derive(Debug, Default)]
pub struct ProtocolBridge {
    sessions: DashMap<String, Arc<BridgeSession>>,
}

impl ProtocolBridge {
    /// Create an empty bridge.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session under its connection id.
    pub fn add_session(&self, session: Arc<BridgeSession>) {
        self.sessions
            .insert(session.connection_id().to_string(), session);
    }

    /// Look up a session by connection id.
    pub fn session(&self, connection_id: &str) -> Option<Arc<BridgeSession>> {
        self.sessions.get(connection_id).map(|s| Arc::clone(s.value()))
    }

    /// Remove and close a session.
    pub async fn remove_session(&self, connection_id: &str) -> bool {
        match self.sessions.remove(connection_id) {
            Some((_, session)) => {
                session.close().await;
                true
            }
            None => false,
        }
    }

    /// Couple `source` to `targets`: every frame received on the source is
    /// replayed through each target's adapter. Unknown target ids are
    /// skipped.
    pub fn couple(&self, source: &str, targets: &[&str]) -> bool {
        let Some(source_session) = self.session(source) else {
            return false;
        };
        let resolved: Vec<Arc<BridgeSession>> = targets
            .iter()
            .filter_map(|id| self.session(id))
            .collect();
        source_session.set_forward_targets(resolved);
        true
    }

    /// Connection ids of all registered sessions.
    pub fn connection_ids(&self) -> Vec<String> {
        self.sessions.iter().map(|e| e.key().clone()).collect()
    }

    /// Close every session in parallel.
    pub async fn close_all(&self) {
        let sessions: Vec<Arc<BridgeSession>> = self
            .sessions
            .iter()
            .map(|e| Arc::clone(e.value()))
            .collect();
        self.sessions.clear();
        futures::future::join_all(sessions.iter().map(|s| s.close())).await;
    }
}
