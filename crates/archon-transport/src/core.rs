//! Adapter contract and shared transport types.

use std::time::Duration;

use archon_core::{McpMessage, ProtocolKind, RpcError};
use archon_protocol::CodecError;
use async_trait::async_trait;
use thiserror::Error;

/// Capacity of every per-connection message queue.
pub const MESSAGE_QUEUE_CAPACITY: usize = 1000;

/// Result type for adapter operations
pub type AdapterResult<T> = std::result::Result<T, AdapterError>;

/// Errors that can occur on the message plane
#[derive(Error, Debug, Clone)]
pub enum AdapterError {
    /// Adapter is not connected
    #[error("Adapter not connected")]
    NotConnected,

    /// Connection could not be established
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Connection dropped mid-session
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// Send operation failed
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Receive operation failed
    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    /// Frame could not be encoded or decoded
    #[error("Serialization failed: {0}")]
    Serialization(String),

    /// Frame violated the JSON-RPC schema; the frame is dropped, the
    /// session continues
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Generic operation timeout
    #[error("Operation timed out")]
    Timeout,

    /// A request saw no correlated response within its deadline
    #[error("Request '{method}' timed out after {timeout_ms}ms")]
    RequestTimeout {
        /// Method that was awaiting a response
        method: String,
        /// Deadline in milliseconds
        timeout_ms: u64,
    },

    /// The underlying stream closed while requests were pending
    #[error("Stream closed: {0}")]
    StreamClosed(String),

    /// The peer answered with a JSON-RPC error object
    #[error("RPC error: {0}")]
    Rpc(RpcError),

    /// A registered method handler failed
    #[error("Handler failed: {0}")]
    Handler(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(String),
}

impl From<std::io::Error> for AdapterError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for AdapterError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<CodecError> for AdapterError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::Parse(e) => Self::Protocol(e.to_string()),
            CodecError::InvalidFrame(e) => Self::Protocol(e),
        }
    }
}

impl AdapterError {
    /// True when the session itself is gone and pending work should fail.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::NotConnected
                | Self::ConnectionFailed(_)
                | Self::ConnectionLost(_)
                | Self::StreamClosed(_)
        )
    }
}

/// Contract shared by every transport adapter.
///
/// Adapters hold their connection state internally (shared handles,
/// channels) so they can be driven through `&self` from both the bridge's
/// receive loop and callers issuing sends.
#[async_trait]
pub trait ProtocolAdapter: Send + Sync + std::fmt::Debug {
    /// Unique id of this connection
    fn connection_id(&self) -> &str;

    /// Transport this adapter speaks
    fn protocol(&self) -> ProtocolKind;

    /// Whether the adapter currently holds a live connection
    fn is_connected(&self) -> bool;

    /// Establish the connection
    async fn connect(&self) -> AdapterResult<()>;

    /// Tear the connection down; idempotent
    async fn disconnect(&self);

    /// Send one message
    async fn send(&self, message: &McpMessage) -> AdapterResult<()>;

    /// Receive one message. `None` means the timeout elapsed without a
    /// frame; schema-violating frames surface as [`AdapterError::Protocol`]
    /// and leave the session usable.
    async fn receive(&self, timeout: Option<Duration>) -> AdapterResult<Option<McpMessage>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_classification() {
        assert!(AdapterError::NotConnected.is_terminal());
        assert!(AdapterError::StreamClosed("eof".into()).is_terminal());
        assert!(AdapterError::ConnectionLost("reset".into()).is_terminal());
        assert!(!AdapterError::Protocol("bad frame".into()).is_terminal());
        assert!(!AdapterError::Timeout.is_terminal());
    }

    #[test]
    fn test_codec_error_maps_to_protocol() {
        let err: AdapterError = CodecError::InvalidFrame("no method".into()).into();
        assert!(matches!(err, AdapterError::Protocol(_)));
    }

    #[test]
    fn test_request_timeout_display() {
        let err = AdapterError::RequestTimeout {
            method: "tools/list".into(),
            timeout_ms: 30_000,
        };
        assert_eq!(err.to_string(), "Request 'tools/list' timed out after 30000ms");
    }
}
