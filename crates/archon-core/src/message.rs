//! Transport-agnostic MCP message model.
//!
//! Every adapter and bridge session in the control plane exchanges
//! [`McpMessage`] values; the JSON-RPC 2.0 wire form lives in the protocol
//! crate. Responses carry either `result` or `error`, never both, and
//! notifications carry no correlation id.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

/// Transport protocol a message arrived on or is destined for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolKind {
    /// Standard I/O over an exec channel
    Stdio,
    /// Server-sent events
    Sse,
    /// WebSocket text frames
    #[serde(rename = "websocket")]
    WebSocket,
    /// Plain HTTP request/response
    Http,
}

impl fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stdio => write!(f, "stdio"),
            Self::Sse => write!(f, "sse"),
            Self::WebSocket => write!(f, "websocket"),
            Self::Http => write!(f, "http"),
        }
    }
}

/// Message role within the JSON-RPC exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    /// Request expecting a correlated response
    Request,
    /// Response to an earlier request
    Response,
    /// Fire-and-forget notification
    Notification,
    /// Error response
    Error,
}

/// JSON-RPC error object carried inside error responses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    /// Numeric error code
    pub code: i32,
    /// Human-readable message
    pub message: String,
    /// Optional structured error data
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    /// Create a new error object without data.
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.code)
    }
}

/// An MCP protocol message.
///
/// The `id` is the correlation key for request/response pairing and is empty
/// for notifications. `timestamp` and `protocol` are local bookkeeping tags;
/// they never appear on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpMessage {
    /// Correlation id; empty for notifications
    pub id: String,
    /// Message role
    pub kind: MessageKind,
    /// Method name for requests and notifications
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    /// Request/notification parameters
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    /// Successful response payload
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error response payload
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
    /// When this message was constructed or received
    pub timestamp: DateTime<Utc>,
    /// Transport the message was observed on
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol: Option<ProtocolKind>,
}

impl McpMessage {
    /// Create a request with a freshly generated correlation id.
    pub fn request(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind: MessageKind::Request,
            method: Some(method.into()),
            params,
            result: None,
            error: None,
            timestamp: Utc::now(),
            protocol: None,
        }
    }

    /// Create a request with a caller-chosen correlation id.
    pub fn request_with_id(
        id: impl Into<String>,
        method: impl Into<String>,
        params: Option<Value>,
    ) -> Self {
        Self {
            id: id.into(),
            ..Self::request(method, params)
        }
    }

    /// Create a successful response to the given correlation id.
    pub fn response(id: impl Into<String>, result: Value) -> Self {
        Self {
            id: id.into(),
            kind: MessageKind::Response,
            method: None,
            params: None,
            result: Some(result),
            error: None,
            timestamp: Utc::now(),
            protocol: None,
        }
    }

    /// Create an error response to the given correlation id.
    pub fn error_response(id: impl Into<String>, error: RpcError) -> Self {
        Self {
            id: id.into(),
            kind: MessageKind::Error,
            method: None,
            params: None,
            result: None,
            error: Some(error),
            timestamp: Utc::now(),
            protocol: None,
        }
    }

    /// Create a notification (no correlation id, no response expected).
    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            id: String::new(),
            kind: MessageKind::Notification,
            method: Some(method.into()),
            params,
            result: None,
            error: None,
            timestamp: Utc::now(),
            protocol: None,
        }
    }

    /// Tag the message with the transport it was observed on.
    #[must_use]
    pub fn with_protocol(mut self, protocol: ProtocolKind) -> Self {
        self.protocol = Some(protocol);
        self
    }

    /// True for requests and notifications, which carry a method name.
    pub fn is_call(&self) -> bool {
        matches!(self.kind, MessageKind::Request | MessageKind::Notification)
    }

    /// True when this message answers a pending request.
    pub fn is_reply(&self) -> bool {
        matches!(self.kind, MessageKind::Response | MessageKind::Error)
    }
}
