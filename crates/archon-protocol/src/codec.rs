//! Codec between [`McpMessage`] and the JSON-RPC 2.0 wire form.
//!
//! Decoding classifies frames the way the wire does: a `method` with an id
//! is a request, a `method` without one a notification, anything else a
//! response carrying `result` xor `error`. Encoding inverts that mapping.
//! Round trips are stable modulo the local `timestamp` and `protocol` tags.

use archon_core::{McpMessage, MessageKind, RpcError};
use serde_json::Value;
use thiserror::Error;

use crate::jsonrpc::{
    JsonRpcError, JsonRpcMessage, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, RequestId,
};

/// Errors produced while encoding or decoding frames.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The frame is not valid JSON
    #[error("Parse error: {0}")]
    Parse(#[from] serde_json::Error),

    /// The frame is JSON but violates the JSON-RPC 2.0 schema
    #[error("Invalid frame: {0}")]
    InvalidFrame(String),
}

/// Convert a message into its typed wire representation.
pub fn to_wire(message: &McpMessage) -> Result<JsonRpcMessage, CodecError> {
    match message.kind {
        MessageKind::Request => {
            let method = message
                .method
                .clone()
                .ok_or_else(|| CodecError::InvalidFrame("request without method".into()))?;
            Ok(JsonRpcMessage::Request(JsonRpcRequest::new(
                method,
                message.params.clone(),
                RequestId::from_key(&message.id),
            )))
        }
        MessageKind::Notification => {
            let method = message
                .method
                .clone()
                .ok_or_else(|| CodecError::InvalidFrame("notification without method".into()))?;
            Ok(JsonRpcMessage::Notification(JsonRpcNotification::new(
                method,
                message.params.clone(),
            )))
        }
        MessageKind::Response => {
            let result = message
                .result
                .clone()
                .ok_or_else(|| CodecError::InvalidFrame("response without result".into()))?;
            Ok(JsonRpcMessage::Response(JsonRpcResponse::success(
                result,
                RequestId::from_key(&message.id),
            )))
        }
        MessageKind::Error => {
            let error = message
                .error
                .clone()
                .ok_or_else(|| CodecError::InvalidFrame("error response without error".into()))?;
            Ok(JsonRpcMessage::Response(JsonRpcResponse::failure(
                JsonRpcError {
                    code: error.code,
                    message: error.message,
                    data: error.data,
                },
                Some(RequestId::from_key(&message.id)),
            )))
        }
    }
}

/// Serialize a message to a single JSON-RPC text frame.
pub fn encode(message: &McpMessage) -> Result<String, CodecError> {
    Ok(serde_json::to_string(&to_wire(message)?)?)
}

/// Convert a typed wire message back into the transport-agnostic model.
pub fn from_wire(wire: JsonRpcMessage) -> Result<McpMessage, CodecError> {
    match wire {
        JsonRpcMessage::Request(req) => Ok(McpMessage::request_with_id(
            req.id.as_key(),
            req.method,
            req.params,
        )),
        JsonRpcMessage::Notification(note) => Ok(McpMessage::notification(note.method, note.params)),
        JsonRpcMessage::Response(resp) => {
            let id = resp.id.map(|i| i.as_key()).unwrap_or_default();
            match (resp.result, resp.error) {
                (Some(result), None) => Ok(McpMessage::response(id, result)),
                (None, Some(error)) => Ok(McpMessage::error_response(
                    id,
                    RpcError {
                        code: error.code,
                        message: error.message,
                        data: error.data,
                    },
                )),
                (Some(_), Some(_)) => Err(CodecError::InvalidFrame(
                    "response carries both result and error".into(),
                )),
                (None, None) => Err(CodecError::InvalidFrame(
                    "response carries neither result nor error".into(),
                )),
            }
        }
    }
}

/// Parse a JSON-RPC text frame into a message.
pub fn decode(frame: &str) -> Result<McpMessage, CodecError> {
    let trimmed = frame.trim();
    if trimmed.is_empty() {
        return Err(CodecError::InvalidFrame("empty frame".into()));
    }
    // Responses with null results would satisfy neither arm of the untagged
    // union cleanly; normalize through Value first so schema errors surface
    // as InvalidFrame rather than a serde union miss.
    let value: Value = serde_json::from_str(trimmed)?;
    let wire: JsonRpcMessage = serde_json::from_value(value)
        .map_err(|e| CodecError::InvalidFrame(e.to_string()))?;
    from_wire(wire)
}
