//! # Archon Protocol
//!
//! JSON-RPC 2.0 framing for the Archon MCP control plane and the codec
//! between the wire form and the transport-agnostic
//! [`McpMessage`](archon_core::McpMessage) model. The control plane frames
//! and correlates JSON-RPC; MCP method semantics belong to the workers.

pub mod codec;
pub mod jsonrpc;

pub use codec::{decode, encode, from_wire, to_wire, CodecError};
pub use jsonrpc::{
    JsonRpcError, JsonRpcErrorCode, JsonRpcMessage, JsonRpcNotification, JsonRpcRequest,
    JsonRpcResponse, JsonRpcVersion, RequestId, JSONRPC_VERSION,
};
