//! # Archon Transport
//!
//! The message plane of the Archon MCP control plane. Every supported
//! transport (stdio over Kubernetes exec streams, server-sent events,
//! WebSocket) is a [`ProtocolAdapter`] speaking the same
//! connect/disconnect/send/receive contract; a [`BridgeSession`] layers
//! request/response correlation and method dispatch on top of one adapter,
//! and a [`ProtocolBridge`] forwards frames between coupled adapters.
//!
//! The [`exec`] module owns the low-level Kubernetes exec channel: the
//! WebSocket upgrade with the `v4.channel.k8s.io` subprotocol and the
//! channel-tagged frame multiplexing over stdin/stdout/stderr.

pub mod bridge;
pub mod core;
pub mod exec;
pub mod sse;
pub mod stdio;
pub mod websocket;

pub use bridge::{handler_fn, BridgeSession, MethodHandler, ProtocolBridge};
pub use core::{AdapterError, AdapterResult, ProtocolAdapter, MESSAGE_QUEUE_CAPACITY};
pub use exec::{ExecSession, ExecStatus, ExecTarget, KubeAuth};
pub use sse::SseAdapter;
pub use stdio::{memory_pipes, MemoryPipeEnds, StdioAdapter, StdioPipes};
pub use websocket::WebSocketAdapter;
