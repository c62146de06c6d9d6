//! # Archon Core
//!
//! Shared primitives for the Archon MCP control plane: the transport-agnostic
//! message model, bounded log rings with fan-out, and small time/text
//! utilities used by every other crate in the workspace.

pub mod log;
pub mod message;
pub mod utils;

pub use log::{LogEntry, LogLevel, LogRing, LOG_RING_CAPACITY};
pub use message::{McpMessage, MessageKind, ProtocolKind, RpcError};
pub use utils::{now_rfc3339, single_line, unix_timestamp};
