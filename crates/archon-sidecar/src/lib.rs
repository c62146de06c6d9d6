//! # Archon Sidecar
//!
//! The HTTP control-plane service. When deployed next to the main service
//! it owns every Kubernetes interaction: starting and stopping MCP server
//! pods, reporting status, and streaming logs. It also serves the built-in
//! server template catalog and NPM/PyPI package discovery.

pub mod packages;
pub mod registry;
pub mod routes;
pub mod state;

pub use registry::{ServerTemplate, TemplateRegistry};
pub use routes::router;
pub use state::{AppState, SidecarSettings};
