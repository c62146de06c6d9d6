//! Server and supervisor configuration.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{SupervisorError, SupervisorResult};

/// Kind of MCP server workload to launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerType {
    /// The Archon MCP server image
    Archon,
    /// A Node package run through npx
    Npx,
    /// A Python package run through uv
    Uv,
    /// A Python module
    Python,
    /// An arbitrary container image
    Docker,
}

impl fmt::Display for ServerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Archon => write!(f, "archon"),
            Self::Npx => write!(f, "npx"),
            Self::Uv => write!(f, "uv"),
            Self::Python => write!(f, "python"),
            Self::Docker => write!(f, "docker"),
        }
    }
}

/// Transport the worker speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
    /// Newline-delimited JSON-RPC over stdio
    Stdio,
    /// Server-sent events
    Sse,
    /// Plain HTTP
    Http,
    /// WebSocket
    Websocket,
}

impl fmt::Display for TransportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stdio => write!(f, "stdio"),
            Self::Sse => write!(f, "sse"),
            Self::Http => write!(f, "http"),
            Self::Websocket => write!(f, "websocket"),
        }
    }
}

fn default_server_type() -> ServerType {
    ServerType::Archon
}

fn default_transport() -> TransportMode {
    TransportMode::Sse
}

fn default_timeout() -> u64 {
    300
}

/// Configuration of one MCP server workload. Immutable after validation;
/// the supervisor freezes a copy into each tracked instance and into the
/// pod's `server-config` annotation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Workload kind
    #[serde(default = "default_server_type")]
    pub server_type: ServerType,
    /// Human-readable name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Package name for npx/uv servers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package: Option<String>,
    /// Custom command for docker servers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    /// Command arguments
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    /// Extra environment variables
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    /// Transport the worker speaks
    #[serde(default = "default_transport")]
    pub transport: TransportMode,
    /// Custom container image
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    /// Port for sse/http servers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    /// Startup timeout in seconds
    #[serde(default = "default_timeout", rename = "timeout")]
    pub timeout_seconds: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            server_type: default_server_type(),
            name: None,
            package: None,
            command: None,
            args: Vec::new(),
            env: BTreeMap::new(),
            transport: default_transport(),
            image: None,
            port: None,
            timeout_seconds: default_timeout(),
        }
    }
}

impl ServerConfig {
    /// Check the cross-field invariants.
    pub fn validate(&self) -> SupervisorResult<()> {
        match self.server_type {
            ServerType::Npx | ServerType::Uv => {
                if self.package.as_deref().map_or(true, str::is_empty) {
                    return Err(SupervisorError::Validation(format!(
                        "package is required for {} servers",
                        self.server_type
                    )));
                }
            }
            ServerType::Docker => {
                if self.command.as_deref().map_or(true, str::is_empty) {
                    return Err(SupervisorError::Validation(
                        "command is required for docker servers".to_string(),
                    ));
                }
            }
            ServerType::Archon | ServerType::Python => {}
        }
        Ok(())
    }

    /// The port the worker serves on, defaulted for HTTP-style transports
    /// (8051 for archon, 8080 otherwise). Stdio workers have none.
    pub fn effective_port(&self) -> Option<u16> {
        match self.transport {
            TransportMode::Sse | TransportMode::Http => Some(self.port.unwrap_or(
                if self.server_type == ServerType::Archon {
                    8051
                } else {
                    8080
                },
            )),
            TransportMode::Stdio | TransportMode::Websocket => self.port,
        }
    }

    /// Name used in pod names and duplicate detection.
    pub fn display_name(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| self.server_type.to_string())
    }
}

/// Container resource requests and limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// CPU request
    pub cpu_request: String,
    /// CPU limit
    pub cpu_limit: String,
    /// Memory request
    pub memory_request: String,
    /// Memory limit
    pub memory_limit: String,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            cpu_request: "250m".to_string(),
            cpu_limit: "500m".to_string(),
            memory_request: "256Mi".to_string(),
            memory_limit: "512Mi".to_string(),
        }
    }
}

/// Pod security context defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PodSecurity {
    /// Refuse to run as root
    pub run_as_non_root: bool,
    /// User id
    pub run_as_user: i64,
    /// Group id
    pub run_as_group: i64,
    /// Mount the root filesystem read-only
    pub read_only_root_filesystem: bool,
    /// Allow privilege escalation
    pub allow_privilege_escalation: bool,
    /// Capabilities to drop
    pub capabilities_drop: Vec<String>,
}

impl Default for PodSecurity {
    fn default() -> Self {
        Self {
            run_as_non_root: true,
            run_as_user: 1001,
            run_as_group: 1001,
            read_only_root_filesystem: false,
            allow_privilege_escalation: false,
            capabilities_drop: vec!["ALL".to_string()],
        }
    }
}

/// Supervisor-wide settings.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Namespace workloads are created in
    pub namespace: String,
    /// Prefix for pod names and the `app` label
    pub pod_name_prefix: String,
    /// Maximum tracked instances
    pub max_concurrent_servers: usize,
    /// Container resources
    pub resources: ResourceLimits,
    /// Container security context
    pub security: PodSecurity,
    /// Grace period for teardown at shutdown
    pub cleanup_timeout: Duration,
    /// Background reconcile interval
    pub health_check_interval: Duration,
    /// Minimum wall-clock gap between start/stop operations
    pub min_operation_interval: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            namespace: "archon".to_string(),
            pod_name_prefix: "mcp".to_string(),
            max_concurrent_servers: 10,
            resources: ResourceLimits::default(),
            security: PodSecurity::default(),
            cleanup_timeout: Duration::from_secs(30),
            health_check_interval: Duration::from_secs(30),
            min_operation_interval: Duration::from_secs(2),
        }
    }
}

impl SupervisorConfig {
    /// Build settings from the environment.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(namespace) = std::env::var("KUBERNETES_NAMESPACE") {
            if !namespace.is_empty() {
                config.namespace = namespace;
            }
        }
        config
    }
}
