//! Tracked server instances and their observed status.

use std::fmt;

use archon_core::unix_timestamp;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::config::{ServerConfig, ServerType, TransportMode};

/// Observed lifecycle state of a tracked instance, derived from the backend
/// on every reconcile cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerStatus {
    /// Pod accepted but not scheduled/started, with the container waiting
    /// reason when one is reported
    Pending(Option<String>),
    /// Pod running but not ready yet
    Starting,
    /// Pod running and ready
    Running,
    /// Deletion issued, pod still present
    Stopping,
    /// Pod completed
    Stopped,
    /// Pod failed
    Failed,
    /// Pod absent from the backend
    NotFound,
}

impl ServerStatus {
    /// Parse the display form back into a status.
    pub fn parse(label: &str) -> Self {
        match label {
            "Starting" => Self::Starting,
            "Running" => Self::Running,
            "Stopping" => Self::Stopping,
            "Stopped" => Self::Stopped,
            "Failed" => Self::Failed,
            "NotFound" => Self::NotFound,
            other => {
                if let Some(reason) = other
                    .strip_prefix("Pending (")
                    .and_then(|r| r.strip_suffix(')'))
                {
                    Self::Pending(Some(reason.to_string()))
                } else {
                    Self::Pending(None)
                }
            }
        }
    }
}

impl fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending(Some(reason)) => write!(f, "Pending ({reason})"),
            Self::Pending(None) => write!(f, "Pending"),
            Self::Starting => write!(f, "Starting"),
            Self::Running => write!(f, "Running"),
            Self::Stopping => write!(f, "Stopping"),
            Self::Stopped => write!(f, "Stopped"),
            Self::Failed => write!(f, "Failed"),
            Self::NotFound => write!(f, "NotFound"),
        }
    }
}

impl Serialize for ServerStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ServerStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let label = String::deserialize(deserializer)?;
        Ok(Self::parse(&label))
    }
}

/// One supervised workload. Owned exclusively by the supervisor; mutated
/// only by reconcile cycles and destroyed on stop or garbage collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerInstance {
    /// Process-unique id, `{type}-{name|default}-{unix_seconds}`
    pub server_id: String,
    /// Backing pod or container name
    pub pod_name: String,
    /// Workload kind
    pub server_type: ServerType,
    /// Configured name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Transport the worker speaks
    pub transport: TransportMode,
    /// Last observed status
    pub status: ServerStatus,
    /// Whether the workload reports ready
    pub ready: bool,
    /// Unix seconds the instance was created at
    pub start_time: i64,
    /// Frozen copy of the submitted configuration
    pub config: ServerConfig,
    /// Consecutive reconcile cycles the pod was absent
    #[serde(skip)]
    pub missed_cycles: u8,
}

impl ServerInstance {
    /// Track a freshly submitted workload.
    pub fn new(server_id: impl Into<String>, pod_name: impl Into<String>, config: ServerConfig) -> Self {
        Self {
            server_id: server_id.into(),
            pod_name: pod_name.into(),
            server_type: config.server_type,
            name: config.name.clone(),
            transport: config.transport,
            status: ServerStatus::Starting,
            ready: false,
            start_time: unix_timestamp(),
            config,
            missed_cycles: 0,
        }
    }

    /// Whether this instance still occupies its `(type, name)` slot.
    pub fn occupies_name_slot(&self) -> bool {
        !matches!(
            self.status,
            ServerStatus::Stopped | ServerStatus::Failed | ServerStatus::NotFound
        )
    }
}

/// Build a process-unique server id.
pub fn make_server_id(config: &ServerConfig, unix_seconds: i64) -> String {
    format!(
        "{}-{}-{}",
        config.server_type,
        config.name.as_deref().unwrap_or("default"),
        unix_seconds
    )
}

/// Build the backing pod name for a workload.
pub fn make_pod_name(prefix: &str, config: &ServerConfig, unix_seconds: i64) -> String {
    format!("{}-{}-{}", prefix, config.display_name(), unix_seconds)
}
