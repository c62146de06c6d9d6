//! Backend drivers performing workload operations against a concrete
//! platform.
//!
//! [`PodDriver`] is a closed variant over the two pod-level backends; the
//! sidecar HTTP client fronts a remote supervisor and lives beside it in
//! the dispatcher rather than below it.

pub mod docker;
pub mod kubernetes;
pub mod sidecar;

use archon_core::LogEntry;
use serde_json::Value;

use crate::config::ServerConfig;
use crate::error::SupervisorResult;
use crate::manifest::WorkloadSpec;

use self::docker::DockerDriver;
use self::kubernetes::KubernetesDriver;

/// Coarse workload phase, shared by both pod drivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PodPhase {
    /// Accepted but not running
    Pending,
    /// Containers running
    Running,
    /// Exited successfully
    Succeeded,
    /// Exited with failure
    Failed,
    /// Phase not reported
    Unknown,
}

/// One workload as observed at the backend.
#[derive(Debug, Clone)]
pub struct PodObservation {
    /// Pod or container name
    pub name: String,
    /// Coarse phase
    pub phase: PodPhase,
    /// Readiness as the backend reports it
    pub ready: bool,
    /// Container waiting reason, when pending
    pub waiting_reason: Option<String>,
    /// Frozen server configuration recovered from labels/annotations
    pub config: Option<ServerConfig>,
}

/// Closed variant over the pod-level backends.
#[derive(Debug)]
pub enum PodDriver {
    /// Direct Kubernetes API access with in-cluster credentials
    Kubernetes(KubernetesDriver),
    /// Local Docker daemon
    Docker(DockerDriver),
}

impl PodDriver {
    /// Short backend label used in status payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Kubernetes(_) => "kubernetes",
            Self::Docker(_) => "docker",
        }
    }

    /// Submit a new workload.
    pub async fn submit(
        &self,
        pod_name: &str,
        manifest: &Value,
        spec: &WorkloadSpec,
        labels: &[(String, String)],
    ) -> SupervisorResult<()> {
        match self {
            Self::Kubernetes(driver) => driver.create_pod(manifest).await.map(|_| ()),
            Self::Docker(driver) => driver.create_workload(pod_name, spec, labels).await,
        }
    }

    /// Delete a workload by name.
    pub async fn remove(&self, pod_name: &str) -> SupervisorResult<()> {
        match self {
            Self::Kubernetes(driver) => driver.delete_pod(pod_name).await,
            Self::Docker(driver) => driver.remove_workload(pod_name).await,
        }
    }

    /// Observe every workload this control plane created.
    pub async fn observe(&self, label_selector: &str) -> SupervisorResult<Vec<PodObservation>> {
        match self {
            Self::Kubernetes(driver) => driver.observe_pods(label_selector).await,
            Self::Docker(driver) => driver.observe_containers().await,
        }
    }

    /// Fetch the trailing log of a workload.
    pub async fn logs(&self, pod_name: &str, tail: usize) -> SupervisorResult<Vec<LogEntry>> {
        match self {
            Self::Kubernetes(driver) => driver.pod_logs(pod_name, tail).await,
            Self::Docker(driver) => driver.container_logs(pod_name, tail).await,
        }
    }

    /// Probe backend reachability.
    pub async fn ping(&self) -> bool {
        match self {
            Self::Kubernetes(driver) => driver.ping().await,
            Self::Docker(driver) => driver.ping().await,
        }
    }
}

/// Split a Kubernetes log line (`timestamps=true`) into timestamp and
/// message, classifying the level from the content.
pub(crate) fn parse_log_line(line: &str) -> Option<LogEntry> {
    let line = line.trim_end();
    if line.is_empty() {
        return None;
    }
    match line.split_once(' ') {
        Some((timestamp, message)) if timestamp.contains('T') => Some(LogEntry::at(
            timestamp,
            archon_core::LogLevel::classify(message),
            message,
        )),
        _ => Some(LogEntry::new(
            archon_core::LogLevel::classify(line),
            line,
        )),
    }
}
