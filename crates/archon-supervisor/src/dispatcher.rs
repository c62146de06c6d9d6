//! Deployment-mode detection and set-once backend binding.
//!
//! Resolution runs at most once per process, under a single-flight guard:
//! concurrent callers all await the same probe sequence and share its
//! result. Probe failures fall through to the next candidate; only the
//! final `Unavailable` binding surfaces an error, and only when a control
//! operation is attempted.

use std::fmt;
use std::sync::Arc;

use archon_core::LogEntry;
use serde_json::Value;
use tokio::sync::OnceCell;
use tracing::{info, warn};

use crate::backend::docker::DockerDriver;
use crate::backend::kubernetes::KubernetesDriver;
use crate::backend::sidecar::{detect_sidecar_url, SidecarClient};
use crate::backend::PodDriver;
use crate::config::{ServerConfig, SupervisorConfig};
use crate::error::{SupervisorError, SupervisorResult};
use crate::response::ControlResponse;
use crate::supervisor::Supervisor;

/// Execution environment the process was bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeploymentMode {
    /// Local Docker daemon
    Docker,
    /// Sidecar owns the Kubernetes interactions
    KubernetesSidecar,
    /// Direct Kubernetes API access
    KubernetesNative,
    /// No functional backend
    Unavailable,
}

impl fmt::Display for DeploymentMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Docker => write!(f, "docker"),
            Self::KubernetesSidecar => write!(f, "kubernetes-sidecar"),
            Self::KubernetesNative => write!(f, "kubernetes-native"),
            Self::Unavailable => write!(f, "unavailable"),
        }
    }
}

/// The backend a resolved binding fans operations through.
#[derive(Debug)]
pub enum Backend {
    /// A local supervisor over a pod driver
    Supervised(Arc<Supervisor>),
    /// A remote supervisor fronted by the sidecar
    Remote(SidecarClient),
    /// Nothing usable was detected
    Unavailable,
}

/// The process-lifetime binding of mode to backend.
#[derive(Debug)]
pub struct DeploymentBinding {
    /// Detected mode
    pub mode: DeploymentMode,
    /// Bound backend
    pub backend: Backend,
}

/// Inputs to mode resolution, captured once so detection is reproducible.
#[derive(Debug, Clone)]
pub struct DispatcherSettings {
    /// Explicit sidecar URL override
    pub sidecar_url: Option<String>,
    /// `DEPLOYMENT_MODE` value, lowercased
    pub deployment_mode: String,
    /// `SERVICE_DISCOVERY_MODE` value, lowercased
    pub service_discovery_mode: String,
    /// Supervisor settings for locally bound backends
    pub supervisor: SupervisorConfig,
}

impl DispatcherSettings {
    /// Capture settings from the environment.
    pub fn from_env() -> Self {
        Self {
            sidecar_url: std::env::var("MCP_SIDECAR_URL").ok(),
            deployment_mode: std::env::var("DEPLOYMENT_MODE")
                .unwrap_or_default()
                .to_lowercase(),
            service_discovery_mode: std::env::var("SERVICE_DISCOVERY_MODE")
                .unwrap_or_default()
                .to_lowercase(),
            supervisor: SupervisorConfig::from_env(),
        }
    }
}

/// Resolves the deployment mode once and fans control operations through
/// the bound backend.
#[derive(Debug)]
pub struct Dispatcher {
    settings: DispatcherSettings,
    binding: OnceCell<DeploymentBinding>,
}

impl Dispatcher {
    /// Create a dispatcher; nothing is probed until the first operation.
    pub fn new(settings: DispatcherSettings) -> Self {
        Self {
            settings,
            binding: OnceCell::new(),
        }
    }

    /// The resolved binding, resolving on first call. Concurrent callers
    /// share one resolution.
    pub async fn binding(&self) -> &DeploymentBinding {
        self.binding
            .get_or_init(|| Self::resolve(self.settings.clone()))
            .await
    }

    /// The resolved deployment mode.
    pub async fn mode(&self) -> DeploymentMode {
        self.binding().await.mode
    }

    async fn resolve(settings: DispatcherSettings) -> DeploymentBinding {
        // 1. A reachable sidecar wins regardless of environment hints.
        let sidecar_url = detect_sidecar_url(
            settings.sidecar_url.as_deref(),
            &settings.deployment_mode,
            &settings.service_discovery_mode,
        );
        let sidecar = SidecarClient::new(&sidecar_url);
        if sidecar.is_available().await {
            info!(url = %sidecar_url, "using MCP sidecar for pod management");
            return DeploymentBinding {
                mode: DeploymentMode::KubernetesSidecar,
                backend: Backend::Remote(sidecar),
            };
        }

        // 2. Kubernetes without a sidecar: talk to the API directly.
        if settings.deployment_mode == "kubernetes" {
            match KubernetesDriver::from_cluster(settings.supervisor.namespace.clone()) {
                Ok(driver) => {
                    info!("using kubernetes-native MCP management");
                    return DeploymentBinding {
                        mode: DeploymentMode::KubernetesNative,
                        backend: Backend::Supervised(Arc::new(Supervisor::new(
                            PodDriver::Kubernetes(driver),
                            settings.supervisor,
                        ))),
                    };
                }
                Err(e) => {
                    warn!(error = %e, "kubernetes driver unavailable, trying next backend");
                }
            }
        }

        // 3. A reachable local Docker daemon.
        match DockerDriver::connect(settings.supervisor.pod_name_prefix.clone()) {
            Ok(driver) => {
                if driver.ping().await {
                    info!("using Docker backend for MCP management");
                    return DeploymentBinding {
                        mode: DeploymentMode::Docker,
                        backend: Backend::Supervised(Arc::new(Supervisor::new(
                            PodDriver::Docker(driver),
                            settings.supervisor,
                        ))),
                    };
                }
                warn!("docker daemon did not answer ping, trying next backend");
            }
            Err(e) => {
                warn!(error = %e, "docker socket unavailable");
            }
        }

        // 4. Every probe fell through.
        warn!("no MCP backend available in this environment");
        DeploymentBinding {
            mode: DeploymentMode::Unavailable,
            backend: Backend::Unavailable,
        }
    }

    /// Start a workload through the bound backend.
    pub async fn start(&self, config: ServerConfig) -> SupervisorResult<ControlResponse> {
        match &self.binding().await.backend {
            Backend::Supervised(supervisor) => supervisor.start(config).await,
            Backend::Remote(sidecar) => sidecar.start_server(&config).await,
            Backend::Unavailable => Err(SupervisorError::Unavailable),
        }
    }

    /// Stop one workload, or all of them.
    pub async fn stop(&self, server_id: Option<&str>) -> SupervisorResult<ControlResponse> {
        match &self.binding().await.backend {
            Backend::Supervised(supervisor) => supervisor.stop(server_id).await,
            Backend::Remote(sidecar) => sidecar.stop_server(server_id).await,
            Backend::Unavailable => Err(SupervisorError::Unavailable),
        }
    }

    /// Aggregated supervisor state, annotated with the deployment mode.
    pub async fn status(&self) -> SupervisorResult<Value> {
        let binding = self.binding().await;
        let mut status = match &binding.backend {
            Backend::Supervised(supervisor) => supervisor.status().await?,
            Backend::Remote(sidecar) => sidecar.status().await?,
            Backend::Unavailable => Err(SupervisorError::Unavailable)?,
        };
        if let Some(map) = status.as_object_mut() {
            map.insert(
                "deployment_mode".to_string(),
                Value::String(binding.mode.to_string()),
            );
        }
        Ok(status)
    }

    /// Tracked servers.
    pub async fn list(&self) -> SupervisorResult<Value> {
        match &self.binding().await.backend {
            Backend::Supervised(supervisor) => supervisor.list().await,
            Backend::Remote(sidecar) => sidecar.list_servers().await,
            Backend::Unavailable => Err(SupervisorError::Unavailable),
        }
    }

    /// Recent logs for the supervisor or one worker.
    pub async fn logs(
        &self,
        server_id: Option<&str>,
        limit: usize,
    ) -> SupervisorResult<Vec<LogEntry>> {
        match &self.binding().await.backend {
            Backend::Supervised(supervisor) => supervisor.logs(server_id, limit).await,
            Backend::Remote(sidecar) => sidecar.logs(limit).await,
            Backend::Unavailable => Err(SupervisorError::Unavailable),
        }
    }

    /// Backend health.
    pub async fn health(&self) -> SupervisorResult<Value> {
        match &self.binding().await.backend {
            Backend::Supervised(supervisor) => supervisor.health().await,
            Backend::Remote(sidecar) => sidecar.health().await,
            Backend::Unavailable => Err(SupervisorError::Unavailable),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn settings_with_sidecar(url: &str) -> DispatcherSettings {
        DispatcherSettings {
            sidecar_url: Some(url.to_string()),
            deployment_mode: "kubernetes".to_string(),
            service_discovery_mode: String::new(),
            supervisor: SupervisorConfig::default(),
        }
    }

    #[tokio::test]
    async fn test_reachable_sidecar_wins() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"status": "healthy"})),
            )
            .mount(&server)
            .await;

        let dispatcher = Dispatcher::new(settings_with_sidecar(&server.uri()));
        assert_eq!(dispatcher.mode().await, DeploymentMode::KubernetesSidecar);
        assert!(matches!(
            dispatcher.binding().await.backend,
            Backend::Remote(_)
        ));
    }

    #[tokio::test]
    async fn test_resolution_is_single_flight() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"status": "healthy"})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let dispatcher = Arc::new(Dispatcher::new(settings_with_sidecar(&server.uri())));
        let (a, b, c) = tokio::join!(
            dispatcher.mode(),
            dispatcher.mode(),
            dispatcher.mode(),
        );
        assert_eq!(a, DeploymentMode::KubernetesSidecar);
        assert_eq!(b, a);
        assert_eq!(c, a);
        // MockServer verifies the probe ran exactly once on drop.
    }

    #[tokio::test]
    async fn test_status_carries_deployment_mode() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/status"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "running_servers": 0,
            })))
            .mount(&server)
            .await;

        let dispatcher = Dispatcher::new(settings_with_sidecar(&server.uri()));
        let status = dispatcher.status().await.unwrap();
        assert_eq!(status["deployment_mode"], "kubernetes-sidecar");
        assert_eq!(status["running_servers"], 0);
    }

    #[test]
    fn test_mode_labels() {
        assert_eq!(DeploymentMode::Docker.to_string(), "docker");
        assert_eq!(
            DeploymentMode::KubernetesSidecar.to_string(),
            "kubernetes-sidecar"
        );
        assert_eq!(
            DeploymentMode::KubernetesNative.to_string(),
            "kubernetes-native"
        );
        assert_eq!(DeploymentMode::Unavailable.to_string(), "unavailable");
    }
}
