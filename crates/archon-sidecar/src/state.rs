//! Application root: composed once at startup, shared by every handler.

use std::path::Path;
use std::sync::Arc;

use archon_supervisor::{
    DockerDriver, KubernetesDriver, PodDriver, Supervisor, SupervisorConfig, SupervisorResult,
};
use tracing::info;

use crate::packages::{NpmClient, PyPiClient};
use crate::registry::TemplateRegistry;

const SERVICE_ACCOUNT_TOKEN: &str = "/var/run/secrets/kubernetes.io/serviceaccount/token";

/// Service settings, read from the environment once at startup.
#[derive(Debug, Clone)]
pub struct SidecarSettings {
    /// Bind host
    pub host: String,
    /// Bind port
    pub port: u16,
    /// Supervisor settings
    pub supervisor: SupervisorConfig,
}

impl SidecarSettings {
    /// Read settings from the environment.
    pub fn from_env() -> Self {
        let host = std::env::var("MCP_SIDECAR_HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let port = std::env::var("MCP_SIDECAR_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(8053);
        Self {
            host,
            port,
            supervisor: SupervisorConfig::from_env(),
        }
    }
}

/// Everything the HTTP handlers share. Owned here rather than in globals;
/// subsystems receive what they need explicitly.
pub struct AppState {
    /// The workload supervisor
    pub supervisor: Arc<Supervisor>,
    /// Built-in server templates
    pub registry: TemplateRegistry,
    /// NPM package discovery
    pub npm: NpmClient,
    /// PyPI package discovery
    pub pypi: PyPiClient,
}

impl AppState {
    /// Compose the application root with an explicit supervisor.
    pub fn new(supervisor: Arc<Supervisor>) -> Self {
        Self {
            supervisor,
            registry: TemplateRegistry::builtin(),
            npm: NpmClient::new(),
            pypi: PyPiClient::new(),
        }
    }

    /// Compose the application root, picking the pod driver from the
    /// environment: Kubernetes when in-cluster credentials are present,
    /// the local Docker daemon otherwise.
    pub fn from_settings(settings: &SidecarSettings) -> SupervisorResult<Self> {
        let driver = select_driver(&settings.supervisor)?;
        info!(backend = driver.kind(), namespace = %settings.supervisor.namespace, "sidecar backend selected");
        let supervisor = Arc::new(Supervisor::new(driver, settings.supervisor.clone()));
        Ok(Self::new(supervisor))
    }
}

fn select_driver(config: &SupervisorConfig) -> SupervisorResult<PodDriver> {
    let in_cluster = std::env::var("KUBERNETES_SERVICE_HOST").is_ok()
        || Path::new(SERVICE_ACCOUNT_TOKEN).exists();
    if in_cluster {
        Ok(PodDriver::Kubernetes(KubernetesDriver::from_cluster(
            config.namespace.clone(),
        )?))
    } else {
        Ok(PodDriver::Docker(DockerDriver::connect(
            config.pod_name_prefix.clone(),
        )?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_settings_defaults() {
        // Environment-independent check of the fallback values.
        let settings = SidecarSettings {
            host: "0.0.0.0".to_string(),
            port: 8053,
            supervisor: SupervisorConfig::default(),
        };
        assert_eq!(settings.host, "0.0.0.0");
        assert_eq!(settings.port, 8053);
        assert_eq!(settings.supervisor.namespace, "archon");
    }
}
