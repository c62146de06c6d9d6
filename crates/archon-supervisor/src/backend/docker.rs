//! Local Docker daemon backend driver.
//!
//! Used when the control plane runs outside a cluster: each workload is a
//! labelled container created and started from the same [`WorkloadSpec`]
//! the pod manifest is derived from. The frozen server configuration rides
//! along as a container label so tracking can be rehydrated the same way
//! pod annotations allow.

use std::collections::HashMap;

use archon_core::LogEntry;
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, LogsOptions, RemoveContainerOptions,
    StartContainerOptions,
};
use bollard::models::ContainerSummary;
use bollard::Docker;
use futures::StreamExt;
use tracing::{debug, warn};

use crate::backend::{parse_log_line, PodObservation, PodPhase};
use crate::error::{SupervisorError, SupervisorResult};
use crate::manifest::{WorkloadSpec, CONFIG_ANNOTATION};

/// Local Docker daemon driver.
#[derive(Debug)]
pub struct DockerDriver {
    docker: Docker,
    prefix: String,
}

fn map_docker_error(err: bollard::errors::Error, subject: &str) -> SupervisorError {
    match err {
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404, ..
        } => SupervisorError::NotFound(subject.to_string()),
        bollard::errors::Error::DockerResponseServerError {
            status_code,
            message,
        } => SupervisorError::from_backend_status(status_code, &message),
        other => SupervisorError::backend_transient(other.to_string()),
    }
}

impl DockerDriver {
    /// Connect to the local daemon socket.
    pub fn connect(prefix: impl Into<String>) -> SupervisorResult<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| SupervisorError::backend_transient(e.to_string()))?;
        Ok(Self {
            docker,
            prefix: prefix.into(),
        })
    }

    /// Create and start a container for the workload.
    pub async fn create_workload(
        &self,
        name: &str,
        spec: &WorkloadSpec,
        labels: &[(String, String)],
    ) -> SupervisorResult<()> {
        let env: Vec<String> = spec
            .env
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect();
        let labels: HashMap<String, String> = labels.iter().cloned().collect();

        let config = Config {
            image: Some(spec.image.clone()),
            entrypoint: (!spec.command.is_empty()).then(|| spec.command.clone()),
            cmd: (!spec.args.is_empty()).then(|| spec.args.clone()),
            env: Some(env),
            labels: Some(labels),
            open_stdin: Some(spec.stdin_open),
            attach_stdin: Some(spec.stdin_open),
            tty: Some(false),
            ..Default::default()
        };

        self.docker
            .create_container(
                Some(CreateContainerOptions {
                    name,
                    platform: None,
                }),
                config,
            )
            .await
            .map_err(|e| map_docker_error(e, name))?;

        self.docker
            .start_container(name, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| map_docker_error(e, name))?;

        debug!(container = %name, image = %spec.image, "container started");
        Ok(())
    }

    /// Force-remove a container.
    pub async fn remove_workload(&self, name: &str) -> SupervisorResult<()> {
        self.docker
            .remove_container(
                name,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| map_docker_error(e, name))
    }

    /// Observe every container this control plane created.
    pub async fn observe_containers(&self) -> SupervisorResult<Vec<PodObservation>> {
        let filters = HashMap::from([(
            "label".to_string(),
            vec![
                format!("app={}", self.prefix),
                "component=mcp-server".to_string(),
            ],
        )]);

        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions {
                all: true,
                filters,
                ..Default::default()
            }))
            .await
            .map_err(|e| map_docker_error(e, "list"))?;

        Ok(containers.iter().map(observe_container).collect())
    }

    /// Fetch a container's trailing log.
    pub async fn container_logs(&self, name: &str, tail: usize) -> SupervisorResult<Vec<LogEntry>> {
        let mut stream = self.docker.logs(
            name,
            Some(LogsOptions::<String> {
                stdout: true,
                stderr: true,
                timestamps: true,
                tail: tail.to_string(),
                ..Default::default()
            }),
        );

        let mut entries = Vec::new();
        while let Some(item) = stream.next().await {
            match item {
                Ok(output) => {
                    for line in output.to_string().lines() {
                        if let Some(entry) = parse_log_line(line) {
                            entries.push(entry);
                        }
                    }
                }
                Err(e) => return Err(map_docker_error(e, name)),
            }
        }
        Ok(entries)
    }

    /// Probe daemon reachability.
    pub async fn ping(&self) -> bool {
        match self.docker.ping().await {
            Ok(_) => true,
            Err(e) => {
                warn!(error = %e, "docker daemon unreachable");
                false
            }
        }
    }
}

/// Map a container summary into an observation.
pub fn observe_container(container: &ContainerSummary) -> PodObservation {
    let name = container
        .names
        .as_ref()
        .and_then(|names| names.first())
        .map(|n| n.trim_start_matches('/').to_string())
        .unwrap_or_default();

    let state = container.state.as_deref().unwrap_or_default();
    let status_line = container.status.as_deref().unwrap_or_default();

    let (phase, ready) = match state {
        "running" => (PodPhase::Running, true),
        "created" | "restarting" | "paused" => (PodPhase::Pending, false),
        "exited" | "dead" => {
            if status_line.starts_with("Exited (0") {
                (PodPhase::Succeeded, false)
            } else {
                (PodPhase::Failed, false)
            }
        }
        _ => (PodPhase::Unknown, false),
    };

    let config = container
        .labels
        .as_ref()
        .and_then(|labels| labels.get(CONFIG_ANNOTATION))
        .and_then(|raw| serde_json::from_str(raw).ok());

    PodObservation {
        name,
        phase,
        ready,
        waiting_reason: (phase == PodPhase::Pending && !state.is_empty())
            .then(|| state.to_string()),
        config,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn summary(state: &str, status: &str) -> ContainerSummary {
        ContainerSummary {
            names: Some(vec!["/mcp-brave-1700000000".to_string()]),
            state: Some(state.to_string()),
            status: Some(status.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_running_container_observation() {
        let obs = observe_container(&summary("running", "Up 3 minutes"));
        assert_eq!(obs.name, "mcp-brave-1700000000");
        assert_eq!(obs.phase, PodPhase::Running);
        assert!(obs.ready);
        assert_eq!(obs.waiting_reason, None);
    }

    #[test]
    fn test_exited_zero_is_succeeded() {
        let obs = observe_container(&summary("exited", "Exited (0) 2 minutes ago"));
        assert_eq!(obs.phase, PodPhase::Succeeded);
        assert!(!obs.ready);
    }

    #[test]
    fn test_exited_nonzero_is_failed() {
        let obs = observe_container(&summary("exited", "Exited (137) 2 minutes ago"));
        assert_eq!(obs.phase, PodPhase::Failed);
    }

    #[test]
    fn test_created_is_pending_with_reason() {
        let obs = observe_container(&summary("created", "Created"));
        assert_eq!(obs.phase, PodPhase::Pending);
        assert_eq!(obs.waiting_reason.as_deref(), Some("created"));
    }

    #[test]
    fn test_config_label_recovery() {
        let mut container = summary("running", "Up 1 second");
        container.labels = Some(HashMap::from([(
            CONFIG_ANNOTATION.to_string(),
            r#"{"server_type":"npx","package":"pkg","name":"brave"}"#.to_string(),
        )]));
        let obs = observe_container(&container);
        let config = obs.config.unwrap();
        assert_eq!(config.name.as_deref(), Some("brave"));
        assert_eq!(config.package.as_deref(), Some("pkg"));
    }
}
