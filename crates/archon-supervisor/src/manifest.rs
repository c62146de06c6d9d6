//! Pod manifest synthesis per server type.
//!
//! [`workload_spec`] computes the image/command/args/env tuple a workload
//! runs with; [`pod_manifest`] wraps it into the full pod document the
//! Kubernetes driver submits. The Docker driver consumes the spec directly.

use serde_json::{json, Map, Value};

use crate::config::{ServerConfig, ServerType, SupervisorConfig, TransportMode};
use crate::error::SupervisorResult;

/// Label identifying pods this control plane created.
pub const CREATED_BY: &str = "archon-sidecar";
/// Annotation key holding the frozen server configuration.
pub const CONFIG_ANNOTATION: &str = "server-config";

/// Everything a container runtime needs to run one workload.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkloadSpec {
    /// Container name inside the pod
    pub container_name: String,
    /// Image reference
    pub image: String,
    /// Entrypoint
    pub command: Vec<String>,
    /// Entrypoint arguments
    pub args: Vec<String>,
    /// Environment, defaults overlaid by the user's variables
    pub env: Vec<(String, String)>,
    /// Served port for sse/http workloads
    pub port: Option<u16>,
    /// Keep stdin open for stdio workloads
    pub stdin_open: bool,
}

fn overlay_env(mut defaults: Vec<(String, String)>, config: &ServerConfig) -> Vec<(String, String)> {
    for (key, value) in &config.env {
        match defaults.iter_mut().find(|(k, _)| k == key) {
            Some(entry) => entry.1 = value.clone(),
            None => defaults.push((key.clone(), value.clone())),
        }
    }
    defaults
}

/// Compute the runtime tuple for a validated configuration.
pub fn workload_spec(
    config: &ServerConfig,
    supervisor: &SupervisorConfig,
) -> SupervisorResult<WorkloadSpec> {
    config.validate()?;

    let stdio = config.transport == TransportMode::Stdio;
    let port = config.effective_port();

    let (image, command, mut args, defaults) = match config.server_type {
        ServerType::Npx => {
            let package = config.package.clone().unwrap_or_default();
            (
                "node:18-alpine".to_string(),
                vec!["npx".to_string()],
                vec!["-y".to_string(), package],
                vec![
                    ("NODE_ENV".to_string(), "production".to_string()),
                    ("NPM_CONFIG_UPDATE_NOTIFIER".to_string(), "false".to_string()),
                ],
            )
        }
        ServerType::Uv => {
            let package = config.package.clone().unwrap_or_default();
            let mut run = format!("pip install uv && uv run --with {package}");
            if stdio {
                run.push_str(" stdio");
            }
            (
                "python:3.12-slim".to_string(),
                vec!["sh".to_string(), "-c".to_string()],
                vec![run],
                vec![
                    ("PYTHONUNBUFFERED".to_string(), "1".to_string()),
                    ("UV_NO_CACHE".to_string(), "1".to_string()),
                ],
            )
        }
        ServerType::Python => {
            let args = if config.args.is_empty() {
                vec![
                    "-m".to_string(),
                    config.package.clone().unwrap_or_default(),
                ]
            } else {
                config.args.clone()
            };
            (
                "python:3.12-slim".to_string(),
                vec!["python".to_string()],
                args,
                vec![("PYTHONUNBUFFERED".to_string(), "1".to_string())],
            )
        }
        ServerType::Docker => (
            config.image.clone().unwrap_or_else(|| "alpine:latest".to_string()),
            config.command.clone().into_iter().collect(),
            config.args.clone(),
            Vec::new(),
        ),
        ServerType::Archon => (
            std::env::var("ARCHON_MCP_IMAGE").unwrap_or_else(|_| "archon-mcp:latest".to_string()),
            vec![
                "python".to_string(),
                "-m".to_string(),
                "src.mcp.mcp_server".to_string(),
            ],
            Vec::new(),
            vec![
                ("ARCHON_MCP_HOST".to_string(), "0.0.0.0".to_string()),
                (
                    "ARCHON_MCP_PORT".to_string(),
                    port.unwrap_or(8051).to_string(),
                ),
                (
                    "LOG_LEVEL".to_string(),
                    std::env::var("LOG_LEVEL").unwrap_or_else(|_| "INFO".to_string()),
                ),
                ("DEPLOYMENT_MODE".to_string(), "kubernetes".to_string()),
                ("SERVICE_DISCOVERY_MODE".to_string(), "kubernetes".to_string()),
                (
                    "KUBERNETES_NAMESPACE".to_string(),
                    supervisor.namespace.clone(),
                ),
            ],
        ),
    };

    // npx/python append the stdio marker as a trailing argument.
    if stdio && matches!(config.server_type, ServerType::Npx | ServerType::Python) {
        args.push("stdio".to_string());
    }

    Ok(WorkloadSpec {
        container_name: format!("mcp-{}", config.display_name()),
        image,
        command,
        args,
        env: overlay_env(defaults, config),
        port,
        stdin_open: stdio,
    })
}

/// Labels identifying a workload pod.
pub fn pod_labels(prefix: &str, config: &ServerConfig) -> Map<String, Value> {
    let mut labels = Map::new();
    labels.insert("app".to_string(), Value::String(prefix.to_string()));
    labels.insert("component".to_string(), Value::String("mcp-server".to_string()));
    labels.insert(
        "server-type".to_string(),
        Value::String(config.server_type.to_string()),
    );
    labels.insert(
        "transport".to_string(),
        Value::String(config.transport.to_string()),
    );
    labels.insert("created-by".to_string(), Value::String(CREATED_BY.to_string()));
    labels
}

/// The label selector matching every pod this control plane created.
pub fn label_selector(prefix: &str) -> String {
    format!("app={prefix},component=mcp-server")
}

/// Build the pod manifest submitted to the Kubernetes API.
pub fn pod_manifest(
    pod_name: &str,
    config: &ServerConfig,
    supervisor: &SupervisorConfig,
) -> SupervisorResult<Value> {
    let spec = workload_spec(config, supervisor)?;

    let env: Vec<Value> = spec
        .env
        .iter()
        .map(|(name, value)| json!({"name": name, "value": value}))
        .collect();

    let mut container = Map::new();
    container.insert("name".to_string(), json!(spec.container_name));
    container.insert("image".to_string(), json!(spec.image));
    container.insert("env".to_string(), json!(env));
    container.insert(
        "resources".to_string(),
        json!({
            "requests": {
                "memory": supervisor.resources.memory_request,
                "cpu": supervisor.resources.cpu_request,
            },
            "limits": {
                "memory": supervisor.resources.memory_limit,
                "cpu": supervisor.resources.cpu_limit,
            },
        }),
    );
    container.insert(
        "securityContext".to_string(),
        json!({
            "allowPrivilegeEscalation": supervisor.security.allow_privilege_escalation,
            "capabilities": {"drop": supervisor.security.capabilities_drop},
            "readOnlyRootFilesystem": supervisor.security.read_only_root_filesystem,
            "runAsNonRoot": supervisor.security.run_as_non_root,
            "runAsUser": supervisor.security.run_as_user,
            "runAsGroup": supervisor.security.run_as_group,
        }),
    );

    if !spec.command.is_empty() {
        container.insert("command".to_string(), json!(spec.command));
    }
    if !spec.args.is_empty() {
        container.insert("args".to_string(), json!(spec.args));
    }

    if matches!(config.transport, TransportMode::Sse | TransportMode::Http) {
        if let Some(port) = spec.port {
            container.insert(
                "ports".to_string(),
                json!([{"containerPort": port, "protocol": "TCP"}]),
            );
            if config.server_type == ServerType::Archon {
                container.insert(
                    "livenessProbe".to_string(),
                    json!({
                        "httpGet": {"path": "/health", "port": port},
                        "initialDelaySeconds": 30,
                        "periodSeconds": 10,
                    }),
                );
                container.insert(
                    "readinessProbe".to_string(),
                    json!({
                        "httpGet": {"path": "/health", "port": port},
                        "initialDelaySeconds": 5,
                        "periodSeconds": 5,
                    }),
                );
            }
        }
    }

    if spec.stdin_open {
        container.insert("stdin".to_string(), json!(true));
        container.insert("stdinOnce".to_string(), json!(false));
        container.insert("tty".to_string(), json!(false));
    }

    let config_json = serde_json::to_string(config)
        .map_err(|e| crate::error::SupervisorError::Validation(e.to_string()))?;

    Ok(json!({
        "apiVersion": "v1",
        "kind": "Pod",
        "metadata": {
            "name": pod_name,
            "namespace": supervisor.namespace,
            "labels": Value::Object(pod_labels(&supervisor.pod_name_prefix, config)),
            "annotations": {CONFIG_ANNOTATION: config_json},
        },
        "spec": {
            // The supervisor decides restarts, never the kubelet.
            "restartPolicy": "Never",
            "securityContext": {
                "runAsNonRoot": supervisor.security.run_as_non_root,
                "runAsUser": supervisor.security.run_as_user,
                "fsGroup": supervisor.security.run_as_group,
            },
            "containers": [Value::Object(container)],
        },
    }))
}

/// Recover the frozen configuration from a pod's annotations.
pub fn config_from_annotations(pod: &Value) -> Option<ServerConfig> {
    let config_json = pod
        .get("metadata")?
        .get("annotations")?
        .get(CONFIG_ANNOTATION)?
        .as_str()?;
    serde_json::from_str(config_json).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::BTreeMap;

    fn supervisor() -> SupervisorConfig {
        SupervisorConfig::default()
    }

    fn npx_stdio() -> ServerConfig {
        ServerConfig {
            server_type: ServerType::Npx,
            name: Some("brave".to_string()),
            package: Some("@modelcontextprotocol/server-brave-search".to_string()),
            transport: TransportMode::Stdio,
            env: BTreeMap::from([("BRAVE_API_KEY".to_string(), "X".to_string())]),
            ..Default::default()
        }
    }

    #[test]
    fn test_npx_spec() {
        let spec = workload_spec(&npx_stdio(), &supervisor()).unwrap();
        assert_eq!(spec.image, "node:18-alpine");
        assert_eq!(spec.command, vec!["npx"]);
        assert_eq!(
            spec.args,
            vec!["-y", "@modelcontextprotocol/server-brave-search", "stdio"]
        );
        assert!(spec.stdin_open);
        assert!(spec.env.contains(&("NODE_ENV".to_string(), "production".to_string())));
        assert!(spec.env.contains(&("BRAVE_API_KEY".to_string(), "X".to_string())));
    }

    #[test]
    fn test_npx_sse_has_no_stdio_marker() {
        let config = ServerConfig {
            transport: TransportMode::Sse,
            ..npx_stdio()
        };
        let spec = workload_spec(&config, &supervisor()).unwrap();
        assert_eq!(spec.args, vec!["-y", "@modelcontextprotocol/server-brave-search"]);
        assert!(!spec.stdin_open);
        assert_eq!(spec.port, Some(8080));
    }

    #[test]
    fn test_uv_spec_folds_stdio_into_shell_line() {
        let config = ServerConfig {
            server_type: ServerType::Uv,
            package: Some("mcp-server-fetch".to_string()),
            transport: TransportMode::Stdio,
            ..Default::default()
        };
        let spec = workload_spec(&config, &supervisor()).unwrap();
        assert_eq!(spec.command, vec!["sh", "-c"]);
        assert_eq!(
            spec.args,
            vec!["pip install uv && uv run --with mcp-server-fetch stdio"]
        );
        assert!(spec.env.contains(&("PYTHONUNBUFFERED".to_string(), "1".to_string())));
    }

    #[test]
    fn test_python_spec_defaults_to_module_invocation() {
        let config = ServerConfig {
            server_type: ServerType::Python,
            package: Some("my_mcp_server".to_string()),
            transport: TransportMode::Stdio,
            ..Default::default()
        };
        let spec = workload_spec(&config, &supervisor()).unwrap();
        assert_eq!(spec.command, vec!["python"]);
        assert_eq!(spec.args, vec!["-m", "my_mcp_server", "stdio"]);

        let with_args = ServerConfig {
            args: vec!["serve.py".to_string()],
            ..config
        };
        let spec = workload_spec(&with_args, &supervisor()).unwrap();
        assert_eq!(spec.args, vec!["serve.py", "stdio"]);
    }

    #[test]
    fn test_docker_spec_uses_config_verbatim() {
        let config = ServerConfig {
            server_type: ServerType::Docker,
            image: Some("ghcr.io/acme/mcp:1".to_string()),
            command: Some("/entrypoint.sh".to_string()),
            args: vec!["--flag".to_string()],
            transport: TransportMode::Stdio,
            ..Default::default()
        };
        let spec = workload_spec(&config, &supervisor()).unwrap();
        assert_eq!(spec.image, "ghcr.io/acme/mcp:1");
        assert_eq!(spec.command, vec!["/entrypoint.sh"]);
        // No implicit stdio marker for custom images.
        assert_eq!(spec.args, vec!["--flag"]);
    }

    #[test]
    fn test_docker_without_command_fails_validation() {
        let config = ServerConfig {
            server_type: ServerType::Docker,
            ..Default::default()
        };
        assert!(workload_spec(&config, &supervisor()).is_err());
    }

    #[test]
    fn test_env_overlay_replaces_defaults() {
        let config = ServerConfig {
            env: BTreeMap::from([("NODE_ENV".to_string(), "development".to_string())]),
            ..npx_stdio()
        };
        let spec = workload_spec(&config, &supervisor()).unwrap();
        let node_env: Vec<_> = spec.env.iter().filter(|(k, _)| k == "NODE_ENV").collect();
        assert_eq!(node_env, vec![&("NODE_ENV".to_string(), "development".to_string())]);
    }

    #[test]
    fn test_manifest_metadata() {
        let manifest = pod_manifest("mcp-brave-1700000000", &npx_stdio(), &supervisor()).unwrap();
        assert_eq!(manifest["metadata"]["name"], "mcp-brave-1700000000");
        assert_eq!(manifest["metadata"]["namespace"], "archon");
        let labels = &manifest["metadata"]["labels"];
        assert_eq!(labels["app"], "mcp");
        assert_eq!(labels["component"], "mcp-server");
        assert_eq!(labels["server-type"], "npx");
        assert_eq!(labels["transport"], "stdio");
        assert_eq!(labels["created-by"], "archon-sidecar");
        assert_eq!(manifest["spec"]["restartPolicy"], "Never");
    }

    #[test]
    fn test_manifest_annotation_round_trips_config() {
        let config = npx_stdio();
        let manifest = pod_manifest("mcp-brave-1700000000", &config, &supervisor()).unwrap();
        let recovered = config_from_annotations(&manifest).unwrap();
        assert_eq!(recovered, config);
    }

    #[test]
    fn test_stdio_container_flags() {
        let manifest = pod_manifest("mcp-brave-1700000000", &npx_stdio(), &supervisor()).unwrap();
        let container = &manifest["spec"]["containers"][0];
        assert_eq!(container["stdin"], true);
        assert_eq!(container["stdinOnce"], false);
        assert_eq!(container["tty"], false);
        assert!(container.get("ports").is_none());
    }

    #[test]
    fn test_archon_sse_gets_port_and_probes() {
        let config = ServerConfig::default();
        let manifest = pod_manifest("mcp-archon-1700000000", &config, &supervisor()).unwrap();
        let container = &manifest["spec"]["containers"][0];
        assert_eq!(container["ports"][0]["containerPort"], 8051);
        assert_eq!(container["livenessProbe"]["httpGet"]["path"], "/health");
        assert_eq!(container["readinessProbe"]["httpGet"]["port"], 8051);
    }

    #[test]
    fn test_non_archon_http_gets_port_but_no_probes() {
        let config = ServerConfig {
            server_type: ServerType::Npx,
            package: Some("x".to_string()),
            transport: TransportMode::Http,
            ..Default::default()
        };
        let manifest = pod_manifest("mcp-npx-1700000000", &config, &supervisor()).unwrap();
        let container = &manifest["spec"]["containers"][0];
        assert_eq!(container["ports"][0]["containerPort"], 8080);
        assert!(container.get("livenessProbe").is_none());
    }

    #[test]
    fn test_security_context_defaults() {
        let manifest = pod_manifest("mcp-brave-1700000000", &npx_stdio(), &supervisor()).unwrap();
        let sc = &manifest["spec"]["containers"][0]["securityContext"];
        assert_eq!(sc["runAsNonRoot"], true);
        assert_eq!(sc["runAsUser"], 1001);
        assert_eq!(sc["allowPrivilegeEscalation"], false);
        assert_eq!(sc["capabilities"]["drop"][0], "ALL");
        assert_eq!(manifest["spec"]["securityContext"]["fsGroup"], 1001);
    }

    #[test]
    fn test_label_selector() {
        assert_eq!(label_selector("mcp"), "app=mcp,component=mcp-server");
    }
}
