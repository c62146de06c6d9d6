//! Sidecar-HTTP backend client.
//!
//! When a sidecar owns the Kubernetes interactions, the main service
//! delegates whole supervisor operations to it over HTTP. URL detection
//! follows the deployment mode; availability is a bounded health probe so
//! a missing sidecar falls through to the next backend candidate.

use std::time::Duration;

use archon_core::LogEntry;
use serde_json::{json, Value};
use tracing::debug;

use crate::config::ServerConfig;
use crate::error::{SupervisorError, SupervisorResult};
use crate::response::ControlResponse;

/// Health probe deadline.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Resolve the sidecar base URL from the environment.
pub fn detect_sidecar_url(
    explicit: Option<&str>,
    deployment_mode: &str,
    service_discovery_mode: &str,
) -> String {
    if let Some(url) = explicit {
        return url.trim_end_matches('/').to_string();
    }
    if deployment_mode == "kubernetes" || service_discovery_mode == "kubernetes" {
        "http://localhost:8053".to_string()
    } else if deployment_mode == "docker" || service_discovery_mode == "docker_compose" {
        "http://archon-sidecar:8053".to_string()
    } else {
        "http://localhost:8053".to_string()
    }
}

/// HTTP client for a co-located sidecar service.
#[derive(Debug, Clone)]
pub struct SidecarClient {
    base_url: String,
    client: reqwest::Client,
}

impl SidecarClient {
    /// Create a client for an explicit base URL.
    pub fn new(base_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        }
    }

    /// Create a client using environment-based URL detection.
    pub fn from_env() -> Self {
        let explicit = std::env::var("MCP_SIDECAR_URL").ok();
        let deployment_mode = std::env::var("DEPLOYMENT_MODE")
            .unwrap_or_default()
            .to_lowercase();
        let discovery_mode = std::env::var("SERVICE_DISCOVERY_MODE")
            .unwrap_or_default()
            .to_lowercase();
        Self::new(detect_sidecar_url(
            explicit.as_deref(),
            &deployment_mode,
            &discovery_mode,
        ))
    }

    /// Base URL this client talks to.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Bounded health probe. Failure means "not deployed here", never an
    /// error surfaced to the user.
    pub async fn is_available(&self) -> bool {
        let url = format!("{}/health", self.base_url);
        match self
            .client
            .get(&url)
            .timeout(PROBE_TIMEOUT)
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!(url = %url, error = %e, "sidecar probe failed");
                false
            }
        }
    }

    async fn parse_response(response: reqwest::Response) -> SupervisorResult<Value> {
        let status = response.status().as_u16();
        if (200..300).contains(&status) {
            response
                .json()
                .await
                .map_err(|e| SupervisorError::Protocol(e.to_string()))
        } else {
            let body = response.text().await.unwrap_or_default();
            match status {
                404 => Err(SupervisorError::NotFound(archon_core::single_line(&body))),
                503 => Err(SupervisorError::Unavailable),
                _ => Err(SupervisorError::from_backend_status(status, &body)),
            }
        }
    }

    async fn get(&self, path: &str) -> SupervisorResult<Value> {
        let response = self
            .client
            .get(format!("{}{}", self.base_url, path))
            .send()
            .await
            .map_err(|e| SupervisorError::backend_transient(e.to_string()))?;
        Self::parse_response(response).await
    }

    async fn post(&self, path: &str, body: &Value) -> SupervisorResult<Value> {
        let response = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .json(body)
            .send()
            .await
            .map_err(|e| SupervisorError::backend_transient(e.to_string()))?;
        Self::parse_response(response).await
    }

    /// Start a server through the sidecar.
    pub async fn start_server(&self, config: &ServerConfig) -> SupervisorResult<ControlResponse> {
        let body = serde_json::to_value(config)
            .map_err(|e| SupervisorError::Validation(e.to_string()))?;
        let value = self.post("/servers/start", &body).await?;
        serde_json::from_value(value).map_err(|e| SupervisorError::Protocol(e.to_string()))
    }

    /// Stop one server, or all when no id is given.
    pub async fn stop_server(&self, server_id: Option<&str>) -> SupervisorResult<ControlResponse> {
        let body = match server_id {
            Some(id) => json!({"server_id": id}),
            None => json!({}),
        };
        let value = self.post("/servers/stop", &body).await?;
        serde_json::from_value(value).map_err(|e| SupervisorError::Protocol(e.to_string()))
    }

    /// Aggregated supervisor state.
    pub async fn status(&self) -> SupervisorResult<Value> {
        self.get("/status").await
    }

    /// Tracked servers.
    pub async fn list_servers(&self) -> SupervisorResult<Value> {
        self.get("/servers/list").await
    }

    /// Recent log entries.
    pub async fn logs(&self, limit: usize) -> SupervisorResult<Vec<LogEntry>> {
        let value = self.get(&format!("/logs?limit={limit}")).await?;
        let entries = value
            .get("logs")
            .cloned()
            .unwrap_or_else(|| Value::Array(Vec::new()));
        serde_json::from_value(entries).map_err(|e| SupervisorError::Protocol(e.to_string()))
    }

    /// Sidecar health payload.
    pub async fn health(&self) -> SupervisorResult<Value> {
        self.get("/health").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_url_detection_precedence() {
        assert_eq!(
            detect_sidecar_url(Some("http://sidecar:9000/"), "kubernetes", ""),
            "http://sidecar:9000"
        );
        assert_eq!(
            detect_sidecar_url(None, "kubernetes", ""),
            "http://localhost:8053"
        );
        assert_eq!(
            detect_sidecar_url(None, "docker", ""),
            "http://archon-sidecar:8053"
        );
        assert_eq!(
            detect_sidecar_url(None, "", "docker_compose"),
            "http://archon-sidecar:8053"
        );
        assert_eq!(detect_sidecar_url(None, "", ""), "http://localhost:8053");
    }

    #[tokio::test]
    async fn test_availability_probe() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"status": "healthy"})),
            )
            .mount(&server)
            .await;

        let client = SidecarClient::new(server.uri());
        assert!(client.is_available().await);

        let dead = SidecarClient::new("http://127.0.0.1:1");
        assert!(!dead.is_available().await);
    }

    #[tokio::test]
    async fn test_start_server_delegates_config() {
        let server = MockServer::start().await;
        let config = ServerConfig {
            server_type: crate::config::ServerType::Npx,
            name: Some("brave".into()),
            package: Some("pkg".into()),
            transport: crate::config::TransportMode::Stdio,
            ..Default::default()
        };
        Mock::given(method("POST"))
            .and(path("/servers/start"))
            .and(body_json(&config))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "success": true,
                "status": "starting",
                "message": "npx MCP pod mcp-brave-1700000000 created successfully",
                "server_id": "npx-brave-1700000000",
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = SidecarClient::new(server.uri());
        let response = client.start_server(&config).await.unwrap();
        assert!(response.success);
        assert_eq!(response.server_id.as_deref(), Some("npx-brave-1700000000"));
    }

    #[tokio::test]
    async fn test_stop_unknown_id_maps_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/servers/stop"))
            .respond_with(ResponseTemplate::new(404).set_body_string("Server ghost not found"))
            .mount(&server)
            .await;

        let client = SidecarClient::new(server.uri());
        let err = client.stop_server(Some("ghost")).await.unwrap_err();
        assert!(matches!(err, SupervisorError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_logs_parse() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/logs"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "logs": [
                    {"timestamp": "2024-05-01T12:00:00Z", "level": "INFO", "message": "pod created"},
                ],
            })))
            .mount(&server)
            .await;

        let client = SidecarClient::new(server.uri());
        let logs = client.logs(50).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].message, "pod created");
    }

    #[tokio::test]
    async fn test_503_maps_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/status"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let client = SidecarClient::new(server.uri());
        let err = client.status().await.unwrap_err();
        assert!(matches!(err, SupervisorError::Unavailable));
    }
}
