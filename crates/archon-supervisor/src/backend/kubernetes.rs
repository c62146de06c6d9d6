//! Kubernetes-native backend driver.
//!
//! Talks to the cluster API directly with in-cluster service-account
//! credentials. Pods are created from raw manifests, observed through
//! label-selector list calls, and their logs fetched via the pod-log
//! subresource. The exec channel reuses the same credentials through
//! [`KubeAuth`].

use archon_core::LogEntry;
use archon_transport::KubeAuth;
use serde_json::Value;
use tracing::{debug, warn};

use crate::backend::{parse_log_line, PodObservation, PodPhase};
use crate::error::{SupervisorError, SupervisorResult};
use crate::manifest::config_from_annotations;

const API_TIMEOUT_SECS: u64 = 30;

/// Direct Kubernetes API driver.
#[derive(Debug)]
pub struct KubernetesDriver {
    api_base: String,
    namespace: String,
    client: reqwest::Client,
    auth: KubeAuth,
}

impl KubernetesDriver {
    /// Build a driver from in-cluster credentials.
    pub fn from_cluster(namespace: impl Into<String>) -> SupervisorResult<Self> {
        let auth = KubeAuth::in_cluster();
        let api_base = format!("https://{}:{}", auth.host, auth.port);
        Self::with_base(api_base, namespace, auth)
    }

    /// Build a driver against an explicit API base (tests, kubeconfig
    /// proxies).
    pub fn with_base(
        api_base: impl Into<String>,
        namespace: impl Into<String>,
        auth: KubeAuth,
    ) -> SupervisorResult<Self> {
        let mut builder =
            reqwest::Client::builder().timeout(std::time::Duration::from_secs(API_TIMEOUT_SECS));

        if let Some(ca_path) = &auth.ca_cert_path {
            let pem = std::fs::read(ca_path)?;
            let cert = reqwest::Certificate::from_pem(&pem)
                .map_err(|e| SupervisorError::Io(format!("invalid cluster CA: {e}")))?;
            builder = builder.add_root_certificate(cert);
        }

        let client = builder
            .build()
            .map_err(|e| SupervisorError::Io(e.to_string()))?;

        Ok(Self {
            api_base: api_base.into().trim_end_matches('/').to_string(),
            namespace: namespace.into(),
            client,
            auth,
        })
    }

    /// Namespace this driver operates in.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Credentials for opening exec channels against this cluster.
    pub fn kube_auth(&self) -> &KubeAuth {
        &self.auth
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}{}", self.api_base, path);
        let mut request = self.client.request(method, url);
        if let Some(token) = &self.auth.token {
            request = request.bearer_auth(token);
        }
        request
    }

    async fn read_failure(response: reqwest::Response) -> SupervisorError {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        SupervisorError::from_backend_status(status, &body)
    }

    /// Create a pod from a manifest.
    pub async fn create_pod(&self, manifest: &Value) -> SupervisorResult<Value> {
        let path = format!("/api/v1/namespaces/{}/pods", self.namespace);
        let response = self
            .request(reqwest::Method::POST, &path)
            .json(manifest)
            .send()
            .await
            .map_err(|e| SupervisorError::backend_transient(e.to_string()))?;

        if response.status().is_success() {
            response
                .json()
                .await
                .map_err(|e| SupervisorError::Protocol(e.to_string()))
        } else {
            Err(Self::read_failure(response).await)
        }
    }

    /// Delete a pod by name. An absent pod is a [`SupervisorError::NotFound`].
    pub async fn delete_pod(&self, name: &str) -> SupervisorResult<()> {
        let path = format!("/api/v1/namespaces/{}/pods/{}", self.namespace, name);
        let response = self
            .request(reqwest::Method::DELETE, &path)
            .send()
            .await
            .map_err(|e| SupervisorError::backend_transient(e.to_string()))?;

        match response.status().as_u16() {
            404 => Err(SupervisorError::NotFound(name.to_string())),
            status if (200..300).contains(&status) => Ok(()),
            _ => Err(Self::read_failure(response).await),
        }
    }

    /// List pods matching a label selector.
    pub async fn list_pods(&self, label_selector: &str) -> SupervisorResult<Vec<Value>> {
        let path = format!("/api/v1/namespaces/{}/pods", self.namespace);
        let response = self
            .request(reqwest::Method::GET, &path)
            .query(&[("labelSelector", label_selector)])
            .send()
            .await
            .map_err(|e| SupervisorError::backend_transient(e.to_string()))?;

        if !response.status().is_success() {
            return Err(Self::read_failure(response).await);
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| SupervisorError::Protocol(e.to_string()))?;
        Ok(body
            .get("items")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default())
    }

    /// Observe every pod matching the selector.
    pub async fn observe_pods(&self, label_selector: &str) -> SupervisorResult<Vec<PodObservation>> {
        let pods = self.list_pods(label_selector).await?;
        Ok(pods.iter().map(observe_pod).collect())
    }

    /// Fetch the trailing pod log with timestamps.
    pub async fn pod_logs(&self, name: &str, tail: usize) -> SupervisorResult<Vec<LogEntry>> {
        let path = format!("/api/v1/namespaces/{}/pods/{}/log", self.namespace, name);
        let response = self
            .request(reqwest::Method::GET, &path)
            .query(&[
                ("tailLines", tail.to_string()),
                ("timestamps", "true".to_string()),
            ])
            .send()
            .await
            .map_err(|e| SupervisorError::backend_transient(e.to_string()))?;

        match response.status().as_u16() {
            404 => Err(SupervisorError::NotFound(name.to_string())),
            status if (200..300).contains(&status) => {
                let text = response
                    .text()
                    .await
                    .map_err(|e| SupervisorError::Protocol(e.to_string()))?;
                Ok(text.lines().filter_map(parse_log_line).collect())
            }
            _ => Err(Self::read_failure(response).await),
        }
    }

    /// Probe the API server by reading our namespace.
    pub async fn ping(&self) -> bool {
        let path = format!("/api/v1/namespaces/{}", self.namespace);
        match self.request(reqwest::Method::GET, &path).send().await {
            Ok(response) => {
                let ok = response.status().is_success();
                if !ok {
                    debug!(status = %response.status(), "namespace probe rejected");
                }
                ok
            }
            Err(e) => {
                warn!(error = %e, "kubernetes api unreachable");
                false
            }
        }
    }
}

/// Map one pod document into an observation.
pub fn observe_pod(pod: &Value) -> PodObservation {
    let name = pod
        .pointer("/metadata/name")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let phase = match pod.pointer("/status/phase").and_then(Value::as_str) {
        Some("Pending") => PodPhase::Pending,
        Some("Running") => PodPhase::Running,
        Some("Succeeded") => PodPhase::Succeeded,
        Some("Failed") => PodPhase::Failed,
        _ => PodPhase::Unknown,
    };

    let ready = pod
        .pointer("/status/conditions")
        .and_then(Value::as_array)
        .is_some_and(|conditions| {
            conditions.iter().any(|c| {
                c.get("type").and_then(Value::as_str) == Some("Ready")
                    && c.get("status").and_then(Value::as_str) == Some("True")
            })
        });

    let waiting_reason = pod
        .pointer("/status/containerStatuses")
        .and_then(Value::as_array)
        .and_then(|statuses| {
            statuses.iter().find_map(|s| {
                s.pointer("/state/waiting/reason")
                    .and_then(Value::as_str)
                    .map(String::from)
            })
        });

    PodObservation {
        name,
        phase,
        ready,
        waiting_reason,
        config: config_from_annotations(pod),
    }
}
