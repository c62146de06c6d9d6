//! End-to-end supervisor flows against a mock Kubernetes API server.

use std::time::Duration;

use archon_supervisor::{
    ControlResponse, KubernetesDriver, PodDriver, ServerConfig, ServerType, Supervisor,
    SupervisorConfig, SupervisorError, TransportMode,
};
use archon_transport::KubeAuth;
use serde_json::{json, Value};
use wiremock::matchers::{method, path, path_regex, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn supervisor_for(uri: &str, max_servers: usize, min_interval_ms: u64) -> Supervisor {
    let driver = KubernetesDriver::with_base(
        uri,
        "archon",
        KubeAuth::from_parts("unused", 443, Some("test-token".into()), None),
    )
    .unwrap();
    let config = SupervisorConfig {
        max_concurrent_servers: max_servers,
        min_operation_interval: Duration::from_millis(min_interval_ms),
        ..Default::default()
    };
    Supervisor::new(PodDriver::Kubernetes(driver), config)
}

fn npx_config(name: &str) -> ServerConfig {
    ServerConfig {
        server_type: ServerType::Npx,
        name: Some(name.to_string()),
        package: Some("@modelcontextprotocol/server-brave-search".to_string()),
        transport: TransportMode::Stdio,
        env: [("BRAVE_API_KEY".to_string(), "X".to_string())].into(),
        ..Default::default()
    }
}

async fn mount_pod_create(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/api/v1/namespaces/archon/pods"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({"kind": "Pod"})))
        .mount(server)
        .await;
}

fn running_pod(name: &str, config: &ServerConfig, ready: bool) -> Value {
    json!({
        "metadata": {
            "name": name,
            "annotations": {"server-config": serde_json::to_string(config).unwrap()},
        },
        "status": {
            "phase": "Running",
            "conditions": [{"type": "Ready", "status": if ready { "True" } else { "False" }}],
        },
    })
}

async fn mount_pod_list(server: &MockServer, items: Vec<Value>) {
    Mock::given(method("GET"))
        .and(path("/api/v1/namespaces/archon/pods"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"items": items})))
        .mount(server)
        .await;
}

#[tokio::test]
async fn start_and_observe() {
    let server = MockServer::start().await;
    mount_pod_create(&server).await;

    let supervisor = supervisor_for(&server.uri(), 10, 0);
    let config = npx_config("brave");
    let response = supervisor.start(config.clone()).await.unwrap();

    assert!(response.success);
    assert_eq!(response.status.as_deref(), Some("starting"));
    let server_id = response.server_id.clone().unwrap();
    assert!(server_id.starts_with("npx-brave-"), "bad id {server_id}");
    let pod_name = response.data.as_ref().unwrap()["pod_name"]
        .as_str()
        .unwrap()
        .to_string();
    assert!(pod_name.starts_with("mcp-brave-"));

    // The backend now reports the pod running and ready.
    mount_pod_list(&server, vec![running_pod(&pod_name, &config, true)]).await;

    let status = supervisor.status().await.unwrap();
    assert_eq!(status["running_servers"], 1);
    let observed = &status["servers"][0];
    assert_eq!(observed["server_id"], server_id.as_str());
    assert_eq!(observed["server_type"], "npx");
    assert_eq!(observed["status"], "Running");
    assert_eq!(observed["ready"], true);
    assert_eq!(status["server_statuses"]["Running"], 1);
}

#[tokio::test]
async fn concurrency_cap_rejects_third_start() {
    let server = MockServer::start().await;
    mount_pod_create(&server).await;

    let supervisor = supervisor_for(&server.uri(), 2, 0);
    supervisor.start(npx_config("one")).await.unwrap();
    supervisor.start(npx_config("two")).await.unwrap();

    let err = supervisor.start(npx_config("three")).await.unwrap_err();
    assert!(matches!(err, SupervisorError::ResourceExhausted { max: 2 }));
    assert!(err.to_string().contains("Maximum concurrent servers"));

    let response = ControlResponse::from_error(&err);
    assert!(!response.success);
    assert_eq!(response.status.as_deref(), Some("error"));
}

#[tokio::test]
async fn duplicate_name_returns_existing_server_id() {
    let server = MockServer::start().await;
    mount_pod_create(&server).await;

    let supervisor = supervisor_for(&server.uri(), 10, 0);
    let first = supervisor.start(npx_config("brave")).await.unwrap();
    let first_id = first.server_id.unwrap();

    let err = supervisor.start(npx_config("brave")).await.unwrap_err();
    match &err {
        SupervisorError::AlreadyRunning { server_id, message } => {
            assert_eq!(server_id, &first_id);
            assert!(message.contains("npx:brave"));
        }
        other => panic!("expected AlreadyRunning, got {other:?}"),
    }

    let response = ControlResponse::from_error(&err);
    assert_eq!(response.status.as_deref(), Some("running"));
    assert_eq!(response.server_id.as_deref(), Some(first_id.as_str()));
}

#[tokio::test]
async fn throttle_rejects_rapid_operations() {
    let server = MockServer::start().await;
    mount_pod_create(&server).await;

    // Default 2s window.
    let supervisor = supervisor_for(&server.uri(), 10, 2000);
    supervisor.start(npx_config("one")).await.unwrap();

    let err = supervisor.start(npx_config("two")).await.unwrap_err();
    match err {
        SupervisorError::Throttled { retry_after_ms } => {
            assert!(retry_after_ms > 0 && retry_after_ms <= 2000);
        }
        other => panic!("expected Throttled, got {other:?}"),
    }
    assert!(err.to_string().contains("wait"));

    // Stop shares the same window.
    let err = supervisor.stop(None).await.unwrap_err();
    assert!(matches!(err, SupervisorError::Throttled { .. }));
}

#[tokio::test]
async fn stop_unknown_id_is_not_found() {
    let server = MockServer::start().await;
    let supervisor = supervisor_for(&server.uri(), 10, 0);

    let err = supervisor.stop(Some("npx-ghost-1700000000")).await.unwrap_err();
    assert!(matches!(err, SupervisorError::NotFound(_)));
}

#[tokio::test]
async fn stop_all_on_empty_supervisor_succeeds_with_zero() {
    let server = MockServer::start().await;
    let supervisor = supervisor_for(&server.uri(), 10, 0);

    let response = supervisor.stop(None).await.unwrap();
    assert!(response.success);
    assert_eq!(response.status.as_deref(), Some("stopped"));
    assert!(response.message.contains("All 0 servers"));
}

#[tokio::test]
async fn stop_by_id_removes_instance() {
    let server = MockServer::start().await;
    mount_pod_create(&server).await;
    Mock::given(method("DELETE"))
        .and(path_regex(r"^/api/v1/namespaces/archon/pods/mcp-brave-\d+$"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "Success"})))
        .mount(&server)
        .await;
    mount_pod_list(&server, vec![]).await;

    let supervisor = supervisor_for(&server.uri(), 10, 0);
    let started = supervisor.start(npx_config("brave")).await.unwrap();
    let server_id = started.server_id.unwrap();

    let response = supervisor.stop(Some(&server_id)).await.unwrap();
    assert!(response.success);
    assert_eq!(response.status.as_deref(), Some("stopped"));

    let status = supervisor.status().await.unwrap();
    assert_eq!(status["running_servers"], 0);
}

#[tokio::test]
async fn stop_all_aggregates_partial_failures() {
    let server = MockServer::start().await;
    mount_pod_create(&server).await;
    Mock::given(method("DELETE"))
        .and(path_regex(r"^/api/v1/namespaces/archon/pods/mcp-alpha-\d+$"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path_regex(r"^/api/v1/namespaces/archon/pods/mcp-beta-\d+$"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path_regex(r"^/api/v1/namespaces/archon/pods/mcp-gamma-\d+$"))
        .respond_with(ResponseTemplate::new(500).set_body_string("etcd timeout"))
        .mount(&server)
        .await;

    let supervisor = supervisor_for(&server.uri(), 10, 0);
    supervisor.start(npx_config("alpha")).await.unwrap();
    supervisor.start(npx_config("beta")).await.unwrap();
    let gamma = supervisor
        .start(npx_config("gamma"))
        .await
        .unwrap()
        .server_id
        .unwrap();

    let response = supervisor.stop(None).await.unwrap();
    assert_eq!(response.status.as_deref(), Some("partial"));
    assert!(response.success, "two of three stops succeeded");
    assert!(response.message.contains("2 servers with 1 errors"));

    let data = response.data.unwrap();
    assert_eq!(data["stopped"].as_array().unwrap().len(), 2);
    assert_eq!(data["errors"].as_array().unwrap().len(), 1);

    // The failed instance stays tracked.
    mount_pod_list(&server, vec![]).await;
    let status = supervisor.status().await.unwrap();
    assert_eq!(status["running_servers"], 1);
    assert_eq!(status["servers"][0]["server_id"], gamma.as_str());
}

#[tokio::test]
async fn vanished_pods_are_garbage_collected_after_two_cycles() {
    let server = MockServer::start().await;
    mount_pod_create(&server).await;
    mount_pod_list(&server, vec![]).await;

    let supervisor = supervisor_for(&server.uri(), 10, 0);
    supervisor.start(npx_config("brave")).await.unwrap();

    // First cycle: observed absent, kept for one more cycle.
    let status = supervisor.status().await.unwrap();
    assert_eq!(status["running_servers"], 1);
    assert_eq!(status["servers"][0]["status"], "NotFound");

    // Second consecutive absence: collected.
    let status = supervisor.status().await.unwrap();
    assert_eq!(status["running_servers"], 0);
}

#[tokio::test]
async fn annotated_pods_are_rehydrated_into_tracking() {
    let server = MockServer::start().await;
    let config = npx_config("brave");
    mount_pod_list(
        &server,
        vec![running_pod("mcp-brave-1700000000", &config, true)],
    )
    .await;

    let supervisor = supervisor_for(&server.uri(), 10, 0);
    let status = supervisor.status().await.unwrap();

    assert_eq!(status["running_servers"], 1);
    let observed = &status["servers"][0];
    assert_eq!(observed["server_id"], "npx-brave-1700000000");
    assert_eq!(observed["pod_name"], "mcp-brave-1700000000");
    assert_eq!(observed["status"], "Running");
    assert_eq!(observed["start_time"], 1700000000i64);
}

#[tokio::test]
async fn worker_logs_fall_back_across_naming_conventions() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/namespaces/archon/pods/mcp-npx-brave-1700000000/log"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(
            "/api/v1/namespaces/archon/pods/archon-mcp-npx-brave-1700000000/log",
        ))
        .and(query_param("tailLines", "20"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string("2024-05-01T12:00:00Z brave search server ready\n"),
        )
        .mount(&server)
        .await;

    let supervisor = supervisor_for(&server.uri(), 10, 0);
    let logs = supervisor
        .logs(Some("npx-brave-1700000000"), 20)
        .await
        .unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].message, "brave search server ready");
}

#[tokio::test]
async fn worker_logs_unknown_everywhere_is_not_found() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path_regex(r"^/api/v1/namespaces/archon/pods/.+/log$"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let supervisor = supervisor_for(&server.uri(), 10, 0);
    let err = supervisor.logs(Some("ghost"), 20).await.unwrap_err();
    assert!(matches!(err, SupervisorError::NotFound(_)));
}

#[tokio::test]
async fn supervisor_logs_come_from_the_event_ring() {
    let server = MockServer::start().await;
    mount_pod_create(&server).await;

    let supervisor = supervisor_for(&server.uri(), 10, 0);
    supervisor.start(npx_config("brave")).await.unwrap();

    let logs = supervisor.logs(None, 10).await.unwrap();
    assert!(!logs.is_empty());
    assert!(logs.iter().any(|entry| entry.message.contains("Created npx MCP pod")));
}

#[tokio::test]
async fn health_reflects_backend_and_readiness() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/namespaces/archon"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"kind": "Namespace"})))
        .mount(&server)
        .await;
    mount_pod_create(&server).await;

    let supervisor = supervisor_for(&server.uri(), 10, 0);

    // Reachable backend, nothing tracked: healthy.
    mount_pod_list(&server, vec![]).await;
    let health = supervisor.health().await.unwrap();
    assert_eq!(health["healthy"], true);
    assert_eq!(health["total_servers"], 0);
}

#[tokio::test]
async fn health_unreachable_backend_is_unhealthy() {
    let supervisor = supervisor_for("http://127.0.0.1:1", 10, 0);
    let health = supervisor.health().await.unwrap();
    assert_eq!(health["healthy"], false);
    assert_eq!(health["backend_reachable"], false);
}

#[tokio::test]
async fn backend_500_on_start_surfaces_transient_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/namespaces/archon/pods"))
        .respond_with(ResponseTemplate::new(503).set_body_string("etcd leader election"))
        .mount(&server)
        .await;

    let supervisor = supervisor_for(&server.uri(), 10, 0);
    let err = supervisor.start(npx_config("brave")).await.unwrap_err();
    match &err {
        SupervisorError::BackendTransient { status, .. } => assert_eq!(*status, Some(503)),
        other => panic!("expected BackendTransient, got {other:?}"),
    }
    assert!(err.is_retryable());

    // The failed start did not occupy a tracking slot.
    mount_pod_list(&server, vec![]).await;
    let status = supervisor.status().await.unwrap();
    assert_eq!(status["running_servers"], 0);
}
