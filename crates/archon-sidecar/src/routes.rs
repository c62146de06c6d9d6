//! HTTP surface of the control plane.
//!
//! Status-code mapping: 200 success, 400 invalid configuration or throttle,
//! 404 unknown id, 503 no usable backend, 500 everything else. Idempotency
//! signals (`AlreadyRunning`) come back as 200 with `success=false` so the
//! caller receives the existing `server_id`.

use std::sync::Arc;
use std::time::Duration;

use archon_supervisor::{ControlResponse, ServerConfig, SupervisorError};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

use crate::state::AppState;

/// Build the service router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/servers/start", post(start_server))
        .route("/servers/stop", post(stop_server))
        .route("/servers/list", get(list_servers))
        .route("/logs", get(logs))
        .route("/logs/stream", get(log_stream))
        .route("/registry/templates", get(list_templates))
        .route("/registry/templates/:id", get(get_template))
        .route("/packages/search", get(search_packages))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn error_status(error: &SupervisorError) -> StatusCode {
    match error {
        SupervisorError::Validation(_)
        | SupervisorError::ResourceExhausted { .. }
        | SupervisorError::Throttled { .. } => StatusCode::BAD_REQUEST,
        SupervisorError::NotFound(_) => StatusCode::NOT_FOUND,
        SupervisorError::AlreadyRunning { .. } => StatusCode::OK,
        SupervisorError::Unavailable
        | SupervisorError::BackendTransient { .. } => StatusCode::SERVICE_UNAVAILABLE,
        SupervisorError::BackendPermanent { .. }
        | SupervisorError::StreamClosed(_)
        | SupervisorError::Protocol(_)
        | SupervisorError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(error: &SupervisorError) -> Response {
    (
        error_status(error),
        Json(ControlResponse::from_error(error)),
    )
        .into_response()
}

async fn health(State(state): State<Arc<AppState>>) -> Response {
    match state.supervisor.health().await {
        Ok(payload) => {
            let healthy = payload
                .get("healthy")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            let code = if healthy {
                StatusCode::OK
            } else {
                StatusCode::SERVICE_UNAVAILABLE
            };
            (code, Json(payload)).into_response()
        }
        Err(e) => error_response(&e),
    }
}

async fn status(State(state): State<Arc<AppState>>) -> Response {
    match state.supervisor.status().await {
        Ok(payload) => (StatusCode::OK, Json(payload)).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn start_server(
    State(state): State<Arc<AppState>>,
    Json(config): Json<ServerConfig>,
) -> Response {
    match state.supervisor.start(config).await {
        Ok(response) => (StatusCode::OK, Json(response)).into_response(),
        Err(e) => error_response(&e),
    }
}

#[derive(Debug, Deserialize)]
struct StopRequest {
    #[serde(default)]
    server_id: Option<String>,
}

async fn stop_server(
    State(state): State<Arc<AppState>>,
    Json(request): Json<StopRequest>,
) -> Response {
    match state.supervisor.stop(request.server_id.as_deref()).await {
        Ok(response) => (StatusCode::OK, Json(response)).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn list_servers(State(state): State<Arc<AppState>>) -> Response {
    match state.supervisor.list().await {
        Ok(payload) => (StatusCode::OK, Json(payload)).into_response(),
        Err(e) => error_response(&e),
    }
}

#[derive(Debug, Deserialize)]
struct LogsQuery {
    #[serde(default = "default_log_limit")]
    limit: usize,
    #[serde(default)]
    server_id: Option<String>,
}

fn default_log_limit() -> usize {
    100
}

async fn logs(State(state): State<Arc<AppState>>, Query(query): Query<LogsQuery>) -> Response {
    match state
        .supervisor
        .logs(query.server_id.as_deref(), query.limit)
        .await
    {
        Ok(entries) => (StatusCode::OK, Json(json!({"logs": entries}))).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn log_stream(State(state): State<Arc<AppState>>, upgrade: WebSocketUpgrade) -> Response {
    upgrade.on_upgrade(move |socket| stream_logs(state, socket))
}

/// Fan supervisor events out to one WebSocket subscriber. The subscriber
/// observes a monotonic prefix of the ring; if it lags far enough to be
/// dropped by the broadcast channel it skips ahead.
async fn stream_logs(state: Arc<AppState>, mut socket: WebSocket) {
    let mut events = state.supervisor.events().subscribe();

    let hello = json!({
        "type": "connection",
        "message": "WebSocket connected to MCP log stream",
    });
    if socket.send(Message::Text(hello.to_string())).await.is_err() {
        return;
    }

    // Replay the recent tail before going live.
    for entry in state.supervisor.events().tail(20) {
        let frame = serde_json::to_string(&entry).unwrap_or_default();
        if socket.send(Message::Text(frame)).await.is_err() {
            return;
        }
    }

    let mut ping = tokio::time::interval(Duration::from_secs(30));
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ping.reset();

    loop {
        tokio::select! {
            entry = events.recv() => {
                match entry {
                    Ok(entry) => {
                        let frame = serde_json::to_string(&entry).unwrap_or_default();
                        if socket.send(Message::Text(frame)).await.is_err() {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "log stream subscriber lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
            _ = ping.tick() => {
                let frame = json!({"type": "ping"}).to_string();
                if socket.send(Message::Text(frame)).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        warn!(error = %e, "log stream socket error");
                        break;
                    }
                    Some(Ok(_)) => {} // client chatter is ignored
                }
            }
        }
    }
}

async fn list_templates(State(state): State<Arc<AppState>>) -> Response {
    let templates = state.registry.list();
    (
        StatusCode::OK,
        Json(json!({"templates": templates, "total_count": templates.len()})),
    )
        .into_response()
}

async fn get_template(
    State(state): State<Arc<AppState>>,
    axum::extract::Path(id): axum::extract::Path<String>,
) -> Response {
    match state.registry.get(&id) {
        Some(template) => (StatusCode::OK, Json(json!(template))).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({"success": false, "message": format!("Template {id} not found")})),
        )
            .into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct PackageSearchQuery {
    query: String,
    #[serde(default = "default_search_registry")]
    registry: String,
    #[serde(default = "default_search_limit")]
    limit: usize,
}

fn default_search_registry() -> String {
    "npm".to_string()
}

fn default_search_limit() -> usize {
    20
}

async fn search_packages(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PackageSearchQuery>,
) -> Response {
    let results = match query.registry.as_str() {
        "pypi" => state.pypi.search(&query.query, query.limit).await,
        _ => state.npm.search(&query.query, query.limit).await,
    };
    (
        StatusCode::OK,
        Json(json!({"packages": results, "total_count": results.len()})),
    )
        .into_response()
}
