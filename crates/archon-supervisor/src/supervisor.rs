//! Workload supervision: tracking, throttling, reconciliation.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use archon_core::{unix_timestamp, LogEntry, LogLevel, LogRing};
use archon_transport::{ExecSession, ExecTarget, StdioPipes};
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::backend::{PodDriver, PodObservation, PodPhase};
use crate::config::{ServerConfig, ServerType, SupervisorConfig};
use crate::error::{SupervisorError, SupervisorResult};
use crate::instance::{make_pod_name, make_server_id, ServerInstance, ServerStatus};
use crate::manifest::{label_selector, pod_labels, pod_manifest, workload_spec, CONFIG_ANNOTATION};
use crate::response::ControlResponse;

/// Cycles a pod must be absent before its instance is garbage-collected.
const GC_MISSED_CYCLES: u8 = 2;

/// Bounded per-instance worker log ring with an ingestion watermark so
/// repeated backend fetches append only lines not seen before.
struct WorkerRing {
    ring: Arc<LogRing>,
    watermark: String,
}

impl WorkerRing {
    fn new() -> Self {
        Self {
            ring: Arc::new(LogRing::new()),
            watermark: String::new(),
        }
    }

    fn ingest(&mut self, entries: &[LogEntry]) {
        for entry in entries {
            if entry.timestamp > self.watermark {
                self.watermark = entry.timestamp.clone();
                self.ring.push(entry.clone());
            }
        }
    }
}

struct SupervisorState {
    instances: HashMap<String, ServerInstance>,
    last_operation: Option<Instant>,
    worker_rings: HashMap<String, WorkerRing>,
    exec_sessions: HashMap<String, Vec<Arc<ExecSession>>>,
}

impl SupervisorState {
    /// Drop everything owned on behalf of a no-longer-tracked instance:
    /// its log ring and any exec channels bound to it.
    fn release_instance(&mut self, server_id: &str) {
        self.worker_rings.remove(server_id);
        if let Some(sessions) = self.exec_sessions.remove(server_id) {
            for session in sessions {
                session.close();
            }
        }
    }
}

/// Owns the tracked set of MCP server workloads and every lifecycle
/// operation on them. All mutation happens under a single mutex; the
/// reconcile cycle gathers backend observations outside the lock and swaps
/// the update in under it.
pub struct Supervisor {
    config: SupervisorConfig,
    driver: PodDriver,
    state: Mutex<SupervisorState>,
    events: LogRing,
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("backend", &self.driver.kind())
            .field("namespace", &self.config.namespace)
            .finish()
    }
}

fn status_from_observation(obs: &PodObservation) -> ServerStatus {
    match obs.phase {
        PodPhase::Pending | PodPhase::Unknown => ServerStatus::Pending(obs.waiting_reason.clone()),
        PodPhase::Running if obs.ready => ServerStatus::Running,
        PodPhase::Running => ServerStatus::Starting,
        PodPhase::Succeeded => ServerStatus::Stopped,
        PodPhase::Failed => ServerStatus::Failed,
    }
}

impl Supervisor {
    /// Create a supervisor over the given backend driver.
    pub fn new(driver: PodDriver, config: SupervisorConfig) -> Self {
        Self {
            config,
            driver,
            state: Mutex::new(SupervisorState {
                instances: HashMap::new(),
                last_operation: None,
                worker_rings: HashMap::new(),
                exec_sessions: HashMap::new(),
            }),
            events: LogRing::new(),
        }
    }

    /// Backend label ("kubernetes" or "docker").
    pub fn backend_kind(&self) -> &'static str {
        self.driver.kind()
    }

    /// Supervisor settings.
    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// The supervisor's own event log ring.
    pub fn events(&self) -> &LogRing {
        &self.events
    }

    fn check_throttle(&self, state: &SupervisorState) -> SupervisorResult<()> {
        if let Some(last) = state.last_operation {
            let elapsed = last.elapsed();
            if elapsed < self.config.min_operation_interval {
                let remaining = self.config.min_operation_interval - elapsed;
                return Err(SupervisorError::Throttled {
                    retry_after_ms: remaining.as_millis().max(1) as u64,
                });
            }
        }
        Ok(())
    }

    fn record(&self, level: LogLevel, message: String) {
        self.events.record(level, message);
    }

    /// Start a new workload from a validated configuration.
    ///
    /// Enforces, in order: configuration validity, the start/stop throttle
    /// window, the concurrent-server cap, and `(type, name)` uniqueness.
    pub async fn start(&self, config: ServerConfig) -> SupervisorResult<ControlResponse> {
        config.validate()?;

        let mut state = self.state.lock().await;
        self.check_throttle(&state)?;

        if state.instances.len() >= self.config.max_concurrent_servers {
            return Err(SupervisorError::ResourceExhausted {
                max: self.config.max_concurrent_servers,
            });
        }

        if let Some(name) = &config.name {
            let existing = state.instances.values().find(|instance| {
                instance.server_type == config.server_type
                    && instance.name.as_ref() == Some(name)
                    && instance.occupies_name_slot()
            });
            if let Some(existing) = existing {
                return Err(SupervisorError::AlreadyRunning {
                    server_id: existing.server_id.clone(),
                    message: format!(
                        "Server {}:{} is already running",
                        config.server_type, name
                    ),
                });
            }
        }

        let now = unix_timestamp();
        let server_id = make_server_id(&config, now);
        let pod_name = make_pod_name(&self.config.pod_name_prefix, &config, now);

        let spec = workload_spec(&config, &self.config)?;
        let manifest = pod_manifest(&pod_name, &config, &self.config)?;
        let mut labels: Vec<(String, String)> = pod_labels(&self.config.pod_name_prefix, &config)
            .iter()
            .map(|(key, value)| {
                (
                    key.clone(),
                    value.as_str().unwrap_or_default().to_string(),
                )
            })
            .collect();
        labels.push((
            CONFIG_ANNOTATION.to_string(),
            serde_json::to_string(&config)
                .map_err(|e| SupervisorError::Validation(e.to_string()))?,
        ));

        match self.driver.submit(&pod_name, &manifest, &spec, &labels).await {
            Ok(()) => {}
            Err(e) => {
                self.record(
                    LogLevel::Error,
                    format!("Failed to start MCP pod {pod_name}: {e}"),
                );
                return Err(e);
            }
        }

        state.last_operation = Some(Instant::now());
        state.instances.insert(
            server_id.clone(),
            ServerInstance::new(&server_id, &pod_name, config.clone()),
        );

        self.record(
            LogLevel::Info,
            format!("Created {} MCP pod: {pod_name}", config.server_type),
        );
        info!(server_id = %server_id, pod = %pod_name, "workload submitted");

        Ok(ControlResponse::ok(
            "starting",
            format!(
                "{} MCP pod {pod_name} created successfully",
                config.server_type
            ),
        )
        .with_server_id(&server_id)
        .with_data(json!({
            "pod_name": pod_name,
            "server_type": config.server_type.to_string(),
            "transport": config.transport.to_string(),
        })))
    }

    /// Stop one workload by id, or every tracked workload when no id is
    /// given. Bulk teardown aggregates partial failures; failed deletions
    /// stay tracked.
    pub async fn stop(&self, server_id: Option<&str>) -> SupervisorResult<ControlResponse> {
        let mut state = self.state.lock().await;
        self.check_throttle(&state)?;

        match server_id {
            Some(id) => {
                let instance = state
                    .instances
                    .get(id)
                    .cloned()
                    .ok_or_else(|| SupervisorError::NotFound(id.to_string()))?;

                match self.driver.remove(&instance.pod_name).await {
                    // An already-deleted pod counts as a successful stop.
                    Ok(()) | Err(SupervisorError::NotFound(_)) => {}
                    Err(e) => {
                        self.record(
                            LogLevel::Error,
                            format!("Failed to stop {id}: {e}"),
                        );
                        return Err(e);
                    }
                }

                state.instances.remove(id);
                state.release_instance(id);
                state.last_operation = Some(Instant::now());
                self.record(
                    LogLevel::Info,
                    format!(
                        "Deleted {} pod: {}",
                        instance.server_type, instance.pod_name
                    ),
                );

                Ok(ControlResponse::ok(
                    "stopped",
                    format!("Server {id} stopped successfully"),
                )
                .with_server_id(id))
            }
            None => {
                let targets: Vec<ServerInstance> = state.instances.values().cloned().collect();
                let mut stopped: Vec<String> = Vec::new();
                let mut errors: Vec<String> = Vec::new();

                for instance in &targets {
                    match self.driver.remove(&instance.pod_name).await {
                        Ok(()) | Err(SupervisorError::NotFound(_)) => {
                            state.instances.remove(&instance.server_id);
                            state.release_instance(&instance.server_id);
                            stopped.push(instance.server_id.clone());
                            self.record(
                                LogLevel::Info,
                                format!(
                                    "Deleted {} pod: {}",
                                    instance.server_type, instance.pod_name
                                ),
                            );
                        }
                        Err(e) => {
                            errors.push(format!("Failed to stop {}: {e}", instance.server_id));
                        }
                    }
                }

                state.last_operation = Some(Instant::now());

                if errors.is_empty() {
                    Ok(ControlResponse::ok(
                        "stopped",
                        format!("All {} servers stopped successfully", stopped.len()),
                    )
                    .with_data(json!({"stopped": stopped})))
                } else {
                    let message = format!(
                        "Stopped {} servers with {} errors: {}",
                        stopped.len(),
                        errors.len(),
                        errors.join("; ")
                    );
                    self.record(LogLevel::Error, message.clone());
                    let mut response = ControlResponse::failed("partial", message)
                        .with_data(json!({"stopped": stopped, "errors": errors}));
                    response.success = !stopped.is_empty();
                    Ok(response)
                }
            }
        }
    }

    /// Reconcile tracked instances against the backend.
    ///
    /// Observations are gathered outside the lock; instances absent for
    /// [`GC_MISSED_CYCLES`] consecutive cycles are garbage-collected, and
    /// untracked pods carrying our config annotation are rehydrated.
    pub async fn reconcile(&self) {
        let selector = label_selector(&self.config.pod_name_prefix);
        let observations = match self.driver.observe(&selector).await {
            Ok(observations) => observations,
            Err(e) => {
                warn!(error = %e, "reconcile observation failed");
                return;
            }
        };

        let by_name: HashMap<&str, &PodObservation> = observations
            .iter()
            .map(|obs| (obs.name.as_str(), obs))
            .collect();

        let mut state = self.state.lock().await;

        let mut collected: Vec<String> = Vec::new();
        for (id, instance) in state.instances.iter_mut() {
            match by_name.get(instance.pod_name.as_str()) {
                Some(obs) => {
                    instance.status = status_from_observation(obs);
                    instance.ready = obs.ready;
                    instance.missed_cycles = 0;
                }
                None => {
                    instance.status = ServerStatus::NotFound;
                    instance.ready = false;
                    instance.missed_cycles = instance.missed_cycles.saturating_add(1);
                    if instance.missed_cycles >= GC_MISSED_CYCLES {
                        collected.push(id.clone());
                    }
                }
            }
        }
        for id in collected {
            state.instances.remove(&id);
            state.release_instance(&id);
            self.events.record(
                LogLevel::Warning,
                format!("Garbage-collected vanished server {id}"),
            );
        }

        // Rehydrate pods created by a previous incarnation of this process.
        let tracked: HashSet<String> = state
            .instances
            .values()
            .map(|instance| instance.pod_name.clone())
            .collect();
        for obs in &observations {
            if tracked.contains(&obs.name) {
                continue;
            }
            let Some(config) = &obs.config else { continue };
            let created_at = obs
                .name
                .rsplit('-')
                .next()
                .and_then(|suffix| suffix.parse::<i64>().ok())
                .unwrap_or_else(unix_timestamp);
            let server_id = make_server_id(config, created_at);
            if state.instances.contains_key(&server_id) {
                continue;
            }
            let mut instance = ServerInstance::new(&server_id, &obs.name, config.clone());
            instance.start_time = created_at;
            instance.status = status_from_observation(obs);
            instance.ready = obs.ready;
            debug!(server_id = %server_id, pod = %obs.name, "rehydrated tracking from annotation");
            state.instances.insert(server_id, instance);
        }
    }

    /// Reconcile, then report aggregated state: backend, counts by status,
    /// and per-instance records.
    pub async fn status(&self) -> SupervisorResult<Value> {
        self.reconcile().await;
        let state = self.state.lock().await;

        let mut counts: BTreeMap<String, usize> = BTreeMap::new();
        for instance in state.instances.values() {
            *counts.entry(instance.status.to_string()).or_default() += 1;
        }

        let mut servers: Vec<&ServerInstance> = state.instances.values().collect();
        servers.sort_by(|a, b| a.server_id.cmp(&b.server_id));

        Ok(json!({
            "backend": self.driver.kind(),
            "namespace": self.config.namespace,
            "running_servers": state.instances.len(),
            "server_statuses": counts,
            "servers": servers,
        }))
    }

    /// Reconcile, then list external (non-archon) servers.
    pub async fn list(&self) -> SupervisorResult<Value> {
        self.reconcile().await;
        let state = self.state.lock().await;

        let mut servers: Vec<&ServerInstance> = state
            .instances
            .values()
            .filter(|instance| instance.server_type != ServerType::Archon)
            .collect();
        servers.sort_by(|a, b| a.server_id.cmp(&b.server_id));

        Ok(json!({
            "servers": servers,
            "total_count": servers.len(),
        }))
    }

    /// Recent supervisor events, or a worker's trailing log when an id is
    /// given. Worker lookup tries the tracked pod name first, then the
    /// `mcp-{id}` and `archon-mcp-{id}` naming conventions. Fetched lines
    /// feed the instance's bounded ring so live tailers observe a monotonic
    /// prefix.
    pub async fn logs(
        &self,
        server_id: Option<&str>,
        limit: usize,
    ) -> SupervisorResult<Vec<LogEntry>> {
        let Some(id) = server_id else {
            return Ok(self.events.tail(limit));
        };

        let tracked_pod = {
            let state = self.state.lock().await;
            state.instances.get(id).map(|i| i.pod_name.clone())
        };

        let mut candidates: Vec<String> = Vec::new();
        if let Some(pod) = tracked_pod {
            candidates.push(pod);
        }
        candidates.push(format!("mcp-{id}"));
        candidates.push(format!("archon-mcp-{id}"));
        candidates.dedup();

        for pod_name in candidates {
            match self.driver.logs(&pod_name, limit).await {
                Ok(entries) => {
                    let mut state = self.state.lock().await;
                    if state.instances.contains_key(id) {
                        let ring = state
                            .worker_rings
                            .entry(id.to_string())
                            .or_insert_with(WorkerRing::new);
                        ring.ingest(&entries);
                        return Ok(ring.ring.tail(limit));
                    }
                    return Ok(entries);
                }
                Err(SupervisorError::NotFound(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(SupervisorError::NotFound(id.to_string()))
    }

    /// Live subscription handle to a tracked worker's log ring.
    pub async fn worker_log_ring(&self, server_id: &str) -> Option<Arc<LogRing>> {
        let mut state = self.state.lock().await;
        if !state.instances.contains_key(server_id) {
            return None;
        }
        Some(Arc::clone(
            &state
                .worker_rings
                .entry(server_id.to_string())
                .or_insert_with(WorkerRing::new)
                .ring,
        ))
    }

    /// Probe backend reachability and instance readiness.
    ///
    /// Healthy iff the backend answers AND (nothing is tracked OR at least
    /// one instance is ready).
    pub async fn health(&self) -> SupervisorResult<Value> {
        let backend_reachable = self.driver.ping().await;

        if backend_reachable {
            self.reconcile().await;
        }

        let state = self.state.lock().await;
        let total = state.instances.len();
        let ready = state
            .instances
            .values()
            .filter(|instance| instance.ready)
            .count();
        let healthy = backend_reachable && (total == 0 || ready > 0);

        Ok(json!({
            "status": if healthy { "healthy" } else { "unhealthy" },
            "healthy": healthy,
            "backend": self.driver.kind(),
            "backend_reachable": backend_reachable,
            "namespace": self.config.namespace,
            "total_servers": total,
            "ready_servers": ready,
        }))
    }

    /// Open a stdio exec channel to a tracked worker and hand back the
    /// queue handles for an adapter. The session stays registered against
    /// the instance so `stop` tears it down with the worker.
    pub async fn open_stdio_session(
        &self,
        server_id: &str,
    ) -> SupervisorResult<(Arc<ExecSession>, StdioPipes)> {
        let instance = {
            let state = self.state.lock().await;
            state
                .instances
                .get(server_id)
                .cloned()
                .ok_or_else(|| SupervisorError::NotFound(server_id.to_string()))?
        };

        let PodDriver::Kubernetes(driver) = &self.driver else {
            return Err(SupervisorError::Validation(
                "stdio bridging requires the kubernetes backend".to_string(),
            ));
        };

        let target = ExecTarget::shell(self.config.namespace.clone(), instance.pod_name.clone());
        let (session, pipes) = ExecSession::open(driver.kube_auth(), &target).await?;
        let session = Arc::new(session);

        let mut state = self.state.lock().await;
        state
            .exec_sessions
            .entry(server_id.to_string())
            .or_default()
            .push(Arc::clone(&session));
        Ok((session, pipes))
    }

    /// Tear down every open exec session. Workloads are left running;
    /// explicit `stop` remains the only teardown path for workers.
    pub async fn shutdown(&self) {
        let mut state = self.state.lock().await;
        for (_, sessions) in state.exec_sessions.drain() {
            for session in sessions {
                session.close();
            }
        }
    }

    /// Run reconcile on a fixed interval until the returned handle is
    /// aborted.
    pub fn spawn_reconcile_loop(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let supervisor = Arc::clone(self);
        let interval = supervisor.config.health_check_interval.max(Duration::from_secs(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                supervisor.reconcile().await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn observation(phase: PodPhase, ready: bool, reason: Option<&str>) -> PodObservation {
        PodObservation {
            name: "mcp-x-1".to_string(),
            phase,
            ready,
            waiting_reason: reason.map(String::from),
            config: None,
        }
    }

    #[test]
    fn test_status_mapping_follows_phase_and_readiness() {
        assert_eq!(
            status_from_observation(&observation(PodPhase::Running, true, None)),
            ServerStatus::Running
        );
        assert_eq!(
            status_from_observation(&observation(PodPhase::Running, false, None)),
            ServerStatus::Starting
        );
        assert_eq!(
            status_from_observation(&observation(PodPhase::Succeeded, false, None)),
            ServerStatus::Stopped
        );
        assert_eq!(
            status_from_observation(&observation(PodPhase::Failed, false, None)),
            ServerStatus::Failed
        );
        assert_eq!(
            status_from_observation(&observation(
                PodPhase::Pending,
                false,
                Some("ImagePullBackOff")
            )),
            ServerStatus::Pending(Some("ImagePullBackOff".to_string()))
        );
    }
}
