//! Kubernetes exec stream handler.
//!
//! Opens an exec channel to a running pod's container by upgrading the
//! `/exec` endpoint to a WebSocket with the `v4.channel.k8s.io` subprotocol.
//! Frames are channel-tagged: the first byte selects stdin (0, outbound),
//! stdout (1) or stderr (2); inbound frames on any other channel are
//! discarded. One reader task demultiplexes inbound frames into line-oriented
//! stdout/stderr queues, one writer task drains the stdin queue. The queue
//! handles are exposed as [`StdioPipes`] so the stdio adapter is oblivious to
//! the transport underneath.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex as SyncMutex;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{HeaderValue, AUTHORIZATION, SEC_WEBSOCKET_PROTOCOL};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async_tls_with_config, Connector};
use tracing::{debug, trace, warn};
use url::Url;

use crate::core::{AdapterError, AdapterResult, MESSAGE_QUEUE_CAPACITY};
use crate::stdio::StdioPipes;

/// Subprotocol carrying channel-tagged exec frames.
pub const EXEC_SUBPROTOCOL: &str = "v4.channel.k8s.io";

/// Outbound stdin channel byte.
pub const CHANNEL_STDIN: u8 = 0;
/// Inbound stdout channel byte.
pub const CHANNEL_STDOUT: u8 = 1;
/// Inbound stderr channel byte.
pub const CHANNEL_STDERR: u8 = 2;

const SERVICE_ACCOUNT_TOKEN: &str = "/var/run/secrets/kubernetes.io/serviceaccount/token";
const SERVICE_ACCOUNT_CA: &str = "/var/run/secrets/kubernetes.io/serviceaccount/ca.crt";

/// Credentials and endpoint for the cluster API server.
#[derive(Debug, Clone)]
pub struct KubeAuth {
    /// API server host
    pub host: String,
    /// API server port
    pub port: u16,
    /// Bearer token, when running with a service account
    pub token: Option<String>,
    /// Cluster CA bundle for TLS verification
    pub ca_cert_path: Option<PathBuf>,
}

impl KubeAuth {
    /// Load in-cluster credentials from the environment and the mounted
    /// service-account volume. Missing pieces degrade to `None` rather than
    /// failing; the API server will reject unauthenticated calls itself.
    pub fn in_cluster() -> Self {
        let host = std::env::var("KUBERNETES_SERVICE_HOST")
            .unwrap_or_else(|_| "kubernetes.default.svc".to_string());
        let port = std::env::var("KUBERNETES_SERVICE_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(443);

        let token = std::fs::read_to_string(SERVICE_ACCOUNT_TOKEN)
            .map(|t| t.trim().to_string())
            .ok();
        if token.is_none() {
            warn!("service account token not found; exec channel will be unauthenticated");
        }

        let ca_cert_path = Path::new(SERVICE_ACCOUNT_CA)
            .exists()
            .then(|| PathBuf::from(SERVICE_ACCOUNT_CA));

        Self {
            host,
            port,
            token,
            ca_cert_path,
        }
    }

    /// Build credentials explicitly (tests, out-of-cluster use).
    pub fn from_parts(
        host: impl Into<String>,
        port: u16,
        token: Option<String>,
        ca_cert_path: Option<PathBuf>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            token,
            ca_cert_path,
        }
    }
}

/// A pod container and the command to exec in it.
#[derive(Debug, Clone)]
pub struct ExecTarget {
    /// Namespace the pod lives in
    pub namespace: String,
    /// Pod name
    pub pod: String,
    /// Container name; the pod's first container when absent
    pub container: Option<String>,
    /// Command to execute
    pub command: Vec<String>,
}

impl ExecTarget {
    /// Target the given pod with an interactive shell.
    pub fn shell(namespace: impl Into<String>, pod: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            pod: pod.into(),
            container: None,
            command: vec!["/bin/sh".to_string()],
        }
    }

    /// Override the container name.
    #[must_use]
    pub fn container(mut self, container: impl Into<String>) -> Self {
        self.container = Some(container.into());
        self
    }

    /// Override the command.
    #[must_use]
    pub fn command(mut self, command: Vec<String>) -> Self {
        self.command = command;
        self
    }
}

/// Lifecycle state of an exec session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecStatus {
    /// Upgrade in progress
    Connecting,
    /// Channel established
    Connected,
    /// Channel closed cleanly
    Closed,
    /// Channel failed
    Error(String),
}

/// Prefix a payload with its channel byte.
pub fn encode_frame(channel: u8, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(payload.len() + 1);
    frame.push(channel);
    frame.extend_from_slice(payload);
    frame
}

/// Split an inbound frame into channel byte and payload. Empty frames carry
/// nothing and yield `None`.
pub fn decode_frame(frame: &[u8]) -> Option<(u8, &[u8])> {
    let (channel, payload) = frame.split_first()?;
    Some((*channel, payload))
}

/// Build the exec upgrade URL for a target.
pub fn exec_url(auth: &KubeAuth, target: &ExecTarget) -> AdapterResult<Url> {
    let base = format!(
        "wss://{}:{}/api/v1/namespaces/{}/pods/{}/exec",
        auth.host, auth.port, target.namespace, target.pod
    );
    let mut url = Url::parse(&base).map_err(|e| AdapterError::ConnectionFailed(e.to_string()))?;
    {
        let mut query = url.query_pairs_mut();
        query
            .append_pair("stdin", "true")
            .append_pair("stdout", "true")
            .append_pair("stderr", "true")
            .append_pair("tty", "false");
        if let Some(container) = &target.container {
            query.append_pair("container", container);
        }
        for part in &target.command {
            query.append_pair("command", part);
        }
    }
    Ok(url)
}

/// Accumulates byte chunks and yields complete newline-terminated lines.
#[derive(Debug, Default)]
struct LineAccumulator {
    buffer: String,
}

impl LineAccumulator {
    fn ingest(&mut self, payload: &[u8]) -> Vec<String> {
        self.buffer.push_str(&String::from_utf8_lossy(payload));
        let mut lines = Vec::new();
        while let Some(pos) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=pos).collect();
            let line = line.trim_end_matches(['\n', '\r']);
            if !line.is_empty() {
                lines.push(line.to_string());
            }
        }
        lines
    }
}

/// Route one inbound frame into the stdout/stderr accumulators. Frames on
/// unknown channels are discarded.
fn demux_frame(
    frame: &[u8],
    stdout_acc: &mut LineAccumulator,
    stderr_acc: &mut LineAccumulator,
) -> (Vec<String>, Vec<String>) {
    match decode_frame(frame) {
        Some((CHANNEL_STDOUT, payload)) => (stdout_acc.ingest(payload), Vec::new()),
        Some((CHANNEL_STDERR, payload)) => (Vec::new(), stderr_acc.ingest(payload)),
        Some((channel, _)) => {
            trace!(channel, "discarding frame on unknown channel");
            (Vec::new(), Vec::new())
        }
        None => (Vec::new(), Vec::new()),
    }
}

fn rustls_config(ca_path: &Path) -> AdapterResult<rustls::ClientConfig> {
    let pem = std::fs::read(ca_path)?;
    let mut reader = std::io::BufReader::new(pem.as_slice());
    let mut store = rustls::RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut reader) {
        let cert = cert.map_err(AdapterError::from)?;
        store
            .add(cert)
            .map_err(|e| AdapterError::ConnectionFailed(format!("invalid cluster CA: {e}")))?;
    }
    Ok(rustls::ClientConfig::builder()
        .with_root_certificates(store)
        .with_no_client_auth())
}

/// A live exec channel bound to a pod container.
#[derive(Debug)]
pub struct ExecSession {
    pod: String,
    status: Arc<SyncMutex<ExecStatus>>,
    tasks: SyncMutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl ExecSession {
    /// Pod this session is attached to.
    pub fn pod(&self) -> &str {
        &self.pod
    }

    /// Current session status.
    pub fn status(&self) -> ExecStatus {
        self.status.lock().clone()
    }

    /// Tear the channel down. Queue handles observe EOF.
    pub fn close(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        let mut status = self.status.lock();
        if *status == ExecStatus::Connected || *status == ExecStatus::Connecting {
            *status = ExecStatus::Closed;
        }
    }

    /// Open an exec channel and return the session plus the stdio queue
    /// handles to bind an adapter to.
    pub async fn open(auth: &KubeAuth, target: &ExecTarget) -> AdapterResult<(Self, StdioPipes)> {
        let url = exec_url(auth, target)?;
        debug!(pod = %target.pod, url = %url, "opening exec channel");

        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| AdapterError::ConnectionFailed(e.to_string()))?;
        request.headers_mut().insert(
            SEC_WEBSOCKET_PROTOCOL,
            HeaderValue::from_static(EXEC_SUBPROTOCOL),
        );
        if let Some(token) = &auth.token {
            let bearer = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| AdapterError::ConnectionFailed(e.to_string()))?;
            request.headers_mut().insert(AUTHORIZATION, bearer);
        }

        let connector = match &auth.ca_cert_path {
            Some(path) => Some(Connector::Rustls(Arc::new(rustls_config(path)?))),
            None => None,
        };

        let (stream, _response) = connect_async_tls_with_config(request, None, false, connector)
            .await
            .map_err(|e| AdapterError::ConnectionFailed(e.to_string()))?;
        let (mut sink, mut source) = stream.split();

        let status = Arc::new(SyncMutex::new(ExecStatus::Connected));
        let (stdin_tx, mut stdin_rx) = mpsc::channel::<String>(MESSAGE_QUEUE_CAPACITY);
        let (stdout_tx, stdout_rx) = mpsc::channel::<String>(MESSAGE_QUEUE_CAPACITY);
        let (stderr_tx, stderr_rx) = mpsc::channel::<String>(MESSAGE_QUEUE_CAPACITY);

        // Writer: drain the stdin queue, prefixing the channel byte.
        // Zero-length writes are dropped before they reach the wire.
        let writer_status = Arc::clone(&status);
        let writer_pod = target.pod.clone();
        let writer = tokio::spawn(async move {
            while let Some(frame) = stdin_rx.recv().await {
                if frame.is_empty() {
                    continue;
                }
                let message = Message::Binary(encode_frame(CHANNEL_STDIN, frame.as_bytes()));
                if let Err(e) = sink.send(message).await {
                    warn!(pod = %writer_pod, error = %e, "exec stdin write failed");
                    *writer_status.lock() = ExecStatus::Error(e.to_string());
                    break;
                }
            }
        });

        // Reader: demultiplex channel-tagged frames into the line queues.
        let reader_status = Arc::clone(&status);
        let reader_pod = target.pod.clone();
        let reader = tokio::spawn(async move {
            let mut stdout_acc = LineAccumulator::default();
            let mut stderr_acc = LineAccumulator::default();

            while let Some(message) = source.next().await {
                let payload = match message {
                    Ok(Message::Binary(data)) => data,
                    Ok(Message::Text(text)) => text.into_bytes(),
                    Ok(Message::Close(_)) => {
                        debug!(pod = %reader_pod, "exec channel closed by server");
                        break;
                    }
                    Ok(_) => continue,
                    Err(e) => {
                        warn!(pod = %reader_pod, error = %e, "exec channel read failed");
                        *reader_status.lock() = ExecStatus::Error(e.to_string());
                        break;
                    }
                };

                let (out_lines, err_lines) =
                    demux_frame(&payload, &mut stdout_acc, &mut stderr_acc);
                for line in out_lines {
                    if stdout_tx.send(line).await.is_err() {
                        return;
                    }
                }
                for line in err_lines {
                    if stderr_tx.send(line).await.is_err() {
                        return;
                    }
                }
            }

            let mut status = reader_status.lock();
            if *status == ExecStatus::Connected {
                *status = ExecStatus::Closed;
            }
            // Dropping stdout_tx/stderr_tx here drains readers with EOF.
        });

        let session = Self {
            pod: target.pod.clone(),
            status,
            tasks: SyncMutex::new(vec![writer, reader]),
        };
        let pipes = StdioPipes {
            stdin_tx,
            stdout_rx,
            stderr_rx: Some(stderr_rx),
        };
        Ok((session, pipes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_frame_round_trip() {
        let frame = encode_frame(CHANNEL_STDIN, b"{\"jsonrpc\":\"2.0\"}\n");
        assert_eq!(frame[0], 0);
        let (channel, payload) = decode_frame(&frame).unwrap();
        assert_eq!(channel, CHANNEL_STDIN);
        assert_eq!(payload, b"{\"jsonrpc\":\"2.0\"}\n");
    }

    #[test]
    fn test_empty_frame_decodes_to_none() {
        assert!(decode_frame(&[]).is_none());
        let (channel, payload) = decode_frame(&[2]).unwrap();
        assert_eq!(channel, CHANNEL_STDERR);
        assert!(payload.is_empty());
    }

    #[test]
    fn test_exec_url_query() {
        let auth = KubeAuth::from_parts("kubernetes.default.svc", 443, None, None);
        let target = ExecTarget::shell("archon", "mcp-brave-1700000000")
            .container("mcp-brave")
            .command(vec!["/bin/sh".to_string(), "-i".to_string()]);
        let url = exec_url(&auth, &target).unwrap();

        assert_eq!(url.scheme(), "wss");
        assert_eq!(
            url.path(),
            "/api/v1/namespaces/archon/pods/mcp-brave-1700000000/exec"
        );
        let query = url.query().unwrap();
        assert!(query.contains("stdin=true"));
        assert!(query.contains("stdout=true"));
        assert!(query.contains("stderr=true"));
        assert!(query.contains("tty=false"));
        assert!(query.contains("container=mcp-brave"));
        assert_eq!(query.matches("command=").count(), 2);
    }

    #[test]
    fn test_line_accumulator_reassembles_split_lines() {
        let mut acc = LineAccumulator::default();
        assert!(acc.ingest(b"{\"jsonrpc\":").is_empty());
        let lines = acc.ingest(b"\"2.0\"}\n{\"partial\":");
        assert_eq!(lines, vec!["{\"jsonrpc\":\"2.0\"}"]);
        let lines = acc.ingest(b"1}\n");
        assert_eq!(lines, vec!["{\"partial\":1}"]);
    }

    #[test]
    fn test_demux_routes_by_channel() {
        let mut stdout_acc = LineAccumulator::default();
        let mut stderr_acc = LineAccumulator::default();

        let (out, err) = demux_frame(
            &encode_frame(CHANNEL_STDOUT, b"out line\n"),
            &mut stdout_acc,
            &mut stderr_acc,
        );
        assert_eq!(out, vec!["out line"]);
        assert!(err.is_empty());

        let (out, err) = demux_frame(
            &encode_frame(CHANNEL_STDERR, b"err line\n"),
            &mut stdout_acc,
            &mut stderr_acc,
        );
        assert!(out.is_empty());
        assert_eq!(err, vec!["err line"]);
    }

    #[test]
    fn test_demux_discards_unknown_channels() {
        let mut stdout_acc = LineAccumulator::default();
        let mut stderr_acc = LineAccumulator::default();

        // Channel 3 (resize) and the outbound stdin channel are not ours.
        for channel in [CHANNEL_STDIN, 3u8, 255u8] {
            let (out, err) = demux_frame(
                &encode_frame(channel, b"ignored\n"),
                &mut stdout_acc,
                &mut stderr_acc,
            );
            assert!(out.is_empty());
            assert!(err.is_empty());
        }
    }

    #[test]
    fn test_auth_from_parts() {
        let auth = KubeAuth::from_parts("10.0.0.1", 6443, Some("tok".into()), None);
        assert_eq!(auth.host, "10.0.0.1");
        assert_eq!(auth.port, 6443);
        assert_eq!(auth.token.as_deref(), Some("tok"));
    }
}
