//! Supervisor error taxonomy.
//!
//! Every backend surfaces the same kinds: validation and throttle errors
//! never touch the backend, idempotency signals (`AlreadyRunning`,
//! `NotFound`) are success-shaped for cleanup flows, and backend failures
//! keep their original HTTP status while the user-visible message is
//! truncated to a single line.

use archon_core::single_line;
use archon_transport::AdapterError;

/// Result type for supervisor operations
pub type SupervisorResult<T> = Result<T, SupervisorError>;

/// Errors surfaced by supervisor operations, uniform across backends
#[derive(Debug, Clone, thiserror::Error)]
pub enum SupervisorError {
    /// Malformed server configuration; never retried
    #[error("Invalid server configuration: {0}")]
    Validation(String),

    /// The deployment mode has no functional backend
    #[error("MCP management not available in current deployment mode")]
    Unavailable,

    /// Operation issued inside the minimum-interval window
    #[error("Please wait {:.1}s before issuing another operation", *.retry_after_ms as f64 / 1000.0)]
    Throttled {
        /// Remaining wait in milliseconds
        retry_after_ms: u64,
    },

    /// A server with the same type and name is already running
    #[error("{message}")]
    AlreadyRunning {
        /// Id of the existing instance
        server_id: String,
        /// Human-readable detail
        message: String,
    },

    /// The referenced server is not tracked
    #[error("Server {0} not found")]
    NotFound(String),

    /// Concurrent-server limit reached
    #[error("Maximum concurrent servers ({max}) reached")]
    ResourceExhausted {
        /// Configured limit
        max: usize,
    },

    /// Backend 5xx, connection reset, or timeout; retryable by the caller
    #[error("Backend error: {message}")]
    BackendTransient {
        /// HTTP status when one was observed
        status: Option<u16>,
        /// Single-line backend error
        message: String,
    },

    /// Backend 4xx (auth, quota); not retried
    #[error("Backend error ({status}): {message}")]
    BackendPermanent {
        /// HTTP status
        status: u16,
        /// Single-line backend error
        message: String,
    },

    /// Exec channel or WebSocket dropped mid-session
    #[error("Stream closed: {0}")]
    StreamClosed(String),

    /// Malformed frame or payload; the offender is dropped and logged
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Local IO failure
    #[error("IO error: {0}")]
    Io(String),
}

impl SupervisorError {
    /// Classify a backend HTTP failure, preserving the status code.
    pub fn from_backend_status(status: u16, body: &str) -> Self {
        let message = single_line(body);
        if status >= 500 {
            Self::BackendTransient {
                status: Some(status),
                message,
            }
        } else {
            Self::BackendPermanent { status, message }
        }
    }

    /// Network-level backend failure without an HTTP status.
    pub fn backend_transient(message: impl Into<String>) -> Self {
        Self::BackendTransient {
            status: None,
            message: single_line(&message.into()),
        }
    }

    /// Whether a retry of the same operation may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Throttled { .. } | Self::BackendTransient { .. } | Self::StreamClosed(_)
        )
    }

    /// Idempotency signals are treated as success by cleanup flows.
    pub fn is_idempotency_signal(&self) -> bool {
        matches!(self, Self::AlreadyRunning { .. } | Self::NotFound(_))
    }
}

impl From<std::io::Error> for SupervisorError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<AdapterError> for SupervisorError {
    fn from(err: AdapterError) -> Self {
        match err {
            AdapterError::Protocol(e) => Self::Protocol(e),
            e if e.is_terminal() => Self::StreamClosed(e.to_string()),
            e => Self::backend_transient(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_throttled_message_mentions_wait() {
        let err = SupervisorError::Throttled {
            retry_after_ms: 1500,
        };
        assert_eq!(
            err.to_string(),
            "Please wait 1.5s before issuing another operation"
        );
    }

    #[test]
    fn test_backend_status_classification() {
        let transient = SupervisorError::from_backend_status(503, "upstream unavailable");
        assert!(transient.is_retryable());
        assert!(matches!(
            transient,
            SupervisorError::BackendTransient {
                status: Some(503),
                ..
            }
        ));

        let permanent = SupervisorError::from_backend_status(403, "forbidden");
        assert!(!permanent.is_retryable());
        assert!(matches!(
            permanent,
            SupervisorError::BackendPermanent { status: 403, .. }
        ));
    }

    #[test]
    fn test_backend_messages_are_single_line() {
        let err = SupervisorError::from_backend_status(500, "first line\nsecond\nthird");
        match err {
            SupervisorError::BackendTransient { message, .. } => {
                assert_eq!(message, "first line");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_idempotency_signals() {
        assert!(SupervisorError::NotFound("x".into()).is_idempotency_signal());
        assert!(
            SupervisorError::AlreadyRunning {
                server_id: "npx-brave-1".into(),
                message: "Server npx:brave is already running".into(),
            }
            .is_idempotency_signal()
        );
        assert!(!SupervisorError::Unavailable.is_idempotency_signal());
    }

    #[test]
    fn test_adapter_error_conversion() {
        let err: SupervisorError = AdapterError::StreamClosed("exec eof".into()).into();
        assert!(matches!(err, SupervisorError::StreamClosed(_)));
        let err: SupervisorError = AdapterError::Protocol("bad frame".into()).into();
        assert!(matches!(err, SupervisorError::Protocol(_)));
        let err: SupervisorError = AdapterError::Timeout.into();
        assert!(matches!(err, SupervisorError::BackendTransient { .. }));
    }
}
