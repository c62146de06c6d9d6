//! Uniform response envelope for control-plane operations.

use archon_core::now_rfc3339;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::SupervisorError;

/// Envelope every control operation resolves to, successful or not.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlResponse {
    /// Whether the operation succeeded
    pub success: bool,
    /// Short machine-readable status label
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    /// Human-readable message
    pub message: String,
    /// Operation-specific payload
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Id of the server the operation concerned
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_id: Option<String>,
    /// RFC3339 UTC timestamp
    #[serde(default)]
    pub timestamp: String,
}

impl ControlResponse {
    /// Successful response with a status label and message.
    pub fn ok(status: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            success: true,
            status: Some(status.into()),
            message: message.into(),
            data: None,
            server_id: None,
            timestamp: now_rfc3339(),
        }
    }

    /// Failed response with a status label and message.
    pub fn failed(status: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            success: false,
            status: Some(status.into()),
            message: message.into(),
            data: None,
            server_id: None,
            timestamp: now_rfc3339(),
        }
    }

    /// Attach a payload.
    #[must_use]
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Attach the server id the operation concerned.
    #[must_use]
    pub fn with_server_id(mut self, server_id: impl Into<String>) -> Self {
        self.server_id = Some(server_id.into());
        self
    }

    /// Map an error into the envelope the HTTP surface returns.
    pub fn from_error(error: &SupervisorError) -> Self {
        let (status, server_id) = match error {
            SupervisorError::AlreadyRunning { server_id, .. } => {
                ("running".to_string(), Some(server_id.clone()))
            }
            SupervisorError::NotFound(_) => ("not_found".to_string(), None),
            SupervisorError::Unavailable => ("unavailable".to_string(), None),
            _ => ("error".to_string(), None),
        };
        Self {
            success: false,
            status: Some(status),
            message: error.to_string(),
            data: None,
            server_id,
            timestamp: now_rfc3339(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_ok_envelope() {
        let resp = ControlResponse::ok("starting", "pod created")
            .with_server_id("npx-brave-1700000000")
            .with_data(json!({"pod_name": "mcp-brave-1700000000"}));
        assert!(resp.success);
        assert_eq!(resp.status.as_deref(), Some("starting"));
        assert_eq!(resp.server_id.as_deref(), Some("npx-brave-1700000000"));
        assert!(!resp.timestamp.is_empty());
    }

    #[test]
    fn test_already_running_maps_to_running_status() {
        let err = SupervisorError::AlreadyRunning {
            server_id: "npx-brave-1700000000".into(),
            message: "Server npx:brave is already running".into(),
        };
        let resp = ControlResponse::from_error(&err);
        assert!(!resp.success);
        assert_eq!(resp.status.as_deref(), Some("running"));
        assert_eq!(resp.server_id.as_deref(), Some("npx-brave-1700000000"));
    }

    #[test]
    fn test_not_found_maps_to_not_found_status() {
        let resp = ControlResponse::from_error(&SupervisorError::NotFound("ghost".into()));
        assert_eq!(resp.status.as_deref(), Some("not_found"));
    }

    #[test]
    fn test_capacity_maps_to_error_status() {
        let resp = ControlResponse::from_error(&SupervisorError::ResourceExhausted { max: 2 });
        assert_eq!(resp.status.as_deref(), Some("error"));
        assert!(resp.message.contains("Maximum concurrent servers"));
    }
}
