//! # Archon Supervisor
//!
//! Lifecycle management for MCP server workloads. A [`Supervisor`] tracks
//! running instances, throttles start/stop operations, synthesizes pod
//! manifests per server type, and reconciles tracked state against the
//! backend. The [`Dispatcher`] detects the execution environment once
//! (sidecar, Kubernetes, local Docker, or nothing) and binds the matching
//! backend for the life of the process.

pub mod backend;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod instance;
pub mod manifest;
pub mod response;
pub mod supervisor;

pub use backend::{PodDriver, PodObservation, PodPhase};
pub use backend::docker::DockerDriver;
pub use backend::kubernetes::KubernetesDriver;
pub use backend::sidecar::SidecarClient;
pub use config::{PodSecurity, ResourceLimits, ServerConfig, ServerType, SupervisorConfig, TransportMode};
pub use dispatcher::{Backend, DeploymentBinding, DeploymentMode, Dispatcher, DispatcherSettings};
pub use error::{SupervisorError, SupervisorResult};
pub use instance::{ServerInstance, ServerStatus};
pub use response::ControlResponse;
pub use supervisor::Supervisor;
