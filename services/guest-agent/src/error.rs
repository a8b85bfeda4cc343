//! Error types for the guest agent.

use kiln_agent_api::{AgentApiError, WorkloadType};
use kiln_bus::BusError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GuestError {
    /// A required `kiln.*` kernel parameter is absent.
    #[error("missing kernel parameter {0}")]
    MissingParameter(&'static str),

    #[error("invalid kernel parameter {name}: {reason}")]
    InvalidParameter { name: &'static str, reason: String },

    /// The host never acknowledged the handshake.
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("bus error: {0}")]
    Bus(#[from] BusError),

    #[error("malformed control request: {0}")]
    MalformedRequest(#[from] AgentApiError),

    /// The agent is shutting down and takes no new work.
    #[error("guest agent is shutting down")]
    ShuttingDown,

    #[error("{0} workloads cannot run in this guest")]
    UnsupportedType(WorkloadType),

    #[error("a workload is already deployed")]
    AlreadyDeployed,

    #[error("no workload is deployed")]
    NotDeployed,

    #[error("{workload_type} workloads do not support {operation}")]
    UnsupportedOperation {
        workload_type: WorkloadType,
        operation: &'static str,
    },

    #[error("workload failed to start: {0}")]
    WorkloadStartFailed(String),

    #[error("execution failed: {0}")]
    Execute(String),

    #[error("workload failed to stop: {0}")]
    StopFailed(String),
}
