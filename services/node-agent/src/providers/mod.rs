//! Execution providers.
//!
//! A provider is the node's side of one workload technology. It validates
//! the artifact on the host and then drives the workload inside the VM by
//! sending control requests to the guest agent over the internal bus. The
//! pool manager creates one per deployment through
//! [`new_execution_provider`] and keeps it for as long as the VM is running.

mod elf;
mod guest;
mod v8;
mod wasm;

pub use elf::ElfProvider;
pub use guest::GuestControl;
pub use v8::V8Provider;
pub use wasm::WasmProvider;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kiln_agent_api::{DeployRequest, WorkloadClaims, WorkloadType};
use kiln_id::MachineId;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::bus::MessageBus;

/// How long a guest may take to stage and start a workload.
pub const DEFAULT_DEPLOY_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_EXECUTE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("invalid execution provider specified: {0}")]
    InvalidProvider(String),

    #[error("{0} execution provider is not yet implemented")]
    UnimplementedProvider(WorkloadType),

    #[error("artifact validation failed: {0}")]
    Validation(String),

    #[error("deploy failed: {0}")]
    Deploy(String),

    #[error("undeploy failed: {0}")]
    Undeploy(String),

    #[error("{workload_type} workloads do not support {operation}")]
    UnsupportedOperation {
        workload_type: WorkloadType,
        operation: &'static str,
    },

    #[error("execution failed: {0}")]
    Execute(String),
}

/// Everything a provider needs to place one workload on one VM.
#[derive(Debug, Clone)]
pub struct ExecutionProviderParams {
    /// Raw type tag; resolved by [`new_execution_provider`].
    pub workload_type: Option<String>,
    pub artifact: Vec<u8>,
    /// Hex SHA-256 the artifact must match.
    pub artifact_hash: Option<String>,
    pub machine_id: MachineId,
    pub workload_name: String,
    pub namespace: String,
    pub claims: WorkloadClaims,
    pub environment: HashMap<String, String>,
    pub argv: Vec<String>,
}

impl ExecutionProviderParams {
    pub fn from_request(request: DeployRequest, machine_id: MachineId) -> Self {
        Self {
            workload_type: request.workload_type,
            artifact: request.artifact,
            artifact_hash: request.artifact_hash,
            machine_id,
            workload_name: request.workload_name,
            namespace: request.namespace,
            claims: request.claims,
            environment: request.environment,
            argv: request.argv,
        }
    }
}

/// Node-level collaborators shared by every provider.
#[derive(Clone)]
pub struct ProviderContext {
    /// Internal bus the guest agents listen on.
    pub bus: Arc<dyn MessageBus>,
    pub internal_prefix: String,
    pub deploy_timeout: Duration,
    /// Longest a guest may take to answer one function call.
    pub execute_timeout: Duration,
}

impl ProviderContext {
    pub fn new(bus: Arc<dyn MessageBus>, internal_prefix: &str) -> Self {
        Self {
            bus,
            internal_prefix: internal_prefix.to_string(),
            deploy_timeout: DEFAULT_DEPLOY_TIMEOUT,
            execute_timeout: DEFAULT_EXECUTE_TIMEOUT,
        }
    }

    pub fn with_execute_timeout(mut self, timeout: Duration) -> Self {
        self.execute_timeout = timeout;
        self
    }
}

/// Capability set every workload technology implements.
///
/// `validate` must succeed before `deploy`; the pool manager never deploys a
/// provider twice.
#[async_trait]
pub trait ExecutionProvider: Send + Sync {
    fn workload_type(&self) -> WorkloadType;

    /// Checks the artifact without side effects.
    async fn validate(&self) -> Result<(), ProviderError>;

    /// Starts the workload in the guest.
    async fn deploy(&self) -> Result<(), ProviderError>;

    /// Invokes a deployed function workload with one request.
    async fn execute(&self, subject: &str, payload: Vec<u8>) -> Result<Vec<u8>, ProviderError>;

    /// Stops the workload in the guest.
    async fn undeploy(&self) -> Result<(), ProviderError>;
}

/// Selects the provider for `params.workload_type`.
pub fn new_execution_provider(
    params: ExecutionProviderParams,
    ctx: ProviderContext,
) -> Result<Box<dyn ExecutionProvider>, ProviderError> {
    let tag = params
        .workload_type
        .as_deref()
        .ok_or_else(|| ProviderError::InvalidProvider("no workload type".to_string()))?;

    let workload_type: WorkloadType = tag
        .parse()
        .map_err(|_| ProviderError::InvalidProvider(tag.to_string()))?;

    match workload_type {
        WorkloadType::Elf => Ok(Box::new(ElfProvider::new(params, ctx))),
        WorkloadType::V8 => Ok(Box::new(V8Provider::new(params, ctx))),
        WorkloadType::Wasm => Ok(Box::new(WasmProvider::new(params, ctx))),
        WorkloadType::Oci => Err(ProviderError::UnimplementedProvider(workload_type)),
    }
}

/// Checks `artifact` against a hex SHA-256 digest, when one was supplied.
pub(crate) fn verify_digest(artifact: &[u8], expected: Option<&str>) -> Result<(), ProviderError> {
    let Some(expected) = expected else {
        return Ok(());
    };

    let actual = hex::encode(Sha256::digest(artifact));
    if actual.eq_ignore_ascii_case(expected.trim()) {
        Ok(())
    } else {
        Err(ProviderError::Validation(format!(
            "artifact digest mismatch: expected {expected}, got {actual}"
        )))
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::bus::InMemoryBus;
    use kiln_agent_api::{subjects, GuestReply};
    use tokio::sync::mpsc;

    pub fn params(workload_type: Option<&str>, artifact: Vec<u8>) -> ExecutionProviderParams {
        let mut request = DeployRequest::new(workload_type.unwrap_or_default(), "echo", artifact);
        request.workload_type = workload_type.map(str::to_string);
        ExecutionProviderParams::from_request(request, MachineId::new())
    }

    pub fn context() -> (Arc<InMemoryBus>, ProviderContext) {
        let bus = Arc::new(InMemoryBus::new());
        let ctx = ProviderContext::new(bus.clone(), "agentint");
        (bus, ctx)
    }

    /// A control request as the guest received it.
    #[derive(Debug)]
    pub struct Received {
        pub subject: String,
        pub payload: Vec<u8>,
    }

    /// Answers every control request for `machine_id` with `reply` and
    /// reports what arrived.
    pub async fn scripted_guest(
        bus: &InMemoryBus,
        machine_id: &MachineId,
        reply: fn(&str) -> GuestReply,
    ) -> mpsc::UnboundedReceiver<Received> {
        let pattern = format!("agentint.{machine_id}.*");
        let mut sub = bus.subscribe(&pattern).await.unwrap();
        let handshake = subjects::handshake("agentint", machine_id);
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Some(msg) = sub.next().await {
                if msg.subject == handshake {
                    continue;
                }
                let operation = msg.subject.rsplit('.').next().unwrap_or_default().to_string();
                tx.send(Received {
                    subject: msg.subject.clone(),
                    payload: msg.payload.clone(),
                })
                .ok();
                msg.respond(reply(&operation).encode()).ok();
            }
        });
        rx
    }
}
