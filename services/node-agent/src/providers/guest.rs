//! Control channel to the guest agent of one VM.
//!
//! Each operation is a request on `{internal}.{vmId}.{deploy|execute|undeploy}`
//! answered with a [`GuestReply`]. A request that nobody answers, or answers
//! too late, fails the operation.

use std::time::Duration;

use kiln_agent_api::{subjects, GuestDeploy, GuestExecute, GuestReply, WorkloadType};
use kiln_id::MachineId;
use tracing::debug;

use super::{ExecutionProviderParams, ProviderContext, ProviderError};

pub struct GuestControl {
    ctx: ProviderContext,
    machine_id: MachineId,
}

impl GuestControl {
    pub fn new(ctx: ProviderContext, machine_id: MachineId) -> Self {
        Self { ctx, machine_id }
    }

    async fn call(&self, subject: String, payload: Vec<u8>, timeout: Duration) -> Result<Vec<u8>, String> {
        debug!(machine_id = %self.machine_id, subject = %subject, bytes = payload.len(), "Sending control request to guest");
        let reply = self
            .ctx
            .bus
            .request(&subject, payload, timeout)
            .await
            .map_err(|e| format!("guest unreachable: {e}"))?;
        GuestReply::decode(&reply)
            .map_err(|e| e.to_string())?
            .into_result()
    }

    /// Ships the artifact and launch settings to the guest and waits for the
    /// workload to start.
    pub async fn deploy(
        &self,
        workload_type: WorkloadType,
        params: &ExecutionProviderParams,
    ) -> Result<(), ProviderError> {
        let request = GuestDeploy {
            workload_type,
            workload_name: params.workload_name.clone(),
            artifact: params.artifact.clone(),
            environment: params.environment.clone(),
            argv: params.argv.clone(),
        };
        self.call(
            subjects::deploy(&self.ctx.internal_prefix, &self.machine_id),
            request.encode(),
            self.ctx.deploy_timeout,
        )
        .await
        .map(|_| ())
        .map_err(ProviderError::Deploy)
    }

    /// Function workloads only; anything else is refused without a round
    /// trip.
    pub async fn execute(
        &self,
        workload_type: WorkloadType,
        subject: &str,
        payload: Vec<u8>,
    ) -> Result<Vec<u8>, ProviderError> {
        if !workload_type.is_function() {
            return Err(ProviderError::UnsupportedOperation {
                workload_type,
                operation: "execute",
            });
        }
        self.call(
            subjects::execute(&self.ctx.internal_prefix, &self.machine_id),
            GuestExecute::new(subject, payload).encode(),
            self.ctx.execute_timeout,
        )
        .await
        .map_err(ProviderError::Execute)
    }

    pub async fn undeploy(&self) -> Result<(), ProviderError> {
        self.call(
            subjects::undeploy(&self.ctx.internal_prefix, &self.machine_id),
            Vec::new(),
            self.ctx.deploy_timeout,
        )
        .await
        .map(|_| ())
        .map_err(ProviderError::Undeploy)
    }
}
