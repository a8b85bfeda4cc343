//! WebAssembly function workloads.
//!
//! Modules are compiled once on the host to reject invalid bytecode before a
//! VM is spent on them; the guest agent instantiates and meters them.

use async_trait::async_trait;
use kiln_agent_api::WorkloadType;
use wasmtime::{Config, Engine, Module};

use super::{
    verify_digest, ExecutionProvider, ExecutionProviderParams, GuestControl, ProviderContext,
    ProviderError,
};

pub struct WasmProvider {
    params: ExecutionProviderParams,
    guest: GuestControl,
}

impl WasmProvider {
    pub fn new(params: ExecutionProviderParams, ctx: ProviderContext) -> Self {
        let guest = GuestControl::new(ctx, params.machine_id);
        Self { params, guest }
    }
}

/// Validation engine; matches the guest's fuel-metered configuration.
fn engine() -> anyhow::Result<Engine> {
    let mut config = Config::new();
    config.consume_fuel(true);
    Engine::new(&config)
}

#[async_trait]
impl ExecutionProvider for WasmProvider {
    fn workload_type(&self) -> WorkloadType {
        WorkloadType::Wasm
    }

    async fn validate(&self) -> Result<(), ProviderError> {
        verify_digest(&self.params.artifact, self.params.artifact_hash.as_deref())?;

        let engine = engine().map_err(|e| ProviderError::Validation(e.to_string()))?;
        Module::validate(&engine, &self.params.artifact)
            .map_err(|e| ProviderError::Validation(format!("invalid module: {e:#}")))
    }

    async fn deploy(&self) -> Result<(), ProviderError> {
        self.guest.deploy(WorkloadType::Wasm, &self.params).await
    }

    async fn execute(&self, subject: &str, payload: Vec<u8>) -> Result<Vec<u8>, ProviderError> {
        self.guest.execute(WorkloadType::Wasm, subject, payload).await
    }

    async fn undeploy(&self) -> Result<(), ProviderError> {
        self.guest.undeploy().await
    }
}
