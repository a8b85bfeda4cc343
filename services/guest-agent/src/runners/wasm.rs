//! WebAssembly function workloads, hosted in-process with wasmtime.
//!
//! Modules import `env.write(ptr, len)` to produce output. A call copies the
//! request payload into guest memory through an exported `alloc(len)` and
//! invokes `run(ptr, len)`; modules without `alloc` export a plain `run()`
//! (or `_start`). Each call runs on a blocking thread with a fresh fuel
//! budget.

use std::sync::{Arc, Mutex};

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use kiln_agent_api::{GuestDeploy, WorkloadType};
use tracing::{debug, info};
use wasmtime::{Caller, Config, Engine, Extern, Instance, Linker, Module, Store, Val};

use super::{RunnerContext, WorkloadRunner};
use crate::error::GuestError;

const MAX_OUTPUT_BYTES: usize = 16 * 1024 * 1024;

#[derive(Default)]
struct HostState {
    output: Vec<u8>,
}

struct Loaded {
    store: Store<HostState>,
    instance: Instance,
}

pub struct WasmRunner {
    deploy: GuestDeploy,
    ctx: RunnerContext,
    loaded: Arc<Mutex<Option<Loaded>>>,
}

impl WasmRunner {
    pub fn new(deploy: GuestDeploy, ctx: RunnerContext) -> Self {
        Self {
            deploy,
            ctx,
            loaded: Arc::new(Mutex::new(None)),
        }
    }
}

fn engine() -> anyhow::Result<Engine> {
    let mut config = Config::new();
    config.consume_fuel(true);
    Engine::new(&config)
}

/// `env.write(ptr, len)`: appends guest memory to the call's output.
fn host_write(mut caller: Caller<'_, HostState>, ptr: i32, len: i32) -> anyhow::Result<()> {
    let Some(Extern::Memory(memory)) = caller.get_export("memory") else {
        bail!("module does not export memory");
    };

    let start = usize::try_from(ptr).map_err(|_| anyhow!("negative pointer"))?;
    let len = usize::try_from(len).map_err(|_| anyhow!("negative length"))?;
    let bytes = memory
        .data(&caller)
        .get(start..start.saturating_add(len))
        .ok_or_else(|| anyhow!("write out of bounds"))?
        .to_vec();

    let output = &mut caller.data_mut().output;
    if output.len() + bytes.len() > MAX_OUTPUT_BYTES {
        bail!("output limit exceeded");
    }
    output.extend_from_slice(&bytes);
    Ok(())
}

fn instantiate(artifact: &[u8], fuel: u64) -> anyhow::Result<Loaded> {
    let engine = engine()?;
    let module = Module::new(&engine, artifact)?;

    let mut linker = Linker::new(&engine);
    linker.func_wrap("env", "write", host_write)?;

    let mut store = Store::new(&engine, HostState::default());
    // Start functions run during instantiation and are metered too.
    store.set_fuel(fuel)?;
    let instance = linker.instantiate(&mut store, &module)?;

    Ok(Loaded { store, instance })
}

fn invoke(loaded: &mut Loaded, payload: &[u8], fuel: u64) -> anyhow::Result<Vec<u8>> {
    let Loaded { store, instance } = loaded;
    store.data_mut().output.clear();
    store.set_fuel(fuel)?;

    let run = instance
        .get_func(&mut *store, "run")
        .or_else(|| instance.get_func(&mut *store, "_start"))
        .ok_or_else(|| anyhow!("module exports neither run nor _start"))?;
    let ty = run.ty(&*store);
    let mut results: Vec<Val> = ty.results().map(|_| Val::I32(0)).collect();

    match ty.params().len() {
        0 => run.call(&mut *store, &[], &mut results)?,
        2 => {
            let alloc = instance
                .get_typed_func::<i32, i32>(&mut *store, "alloc")
                .map_err(|_| anyhow!("run(ptr, len) requires an exported alloc(len)"))?;
            let memory = instance
                .get_memory(&mut *store, "memory")
                .ok_or_else(|| anyhow!("module does not export memory"))?;

            let len = i32::try_from(payload.len()).map_err(|_| anyhow!("payload too large"))?;
            let ptr = alloc.call(&mut *store, len)?;
            let offset = usize::try_from(ptr).map_err(|_| anyhow!("alloc returned a negative pointer"))?;
            memory.write(&mut *store, offset, payload)?;

            run.call(&mut *store, &[Val::I32(ptr), Val::I32(len)], &mut results)?;
        }
        n => bail!("run takes {n} parameters, expected 0 or 2"),
    }

    Ok(std::mem::take(&mut store.data_mut().output))
}

/// Out-of-fuel traps are reported as such rather than as a bare trap code.
fn describe(err: anyhow::Error) -> String {
    match err.downcast_ref::<wasmtime::Trap>() {
        Some(wasmtime::Trap::OutOfFuel) => "fuel budget exhausted".to_string(),
        _ => format!("{err:#}"),
    }
}

#[async_trait]
impl WorkloadRunner for WasmRunner {
    fn workload_type(&self) -> WorkloadType {
        WorkloadType::Wasm
    }

    async fn start(&self) -> Result<(), GuestError> {
        let artifact = self.deploy.artifact.clone();
        let fuel = self.ctx.config.fuel_per_call;
        let loaded = Arc::clone(&self.loaded);

        tokio::task::spawn_blocking(move || {
            let mut slot = loaded
                .lock()
                .map_err(|_| GuestError::WorkloadStartFailed("instance lock poisoned".to_string()))?;
            if slot.is_some() {
                return Err(GuestError::AlreadyDeployed);
            }
            let instance =
                instantiate(&artifact, fuel).map_err(|e| GuestError::WorkloadStartFailed(describe(e)))?;
            *slot = Some(instance);
            Ok(())
        })
        .await
        .map_err(|e| GuestError::WorkloadStartFailed(format!("instantiate task failed: {e}")))??;

        info!(
            machine_id = %self.ctx.config.machine_id,
            workload = %self.deploy.workload_name,
            "Wasm workload instantiated"
        );
        Ok(())
    }

    async fn execute(&self, subject: &str, payload: Vec<u8>) -> Result<Vec<u8>, GuestError> {
        debug!(machine_id = %self.ctx.config.machine_id, subject, bytes = payload.len(), "Invoking Wasm workload");

        let fuel = self.ctx.config.fuel_per_call;
        let loaded = Arc::clone(&self.loaded);

        tokio::task::spawn_blocking(move || {
            let mut slot = loaded
                .lock()
                .map_err(|_| GuestError::Execute("instance lock poisoned".to_string()))?;
            let instance = slot.as_mut().ok_or(GuestError::NotDeployed)?;
            invoke(instance, &payload, fuel).map_err(|e| GuestError::Execute(describe(e)))
        })
        .await
        .map_err(|e| GuestError::Execute(format!("execution task failed: {e}")))?
    }

    async fn stop(&self) -> Result<(), GuestError> {
        let loaded = self
            .loaded
            .lock()
            .map_err(|_| GuestError::StopFailed("instance lock poisoned".to_string()))?
            .take();
        drop(loaded);
        Ok(())
    }
}
