//! In-guest workload runners.
//!
//! A runner owns one deployed workload inside the VM: it stages the artifact,
//! starts it, feeds it calls and stops it. Output goes to the VM's internal
//! log subject and a workload that ends on its own is reported with a
//! `workload_stopped` event.

mod elf;
mod v8;
mod wasm;

pub use elf::ElfRunner;
pub use v8::V8Runner;
pub use wasm::WasmRunner;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use kiln_agent_api::{subjects, GuestDeploy, LogEntry, WorkloadType};
use kiln_bus::MessageBus;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::GuestConfig;
use crate::error::GuestError;

/// What a runner shares with the rest of the agent.
#[derive(Clone)]
pub struct RunnerContext {
    pub config: Arc<GuestConfig>,
    pub bus: Arc<dyn MessageBus>,
}

#[async_trait]
pub trait WorkloadRunner: Send + Sync {
    fn workload_type(&self) -> WorkloadType;

    /// Stages and starts the workload.
    async fn start(&self) -> Result<(), GuestError>;

    /// Invokes a function workload with one request.
    async fn execute(&self, subject: &str, payload: Vec<u8>) -> Result<Vec<u8>, GuestError>;

    /// Stops the workload and removes what `start` staged. Stopping a runner
    /// that is not running is a no-op.
    async fn stop(&self) -> Result<(), GuestError>;
}

/// Selects the runner for `deploy.workload_type`.
pub fn new_runner(
    deploy: GuestDeploy,
    ctx: RunnerContext,
) -> Result<Box<dyn WorkloadRunner>, GuestError> {
    match deploy.workload_type {
        WorkloadType::Elf => Ok(Box::new(ElfRunner::new(deploy, ctx))),
        WorkloadType::V8 => Ok(Box::new(V8Runner::new(deploy, ctx))),
        WorkloadType::Wasm => Ok(Box::new(WasmRunner::new(deploy, ctx))),
        WorkloadType::Oci => Err(GuestError::UnsupportedType(WorkloadType::Oci)),
    }
}

/// Writes a file into the work directory, creating it if needed.
pub(crate) async fn stage_file(
    work_dir: &Path,
    name: &str,
    contents: &[u8],
    mode: u32,
) -> std::io::Result<PathBuf> {
    use std::os::unix::fs::PermissionsExt;

    tokio::fs::create_dir_all(work_dir).await?;
    let path = work_dir.join(name);
    tokio::fs::write(&path, contents).await?;
    tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode)).await?;
    Ok(path)
}

pub(crate) async fn remove_staged(path: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_file(path).await {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Publishes each line of `reader` on the VM's internal log subject.
pub(crate) fn spawn_log_pump<R>(
    reader: R,
    ctx: &RunnerContext,
    to_entry: fn(String) -> LogEntry,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let bus = Arc::clone(&ctx.bus);
    let machine_id = ctx.config.machine_id;
    let subject = subjects::logs(&ctx.config.internal_prefix, &machine_id);

    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if let Err(e) = bus.publish(&subject, to_entry(line).encode()).await {
                        warn!(machine_id = %machine_id, error = %e, "Failed to publish workload output");
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    debug!(machine_id = %machine_id, error = %e, "Workload output closed");
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::collections::HashMap;

    use super::*;
    use kiln_bus::InMemoryBus;
    use kiln_id::MachineId;

    pub fn deploy(workload_type: WorkloadType, artifact: Vec<u8>) -> GuestDeploy {
        GuestDeploy {
            workload_type,
            workload_name: "echo".to_string(),
            artifact,
            environment: HashMap::new(),
            argv: Vec::new(),
        }
    }

    pub fn context(work_dir: &Path) -> (Arc<InMemoryBus>, RunnerContext) {
        let bus = Arc::new(InMemoryBus::new());
        let config = GuestConfig::new(MachineId::new(), "agentint", work_dir);
        let ctx = RunnerContext {
            config: Arc::new(config),
            bus: bus.clone(),
        };
        (bus, ctx)
    }
}
