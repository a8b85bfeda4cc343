//! VM runtime interface and mock implementation.
//!
//! The runtime owns the micro-VM processes themselves: starting a VM with a
//! given shape, stopping it, and checking its health. The pool manager only ever sees a
//! [`VmHandle`].
//!
//! [`MockRuntime`] stands in for Firecracker in tests and development. It can
//! run a real guest agent in-process for each VM, attached to the internal
//! bus, so the whole warm-pool and workload path runs without a hypervisor.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use kiln_guest_agent::{GuestAgent, GuestConfig};
use kiln_id::MachineId;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::bus::MessageBus;
use crate::config::{CniDefinition, Limiters, MachineTemplate, NodeConfiguration};

/// Everything the runtime needs to boot one VM.
#[derive(Debug, Clone)]
pub struct MachineSpec {
    pub machine_id: MachineId,
    pub template: MachineTemplate,
    pub kernel_file: PathBuf,
    pub rootfs_file: PathBuf,
    pub cni: CniDefinition,
    pub rate_limiters: Option<Limiters>,
    /// Host bus address the guest agent dials.
    pub internal_node_host: String,
    pub internal_node_port: u16,
    /// Prefix of the internal subjects the guest agent speaks on.
    pub internal_prefix: String,
    /// Interpreter the guest agent runs JavaScript workloads with.
    pub js_interpreter: PathBuf,
    /// Per-VM scratch directory on the host.
    pub workspace: PathBuf,
}

impl MachineSpec {
    pub fn from_config(
        config: &NodeConfiguration,
        machine_id: MachineId,
        template: MachineTemplate,
    ) -> Self {
        Self {
            machine_id,
            template,
            kernel_file: config.kernel_file.clone(),
            rootfs_file: config.rootfs_file.clone(),
            cni: config.cni.clone(),
            rate_limiters: config.rate_limiters,
            internal_node_host: config.internal_node_host.clone(),
            internal_node_port: config.internal_node_port,
            internal_prefix: config.internal_subject_prefix.clone(),
            js_interpreter: config.js_interpreter.clone(),
            workspace: config.work_dir.join(machine_id.to_string()),
        }
    }
}

/// Handle to a running VM.
#[derive(Debug, Clone)]
pub struct VmHandle {
    pub machine_id: MachineId,

    /// Boot ID (unique per boot).
    pub boot_id: String,

    /// Hypervisor process id, when there is one.
    pub pid: Option<u32>,
}

/// VM runtime interface.
#[async_trait]
pub trait Runtime: Send + Sync {
    /// Start a VM described by `spec`.
    async fn start_vm(&self, spec: &MachineSpec) -> Result<VmHandle>;

    /// Stop a running VM.
    async fn stop_vm(&self, handle: &VmHandle) -> Result<()>;

    /// Check if a VM is healthy.
    async fn check_vm_health(&self, handle: &VmHandle) -> Result<bool>;
}

/// An in-process guest agent standing in for one VM.
struct MockGuest {
    agent: Arc<GuestAgent>,
    task: JoinHandle<()>,
}

/// Mock runtime for testing and development.
pub struct MockRuntime {
    boot_counter: AtomicU64,
    stop_counter: AtomicU64,
    fail_starts: AtomicBool,
    start_delay: Duration,
    /// Bus the in-process guests attach to; `None` boots VMs with no guest.
    guest_bus: Option<Arc<dyn MessageBus>>,
    guests: Mutex<HashMap<MachineId, MockGuest>>,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self {
            boot_counter: AtomicU64::new(0),
            stop_counter: AtomicU64::new(0),
            fail_starts: AtomicBool::new(false),
            start_delay: Duration::from_millis(10),
            guest_bus: None,
            guests: Mutex::new(HashMap::new()),
        }
    }

    /// Create a mock runtime that fails all starts.
    pub fn failing() -> Self {
        let runtime = Self::new();
        runtime.fail_starts.store(true, Ordering::SeqCst);
        runtime
    }

    /// Runs a guest agent for every VM it starts, connected to `bus`. The
    /// agent handshakes and serves deploy, execute and undeploy as it would
    /// inside a real VM, with its workload staged under the VM's workspace.
    pub fn with_guest_agent(mut self, bus: Arc<dyn MessageBus>) -> Self {
        self.guest_bus = Some(bus);
        self
    }

    /// How long each start takes before the VM is reported booted.
    pub fn with_start_delay(mut self, delay: Duration) -> Self {
        self.start_delay = delay;
        self
    }

    pub fn set_fail_starts(&self, fail: bool) {
        self.fail_starts.store(fail, Ordering::SeqCst);
    }

    /// Successful starts so far.
    pub fn starts(&self) -> u64 {
        self.boot_counter.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> u64 {
        self.stop_counter.load(Ordering::SeqCst)
    }

    /// Guest agents currently running.
    pub fn running_guests(&self) -> usize {
        self.guests.lock().map(|guests| guests.len()).unwrap_or(0)
    }

    fn next_boot_id(&self) -> String {
        let counter = self.boot_counter.fetch_add(1, Ordering::SeqCst);
        format!("boot_{:016x}", counter)
    }

    fn spawn_guest(&self, bus: &Arc<dyn MessageBus>, spec: &MachineSpec) -> Result<()> {
        let config = GuestConfig::new(
            spec.machine_id,
            &spec.internal_prefix,
            spec.workspace.join("workload"),
        )
        .with_js_interpreter(spec.js_interpreter.clone());
        let agent = Arc::new(GuestAgent::new(config, Arc::clone(bus)));

        let machine_id = spec.machine_id;
        let task = tokio::spawn({
            let agent = Arc::clone(&agent);
            async move {
                if let Err(e) = agent.run().await {
                    warn!(machine_id = %machine_id, error = %e, "[MOCK] Guest agent stopped");
                }
            }
        });

        self.guests
            .lock()
            .map_err(|_| anyhow!("mock guest table poisoned"))?
            .insert(machine_id, MockGuest { agent, task });
        Ok(())
    }

    fn guest_is_running(&self, machine_id: &MachineId) -> bool {
        self.guests
            .lock()
            .map(|guests| guests.get(machine_id).is_some_and(|g| !g.task.is_finished()))
            .unwrap_or(false)
    }

    fn take_guest(&self, machine_id: &MachineId) -> Option<MockGuest> {
        self.guests.lock().ok()?.remove(machine_id)
    }
}

impl Default for MockRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Runtime for MockRuntime {
    async fn start_vm(&self, spec: &MachineSpec) -> Result<VmHandle> {
        if self.fail_starts.load(Ordering::SeqCst) {
            anyhow::bail!("Mock runtime configured to fail");
        }

        info!(
            machine_id = %spec.machine_id,
            vcpus = spec.template.vcpu_count,
            memory_mib = spec.template.memsize_mib,
            "[MOCK] Starting VM"
        );

        tokio::time::sleep(self.start_delay).await;

        let boot_id = self.next_boot_id();
        debug!(machine_id = %spec.machine_id, boot_id = %boot_id, "[MOCK] VM started");

        if let Some(bus) = &self.guest_bus {
            self.spawn_guest(bus, spec)?;
        }

        Ok(VmHandle {
            machine_id: spec.machine_id,
            boot_id,
            pid: None,
        })
    }

    async fn stop_vm(&self, handle: &VmHandle) -> Result<()> {
        info!(
            machine_id = %handle.machine_id,
            boot_id = %handle.boot_id,
            "[MOCK] Stopping VM"
        );

        if let Some(guest) = self.take_guest(&handle.machine_id) {
            if let Err(e) = guest.agent.shutdown().await {
                warn!(machine_id = %handle.machine_id, error = %e, "[MOCK] Guest workload did not stop cleanly");
            }
            guest.task.abort();
        }

        tokio::time::sleep(Duration::from_millis(5)).await;
        self.stop_counter.fetch_add(1, Ordering::SeqCst);

        Ok(())
    }

    async fn check_vm_health(&self, handle: &VmHandle) -> Result<bool> {
        debug!(
            machine_id = %handle.machine_id,
            boot_id = %handle.boot_id,
            "[MOCK] Checking VM health"
        );
        Ok(self.guest_bus.is_none() || self.guest_is_running(&handle.machine_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::InMemoryBus;
    use crate::config::{NodeConfigFile, NodeConfiguration};
    use kiln_agent_api::{subjects, GuestReply, HandshakeRequest, HANDSHAKE_ACK};

    fn test_spec() -> MachineSpec {
        let config = NodeConfiguration::resolve(NodeConfigFile {
            default_resource_dir: Some("/opt/kiln".into()),
            ..Default::default()
        })
        .unwrap();
        MachineSpec::from_config(&config, MachineId::new(), MachineTemplate::default())
    }

    #[test]
    fn test_spec_workspace_is_per_machine() {
        let spec = test_spec();
        assert!(spec.workspace.ends_with(spec.machine_id.to_string()));
        assert_eq!(spec.kernel_file, PathBuf::from("/opt/kiln/vmlinux"));
    }

    #[tokio::test]
    async fn test_mock_runtime_start_and_stop() {
        let runtime = MockRuntime::new();
        let spec = test_spec();

        let handle = runtime.start_vm(&spec).await.unwrap();
        assert_eq!(handle.machine_id, spec.machine_id);
        assert!(handle.boot_id.starts_with("boot_"));
        assert!(runtime.check_vm_health(&handle).await.unwrap());

        runtime.stop_vm(&handle).await.unwrap();
        assert_eq!(runtime.starts(), 1);
        assert_eq!(runtime.stops(), 1);
    }

    #[tokio::test]
    async fn test_mock_runtime_failing() {
        let runtime = MockRuntime::failing();
        assert!(runtime.start_vm(&test_spec()).await.is_err());
        assert_eq!(runtime.starts(), 0);

        runtime.set_fail_starts(false);
        assert!(runtime.start_vm(&test_spec()).await.is_ok());
    }

    #[tokio::test]
    async fn test_mock_guest_handshakes_and_serves_control_requests() {
        let bus = Arc::new(InMemoryBus::new());
        let mut sub = bus
            .subscribe(&subjects::handshake_wildcard("agentint"))
            .await
            .unwrap();
        let runtime = MockRuntime::new().with_guest_agent(bus.clone());

        let work = tempfile::tempdir().unwrap();
        let mut spec = test_spec();
        spec.workspace = work.path().join(spec.machine_id.to_string());
        let handle = runtime.start_vm(&spec).await.unwrap();
        assert_eq!(runtime.running_guests(), 1);

        let msg = sub.next().await.unwrap();
        let request = HandshakeRequest::decode(&msg.payload).unwrap();
        assert_eq!(request.machine_id, spec.machine_id);
        msg.respond(HANDSHAKE_ACK.to_vec()).unwrap();

        // Undeploy with nothing deployed is answered by the guest.
        let reply = bus
            .request(
                &subjects::undeploy("agentint", &spec.machine_id),
                Vec::new(),
                Duration::from_secs(5),
            )
            .await
            .unwrap();
        assert!(GuestReply::decode(&reply).unwrap().ok);
        assert!(runtime.check_vm_health(&handle).await.unwrap());

        runtime.stop_vm(&handle).await.unwrap();
        assert_eq!(runtime.running_guests(), 0);
        assert!(!runtime.check_vm_health(&handle).await.unwrap());
    }
}
