//! Firecracker implementation of [`Runtime`].
//!
//! Each VM gets a `vm/` directory inside its workspace holding the API socket
//! and a private copy of the root filesystem.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use kiln_id::MachineId;
use tokio::process::{Child, Command};
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::runtime::{MachineSpec, Runtime, VmHandle};

use super::api::FirecrackerClient;
use super::config::VmConfig;

const SOCKET_WAIT: Duration = Duration::from_secs(5);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct FirecrackerRuntimeConfig {
    pub firecracker_path: PathBuf,
}

impl Default for FirecrackerRuntimeConfig {
    fn default() -> Self {
        Self {
            firecracker_path: PathBuf::from("/usr/bin/firecracker"),
        }
    }
}

struct InstanceState {
    process: Child,
    client: FirecrackerClient,
    vm_dir: PathBuf,
}

pub struct FirecrackerRuntime {
    config: FirecrackerRuntimeConfig,
    instances: RwLock<HashMap<MachineId, InstanceState>>,
    boot_counter: AtomicU64,
}

impl FirecrackerRuntime {
    pub fn new(config: FirecrackerRuntimeConfig) -> Self {
        Self {
            config,
            instances: RwLock::new(HashMap::new()),
            boot_counter: AtomicU64::new(0),
        }
    }

    fn next_boot_id(&self) -> String {
        let counter = self.boot_counter.fetch_add(1, Ordering::SeqCst);
        format!("boot_{:016x}", counter)
    }

    fn vm_dir(spec: &MachineSpec) -> PathBuf {
        spec.workspace.join("vm")
    }

    async fn spawn_firecracker(&self, machine_id: &MachineId, socket_path: &Path) -> Result<Child> {
        if socket_path.exists() {
            std::fs::remove_file(socket_path).ok();
        }

        let child = Command::new(&self.config.firecracker_path)
            .arg("--api-sock")
            .arg(socket_path)
            .arg("--id")
            .arg(machine_id.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| {
                format!(
                    "failed to spawn {}",
                    self.config.firecracker_path.display()
                )
            })?;

        let deadline = tokio::time::Instant::now() + SOCKET_WAIT;
        while !socket_path.exists() {
            if tokio::time::Instant::now() >= deadline {
                return Err(anyhow!("Firecracker socket did not appear"));
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        Ok(child)
    }

    async fn configure_and_boot(&self, client: &FirecrackerClient, config: &VmConfig) -> Result<()> {
        client.put_machine_config(&config.machine).await?;
        client.put_boot_source(&config.boot_source).await?;
        for drive in &config.drives {
            client.put_drive(drive).await?;
        }
        for iface in &config.network_interfaces {
            client.put_network_interface(iface).await?;
        }
        client.start_instance().await?;
        Ok(())
    }

    /// Stages the root filesystem in `vm_dir`, spawns Firecracker and boots
    /// the guest. A process spawned here is killed before an error returns.
    async fn boot(&self, spec: &MachineSpec, vm_dir: &Path) -> Result<(Child, FirecrackerClient)> {
        let rootfs = vm_dir.join("rootfs.ext4");
        tokio::fs::copy(&spec.rootfs_file, &rootfs)
            .await
            .with_context(|| format!("failed to copy {}", spec.rootfs_file.display()))?;

        let socket_path = vm_dir.join("firecracker.socket");
        let mut process = self.spawn_firecracker(&spec.machine_id, &socket_path).await?;
        let client = FirecrackerClient::new(&socket_path);

        let config = VmConfig::from_spec(spec, rootfs);
        if let Err(e) = self.configure_and_boot(&client, &config).await {
            error!(machine_id = %spec.machine_id, error = %e, "Failed to configure VM");
            process.kill().await.ok();
            return Err(e);
        }
        Ok((process, client))
    }
}

#[async_trait]
impl Runtime for FirecrackerRuntime {
    async fn start_vm(&self, spec: &MachineSpec) -> Result<VmHandle> {
        let machine_id = spec.machine_id;
        info!(machine_id = %machine_id, "Starting Firecracker VM");

        let vm_dir = Self::vm_dir(spec);
        tokio::fs::create_dir_all(&vm_dir).await?;

        // Nothing staged for a VM that never booted outlives the attempt.
        let (process, client) = match self.boot(spec, &vm_dir).await {
            Ok(booted) => booted,
            Err(e) => {
                if let Err(cleanup) = tokio::fs::remove_dir_all(&vm_dir).await {
                    warn!(machine_id = %machine_id, error = %cleanup, "Failed to remove VM directory");
                }
                return Err(e);
            }
        };

        let pid = process.id();
        let boot_id = self.next_boot_id();
        debug!(machine_id = %machine_id, boot_id = %boot_id, pid = ?pid, "VM booted");

        self.instances.write().await.insert(
            machine_id,
            InstanceState {
                process,
                client,
                vm_dir,
            },
        );

        Ok(VmHandle {
            machine_id,
            boot_id,
            pid,
        })
    }

    async fn stop_vm(&self, handle: &VmHandle) -> Result<()> {
        let machine_id = handle.machine_id;
        info!(machine_id = %machine_id, "Stopping Firecracker VM");

        let state = self
            .instances
            .write()
            .await
            .remove(&machine_id)
            .ok_or_else(|| anyhow!("Instance not found: {}", machine_id))?;

        let mut process = state.process;
        match state.client.send_ctrl_alt_del().await {
            Ok(()) => {
                debug!(machine_id = %machine_id, "Sent CtrlAltDel");
                if tokio::time::timeout(SHUTDOWN_GRACE, process.wait())
                    .await
                    .is_err()
                {
                    debug!(machine_id = %machine_id, "Guest did not halt in time");
                }
            }
            Err(e) => {
                warn!(machine_id = %machine_id, error = %e, "CtrlAltDel failed, will force kill");
            }
        }

        if matches!(process.try_wait(), Ok(None)) {
            if let Err(e) = process.kill().await {
                warn!(machine_id = %machine_id, error = %e, "Failed to kill process");
            }
        }

        if let Err(e) = std::fs::remove_dir_all(&state.vm_dir) {
            warn!(machine_id = %machine_id, error = %e, "Failed to remove VM directory");
        }

        Ok(())
    }

    async fn check_vm_health(&self, handle: &VmHandle) -> Result<bool> {
        let instances = self.instances.read().await;
        let state = instances
            .get(&handle.machine_id)
            .ok_or_else(|| anyhow!("Instance not found: {}", handle.machine_id))?;

        match state.client.get_instance_info().await {
            Ok(info) => Ok(info.state == "Running"),
            Err(_) => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MachineTemplate, NodeConfigFile, NodeConfiguration};

    #[test]
    fn test_boot_id_generation() {
        let runtime = FirecrackerRuntime::new(FirecrackerRuntimeConfig::default());
        let id1 = runtime.next_boot_id();
        let id2 = runtime.next_boot_id();
        assert!(id1.starts_with("boot_"));
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_vm_dir_inside_workspace() {
        let config = NodeConfiguration::resolve(NodeConfigFile {
            default_resource_dir: Some("/opt/kiln".into()),
            work_dir: Some("/var/lib/kiln".into()),
            ..Default::default()
        })
        .unwrap();
        let spec = MachineSpec::from_config(&config, MachineId::new(), MachineTemplate::default());

        let dir = FirecrackerRuntime::vm_dir(&spec);
        assert!(dir.starts_with("/var/lib/kiln"));
        assert!(dir.ends_with("vm"));
    }

    #[tokio::test]
    async fn test_start_fails_without_rootfs() {
        let work = tempfile::tempdir().unwrap();
        let config = NodeConfiguration::resolve(NodeConfigFile {
            default_resource_dir: Some(work.path().join("missing")),
            work_dir: Some(work.path().to_path_buf()),
            ..Default::default()
        })
        .unwrap();
        let spec = MachineSpec::from_config(&config, MachineId::new(), MachineTemplate::default());

        let runtime = FirecrackerRuntime::new(FirecrackerRuntimeConfig::default());
        assert!(runtime.start_vm(&spec).await.is_err());
    }

    #[tokio::test]
    async fn test_failed_starts_leave_no_rootfs_copies() {
        let work = tempfile::tempdir().unwrap();
        let resources = work.path().join("resources");
        std::fs::create_dir_all(&resources).unwrap();
        std::fs::write(resources.join("rootfs.ext4"), vec![0u8; 4096]).unwrap();
        let config = NodeConfiguration::resolve(NodeConfigFile {
            default_resource_dir: Some(resources),
            work_dir: Some(work.path().join("machines")),
            ..Default::default()
        })
        .unwrap();

        let runtime = FirecrackerRuntime::new(FirecrackerRuntimeConfig {
            firecracker_path: work.path().join("no-such-firecracker"),
        });
        for _ in 0..3 {
            let spec =
                MachineSpec::from_config(&config, MachineId::new(), MachineTemplate::default());
            let err = runtime.start_vm(&spec).await.unwrap_err();
            assert!(format!("{err:#}").contains("failed to spawn"));
            assert!(!FirecrackerRuntime::vm_dir(&spec).exists());
        }
        assert!(runtime.instances.read().await.is_empty());
    }

    #[tokio::test]
    async fn test_stop_unknown_vm_is_an_error() {
        let runtime = FirecrackerRuntime::new(FirecrackerRuntimeConfig::default());
        let handle = VmHandle {
            machine_id: MachineId::new(),
            boot_id: "boot_0".to_string(),
            pid: None,
        };
        assert!(runtime.stop_vm(&handle).await.is_err());
    }
}
