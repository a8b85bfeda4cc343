//! Firecracker API payloads and their construction from a [`MachineSpec`].

use std::path::PathBuf;

use kiln_id::MachineId;
use serde::{Deserialize, Serialize};

use crate::config::{Limiters, TokenBucket};
use crate::runtime::MachineSpec;

const BASE_BOOT_ARGS: &str = "console=ttyS0 reboot=k panic=1 pci=off";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineConfig {
    pub vcpu_count: u8,
    pub mem_size_mib: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub smt: Option<bool>,
}

impl MachineConfig {
    pub fn new(vcpu_count: u8, mem_size_mib: u32) -> Self {
        Self {
            vcpu_count,
            mem_size_mib,
            smt: Some(false),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootSource {
    pub kernel_image_path: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub boot_args: Option<String>,
}

impl BootSource {
    /// Boot source whose kernel command line tells the guest agent who it is
    /// and where the host bus lives.
    pub fn for_machine(kernel_image_path: PathBuf, spec: &MachineSpec) -> Self {
        Self {
            kernel_image_path,
            boot_args: Some(boot_args(spec)),
        }
    }
}

fn boot_args(spec: &MachineSpec) -> String {
    format!(
        "{BASE_BOOT_ARGS} kiln.vm_id={} kiln.host={} kiln.port={} kiln.prefix={} kiln.js={}",
        spec.machine_id,
        spec.internal_node_host,
        spec.internal_node_port,
        spec.internal_prefix,
        spec.js_interpreter.display()
    )
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriveConfig {
    pub drive_id: String,
    pub path_on_host: PathBuf,
    pub is_root_device: bool,
    pub is_read_only: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limiter: Option<RateLimiter>,
}

impl DriveConfig {
    /// The root filesystem drive. Each VM boots from its own copy, so it is
    /// writable.
    pub fn root_disk(path: PathBuf) -> Self {
        Self {
            drive_id: "rootfs".to_string(),
            path_on_host: path,
            is_root_device: true,
            is_read_only: false,
            rate_limiter: None,
        }
    }

    pub fn with_rate_limiter(mut self, limiter: Option<RateLimiter>) -> Self {
        self.rate_limiter = limiter;
        self
    }
}

/// Rate limiter for drives or network interfaces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimiter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bandwidth: Option<TokenBucket>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ops: Option<TokenBucket>,
}

impl RateLimiter {
    /// `None` when neither bucket is configured.
    pub fn from_limiters(limiters: &Limiters) -> Option<Self> {
        if limiters.bandwidth.is_none() && limiters.operations.is_none() {
            return None;
        }
        Some(Self {
            bandwidth: limiters.bandwidth,
            ops: limiters.operations,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkInterface {
    pub iface_id: String,
    /// Host tap device.
    pub host_dev_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub guest_mac: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rx_rate_limiter: Option<RateLimiter>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx_rate_limiter: Option<RateLimiter>,
}

/// Tap device name for a machine, within the 15 byte interface name limit.
pub fn tap_device_name(machine_id: &MachineId) -> String {
    let ulid = machine_id.ulid().to_string().to_lowercase();
    format!("kt{}", &ulid[ulid.len() - 12..])
}

/// Deterministic, locally administered unicast MAC for a machine.
pub fn generate_mac_address(machine_id: &MachineId) -> String {
    let bytes = machine_id.ulid().to_bytes();
    // Random part of the ULID sits in the trailing bytes.
    let tail = &bytes[bytes.len() - 5..];

    format!(
        "02:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        tail[0], tail[1], tail[2], tail[3], tail[4]
    )
}

/// Full Firecracker configuration for one VM.
#[derive(Debug, Clone)]
pub struct VmConfig {
    pub machine: MachineConfig,
    pub boot_source: BootSource,
    pub drives: Vec<DriveConfig>,
    pub network_interfaces: Vec<NetworkInterface>,
}

impl VmConfig {
    /// Builds the configuration; `rootfs` is the VM's private copy of the
    /// root filesystem image.
    pub fn from_spec(spec: &MachineSpec, rootfs: PathBuf) -> Self {
        let limiter = spec
            .rate_limiters
            .as_ref()
            .and_then(RateLimiter::from_limiters);

        let iface = NetworkInterface {
            iface_id: spec.cni.interface_name.clone(),
            host_dev_name: tap_device_name(&spec.machine_id),
            guest_mac: Some(generate_mac_address(&spec.machine_id)),
            rx_rate_limiter: limiter.clone(),
            tx_rate_limiter: limiter.clone(),
        };

        Self {
            machine: MachineConfig::new(spec.template.vcpu_count, spec.template.memsize_mib),
            boot_source: BootSource::for_machine(spec.kernel_file.clone(), spec),
            drives: vec![DriveConfig::root_disk(rootfs).with_rate_limiter(limiter)],
            network_interfaces: vec![iface],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MachineTemplate, NodeConfigFile, NodeConfiguration};

    fn spec_with_limits(limiters: Option<Limiters>) -> MachineSpec {
        let mut config = NodeConfiguration::resolve(NodeConfigFile {
            default_resource_dir: Some("/opt/kiln".into()),
            ..Default::default()
        })
        .unwrap();
        config.rate_limiters = limiters;
        MachineSpec::from_config(
            &config,
            MachineId::new(),
            MachineTemplate {
                vcpu_count: 2,
                memsize_mib: 512,
            },
        )
    }

    #[test]
    fn test_boot_args_identify_machine() {
        let spec = spec_with_limits(None);
        let config = VmConfig::from_spec(&spec, "/tmp/rootfs.ext4".into());

        let args = config.boot_source.boot_args.unwrap();
        assert!(args.starts_with("console=ttyS0"));
        assert!(args.contains(&format!("kiln.vm_id={}", spec.machine_id)));
        assert!(args.contains("kiln.host=192.168.127.1"));
        assert!(args.contains("kiln.port=9222"));
        assert!(args.contains(&format!("kiln.prefix={}", spec.internal_prefix)));
        assert!(args.contains("kiln.js="));
        assert_eq!(config.machine.vcpu_count, 2);
        assert_eq!(config.machine.mem_size_mib, 512);
    }

    #[test]
    fn test_rate_limiters_applied_to_drive_and_network() {
        let bucket = TokenBucket {
            one_time_burst: None,
            refill_time: 1000,
            size: 4096,
        };
        let spec = spec_with_limits(Some(Limiters {
            bandwidth: Some(bucket),
            operations: None,
        }));
        let config = VmConfig::from_spec(&spec, "/tmp/rootfs.ext4".into());

        let drive_limiter = config.drives[0].rate_limiter.as_ref().unwrap();
        assert_eq!(drive_limiter.bandwidth, Some(bucket));
        assert!(drive_limiter.ops.is_none());
        assert!(config.network_interfaces[0].rx_rate_limiter.is_some());

        let json = serde_json::to_value(&config.drives[0]).unwrap();
        assert!(json["rate_limiter"].get("ops").is_none());
    }

    #[test]
    fn test_empty_limiters_produce_none() {
        assert!(RateLimiter::from_limiters(&Limiters::default()).is_none());
    }

    #[test]
    fn test_generate_mac_address() {
        let id = MachineId::new();
        let mac = generate_mac_address(&id);

        assert_eq!(mac, generate_mac_address(&id));
        assert!(mac.starts_with("02:"));
        assert_eq!(mac.len(), 17);
    }

    #[test]
    fn test_tap_device_name_fits_ifnamsiz() {
        let name = tap_device_name(&MachineId::new());
        assert!(name.len() <= 15);
        assert!(name.starts_with("kt"));
    }
}
