//! Node configuration.
//!
//! The configuration file is a JSON document in which every field is
//! optional. [`NodeConfigFile`] mirrors that document and
//! [`NodeConfiguration::resolve`] turns it into a fully-populated
//! configuration without touching the filesystem, so defaulting can be tested
//! in isolation. [`NodeConfiguration::validate`] is the separate step that
//! checks the kernel and root filesystem actually exist.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use kiln_agent_api::subjects::{DEFAULT_EXTERNAL_PREFIX, DEFAULT_INTERNAL_PREFIX};
use kiln_agent_api::{WorkloadType, DEFAULT_WORKLOAD_TYPES};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_CNI_NETWORK_NAME: &str = "fcnet";
pub const DEFAULT_CNI_INTERFACE_NAME: &str = "veth0";
/// Address of the host bus as seen from inside a VM, not necessarily the
/// address the host listens on.
pub const DEFAULT_INTERNAL_NODE_HOST: &str = "192.168.127.1";
pub const DEFAULT_INTERNAL_NODE_PORT: u16 = 9222;
pub const DEFAULT_MACHINE_POOL_SIZE: usize = 1;
pub const DEFAULT_VCPU_COUNT: u8 = 1;
pub const DEFAULT_MEM_SIZE_MIB: u32 = 256;
pub const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_EXECUTE_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_WORK_DIR: &str = "/tmp/kiln";
pub const DEFAULT_JS_INTERPRETER: &str = "node";

const KERNEL_FILE_NAME: &str = "vmlinux";
const ROOTFS_FILE_NAME: &str = "rootfs.ext4";

/// Configuration errors. All of them are fatal at node startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration document: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid kernel file setting: set kernel_file or default_resource_dir")]
    MissingKernel,

    #[error("invalid rootfs file setting: set rootfs_file or default_resource_dir")]
    MissingRootfs,

    #[error("unrecognized workload type '{0}' in workload_types")]
    UnknownWorkloadType(String),

    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },

    #[error("required files not found: {}", display_paths(.0))]
    MissingFiles(Vec<PathBuf>),
}

fn display_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

// =============================================================================
// Shared value types
// =============================================================================

/// CPU and memory shape of a VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineTemplate {
    pub vcpu_count: u8,
    pub memsize_mib: u32,
}

impl Default for MachineTemplate {
    fn default() -> Self {
        Self {
            vcpu_count: DEFAULT_VCPU_COUNT,
            memsize_mib: DEFAULT_MEM_SIZE_MIB,
        }
    }
}

/// CNI network reference; the network itself lives in `{network}.conflist`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CniDefinition {
    pub network_name: String,
    pub interface_name: String,
}

/// Token bucket, field-for-field the Firecracker rate limiter bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenBucket {
    /// Initial burst on top of `size`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub one_time_burst: Option<u64>,
    /// Milliseconds for the bucket to refill.
    pub refill_time: u64,
    /// Tokens the bucket holds.
    pub size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Limiters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bandwidth: Option<TokenBucket>,
    #[serde(default, rename = "iops", skip_serializing_if = "Option::is_none")]
    pub operations: Option<TokenBucket>,
}

// =============================================================================
// File document
// =============================================================================

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CniFile {
    pub network_name: Option<String>,
    pub interface_name: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MachineTemplateFile {
    pub vcpu_count: Option<u8>,
    pub memsize_mib: Option<u32>,
}

/// The configuration document exactly as written on disk.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct NodeConfigFile {
    pub kernel_file: Option<PathBuf>,
    pub rootfs_file: Option<PathBuf>,
    pub default_resource_dir: Option<PathBuf>,
    pub cni: CniFile,
    pub internal_node_host: Option<String>,
    pub internal_node_port: Option<u16>,
    pub machine_pool_size: Option<usize>,
    pub machine_template: MachineTemplateFile,
    pub rate_limiters: Option<Limiters>,
    pub valid_issuers: Vec<String>,
    pub workload_types: Vec<String>,
    pub tags: HashMap<String, String>,
    pub handshake_timeout_ms: Option<u64>,
    pub execute_timeout_ms: Option<u64>,
    pub work_dir: Option<PathBuf>,
    pub js_interpreter: Option<PathBuf>,
    pub internal_subject_prefix: Option<String>,
    pub external_subject_prefix: Option<String>,
}

impl NodeConfigFile {
    pub fn from_json(bytes: &[u8]) -> Result<Self, ConfigError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

// =============================================================================
// Resolved configuration
// =============================================================================

/// Fully resolved node configuration.
#[derive(Debug, Clone)]
pub struct NodeConfiguration {
    pub kernel_file: PathBuf,
    pub rootfs_file: PathBuf,
    pub cni: CniDefinition,
    pub internal_node_host: String,
    pub internal_node_port: u16,
    /// Number of VMs the manager keeps provisioned.
    pub machine_pool_size: usize,
    /// Default VM shape; deployments may override it.
    pub machine_template: MachineTemplate,
    pub rate_limiters: Option<Limiters>,
    /// Trusted claim issuers. Empty accepts any issuer.
    pub valid_issuers: Vec<String>,
    pub workload_types: Vec<WorkloadType>,
    pub tags: HashMap<String, String>,
    pub handshake_timeout: Duration,
    /// Longest the node waits for a guest to answer one function call.
    pub execute_timeout: Duration,
    /// Root of the per-machine workspaces.
    pub work_dir: PathBuf,
    /// Interpreter the guest agent runs JavaScript workloads with.
    pub js_interpreter: PathBuf,
    pub internal_subject_prefix: String,
    pub external_subject_prefix: String,
}

impl NodeConfiguration {
    /// Resolves a configuration document, applying defaults.
    ///
    /// Kernel and root filesystem paths fall back to `{dir}/vmlinux` and
    /// `{dir}/rootfs.ext4` under `default_resource_dir`; it is an error if
    /// neither an explicit path nor the directory is given.
    pub fn resolve(file: NodeConfigFile) -> Result<Self, ConfigError> {
        let resource_dir = file.default_resource_dir.as_deref();

        let kernel_file = file
            .kernel_file
            .or_else(|| resource_dir.map(|d| d.join(KERNEL_FILE_NAME)))
            .ok_or(ConfigError::MissingKernel)?;

        let rootfs_file = file
            .rootfs_file
            .or_else(|| resource_dir.map(|d| d.join(ROOTFS_FILE_NAME)))
            .ok_or(ConfigError::MissingRootfs)?;

        let workload_types = if file.workload_types.is_empty() {
            DEFAULT_WORKLOAD_TYPES.to_vec()
        } else {
            let mut types = Vec::with_capacity(file.workload_types.len());
            for tag in &file.workload_types {
                let ty: WorkloadType = tag
                    .parse()
                    .map_err(|_| ConfigError::UnknownWorkloadType(tag.clone()))?;
                if !types.contains(&ty) {
                    types.push(ty);
                }
            }
            types
        };

        let machine_template = MachineTemplate {
            vcpu_count: file.machine_template.vcpu_count.unwrap_or(DEFAULT_VCPU_COUNT),
            memsize_mib: file
                .machine_template
                .memsize_mib
                .unwrap_or(DEFAULT_MEM_SIZE_MIB),
        };
        if machine_template.vcpu_count == 0 {
            return Err(ConfigError::InvalidValue {
                field: "machine_template.vcpu_count",
                reason: "must be at least 1".to_string(),
            });
        }
        if machine_template.memsize_mib == 0 {
            return Err(ConfigError::InvalidValue {
                field: "machine_template.memsize_mib",
                reason: "must be at least 1".to_string(),
            });
        }

        let internal_subject_prefix = file
            .internal_subject_prefix
            .unwrap_or_else(|| DEFAULT_INTERNAL_PREFIX.to_string());
        let external_subject_prefix = file
            .external_subject_prefix
            .unwrap_or_else(|| DEFAULT_EXTERNAL_PREFIX.to_string());
        for (field, prefix) in [
            ("internal_subject_prefix", &internal_subject_prefix),
            ("external_subject_prefix", &external_subject_prefix),
        ] {
            if !valid_subject_prefix(prefix) {
                return Err(ConfigError::InvalidValue {
                    field,
                    reason: format!("'{prefix}' is not a valid subject prefix"),
                });
            }
        }

        Ok(Self {
            kernel_file,
            rootfs_file,
            cni: CniDefinition {
                network_name: file
                    .cni
                    .network_name
                    .unwrap_or_else(|| DEFAULT_CNI_NETWORK_NAME.to_string()),
                interface_name: file
                    .cni
                    .interface_name
                    .unwrap_or_else(|| DEFAULT_CNI_INTERFACE_NAME.to_string()),
            },
            internal_node_host: file
                .internal_node_host
                .unwrap_or_else(|| DEFAULT_INTERNAL_NODE_HOST.to_string()),
            internal_node_port: file
                .internal_node_port
                .unwrap_or(DEFAULT_INTERNAL_NODE_PORT),
            machine_pool_size: file
                .machine_pool_size
                .unwrap_or(DEFAULT_MACHINE_POOL_SIZE),
            machine_template,
            rate_limiters: file.rate_limiters,
            valid_issuers: file.valid_issuers,
            workload_types,
            tags: file.tags,
            handshake_timeout: Duration::from_millis(
                file.handshake_timeout_ms
                    .unwrap_or(DEFAULT_HANDSHAKE_TIMEOUT_MS),
            ),
            execute_timeout: Duration::from_millis(
                file.execute_timeout_ms.unwrap_or(DEFAULT_EXECUTE_TIMEOUT_MS),
            ),
            work_dir: file
                .work_dir
                .unwrap_or_else(|| PathBuf::from(DEFAULT_WORK_DIR)),
            js_interpreter: file
                .js_interpreter
                .unwrap_or_else(|| PathBuf::from(DEFAULT_JS_INTERPRETER)),
            internal_subject_prefix,
            external_subject_prefix,
        })
    }

    /// Reads and resolves the configuration file at `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let bytes = std::fs::read(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::resolve(NodeConfigFile::from_json(&bytes)?)
    }

    /// Checks that the kernel and root filesystem exist, reporting every
    /// missing file at once.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let missing: Vec<PathBuf> = [&self.kernel_file, &self.rootfs_file]
            .into_iter()
            .filter(|p| !p.exists())
            .cloned()
            .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::MissingFiles(missing))
        }
    }

    pub fn accepts(&self, workload_type: WorkloadType) -> bool {
        self.workload_types.contains(&workload_type)
    }

    /// An empty issuer list trusts every issuer.
    pub fn trusts_issuer(&self, issuer: &str) -> bool {
        self.valid_issuers.is_empty() || self.valid_issuers.iter().any(|i| i == issuer)
    }
}

fn valid_subject_prefix(prefix: &str) -> bool {
    !prefix.is_empty()
        && prefix
            .split('.')
            .all(|t| !t.is_empty() && !t.contains(['*', '>', ' ']))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolve_json(json: &str) -> Result<NodeConfiguration, ConfigError> {
        NodeConfiguration::resolve(NodeConfigFile::from_json(json.as_bytes())?)
    }

    #[test]
    fn test_defaults_from_resource_dir() {
        let config = resolve_json(r#"{"default_resource_dir": "/opt/kiln"}"#).unwrap();
        assert_eq!(config.kernel_file, PathBuf::from("/opt/kiln/vmlinux"));
        assert_eq!(config.rootfs_file, PathBuf::from("/opt/kiln/rootfs.ext4"));
        assert_eq!(config.cni.network_name, "fcnet");
        assert_eq!(config.cni.interface_name, "veth0");
        assert_eq!(config.internal_node_host, "192.168.127.1");
        assert_eq!(config.internal_node_port, 9222);
        assert_eq!(config.machine_pool_size, 1);
        assert_eq!(config.machine_template, MachineTemplate::default());
        assert_eq!(config.workload_types, DEFAULT_WORKLOAD_TYPES.to_vec());
        assert_eq!(config.handshake_timeout, Duration::from_secs(5));
        assert_eq!(config.execute_timeout, Duration::from_secs(10));
        assert!(config.rate_limiters.is_none());
    }

    #[test]
    fn test_explicit_paths_win_over_resource_dir() {
        let config = resolve_json(
            r#"{"kernel_file": "/k/vmlinux-6.1", "default_resource_dir": "/opt/kiln"}"#,
        )
        .unwrap();
        assert_eq!(config.kernel_file, PathBuf::from("/k/vmlinux-6.1"));
        assert_eq!(config.rootfs_file, PathBuf::from("/opt/kiln/rootfs.ext4"));
    }

    #[test]
    fn test_missing_kernel_is_an_error() {
        let err = resolve_json(r#"{"rootfs_file": "/r.ext4"}"#).unwrap_err();
        assert!(matches!(err, ConfigError::MissingKernel));
    }

    #[test]
    fn test_missing_rootfs_is_an_error() {
        let err = resolve_json(r#"{"kernel_file": "/vmlinux"}"#).unwrap_err();
        assert!(matches!(err, ConfigError::MissingRootfs));
    }

    #[test]
    fn test_containers_require_opt_in() {
        let config = resolve_json(r#"{"default_resource_dir": "/d"}"#).unwrap();
        assert!(!config.accepts(WorkloadType::Oci));

        let config =
            resolve_json(r#"{"default_resource_dir": "/d", "workload_types": ["oci", "elf"]}"#)
                .unwrap();
        assert!(config.accepts(WorkloadType::Oci));
        assert!(!config.accepts(WorkloadType::Wasm));
    }

    #[test]
    fn test_unknown_workload_type_is_fatal() {
        let err = resolve_json(r#"{"default_resource_dir": "/d", "workload_types": ["exe"]}"#)
            .unwrap_err();
        assert!(matches!(err, ConfigError::UnknownWorkloadType(t) if t == "exe"));
    }

    #[test]
    fn test_rate_limiters_and_template() {
        let config = resolve_json(
            r#"{
                "default_resource_dir": "/d",
                "machine_pool_size": 3,
                "machine_template": {"vcpu_count": 2, "memsize_mib": 512},
                "rate_limiters": {
                    "bandwidth": {"one_time_burst": 100, "refill_time": 1000, "size": 5000},
                    "iops": {"refill_time": 100, "size": 50}
                }
            }"#,
        )
        .unwrap();
        assert_eq!(config.machine_pool_size, 3);
        assert_eq!(config.machine_template.vcpu_count, 2);
        assert_eq!(config.machine_template.memsize_mib, 512);

        let limiters = config.rate_limiters.unwrap();
        assert_eq!(limiters.bandwidth.unwrap().one_time_burst, Some(100));
        assert_eq!(limiters.operations.unwrap().size, 50);
    }

    #[test]
    fn test_zero_vcpus_rejected() {
        let err = resolve_json(
            r#"{"default_resource_dir": "/d", "machine_template": {"vcpu_count": 0}}"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn test_wildcard_prefix_rejected() {
        let err = resolve_json(r#"{"default_resource_dir": "/d", "internal_subject_prefix": "a.*"}"#)
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn test_issuer_trust() {
        let mut config = resolve_json(r#"{"default_resource_dir": "/d"}"#).unwrap();
        assert!(config.trusts_issuer("anyone"));

        config.valid_issuers = vec!["ISSUER_A".to_string()];
        assert!(config.trusts_issuer("ISSUER_A"));
        assert!(!config.trusts_issuer("ISSUER_B"));
    }

    #[test]
    fn test_validate_reports_all_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let config = NodeConfiguration::resolve(NodeConfigFile {
            default_resource_dir: Some(dir.path().to_path_buf()),
            ..Default::default()
        })
        .unwrap();

        match config.validate() {
            Err(ConfigError::MissingFiles(missing)) => assert_eq!(missing.len(), 2),
            other => panic!("expected missing files, got {other:?}"),
        }

        std::fs::write(dir.path().join("vmlinux"), b"k").unwrap();
        std::fs::write(dir.path().join("rootfs.ext4"), b"r").unwrap();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"default_resource_dir": "/d", "tags": {"zone": "a"}}"#).unwrap();

        let config = NodeConfiguration::load(&path).unwrap();
        assert_eq!(config.tags.get("zone").map(String::as_str), Some("a"));

        let err = NodeConfiguration::load(&dir.path().join("absent.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
