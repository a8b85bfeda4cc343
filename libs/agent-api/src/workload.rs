//! Workload descriptions handed to the node for deployment.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Execution models a VM can host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkloadType {
    /// Statically linked ELF binary run as a supervised process.
    Elf,
    /// JavaScript function loaded into a persistent interpreter.
    V8,
    /// OCI container image.
    Oci,
    /// WebAssembly module.
    Wasm,
}

/// Workload types a node accepts when its configuration names none.
/// Containers need an explicit opt-in.
pub const DEFAULT_WORKLOAD_TYPES: [WorkloadType; 3] =
    [WorkloadType::Elf, WorkloadType::V8, WorkloadType::Wasm];

impl WorkloadType {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkloadType::Elf => "elf",
            WorkloadType::V8 => "v8",
            WorkloadType::Oci => "oci",
            WorkloadType::Wasm => "wasm",
        }
    }

    /// Function-style workloads are invoked per request rather than run as
    /// long-lived services.
    pub fn is_function(&self) -> bool {
        matches!(self, WorkloadType::V8 | WorkloadType::Wasm)
    }
}

impl fmt::Display for WorkloadType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkloadType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "elf" => Ok(WorkloadType::Elf),
            "v8" => Ok(WorkloadType::V8),
            "oci" => Ok(WorkloadType::Oci),
            "wasm" => Ok(WorkloadType::Wasm),
            other => Err(format!("unknown workload type '{other}'")),
        }
    }
}

/// Verified claims identifying a workload.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WorkloadClaims {
    /// Workload subject; scopes the workload's external subjects.
    pub subject: String,
    /// Human-readable workload name.
    pub name: String,
    /// Identity that signed the claims.
    pub issuer: String,
}

/// A request to place a workload on a warm VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployRequest {
    /// Raw workload type tag. Kept as a string so unrecognised tags reach the
    /// provider factory and fail there.
    pub workload_type: Option<String>,
    pub workload_name: String,
    pub namespace: String,
    pub claims: WorkloadClaims,
    #[serde(default)]
    pub artifact: Vec<u8>,
    /// Hex-encoded SHA-256 of `artifact`, checked during validation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_hash: Option<String>,
    #[serde(default)]
    pub environment: HashMap<String, String>,
    #[serde(default)]
    pub argv: Vec<String>,
}

impl DeployRequest {
    pub fn new(workload_type: &str, workload_name: &str, artifact: Vec<u8>) -> Self {
        Self {
            workload_type: Some(workload_type.to_string()),
            workload_name: workload_name.to_string(),
            namespace: "default".to_string(),
            claims: WorkloadClaims {
                subject: workload_name.to_string(),
                name: workload_name.to_string(),
                issuer: String::new(),
            },
            artifact,
            artifact_hash: None,
            environment: HashMap::new(),
            argv: Vec::new(),
        }
    }

    pub fn with_namespace(mut self, namespace: &str) -> Self {
        self.namespace = namespace.to_string();
        self
    }

    pub fn with_claims(mut self, claims: WorkloadClaims) -> Self {
        self.claims = claims;
        self
    }

    pub fn with_artifact_hash(mut self, hash: &str) -> Self {
        self.artifact_hash = Some(hash.to_string());
        self
    }

    pub fn with_env(mut self, key: &str, value: &str) -> Self {
        self.environment.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_argv(mut self, argv: Vec<String>) -> Self {
        self.argv = argv;
        self
    }

    /// The workload type, if the tag is present and recognised.
    pub fn parsed_type(&self) -> Option<WorkloadType> {
        self.workload_type.as_deref().and_then(|t| t.parse().ok())
    }
}
