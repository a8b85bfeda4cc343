//! Guest agent configuration.
//!
//! Inside a VM everything the agent needs arrives on the kernel command line
//! as `kiln.*` parameters, written there by the node when it boots the VM.

use std::path::PathBuf;
use std::time::Duration;

use kiln_agent_api::subjects::DEFAULT_INTERNAL_PREFIX;
use kiln_id::MachineId;

use crate::error::GuestError;

pub const CMDLINE_PATH: &str = "/proc/cmdline";
pub const DEFAULT_WORK_DIR: &str = "/run/kiln/workload";
pub const DEFAULT_JS_INTERPRETER: &str = "node";
pub const DEFAULT_HANDSHAKE_ATTEMPTS: u32 = 50;
pub const DEFAULT_FUEL_PER_CALL: u64 = 500_000_000;

#[derive(Debug, Clone)]
pub struct GuestConfig {
    /// The VM this agent speaks for.
    pub machine_id: MachineId,
    /// Host bus address, as reachable from inside the VM.
    pub host: String,
    pub port: u16,
    pub internal_prefix: String,
    /// Where workload files are staged.
    pub work_dir: PathBuf,
    /// Interpreter command for JavaScript workloads.
    pub js_interpreter: PathBuf,
    pub handshake_attempts: u32,
    /// Wait per handshake attempt.
    pub handshake_timeout: Duration,
    /// Pause between failed handshake attempts.
    pub handshake_retry: Duration,
    /// Fuel budget for one Wasm call.
    pub fuel_per_call: u64,
    /// Longest a JavaScript handler may take to answer one call.
    pub execute_timeout: Duration,
}

impl GuestConfig {
    pub fn new(machine_id: MachineId, internal_prefix: &str, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            machine_id,
            host: String::new(),
            port: 0,
            internal_prefix: internal_prefix.to_string(),
            work_dir: work_dir.into(),
            js_interpreter: PathBuf::from(DEFAULT_JS_INTERPRETER),
            handshake_attempts: DEFAULT_HANDSHAKE_ATTEMPTS,
            handshake_timeout: Duration::from_millis(500),
            handshake_retry: Duration::from_millis(20),
            fuel_per_call: DEFAULT_FUEL_PER_CALL,
            execute_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_js_interpreter(mut self, interpreter: impl Into<PathBuf>) -> Self {
        self.js_interpreter = interpreter.into();
        self
    }

    pub fn with_fuel_per_call(mut self, fuel: u64) -> Self {
        self.fuel_per_call = fuel;
        self
    }

    /// Parses `kiln.vm_id`, `kiln.host` and `kiln.port` (required) and
    /// `kiln.prefix`, `kiln.work_dir` and `kiln.js` (optional) out of a
    /// kernel command line.
    pub fn from_cmdline(cmdline: &str) -> Result<Self, GuestError> {
        let param = |name: &str| {
            cmdline
                .split_whitespace()
                .find_map(|part| part.strip_prefix(name)?.strip_prefix('='))
        };

        let machine_id = param("kiln.vm_id").ok_or(GuestError::MissingParameter("kiln.vm_id"))?;
        let machine_id = MachineId::parse(machine_id).map_err(|e| GuestError::InvalidParameter {
            name: "kiln.vm_id",
            reason: e.to_string(),
        })?;

        let host = param("kiln.host").ok_or(GuestError::MissingParameter("kiln.host"))?;
        let port = param("kiln.port")
            .ok_or(GuestError::MissingParameter("kiln.port"))?
            .parse::<u16>()
            .map_err(|e| GuestError::InvalidParameter {
                name: "kiln.port",
                reason: e.to_string(),
            })?;

        let mut config = Self::new(
            machine_id,
            param("kiln.prefix").unwrap_or(DEFAULT_INTERNAL_PREFIX),
            param("kiln.work_dir").unwrap_or(DEFAULT_WORK_DIR),
        );
        config.host = host.to_string();
        config.port = port;
        if let Some(js) = param("kiln.js") {
            config.js_interpreter = PathBuf::from(js);
        }
        Ok(config)
    }

    /// Reads the configuration from the running kernel's command line.
    pub fn load() -> Result<Self, GuestError> {
        let cmdline = std::fs::read_to_string(CMDLINE_PATH).map_err(|e| {
            GuestError::InvalidParameter {
                name: "cmdline",
                reason: format!("failed to read {CMDLINE_PATH}: {e}"),
            }
        })?;
        Self::from_cmdline(&cmdline)
    }

    /// `host:port` of the node's bus.
    pub fn host_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_cmdline() {
        let id = MachineId::new();
        let cmdline = format!(
            "console=ttyS0 reboot=k panic=1 pci=off kiln.vm_id={id} kiln.host=192.168.127.1 kiln.port=9222 kiln.prefix=host.agent"
        );

        let config = GuestConfig::from_cmdline(&cmdline).unwrap();
        assert_eq!(config.machine_id, id);
        assert_eq!(config.host_addr(), "192.168.127.1:9222");
        assert_eq!(config.internal_prefix, "host.agent");
        assert_eq!(config.work_dir, PathBuf::from(DEFAULT_WORK_DIR));
        assert_eq!(config.js_interpreter, PathBuf::from("node"));
    }

    #[test]
    fn test_prefix_defaults() {
        let id = MachineId::new();
        let cmdline = format!("kiln.vm_id={id} kiln.host=10.0.0.1 kiln.port=1 kiln.js=/usr/bin/deno");
        let config = GuestConfig::from_cmdline(&cmdline).unwrap();
        assert_eq!(config.internal_prefix, "agentint");
        assert_eq!(config.js_interpreter, PathBuf::from("/usr/bin/deno"));
    }

    #[test]
    fn test_missing_and_invalid_parameters() {
        assert!(matches!(
            GuestConfig::from_cmdline("kiln.host=a kiln.port=1"),
            Err(GuestError::MissingParameter("kiln.vm_id"))
        ));
        assert!(matches!(
            GuestConfig::from_cmdline("kiln.vm_id=v1 kiln.host=a kiln.port=1"),
            Err(GuestError::InvalidParameter { name: "kiln.vm_id", .. })
        ));

        let id = MachineId::new();
        let cmdline = format!("kiln.vm_id={id} kiln.host=a kiln.port=99999");
        assert!(matches!(
            GuestConfig::from_cmdline(&cmdline),
            Err(GuestError::InvalidParameter { name: "kiln.port", .. })
        ));
    }

    #[test]
    fn test_similar_parameter_names_do_not_match() {
        let id = MachineId::new();
        let cmdline = format!("kiln.vm_id={id} kiln.hostname=x kiln.host=h kiln.port=2");
        let config = GuestConfig::from_cmdline(&cmdline).unwrap();
        assert_eq!(config.host, "h");
    }
}
