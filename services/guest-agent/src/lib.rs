//! kiln guest agent.
//!
//! Runs inside each micro-VM. It reads its identity and the node's bus
//! address from the kernel command line, connects to the node, handshakes,
//! and then runs the one workload the node deploys onto the VM.
//!
//! ## Modules
//!
//! - `agent`: control request handling (deploy, execute, undeploy)
//! - `config`: `kiln.*` kernel parameters
//! - `handshake`: handshake with the node agent
//! - `runners`: workload runners for ELF, JavaScript and Wasm

pub mod agent;
pub mod config;
pub mod error;
pub mod handshake;
pub mod runners;

pub use agent::GuestAgent;
pub use config::GuestConfig;
pub use error::GuestError;

/// Guest agent version (semver).
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
