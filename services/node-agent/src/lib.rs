//! kiln node agent library.
//!
//! The node agent runs untrusted workloads inside a pool of micro-VMs. It
//! keeps a number of VMs booted and handshaken ahead of demand, places
//! workloads on them through an execution provider per workload technology,
//! and relays guest logs and events to the control plane.
//!
//! ## Architecture
//!
//! ```text
//! Node
//! ├── MachineManager   (live VM set, lifecycle, warm pool replenishment)
//! │   ├── Runtime      (Firecracker, or a mock in tests)
//! │   └── ExecutionProvider per running VM (validates, dispatches to the guest)
//! └── AgentComms       (handshake, log and event relay)
//! ```
//!
//! ## Modules
//!
//! - `bus`: the `kiln-bus` crate, re-exported
//! - `comms`: internal agent protocol handler
//! - `config`: node configuration file and resolution
//! - `firecracker`: Firecracker microVM runtime implementation
//! - `pool`: machine pool lifecycle manager
//! - `providers`: execution providers and their factory
//! - `runtime`: VM runtime trait and mock

pub use kiln_bus as bus;
pub mod comms;
pub mod config;
pub mod firecracker;
pub mod node;
pub mod pool;
pub mod providers;
pub mod runtime;

pub use bus::{InMemoryBus, MessageBus};
pub use comms::AgentComms;
pub use config::{NodeConfigFile, NodeConfiguration};
pub use node::Node;
pub use pool::{MachineManager, MachineState, PoolError};
pub use runtime::MockRuntime;
