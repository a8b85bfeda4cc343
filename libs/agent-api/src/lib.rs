//! # kiln-agent-api
//!
//! Wire contract between the node agent on the host and the agent process
//! running inside each micro-VM.
//!
//! ## Message classes
//!
//! The guest talks to the host over the internal bus, one subject family
//! per VM:
//!
//! - `{internal}.{vmId}.handshake`: request/reply liveness proof
//! - `{internal}.{vmId}.logs`: fire-and-forget log lines
//! - `{internal}.{vmId}.events.{type}`: fire-and-forget cloud events
//!
//! The host republishes logs and events on the external bus, scoped by
//! namespace, node, workload and VM.
//!
//! In the other direction the host drives the workload with request/reply
//! exchanges on `{internal}.{vmId}.deploy`, `.execute` and `.undeploy`; see
//! [`GuestDeploy`], [`GuestExecute`] and [`GuestReply`].
//!
//! ## Workloads
//!
//! [`DeployRequest`] describes a workload to place on a warm VM and
//! [`WorkloadType`] names its execution model.

mod error;
mod event;
mod guest;
mod messages;
pub mod subjects;
mod workload;

pub use error::AgentApiError;
pub use event::*;
pub use guest::*;
pub use messages::*;
pub use workload::*;
