//! Identifier types used across the node agent.

use crate::define_id;

// A micro-VM. Unique for the lifetime of the node process.
define_id!(MachineId, "vm");

// The node itself; its rendered form doubles as the node's public key on
// external subjects when no key is configured.
define_id!(NodeId, "node");
