//! Warm pool of micro-VMs.
//!
//! [`MachineManager`] owns the live set of VMs, drives each through its
//! lifecycle and keeps the pool topped up to the configured size.

mod backoff;
mod machine;
mod manager;

pub use backoff::BackoffPolicy;
pub use machine::{
    Assignment, MachineRecord, MachineState, MachineSummary, UNASSIGNED_NAMESPACE,
    UNASSIGNED_WORKLOAD,
};
pub use manager::{MachineManager, PoolError};
