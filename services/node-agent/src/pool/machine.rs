//! VM records and lifecycle states.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use kiln_agent_api::{WorkloadClaims, WorkloadType};
use kiln_id::MachineId;
use serde::Serialize;

use crate::config::MachineTemplate;
use crate::providers::ExecutionProvider;
use crate::runtime::VmHandle;

/// Scope reported for VMs that have no workload yet.
pub const UNASSIGNED_NAMESPACE: &str = "system";
pub const UNASSIGNED_WORKLOAD: &str = "unassigned";

/// Lifecycle of a pooled VM.
///
/// ```text
/// provisioning -> cold_ready -> warm -> running -> stopping -> (removed)
///       \              \
///        `-> failed     `-> failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MachineState {
    Provisioning,
    ColdReady,
    Warm,
    Running,
    Stopping,
    Terminated,
    Failed,
}

impl MachineState {
    /// States that count towards the pool size.
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            MachineState::Provisioning
                | MachineState::ColdReady
                | MachineState::Warm
                | MachineState::Running
        )
    }

    pub fn can_transition_to(&self, next: MachineState) -> bool {
        use MachineState::*;
        matches!(
            (self, next),
            (Provisioning, ColdReady)
                | (Provisioning, Failed)
                | (Provisioning, Stopping)
                | (ColdReady, Warm)
                | (ColdReady, Failed)
                | (ColdReady, Stopping)
                | (Warm, Running)
                | (Warm, Stopping)
                | (Warm, Failed)
                | (Running, Stopping)
                | (Stopping, Terminated)
                | (Failed, Terminated)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MachineState::Provisioning => "provisioning",
            MachineState::ColdReady => "cold_ready",
            MachineState::Warm => "warm",
            MachineState::Running => "running",
            MachineState::Stopping => "stopping",
            MachineState::Terminated => "terminated",
            MachineState::Failed => "failed",
        }
    }
}

impl fmt::Display for MachineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The workload placed on a running VM.
#[derive(Clone)]
pub struct Assignment {
    pub namespace: String,
    pub workload_name: String,
    pub claims: WorkloadClaims,
    pub workload_type: WorkloadType,
    pub provider: Arc<dyn ExecutionProvider>,
    pub deployed_at: DateTime<Utc>,
}

/// One VM in the live set.
pub struct MachineRecord {
    pub id: MachineId,
    pub state: MachineState,
    pub template: MachineTemplate,
    pub handle: Option<VmHandle>,
    pub handshake_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    /// Present exactly while the VM is running.
    pub assignment: Option<Assignment>,
    /// Serializes deploy and teardown of this VM.
    pub lifecycle: Arc<tokio::sync::Mutex<()>>,
}

impl MachineRecord {
    pub fn new(id: MachineId, template: MachineTemplate) -> Self {
        Self {
            id,
            state: MachineState::Provisioning,
            template,
            handle: None,
            handshake_at: None,
            created_at: Utc::now(),
            assignment: None,
            lifecycle: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    /// Moves to `next`, which must be reachable from the current state.
    pub fn transition(&mut self, next: MachineState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal transition {} -> {next} for {}",
            self.state,
            self.id
        );
        self.state = next;
    }

    /// Namespace and workload name used to scope this VM's external subjects.
    pub fn scope(&self) -> (&str, &str) {
        match &self.assignment {
            Some(a) => (&a.namespace, &a.claims.subject),
            None => (UNASSIGNED_NAMESPACE, UNASSIGNED_WORKLOAD),
        }
    }

    pub fn summary(&self) -> MachineSummary {
        MachineSummary {
            id: self.id,
            state: self.state,
            vcpu_count: self.template.vcpu_count,
            memsize_mib: self.template.memsize_mib,
            namespace: self.assignment.as_ref().map(|a| a.namespace.clone()),
            workload_name: self.assignment.as_ref().map(|a| a.workload_name.clone()),
            workload_type: self.assignment.as_ref().map(|a| a.workload_type),
            handshake_at: self.handshake_at,
            deployed_at: self.assignment.as_ref().map(|a| a.deployed_at),
        }
    }
}

/// Point-in-time view of a VM.
#[derive(Debug, Clone, Serialize)]
pub struct MachineSummary {
    pub id: MachineId,
    pub state: MachineState,
    pub vcpu_count: u8,
    pub memsize_mib: u32,
    pub namespace: Option<String>,
    pub workload_name: Option<String>,
    pub workload_type: Option<WorkloadType>,
    pub handshake_at: Option<DateTime<Utc>>,
    pub deployed_at: Option<DateTime<Utc>>,
}
