//! Machine pool lifecycle manager.
//!
//! All VM records live in one [`PoolState`] behind a single async mutex that
//! is only ever held for map updates, never across runtime or provider calls.
//! Each record additionally carries a lifecycle lock that is held for the
//! whole of a deploy or teardown, so checking a VM's state and acting on it
//! is atomic per VM and concurrent teardowns of one VM collapse into one.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::{join_all, BoxFuture};
use futures_util::FutureExt;
use kiln_agent_api::{subjects, DeployRequest, WorkloadType};
use kiln_id::MachineId;
use thiserror::Error;
use tokio::sync::{watch, Mutex, Notify};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::backoff::BackoffPolicy;
use super::machine::{Assignment, MachineRecord, MachineState, MachineSummary};
use crate::config::{MachineTemplate, NodeConfiguration};
use crate::providers::{
    new_execution_provider, ExecutionProvider, ExecutionProviderParams, ProviderContext,
    ProviderError,
};
use crate::runtime::{MachineSpec, Runtime};

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("failed to provision machine: {0}")]
    Provision(String),

    #[error("machine {id} did not handshake within {timeout:?}")]
    HandshakeTimeout { id: MachineId, timeout: Duration },

    #[error("unknown machine {0}")]
    UnknownMachine(MachineId),

    #[error("machine {id} is {actual}, expected {expected}")]
    InvalidState {
        id: MachineId,
        expected: MachineState,
        actual: MachineState,
    },

    #[error("workload type {0} is not accepted by this node")]
    WorkloadTypeNotAccepted(WorkloadType),

    #[error("issuer '{0}' is not trusted by this node")]
    UntrustedIssuer(String),

    /// The value would not form a single token of the VM's external
    /// subjects.
    #[error("invalid {field} '{value}': must be one non-empty subject token")]
    InvalidScope { field: &'static str, value: String },

    #[error("no warm machines available")]
    NoWarmMachines,

    #[error("node is shutting down")]
    ShuttingDown,

    #[error(transparent)]
    Provider(#[from] ProviderError),
}

/// Every VM is registered here from the moment its slot is reserved, so a
/// handshake can only ever land on a record.
#[derive(Default)]
struct PoolState {
    machines: HashMap<MachineId, MachineRecord>,
}

pub struct MachineManager {
    config: Arc<NodeConfiguration>,
    node_id: String,
    runtime: Arc<dyn Runtime>,
    providers: ProviderContext,
    state: Mutex<PoolState>,
    handshake_notify: Notify,
    draining: watch::Sender<bool>,
    backoff: BackoffPolicy,
    consecutive_failures: AtomicU32,
    provisioning: std::sync::Mutex<JoinSet<()>>,
}

impl MachineManager {
    pub fn new(
        config: Arc<NodeConfiguration>,
        node_id: impl Into<String>,
        runtime: Arc<dyn Runtime>,
        providers: ProviderContext,
    ) -> Self {
        Self {
            config,
            node_id: node_id.into(),
            runtime,
            providers,
            state: Mutex::new(PoolState::default()),
            handshake_notify: Notify::new(),
            draining: watch::Sender::new(false),
            backoff: BackoffPolicy::default(),
            consecutive_failures: AtomicU32::new(0),
            provisioning: std::sync::Mutex::new(JoinSet::new()),
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn config(&self) -> &NodeConfiguration {
        &self.config
    }

    pub fn is_accepting(&self) -> bool {
        !*self.draining.borrow()
    }

    fn workspace(&self, id: &MachineId) -> std::path::PathBuf {
        self.config.work_dir.join(id.to_string())
    }

    // =========================================================================
    // Provisioning
    // =========================================================================

    /// Fills the pool at node start.
    pub async fn start(self: &Arc<Self>) {
        info!(
            pool_size = self.config.machine_pool_size,
            node_id = %self.node_id,
            "Starting machine pool"
        );
        self.replenish().await;
    }

    /// Boots a new VM and leaves it `cold_ready`, waiting for its handshake.
    pub async fn provision_vm(
        self: &Arc<Self>,
        template: Option<MachineTemplate>,
    ) -> Result<MachineId, PoolError> {
        if !self.is_accepting() {
            return Err(PoolError::ShuttingDown);
        }

        let template = template.unwrap_or(self.config.machine_template);
        let id = MachineId::new();
        self.state
            .lock()
            .await
            .machines
            .insert(id, MachineRecord::new(id, template));

        self.boot_reserved(id, template).await?;
        Ok(id)
    }

    /// Starts the VM for a record already registered as `provisioning`.
    async fn boot_reserved(
        self: &Arc<Self>,
        id: MachineId,
        template: MachineTemplate,
    ) -> Result<(), PoolError> {
        let spec = MachineSpec::from_config(&self.config, id, template);
        debug!(machine_id = %id, vcpus = template.vcpu_count, memory_mib = template.memsize_mib, "Provisioning machine");

        let handle = match self.runtime.start_vm(&spec).await {
            Ok(handle) => handle,
            Err(e) => {
                error!(machine_id = %id, error = %e, "Failed to start machine");
                {
                    let mut state = self.state.lock().await;
                    if let Some(record) = state.machines.get_mut(&id) {
                        record.transition(MachineState::Failed);
                    }
                    state.machines.remove(&id);
                }
                // The runtime may have staged files before failing.
                self.remove_workspace(id).await;
                self.note_failure();
                self.replenish().await;
                return Err(PoolError::Provision(format!("{e:#}")));
            }
        };

        let mut state = self.state.lock().await;
        match state.machines.get_mut(&id) {
            Some(record) if self.is_accepting() => {
                // A handshake may already be on the record if the guest came
                // up before start_vm returned.
                record.handle = Some(handle);
                record.transition(MachineState::ColdReady);
                info!(machine_id = %id, early_handshake = record.handshake_at.is_some(), "Machine booted, awaiting handshake");
                Ok(())
            }
            _ => {
                state.machines.remove(&id);
                drop(state);
                if let Err(e) = self.runtime.stop_vm(&handle).await {
                    warn!(machine_id = %id, error = %e, "Failed to stop machine booted during shutdown");
                }
                self.remove_workspace(id).await;
                Err(PoolError::ShuttingDown)
            }
        }
    }

    /// Waits for the guest agent's handshake and moves the VM to `warm`.
    ///
    /// On timeout the VM is marked failed and torn down.
    pub async fn await_handshake(
        self: &Arc<Self>,
        id: MachineId,
        timeout: Duration,
    ) -> Result<(), PoolError> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let notified = self.handshake_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock().await;
                let record = state
                    .machines
                    .get_mut(&id)
                    .ok_or(PoolError::UnknownMachine(id))?;

                if !self.is_accepting() && record.state.is_live() && record.state != MachineState::Running {
                    drop(state);
                    self.fail_and_teardown(id).await;
                    return Err(PoolError::ShuttingDown);
                }

                if record.handshake_at.is_some() {
                    match record.state {
                        MachineState::ColdReady => {
                            record.transition(MachineState::Warm);
                            self.consecutive_failures.store(0, Ordering::SeqCst);
                            info!(machine_id = %id, "Machine warm");
                            return Ok(());
                        }
                        MachineState::Warm | MachineState::Running => return Ok(()),
                        actual => {
                            return Err(PoolError::InvalidState {
                                id,
                                expected: MachineState::ColdReady,
                                actual,
                            })
                        }
                    }
                }
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                warn!(machine_id = %id, timeout_ms = timeout.as_millis() as u64, "Handshake timed out");
                self.fail_and_teardown(id).await;
                return Err(PoolError::HandshakeTimeout { id, timeout });
            }
        }
    }

    /// Records a guest handshake on the VM's record. Returns whether the VM
    /// is known; handshakes from VMs this node never reserved are dropped.
    pub async fn record_handshake(&self, id: MachineId) -> bool {
        {
            let mut state = self.state.lock().await;
            let Some(record) = state.machines.get_mut(&id) else {
                return false;
            };
            record.handshake_at = Some(Utc::now());
        }
        self.handshake_notify.notify_waiters();
        true
    }

    /// Tears down a VM that never reached `running`.
    async fn fail_and_teardown(self: &Arc<Self>, id: MachineId) {
        let Some(lifecycle) = self.lifecycle_lock(id).await else {
            return;
        };
        let _guard = lifecycle.lock().await;

        let handle = {
            let mut state = self.state.lock().await;
            match state.machines.get_mut(&id) {
                Some(record)
                    if matches!(
                        record.state,
                        MachineState::Provisioning | MachineState::ColdReady
                    ) =>
                {
                    record.transition(MachineState::Failed);
                    record.handle.take()
                }
                _ => return,
            }
        };

        if let Some(handle) = handle {
            if let Err(e) = self.runtime.stop_vm(&handle).await {
                warn!(machine_id = %id, error = %e, "Failed to stop failed machine");
            }
        }
        self.remove_workspace(id).await;

        self.state.lock().await.machines.remove(&id);
        info!(machine_id = %id, "Failed machine removed");

        if self.is_accepting() {
            self.note_failure();
        }
        self.replenish().await;
    }

    fn note_failure(&self) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(failures, "Provisioning failure recorded");
    }

    /// Provisions enough VMs in the background to bring the live count back
    /// to the pool size.
    async fn replenish(self: &Arc<Self>) {
        if !self.is_accepting() {
            return;
        }

        let reserved: Vec<(MachineId, MachineTemplate)> = {
            let mut state = self.state.lock().await;
            let live = state.machines.values().filter(|m| m.state.is_live()).count();
            let deficit = self.config.machine_pool_size.saturating_sub(live);
            (0..deficit)
                .map(|_| {
                    let id = MachineId::new();
                    let template = self.config.machine_template;
                    state.machines.insert(id, MachineRecord::new(id, template));
                    (id, template)
                })
                .collect()
        };

        if reserved.is_empty() {
            return;
        }
        info!(count = reserved.len(), "Replenishing machine pool");

        let Ok(mut tasks) = self.provisioning.lock() else {
            error!("Provisioning task set poisoned");
            return;
        };
        while tasks.try_join_next().is_some() {}
        for (id, template) in reserved {
            let manager = Arc::clone(self);
            tasks.spawn(manager.fill_slot(id, template));
        }
    }

    // Boxed: provisioning re-enters replenish on failure.
    fn fill_slot(self: Arc<Self>, id: MachineId, template: MachineTemplate) -> BoxFuture<'static, ()> {
        async move {
            let delay = self
                .backoff
                .delay(self.consecutive_failures.load(Ordering::SeqCst));
            if !delay.is_zero() {
                debug!(machine_id = %id, delay_ms = delay.as_millis() as u64, "Backing off before provisioning");
                let mut draining = self.draining.subscribe();
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = draining.wait_for(|draining| *draining) => {}
                }
            }

            if !self.is_accepting() {
                self.state.lock().await.machines.remove(&id);
                return;
            }

            if let Err(e) = self.boot_reserved(id, template).await {
                warn!(machine_id = %id, error = %e, "Background provisioning failed");
                return;
            }
            if let Err(e) = self.await_handshake(id, self.config.handshake_timeout).await {
                warn!(machine_id = %id, error = %e, "Machine never became warm");
            }
        }
        .boxed()
    }

    // =========================================================================
    // Workloads
    // =========================================================================

    async fn lifecycle_lock(&self, id: MachineId) -> Option<Arc<Mutex<()>>> {
        self.state
            .lock()
            .await
            .machines
            .get(&id)
            .map(|record| Arc::clone(&record.lifecycle))
    }

    /// Deploys a workload onto a warm VM.
    ///
    /// On any failure the VM stays warm.
    pub async fn deploy(
        self: &Arc<Self>,
        id: MachineId,
        request: DeployRequest,
    ) -> Result<(), PoolError> {
        if !self.is_accepting() {
            return Err(PoolError::ShuttingDown);
        }

        let lifecycle = self
            .lifecycle_lock(id)
            .await
            .ok_or(PoolError::UnknownMachine(id))?;
        let _guard = lifecycle.lock().await;

        {
            let state = self.state.lock().await;
            let record = state.machines.get(&id).ok_or(PoolError::UnknownMachine(id))?;
            if record.state != MachineState::Warm {
                return Err(PoolError::InvalidState {
                    id,
                    expected: MachineState::Warm,
                    actual: record.state,
                });
            }
        }

        // Unrecognised tags are left for the provider factory to reject.
        if let Some(workload_type) = request.parsed_type() {
            if !self.config.accepts(workload_type) {
                return Err(PoolError::WorkloadTypeNotAccepted(workload_type));
            }
        }
        if !self.config.trusts_issuer(&request.claims.issuer) {
            return Err(PoolError::UntrustedIssuer(request.claims.issuer.clone()));
        }
        check_scope(&request)?;

        let namespace = request.namespace.clone();
        let workload_name = request.workload_name.clone();
        let claims = request.claims.clone();
        let params = ExecutionProviderParams::from_request(request, id);

        let provider: Arc<dyn ExecutionProvider> =
            Arc::from(new_execution_provider(params, self.providers.clone())?);
        let workload_type = provider.workload_type();

        provider.validate().await?;
        provider.deploy().await?;

        let mut state = self.state.lock().await;
        let Some(record) = state.machines.get_mut(&id) else {
            drop(state);
            warn!(machine_id = %id, "Machine vanished during deploy");
            provider.undeploy().await.ok();
            return Err(PoolError::UnknownMachine(id));
        };

        record.transition(MachineState::Running);
        record.assignment = Some(Assignment {
            namespace: namespace.clone(),
            workload_name: workload_name.clone(),
            claims,
            workload_type,
            provider,
            deployed_at: Utc::now(),
        });

        info!(
            machine_id = %id,
            namespace = %namespace,
            workload = %workload_name,
            workload_type = %workload_type,
            "Workload deployed"
        );
        Ok(())
    }

    /// Deploys onto any warm VM, oldest first.
    pub async fn deploy_next(self: &Arc<Self>, request: DeployRequest) -> Result<MachineId, PoolError> {
        let candidates: Vec<MachineId> = {
            let state = self.state.lock().await;
            let mut warm: Vec<&MachineRecord> = state
                .machines
                .values()
                .filter(|m| m.state == MachineState::Warm)
                .collect();
            warm.sort_by_key(|m| m.created_at);
            warm.into_iter().map(|m| m.id).collect()
        };

        for id in candidates {
            match self.deploy(id, request.clone()).await {
                Ok(()) => return Ok(id),
                // Taken by a concurrent deploy or torn down meanwhile.
                Err(PoolError::InvalidState { .. }) | Err(PoolError::UnknownMachine(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(PoolError::NoWarmMachines)
    }

    /// Invokes the workload running on `id`.
    pub async fn execute(
        &self,
        id: MachineId,
        subject: &str,
        payload: Vec<u8>,
    ) -> Result<Vec<u8>, PoolError> {
        let provider = {
            let state = self.state.lock().await;
            let record = state.machines.get(&id).ok_or(PoolError::UnknownMachine(id))?;
            match &record.assignment {
                Some(assignment) if record.state == MachineState::Running => {
                    Arc::clone(&assignment.provider)
                }
                _ => {
                    return Err(PoolError::InvalidState {
                        id,
                        expected: MachineState::Running,
                        actual: record.state,
                    })
                }
            }
        };

        Ok(provider.execute(subject, payload).await?)
    }

    /// Stops the workload on `id` and tears the VM down.
    ///
    /// Undeploying a VM that is already stopping or gone is a no-op.
    pub async fn undeploy(self: &Arc<Self>, id: MachineId) -> Result<(), PoolError> {
        let Some(lifecycle) = self.lifecycle_lock(id).await else {
            debug!(machine_id = %id, "Undeploy of unknown machine ignored");
            return Ok(());
        };
        let _guard = lifecycle.lock().await;

        match self.machine_state(id).await {
            None | Some(MachineState::Stopping) | Some(MachineState::Terminated) => Ok(()),
            Some(MachineState::Running) => {
                self.teardown(id).await;
                Ok(())
            }
            Some(actual) => Err(PoolError::InvalidState {
                id,
                expected: MachineState::Running,
                actual,
            }),
        }
    }

    /// Tears down a VM whose workload exited on its own. Ignored unless the
    /// VM is running.
    pub async fn handle_workload_stopped(self: &Arc<Self>, id: MachineId) {
        let Some(lifecycle) = self.lifecycle_lock(id).await else {
            return;
        };
        let _guard = lifecycle.lock().await;

        match self.machine_state(id).await {
            Some(MachineState::Running) => {
                info!(machine_id = %id, "Workload stopped, tearing down machine");
                self.teardown(id).await;
            }
            other => {
                debug!(machine_id = %id, state = ?other, "Ignoring workload_stopped");
            }
        }
    }

    /// Stops the workload and the VM and removes the record. The caller holds
    /// the VM's lifecycle lock.
    async fn teardown(self: &Arc<Self>, id: MachineId) {
        let (assignment, handle) = {
            let mut state = self.state.lock().await;
            let Some(record) = state.machines.get_mut(&id) else {
                return;
            };
            record.transition(MachineState::Stopping);
            (record.assignment.take(), record.handle.take())
        };

        if let Some(assignment) = assignment {
            if let Err(e) = assignment.provider.undeploy().await {
                warn!(machine_id = %id, error = %e, "Workload undeploy failed");
            }
        }
        if let Some(handle) = handle {
            if let Err(e) = self.runtime.stop_vm(&handle).await {
                warn!(machine_id = %id, error = %e, "Failed to stop machine");
            }
        }
        self.remove_workspace(id).await;

        {
            let mut state = self.state.lock().await;
            if let Some(record) = state.machines.get_mut(&id) {
                record.transition(MachineState::Terminated);
            }
            state.machines.remove(&id);
        }
        info!(machine_id = %id, "Machine terminated");

        self.replenish().await;
    }

    async fn remove_workspace(&self, id: MachineId) {
        let workspace = self.workspace(&id);
        if let Err(e) = tokio::fs::remove_dir_all(&workspace).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(machine_id = %id, path = %workspace.display(), error = %e, "Failed to remove workspace");
            }
        }
    }

    /// Stops accepting work and tears down every VM, waiting for all of them.
    pub async fn shutdown(self: &Arc<Self>) {
        if self.draining.send_replace(true) {
            return;
        }
        info!("Draining machine pool");
        self.handshake_notify.notify_waiters();

        let mut tasks = match self.provisioning.lock() {
            Ok(mut tasks) => std::mem::take(&mut *tasks),
            Err(_) => JoinSet::new(),
        };
        while tasks.join_next().await.is_some() {}

        let ids: Vec<MachineId> = self.state.lock().await.machines.keys().copied().collect();
        join_all(ids.into_iter().map(|id| self.drain_machine(id))).await;

        info!("Machine pool drained");
    }

    async fn drain_machine(self: &Arc<Self>, id: MachineId) {
        let Some(lifecycle) = self.lifecycle_lock(id).await else {
            return;
        };
        let _guard = lifecycle.lock().await;

        if self.machine_state(id).await.is_some_and(|state| state.is_live()) {
            self.teardown(id).await;
        }
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    pub async fn machine_state(&self, id: MachineId) -> Option<MachineState> {
        self.state.lock().await.machines.get(&id).map(|m| m.state)
    }

    pub async fn list_machines(&self) -> Vec<MachineSummary> {
        let state = self.state.lock().await;
        let mut machines: Vec<MachineSummary> =
            state.machines.values().map(MachineRecord::summary).collect();
        machines.sort_by_key(|m| m.id);
        machines
    }

    pub async fn warm_count(&self) -> usize {
        self.state
            .lock()
            .await
            .machines
            .values()
            .filter(|m| m.state == MachineState::Warm)
            .count()
    }

    pub async fn live_count(&self) -> usize {
        self.state
            .lock()
            .await
            .machines
            .values()
            .filter(|m| m.state.is_live())
            .count()
    }

    pub async fn has_provider(&self, id: MachineId) -> bool {
        self.state
            .lock()
            .await
            .machines
            .get(&id)
            .is_some_and(|m| m.assignment.is_some())
    }

    /// `(namespace, workload)` used to scope the VM's external subjects, or
    /// `None` for unknown VMs.
    pub async fn publish_scope(&self, id: MachineId) -> Option<(String, String)> {
        self.state.lock().await.machines.get(&id).map(|m| {
            let (namespace, workload) = m.scope();
            (namespace.to_string(), workload.to_string())
        })
    }

    pub async fn handshake_at(&self, id: MachineId) -> Option<DateTime<Utc>> {
        self.state
            .lock()
            .await
            .machines
            .get(&id)
            .and_then(|m| m.handshake_at)
    }

    /// Asks the runtime whether the VM is healthy.
    pub async fn check_health(&self, id: MachineId) -> Result<bool, PoolError> {
        let handle = self
            .state
            .lock()
            .await
            .machines
            .get(&id)
            .ok_or(PoolError::UnknownMachine(id))?
            .handle
            .clone();

        match handle {
            Some(handle) => self
                .runtime
                .check_vm_health(&handle)
                .await
                .map_err(|e| PoolError::Provision(format!("{e:#}"))),
            None => Ok(false),
        }
    }
}

/// The namespace and the claims subject each become one token of the VM's
/// external subjects.
fn check_scope(request: &DeployRequest) -> Result<(), PoolError> {
    for (field, value) in [
        ("namespace", &request.namespace),
        ("claims subject", &request.claims.subject),
    ] {
        if !subjects::is_valid_token(value) {
            return Err(PoolError::InvalidScope {
                field,
                value: value.clone(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::InMemoryBus;
    use crate::config::NodeConfigFile;
    use crate::runtime::MockRuntime;

    fn manager(
        pool_size: usize,
        runtime: Arc<MockRuntime>,
        backoff: BackoffPolicy,
    ) -> (tempfile::TempDir, Arc<MachineManager>) {
        let dir = tempfile::tempdir().unwrap();
        let config = NodeConfiguration::resolve(NodeConfigFile {
            default_resource_dir: Some("/opt/kiln".into()),
            machine_pool_size: Some(pool_size),
            handshake_timeout_ms: Some(1_000),
            work_dir: Some(dir.path().to_path_buf()),
            ..Default::default()
        })
        .unwrap();
        let bus = Arc::new(InMemoryBus::new());
        let providers = ProviderContext::new(bus, "agentint");
        let manager = MachineManager::new(Arc::new(config), "node-test", runtime, providers)
            .with_backoff(backoff);
        (dir, Arc::new(manager))
    }

    /// Handshakes on behalf of every cold machine until the pool is warm.
    async fn handshake_until_warm(manager: &MachineManager, count: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while manager.warm_count().await < count {
                for summary in manager.list_machines().await {
                    if summary.state == MachineState::ColdReady {
                        manager.record_handshake(summary.id).await;
                    }
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("pool never warmed");
    }

    #[tokio::test]
    async fn test_replenish_recovers_after_failures() {
        let runtime = Arc::new(MockRuntime::failing());
        let backoff = BackoffPolicy {
            base: Duration::from_millis(5),
            max: Duration::from_millis(20),
            jitter: 0.0,
        };
        let (_dir, manager) = manager(1, runtime.clone(), backoff);

        manager.start().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(manager.warm_count().await, 0);
        assert!(manager.consecutive_failures.load(Ordering::SeqCst) > 0);

        runtime.set_fail_starts(false);
        handshake_until_warm(&manager, 1).await;

        assert_eq!(manager.consecutive_failures.load(Ordering::SeqCst), 0);
        assert_eq!(runtime.starts(), 1);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_backoff() {
        let runtime = Arc::new(MockRuntime::failing());
        let backoff = BackoffPolicy {
            base: Duration::from_secs(60),
            max: Duration::from_secs(60),
            jitter: 0.0,
        };
        let (_dir, manager) = manager(1, runtime, backoff);

        manager.start().await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        tokio::time::timeout(Duration::from_secs(2), manager.shutdown())
            .await
            .expect("shutdown waited out the backoff");
        assert!(manager.list_machines().await.is_empty());
    }

    #[tokio::test]
    async fn test_replenish_spawns_exact_deficit() {
        let runtime = Arc::new(MockRuntime::new());
        let (_dir, manager) = manager(3, runtime.clone(), BackoffPolicy::none());

        manager.start().await;
        // A second pass while the first batch is still booting adds nothing.
        manager.replenish().await;
        handshake_until_warm(&manager, 3).await;

        assert_eq!(runtime.starts(), 3);
        assert_eq!(manager.live_count().await, 3);
        manager.shutdown().await;
        assert_eq!(runtime.stops(), 3);
    }

    #[tokio::test]
    async fn test_handshake_from_unreserved_machine_is_dropped() {
        let (_dir, manager) = manager(0, Arc::new(MockRuntime::new()), BackoffPolicy::none());
        let stranger = MachineId::new();

        assert!(!manager.record_handshake(stranger).await);
        assert!(manager.handshake_at(stranger).await.is_none());
        assert!(manager.list_machines().await.is_empty());
    }

    #[tokio::test]
    async fn test_handshake_during_provisioning_is_kept() {
        let runtime = Arc::new(MockRuntime::new().with_start_delay(Duration::from_millis(200)));
        let (_dir, manager) = manager(0, runtime, BackoffPolicy::none());

        let booting = tokio::spawn({
            let manager = Arc::clone(&manager);
            async move { manager.provision_vm(None).await }
        });

        let id = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if let Some(summary) = manager.list_machines().await.first() {
                    return summary.id;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(manager.machine_state(id).await, Some(MachineState::Provisioning));
        assert!(manager.record_handshake(id).await);

        assert_eq!(booting.await.unwrap().unwrap(), id);
        assert!(manager.handshake_at(id).await.is_some());
        manager
            .await_handshake(id, Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(manager.machine_state(id).await, Some(MachineState::Warm));
        manager.shutdown().await;
    }

    /// Stages a directory in the VM's workspace, then fails to boot.
    struct FailsAfterStaging;

    #[async_trait::async_trait]
    impl Runtime for FailsAfterStaging {
        async fn start_vm(&self, spec: &MachineSpec) -> anyhow::Result<crate::runtime::VmHandle> {
            tokio::fs::create_dir_all(spec.workspace.join("vm")).await?;
            anyhow::bail!("hypervisor refused to start")
        }

        async fn stop_vm(&self, _handle: &crate::runtime::VmHandle) -> anyhow::Result<()> {
            Ok(())
        }

        async fn check_vm_health(&self, _handle: &crate::runtime::VmHandle) -> anyhow::Result<bool> {
            Ok(false)
        }
    }

    #[tokio::test]
    async fn test_failed_boot_removes_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let config = NodeConfiguration::resolve(NodeConfigFile {
            default_resource_dir: Some("/opt/kiln".into()),
            machine_pool_size: Some(0),
            work_dir: Some(dir.path().to_path_buf()),
            ..Default::default()
        })
        .unwrap();
        let providers = ProviderContext::new(Arc::new(InMemoryBus::new()), "agentint");
        let manager = Arc::new(MachineManager::new(
            Arc::new(config),
            "node-test",
            Arc::new(FailsAfterStaging),
            providers,
        ));

        for _ in 0..3 {
            assert!(matches!(
                manager.provision_vm(None).await,
                Err(PoolError::Provision(_))
            ));
        }
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_deploy_rejects_scope_that_is_not_one_token() {
        let (_dir, manager) = manager(1, Arc::new(MockRuntime::new()), BackoffPolicy::none());
        manager.start().await;
        handshake_until_warm(&manager, 1).await;
        let id = manager.list_machines().await[0].id;

        let cases = [
            DeployRequest::new("wasm", "echo", Vec::new()).with_namespace("team.a"),
            DeployRequest::new("wasm", "echo", Vec::new()).with_namespace(""),
            DeployRequest::new("wasm", "echo", Vec::new()).with_namespace("prod >"),
            DeployRequest::new("wasm", "echo", Vec::new()).with_claims(kiln_agent_api::WorkloadClaims {
                subject: "echo.*".to_string(),
                name: "echo".to_string(),
                issuer: String::new(),
            }),
            DeployRequest::new("wasm", "", Vec::new()),
        ];
        for request in cases {
            assert!(matches!(
                manager.deploy(id, request).await,
                Err(PoolError::InvalidScope { .. })
            ));
            assert_eq!(manager.machine_state(id).await, Some(MachineState::Warm));
        }
        manager.shutdown().await;
    }
}
