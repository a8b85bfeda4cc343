//! The guest agent proper.
//!
//! Serves the node's control requests for one VM: `deploy` starts the
//! workload, `execute` calls a function workload and `undeploy` stops it.
//! Every request is answered with a [`GuestReply`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use kiln_agent_api::{subjects, GuestDeploy, GuestExecute, GuestReply, WorkloadType};
use kiln_bus::{BusError, InboundMessage, MessageBus};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::GuestConfig;
use crate::error::GuestError;
use crate::handshake::perform_handshake;
use crate::runners::{new_runner, RunnerContext, WorkloadRunner};

#[derive(Debug, Clone, Copy)]
enum Control {
    Deploy,
    Execute,
    Undeploy,
}

pub struct GuestAgent {
    config: Arc<GuestConfig>,
    bus: Arc<dyn MessageBus>,
    runner: Mutex<Option<Arc<dyn WorkloadRunner>>>,
    stopped: AtomicBool,
}

impl GuestAgent {
    pub fn new(config: GuestConfig, bus: Arc<dyn MessageBus>) -> Self {
        Self {
            config: Arc::new(config),
            bus,
            runner: Mutex::new(None),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &GuestConfig {
        &self.config
    }

    /// Subscribes to the control subjects, handshakes, then serves requests
    /// until the bus goes away.
    ///
    /// The subscriptions exist before the handshake is sent, so a deploy the
    /// node issues as soon as it sees the handshake is never missed.
    pub async fn run(self: Arc<Self>) -> Result<(), GuestError> {
        let prefix = &self.config.internal_prefix;
        let machine_id = self.config.machine_id;
        let mut deploys = self.bus.subscribe(&subjects::deploy(prefix, &machine_id)).await?;
        let mut executes = self.bus.subscribe(&subjects::execute(prefix, &machine_id)).await?;
        let mut undeploys = self
            .bus
            .subscribe(&subjects::undeploy(prefix, &machine_id))
            .await?;

        perform_handshake(self.bus.as_ref(), &self.config).await?;
        info!(machine_id = %machine_id, "Guest agent ready for workloads");

        loop {
            let (control, msg) = tokio::select! {
                Some(msg) = deploys.next() => (Control::Deploy, msg),
                Some(msg) = executes.next() => (Control::Execute, msg),
                Some(msg) = undeploys.next() => (Control::Undeploy, msg),
                else => break,
            };
            let agent = Arc::clone(&self);
            tokio::spawn(async move { agent.dispatch(control, msg).await });
        }

        warn!(machine_id = %machine_id, "Control subscriptions closed");
        Err(GuestError::Bus(BusError::Disconnected))
    }

    async fn dispatch(&self, control: Control, msg: InboundMessage) {
        let result = self.handle(control, &msg.payload).await;
        let reply = match result {
            Ok(payload) => GuestReply::ok(payload),
            Err(e) => {
                warn!(machine_id = %self.config.machine_id, request = ?control, error = %e, "Control request failed");
                GuestReply::err(e.to_string())
            }
        };

        if msg.expects_reply() {
            if let Err(e) = msg.respond(reply.encode()) {
                debug!(request = ?control, error = %e, "Control reply not delivered");
            }
        }
    }

    async fn handle(&self, control: Control, payload: &[u8]) -> Result<Vec<u8>, GuestError> {
        match control {
            Control::Deploy => {
                self.deploy(GuestDeploy::decode(payload)?).await?;
                Ok(Vec::new())
            }
            Control::Execute => {
                let request = GuestExecute::decode(payload)?;
                self.execute(&request.subject, request.payload).await
            }
            Control::Undeploy => {
                self.undeploy().await?;
                Ok(Vec::new())
            }
        }
    }

    /// Starts the one workload this VM will run.
    pub async fn deploy(&self, request: GuestDeploy) -> Result<(), GuestError> {
        let mut slot = self.runner.lock().await;
        if self.stopped.load(Ordering::SeqCst) {
            return Err(GuestError::ShuttingDown);
        }
        if slot.is_some() {
            return Err(GuestError::AlreadyDeployed);
        }

        let workload_name = request.workload_name.clone();
        let ctx = RunnerContext {
            config: Arc::clone(&self.config),
            bus: Arc::clone(&self.bus),
        };
        let runner: Arc<dyn WorkloadRunner> = Arc::from(new_runner(request, ctx)?);

        if let Err(e) = runner.start().await {
            // Clears anything staged before the failure.
            if let Err(stop_err) = runner.stop().await {
                debug!(error = %stop_err, "Cleanup after failed start failed");
            }
            return Err(e);
        }

        info!(
            machine_id = %self.config.machine_id,
            workload = %workload_name,
            workload_type = %runner.workload_type(),
            "Workload deployed"
        );
        *slot = Some(runner);
        Ok(())
    }

    pub async fn execute(&self, subject: &str, payload: Vec<u8>) -> Result<Vec<u8>, GuestError> {
        // Calls run concurrently with each other; only the lookup is locked.
        let runner = self
            .runner
            .lock()
            .await
            .clone()
            .ok_or(GuestError::NotDeployed)?;
        runner.execute(subject, payload).await
    }

    /// Stops the workload. Undeploying with nothing deployed succeeds.
    pub async fn undeploy(&self) -> Result<(), GuestError> {
        let runner = self.runner.lock().await.take();
        match runner {
            Some(runner) => {
                runner.stop().await?;
                info!(machine_id = %self.config.machine_id, "Workload undeployed");
                Ok(())
            }
            None => Ok(()),
        }
    }

    pub async fn deployed_type(&self) -> Option<WorkloadType> {
        self.runner
            .lock()
            .await
            .as_ref()
            .map(|runner| runner.workload_type())
    }

    /// Refuses further deploys and stops the running workload.
    pub async fn shutdown(&self) -> Result<(), GuestError> {
        self.stopped.store(true, Ordering::SeqCst);
        self.undeploy().await
    }
}
