//! Node wiring.
//!
//! A [`Node`] ties one configuration, one runtime and the two buses to a
//! [`MachineManager`] and its [`AgentComms`], and owns the shutdown order:
//! the pool drains before the agent subscriptions are released, so guest
//! traffic sent during teardown is still relayed.

use std::sync::Arc;

use tracing::info;

use crate::bus::{BusError, MessageBus};
use crate::comms::AgentComms;
use crate::config::NodeConfiguration;
use crate::pool::MachineManager;
use crate::providers::ProviderContext;
use crate::runtime::Runtime;

pub struct Node {
    manager: Arc<MachineManager>,
    comms: AgentComms,
}

impl Node {
    pub fn new(
        config: NodeConfiguration,
        node_key: impl Into<String>,
        runtime: Arc<dyn Runtime>,
        internal: Arc<dyn MessageBus>,
        external: Arc<dyn MessageBus>,
    ) -> Self {
        let providers = ProviderContext::new(Arc::clone(&internal), &config.internal_subject_prefix)
            .with_execute_timeout(config.execute_timeout);
        let manager = Arc::new(MachineManager::new(
            Arc::new(config),
            node_key,
            runtime,
            providers,
        ));
        let comms = AgentComms::new(Arc::clone(&manager), internal, external);

        Self { manager, comms }
    }

    pub fn manager(&self) -> &Arc<MachineManager> {
        &self.manager
    }

    /// Starts listening for guests, then fills the pool.
    pub async fn start(&self) -> Result<(), BusError> {
        self.comms.start().await?;
        self.manager.start().await;
        info!(node_id = %self.manager.node_id(), "Node started");
        Ok(())
    }

    pub async fn shutdown(&self) {
        info!(node_id = %self.manager.node_id(), "Shutting down node");
        self.manager.shutdown().await;
        self.comms.stop();
        info!("Node shutdown complete");
    }
}
