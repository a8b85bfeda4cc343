//! kiln node agent
//!
//! Boots a warm pool of micro-VMs, serves the internal bus their guest agents
//! dial into, and relays guest telemetry until interrupted.
//!
//! ## Environment
//!
//! - `KILN_CONFIG`: node configuration file (default `/etc/kiln/node.json`)
//! - `KILN_NODE_KEY`: node public key used on external subjects
//! - `KILN_FIRECRACKER`: path to the firecracker binary; the mock runtime is
//!   used when unset
//! - `KILN_LOG`: tracing filter (default `info`)

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use kiln_id::NodeId;
use kiln_node_agent::bus::{InMemoryBus, MessageBus};
use kiln_node_agent::config::NodeConfiguration;
use kiln_node_agent::firecracker::{FirecrackerRuntime, FirecrackerRuntimeConfig};
use kiln_node_agent::runtime::{MockRuntime, Runtime};
use kiln_node_agent::Node;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_CONFIG_PATH: &str = "/etc/kiln/node.json";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_env("KILN_LOG").unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting kiln node agent");

    let config_path = std::env::var("KILN_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));
    let config = NodeConfiguration::load(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;

    let node_key = std::env::var("KILN_NODE_KEY").unwrap_or_else(|_| NodeId::new().to_string());
    info!(
        node_key = %node_key,
        pool_size = config.machine_pool_size,
        workload_types = ?config.workload_types,
        "Configuration loaded"
    );

    // The bus transport is external to the agent; the in-process bus serves
    // both sides until one is wired in.
    let bus: Arc<dyn MessageBus> = Arc::new(InMemoryBus::new());

    let runtime: Arc<dyn Runtime> = match std::env::var("KILN_FIRECRACKER") {
        Ok(path) => {
            config.validate().context("invalid node configuration")?;

            let addr = format!("{}:{}", config.internal_node_host, config.internal_node_port);
            let listener = TcpListener::bind(&addr)
                .await
                .with_context(|| format!("binding internal bus on {addr}"))?;
            info!(addr = %addr, "Serving internal bus to guests");
            let served = Arc::clone(&bus);
            tokio::spawn(async move {
                if let Err(e) = kiln_bus::remote::serve_listener(listener, served).await {
                    error!(error = %e, "Internal bus listener stopped");
                }
            });

            Arc::new(FirecrackerRuntime::new(FirecrackerRuntimeConfig {
                firecracker_path: PathBuf::from(path),
            }))
        }
        Err(_) => {
            warn!("KILN_FIRECRACKER not set, using mock runtime with in-process guest agents");
            Arc::new(MockRuntime::new().with_guest_agent(Arc::clone(&bus)))
        }
    };

    let node = Node::new(config, node_key, runtime, Arc::clone(&bus), bus);
    node.start().await.context("starting node")?;

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("Received shutdown signal");

    node.shutdown().await;
    info!("Node agent shutdown complete");
    Ok(())
}
