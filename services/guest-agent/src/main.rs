//! kiln guest agent binary.
//!
//! Started by the VM's init. Configuration comes from `kiln.*` kernel
//! parameters; `KILN_LOG` sets the tracing filter (default `info`).

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use kiln_bus::{MessageBus, RemoteBus};
use kiln_guest_agent::{GuestAgent, GuestConfig, VERSION};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const CONNECT_ATTEMPTS: u32 = 50;
const CONNECT_RETRY: Duration = Duration::from_millis(100);

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_env("KILN_LOG").unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(version = VERSION, "Starting kiln guest agent");

    match run().await {
        Ok(()) => {
            info!("Guest agent exiting");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "Guest agent failed");
            for cause in e.chain().skip(1) {
                error!(cause = %cause, "Caused by");
            }
            ExitCode::from(1)
        }
    }
}

/// The node's listener may come up after the VM; retry until it answers.
async fn connect(addr: &str) -> Result<RemoteBus> {
    let mut attempt = 0;
    loop {
        match RemoteBus::connect(addr).await {
            Ok(bus) => return Ok(bus),
            Err(e) if attempt + 1 < CONNECT_ATTEMPTS => {
                warn!(addr, attempt, error = %e, "Node bus not reachable yet");
                attempt += 1;
                tokio::time::sleep(CONNECT_RETRY).await;
            }
            Err(e) => return Err(e).with_context(|| format!("connecting to node bus at {addr}")),
        }
    }
}

async fn run() -> Result<()> {
    let config = GuestConfig::load().context("reading kernel parameters")?;
    let addr = config.host_addr();
    info!(machine_id = %config.machine_id, addr = %addr, "Connecting to node bus");

    let bus: Arc<dyn MessageBus> = Arc::new(connect(&addr).await?);
    let agent = Arc::new(GuestAgent::new(config, bus));

    let mut terminate = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    let served = tokio::select! {
        result = Arc::clone(&agent).run() => Some(result),
        _ = terminate.recv() => None,
    };

    match served {
        Some(result) => {
            agent.shutdown().await.ok();
            result.context("serving control requests")
        }
        None => {
            info!("Received SIGTERM, stopping workload");
            agent.shutdown().await.context("stopping workload")
        }
    }
}
