//! Handshake with the node agent.
//!
//! The guest announces itself on `{internal}.{vmId}.handshake` and waits for
//! the host's `OK`. The host's subscription may not be reachable yet when
//! the guest comes up, so failed attempts are retried.

use kiln_agent_api::{subjects, HandshakeRequest, HANDSHAKE_ACK};
use kiln_bus::MessageBus;
use tracing::{debug, info, warn};

use crate::config::GuestConfig;
use crate::error::GuestError;

/// Handshakes until the host acknowledges or the attempts run out.
pub async fn perform_handshake(bus: &dyn MessageBus, config: &GuestConfig) -> Result<(), GuestError> {
    let machine_id = config.machine_id;
    let subject = subjects::handshake(&config.internal_prefix, &machine_id);
    let payload = HandshakeRequest::new(machine_id, "guest agent online").encode();

    info!(machine_id = %machine_id, subject = %subject, "Performing handshake with node agent");

    let mut last_error = String::from("no attempts made");
    for attempt in 0..config.handshake_attempts {
        match bus
            .request(&subject, payload.clone(), config.handshake_timeout)
            .await
        {
            Ok(reply) if reply == HANDSHAKE_ACK => {
                info!(machine_id = %machine_id, attempt, "Handshake acknowledged");
                return Ok(());
            }
            Ok(reply) => {
                let reply = String::from_utf8_lossy(&reply).into_owned();
                warn!(machine_id = %machine_id, reply = %reply, "Unexpected handshake reply");
                return Err(GuestError::HandshakeFailed(format!("unexpected reply '{reply}'")));
            }
            Err(e) => {
                debug!(machine_id = %machine_id, attempt, error = %e, "Handshake attempt failed");
                last_error = e.to_string();
                tokio::time::sleep(config.handshake_retry).await;
            }
        }
    }

    Err(GuestError::HandshakeFailed(format!(
        "no acknowledgement after {} attempts: {last_error}",
        config.handshake_attempts
    )))
}
