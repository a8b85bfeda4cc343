//! Internal agent protocol handler.
//!
//! Guests reach the host only through three subject families on the internal
//! bus. Handshakes are answered; logs and events are relayed to the external
//! bus under the VM's namespace and workload scope. Every inbound message is
//! handled on its own task so a slow teardown never stalls relaying for other
//! VMs.

use std::sync::Arc;

use kiln_agent_api::{subjects, CloudEvent, EmittedLog, HandshakeRequest, LogEntry, HANDSHAKE_ACK};
use kiln_id::MachineId;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::bus::{BusError, InboundMessage, MessageBus, Subscription};
use crate::pool::MachineManager;

#[derive(Clone, Copy)]
enum Class {
    Handshake,
    Logs,
    Events,
}

impl Class {
    fn as_str(&self) -> &'static str {
        match self {
            Class::Handshake => "handshake",
            Class::Logs => "logs",
            Class::Events => "events",
        }
    }
}

struct Relay {
    manager: Arc<MachineManager>,
    external: Arc<dyn MessageBus>,
    internal_prefix: String,
    external_prefix: String,
}

pub struct AgentComms {
    relay: Arc<Relay>,
    internal: Arc<dyn MessageBus>,
    loops: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl AgentComms {
    pub fn new(
        manager: Arc<MachineManager>,
        internal: Arc<dyn MessageBus>,
        external: Arc<dyn MessageBus>,
    ) -> Self {
        let internal_prefix = manager.config().internal_subject_prefix.clone();
        let external_prefix = manager.config().external_subject_prefix.clone();
        Self {
            relay: Arc::new(Relay {
                manager,
                external,
                internal_prefix,
                external_prefix,
            }),
            internal,
            loops: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Subscribes to the internal subjects and starts dispatching.
    pub async fn start(&self) -> Result<(), BusError> {
        let prefix = &self.relay.internal_prefix;
        let subscriptions = [
            (Class::Handshake, subjects::handshake_wildcard(prefix)),
            (Class::Logs, subjects::logs_wildcard(prefix)),
            (Class::Events, subjects::events_wildcard(prefix)),
        ];

        let mut handles = Vec::with_capacity(subscriptions.len());
        for (class, pattern) in subscriptions {
            let subscription = self.internal.subscribe(&pattern).await?;
            debug!(pattern = %pattern, "Subscribed to agent subjects");
            handles.push(tokio::spawn(dispatch(
                Arc::clone(&self.relay),
                class,
                subscription,
            )));
        }

        if let Ok(mut loops) = self.loops.lock() {
            loops.extend(handles);
        }
        info!(prefix = %self.relay.internal_prefix, "Agent comms started");
        Ok(())
    }

    /// Stops the dispatch loops and releases their subscriptions.
    pub fn stop(&self) {
        if let Ok(mut loops) = self.loops.lock() {
            for handle in loops.drain(..) {
                handle.abort();
            }
        }
        info!("Agent comms stopped");
    }
}

impl Drop for AgentComms {
    fn drop(&mut self) {
        if let Ok(mut loops) = self.loops.lock() {
            for handle in loops.drain(..) {
                handle.abort();
            }
        }
    }
}

async fn dispatch(relay: Arc<Relay>, class: Class, mut subscription: Subscription) {
    while let Some(message) = subscription.next().await {
        let relay = Arc::clone(&relay);
        tokio::spawn(async move {
            match class {
                Class::Handshake => relay.handle_handshake(message).await,
                Class::Logs => relay.handle_log(message).await,
                Class::Events => relay.handle_event(message).await,
            }
        });
    }
    debug!(class = class.as_str(), "Agent subscription closed");
}

impl Relay {
    fn machine_id(&self, message: &InboundMessage) -> Option<MachineId> {
        match subjects::parse_internal(&self.internal_prefix, &message.subject) {
            Ok(parsed) => Some(parsed.machine_id),
            Err(e) => {
                warn!(subject = %message.subject, error = %e, "Dropping message on malformed subject");
                None
            }
        }
    }

    async fn handle_handshake(&self, message: InboundMessage) {
        let Some(machine_id) = self.machine_id(&message) else {
            return;
        };

        let request = match HandshakeRequest::decode(&message.payload) {
            Ok(request) => request,
            Err(e) => {
                error!(
                    machine_id = %machine_id,
                    payload = %String::from_utf8_lossy(&message.payload),
                    error = %e,
                    "Failed to decode handshake"
                );
                return;
            }
        };

        // A guest may only speak for its own VM.
        if request.machine_id != machine_id {
            warn!(
                machine_id = %machine_id,
                claimed = %request.machine_id,
                "Handshake machine id does not match subject"
            );
            return;
        }

        let known = self.manager.record_handshake(machine_id).await;
        if known {
            info!(machine_id = %machine_id, message = %request.message, "Received agent handshake");
        } else {
            debug!(machine_id = %machine_id, "Handshake from machine not yet registered");
        }

        if let Err(e) = message.respond(HANDSHAKE_ACK.to_vec()) {
            warn!(machine_id = %machine_id, error = %e, "Failed to acknowledge handshake");
        }
    }

    async fn handle_log(&self, message: InboundMessage) {
        let Some(machine_id) = self.machine_id(&message) else {
            return;
        };

        let Some((namespace, workload)) = self.manager.publish_scope(machine_id).await else {
            warn!(machine_id = %machine_id, "Dropping log from unknown machine");
            return;
        };

        let entry = match LogEntry::decode(&message.payload) {
            Ok(entry) => entry,
            Err(e) => {
                error!(
                    machine_id = %machine_id,
                    payload = %String::from_utf8_lossy(&message.payload),
                    error = %e,
                    "Failed to decode log entry"
                );
                return;
            }
        };

        let subject = subjects::log_publish(
            &self.external_prefix,
            &namespace,
            self.manager.node_id(),
            &workload,
            &machine_id,
        );
        let emitted = EmittedLog::from_entry(entry, &machine_id);
        let payload = match serde_json::to_vec(&emitted) {
            Ok(payload) => payload,
            Err(e) => {
                error!(machine_id = %machine_id, error = %e, "Failed to encode log");
                return;
            }
        };

        if let Err(e) = self.external.publish(&subject, payload).await {
            warn!(machine_id = %machine_id, subject = %subject, error = %e, "Failed to relay log");
        }
    }

    async fn handle_event(&self, message: InboundMessage) {
        let Some(machine_id) = self.machine_id(&message) else {
            return;
        };

        let Some((namespace, workload)) = self.manager.publish_scope(machine_id).await else {
            warn!(machine_id = %machine_id, "Dropping event from unknown machine");
            return;
        };

        let event = match CloudEvent::decode(&message.payload) {
            Ok(event) => event,
            Err(e) => {
                error!(
                    machine_id = %machine_id,
                    payload = %String::from_utf8_lossy(&message.payload),
                    error = %e,
                    "Failed to decode cloud event"
                );
                return;
            }
        };

        let subject = subjects::event_publish(
            &self.external_prefix,
            &namespace,
            self.manager.node_id(),
            &workload,
            &machine_id,
        );
        debug!(machine_id = %machine_id, event_type = %event.event_type, "Relaying agent event");
        if let Err(e) = self.external.publish(&subject, message.payload).await {
            warn!(machine_id = %machine_id, subject = %subject, error = %e, "Failed to relay event");
        }

        if event.is_workload_stopped() {
            info!(machine_id = %machine_id, "Received workload_stopped event");
            self.manager.handle_workload_stopped(machine_id).await;
        }
    }
}
