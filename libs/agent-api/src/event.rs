//! Cloud-event envelope emitted by the guest agent.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use kiln_id::MachineId;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AgentApiError;

/// Reserved event type signalling that the workload inside a VM has exited.
/// The host tears the VM down when it sees this type.
pub const WORKLOAD_STOPPED_EVENT_TYPE: &str = "workload_stopped";

/// CloudEvents 1.0 specification version string.
pub const CLOUD_EVENT_SPEC_VERSION: &str = "1.0";

/// A structured event in CloudEvents JSON format.
///
/// Unknown extension attributes are preserved so the envelope survives a
/// decode/encode cycle, although the host republishes the original bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloudEvent {
    #[serde(default = "default_spec_version")]
    pub specversion: String,

    #[serde(default)]
    pub id: String,

    #[serde(default)]
    pub source: String,

    #[serde(rename = "type")]
    pub event_type: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datacontenttype: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,

    #[serde(flatten)]
    pub extensions: BTreeMap<String, serde_json::Value>,
}

fn default_spec_version() -> String {
    CLOUD_EVENT_SPEC_VERSION.to_string()
}

impl CloudEvent {
    /// Creates an event with a fresh id and the current time.
    pub fn new(source: impl Into<String>, event_type: impl Into<String>) -> Self {
        Self {
            specversion: default_spec_version(),
            id: Uuid::new_v4().to_string(),
            source: source.into(),
            event_type: event_type.into(),
            time: Some(Utc::now()),
            datacontenttype: None,
            subject: None,
            data: None,
            extensions: BTreeMap::new(),
        }
    }

    /// Attaches a JSON payload.
    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.datacontenttype = Some("application/json".to_string());
        self.data = Some(data);
        self
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    /// The event a guest emits when its workload process exits.
    pub fn workload_stopped(machine_id: &MachineId, workload_name: &str, exit_code: i32) -> Self {
        Self::new(format!("kiln-agent/{machine_id}"), WORKLOAD_STOPPED_EVENT_TYPE)
            .with_subject(workload_name)
            .with_data(serde_json::json!({
                "name": workload_name,
                "code": exit_code,
                "message": "Workload stopped",
            }))
    }

    pub fn is_workload_stopped(&self) -> bool {
        self.event_type == WORKLOAD_STOPPED_EVENT_TYPE
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, AgentApiError> {
        serde_json::from_slice(bytes).map_err(|e| AgentApiError::payload("cloud event", e))
    }

    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_event_decodes() {
        let event = CloudEvent::decode(br#"{"type":"workload_stopped"}"#).unwrap();
        assert!(event.is_workload_stopped());
        assert_eq!(event.specversion, "1.0");
        assert!(event.data.is_none());
    }

    #[test]
    fn test_event_without_type_is_rejected() {
        assert!(CloudEvent::decode(br#"{"id":"abc"}"#).is_err());
    }

    #[test]
    fn test_extensions_are_preserved() {
        let raw = br#"{"type":"custom","id":"1","source":"s","traceparent":"00-abc"}"#;
        let event = CloudEvent::decode(raw).unwrap();
        assert_eq!(
            event.extensions.get("traceparent"),
            Some(&serde_json::json!("00-abc"))
        );

        let value: serde_json::Value = serde_json::from_slice(&event.encode()).unwrap();
        assert_eq!(value["traceparent"], "00-abc");
        assert_eq!(value["type"], "custom");
    }

    #[test]
    fn test_workload_stopped_builder() {
        let id = MachineId::new();
        let event = CloudEvent::workload_stopped(&id, "echo", 3);
        assert!(event.is_workload_stopped());
        assert_eq!(event.subject.as_deref(), Some("echo"));
        assert_eq!(event.data.as_ref().unwrap()["code"], 3);
        assert!(event.source.contains(&id.to_string()));
    }
}
