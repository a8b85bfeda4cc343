//! Handshake and log messages exchanged with the in-guest agent.

use kiln_id::MachineId;
use serde::{Deserialize, Serialize};

use crate::error::AgentApiError;

/// Body of the host's reply to a successful handshake.
pub const HANDSHAKE_ACK: &[u8] = b"OK";

/// Guest log severities, following the slog numeric convention.
pub mod level {
    pub const DEBUG: i32 = -4;
    pub const INFO: i32 = 0;
    pub const WARN: i32 = 4;
    pub const ERROR: i32 = 8;
}

/// Sent by the guest agent once it is up. The host must reply so the guest
/// knows the round trip worked; a publish alone could be lost silently.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeRequest {
    pub machine_id: MachineId,
    pub message: String,
}

impl HandshakeRequest {
    pub fn new(machine_id: MachineId, message: impl Into<String>) -> Self {
        Self {
            machine_id,
            message: message.into(),
        }
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, AgentApiError> {
        serde_json::from_slice(bytes).map_err(|e| AgentApiError::payload("handshake", e))
    }

    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }
}

/// A single log line emitted by the guest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub text: String,
    pub level: i32,
}

impl LogEntry {
    pub fn new(level: i32, text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            level,
        }
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, AgentApiError> {
        serde_json::from_slice(bytes).map_err(|e| AgentApiError::payload("log", e))
    }

    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }
}

/// A guest log line as republished on the external bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmittedLog {
    pub text: String,
    pub level: i32,
    #[serde(rename = "machineId")]
    pub machine_id: String,
}

impl EmittedLog {
    pub fn from_entry(entry: LogEntry, machine_id: &MachineId) -> Self {
        Self {
            text: entry.text,
            level: entry.level,
            machine_id: machine_id.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_entry_wire_shape() {
        let entry = LogEntry::decode(br#"{"text":"hello","level":4}"#).unwrap();
        assert_eq!(entry, LogEntry::new(level::WARN, "hello"));
    }

    #[test]
    fn test_emitted_log_field_names() {
        let id = MachineId::new();
        let emitted = EmittedLog::from_entry(LogEntry::new(4, "hello"), &id);
        let value = serde_json::to_value(&emitted).unwrap();
        assert_eq!(
            value,
            serde_json::json!({"text": "hello", "level": 4, "machineId": id.to_string()})
        );
    }

    #[test]
    fn test_handshake_decode_rejects_garbage() {
        let err = HandshakeRequest::decode(b"not json").unwrap_err();
        assert!(matches!(
            err,
            AgentApiError::MalformedPayload { kind: "handshake", .. }
        ));
    }

    #[test]
    fn test_handshake_decode_rejects_bad_machine_id() {
        let err = HandshakeRequest::decode(br#"{"machine_id":"v1","message":"hi"}"#);
        assert!(err.is_err());
    }
}
