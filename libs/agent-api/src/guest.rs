//! Host-to-guest workload control.
//!
//! The host drives the workload inside a VM with three request/reply
//! exchanges on `{internal}.{vmId}.deploy`, `.execute` and `.undeploy`.
//! Every exchange is answered with a [`GuestReply`]. Binary fields travel as
//! standard base64.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::AgentApiError;
use crate::workload::WorkloadType;

/// Places a workload inside the guest. The host has already validated the
/// artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestDeploy {
    pub workload_type: WorkloadType,
    pub workload_name: String,
    #[serde(with = "b64")]
    pub artifact: Vec<u8>,
    #[serde(default)]
    pub environment: HashMap<String, String>,
    #[serde(default)]
    pub argv: Vec<String>,
}

/// Invokes a deployed function workload once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestExecute {
    pub subject: String,
    #[serde(with = "b64")]
    pub payload: Vec<u8>,
}

/// Outcome of a deploy, execute or undeploy exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestReply {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, with = "b64")]
    pub payload: Vec<u8>,
}

impl GuestDeploy {
    pub fn decode(bytes: &[u8]) -> Result<Self, AgentApiError> {
        serde_json::from_slice(bytes).map_err(|e| AgentApiError::payload("deploy", e))
    }

    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }
}

impl GuestExecute {
    pub fn new(subject: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            subject: subject.into(),
            payload,
        }
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, AgentApiError> {
        serde_json::from_slice(bytes).map_err(|e| AgentApiError::payload("execute", e))
    }

    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }
}

impl GuestReply {
    pub fn ok(payload: Vec<u8>) -> Self {
        Self {
            ok: true,
            error: None,
            payload,
        }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: Some(message.into()),
            payload: Vec::new(),
        }
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, AgentApiError> {
        serde_json::from_slice(bytes).map_err(|e| AgentApiError::payload("guest reply", e))
    }

    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }

    /// The payload, or the guest's error message.
    pub fn into_result(self) -> Result<Vec<u8>, String> {
        if self.ok {
            Ok(self.payload)
        } else {
            Err(self
                .error
                .unwrap_or_else(|| "guest reported failure".to_string()))
        }
    }
}

mod b64 {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}
