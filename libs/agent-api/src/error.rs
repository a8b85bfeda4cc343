//! Error types for the agent wire contract.

use thiserror::Error;

/// Errors raised while decoding agent traffic.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AgentApiError {
    /// The subject does not belong to the internal agent namespace.
    #[error("invalid internal subject '{subject}': {reason}")]
    InvalidSubject { subject: String, reason: String },

    /// A payload failed to decode.
    #[error("malformed {kind} payload: {message}")]
    MalformedPayload { kind: &'static str, message: String },
}

impl AgentApiError {
    pub(crate) fn subject(subject: &str, reason: impl Into<String>) -> Self {
        AgentApiError::InvalidSubject {
            subject: subject.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn payload(kind: &'static str, err: serde_json::Error) -> Self {
        AgentApiError::MalformedPayload {
            kind,
            message: err.to_string(),
        }
    }
}
