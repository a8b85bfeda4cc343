//! # kiln-bus
//!
//! Subject-addressed message bus.
//!
//! The node agent talks to guests on an internal bus and to the control plane
//! on an external one; the guest agent sees only the internal one. All of
//! them are reached through [`MessageBus`].
//!
//! [`InMemoryBus`] delivers within one process. [`remote`] carries a bus
//! across a stream connection so a guest can reach the host's bus from
//! inside its VM.
//!
//! Subjects are dot-separated tokens. Subscription patterns may use `*` to
//! match exactly one token and a trailing `>` to match one or more tokens.

mod memory;
pub mod remote;

pub use memory::InMemoryBus;
pub use remote::RemoteBus;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("invalid subject '{subject}': {reason}")]
    InvalidSubject { subject: String, reason: &'static str },

    #[error("no responders for '{0}'")]
    NoResponders(String),

    #[error("request to '{0}' timed out")]
    Timeout(String),

    #[error("message does not expect a reply")]
    NoReplyExpected,

    #[error("requester for '{0}' went away")]
    ReplyDropped(String),

    #[error("bus connection closed")]
    Disconnected,

    #[error("bus connection failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("remote bus error: {0}")]
    Remote(String),
}

/// A message delivered to a subscription.
#[derive(Debug)]
pub struct InboundMessage {
    pub subject: String,
    pub payload: Vec<u8>,
    reply: Option<mpsc::UnboundedSender<Vec<u8>>>,
}

impl InboundMessage {
    pub fn new(subject: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            subject: subject.into(),
            payload,
            reply: None,
        }
    }

    pub(crate) fn with_reply(
        subject: impl Into<String>,
        payload: Vec<u8>,
        reply: mpsc::UnboundedSender<Vec<u8>>,
    ) -> Self {
        Self {
            subject: subject.into(),
            payload,
            reply: Some(reply),
        }
    }

    /// Whether the sender is waiting on a reply.
    pub fn expects_reply(&self) -> bool {
        self.reply.is_some()
    }

    /// Whether a reply could no longer reach the requester.
    pub(crate) fn reply_abandoned(&self) -> bool {
        self.reply.as_ref().is_some_and(|reply| reply.is_closed())
    }

    /// Replies to a request.
    pub fn respond(self, payload: Vec<u8>) -> Result<(), BusError> {
        let reply = self.reply.ok_or(BusError::NoReplyExpected)?;
        reply
            .send(payload)
            .map_err(|_| BusError::ReplyDropped(self.subject))
    }
}

/// Stream of messages matching a pattern. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    pattern: String,
    rx: mpsc::UnboundedReceiver<InboundMessage>,
}

impl Subscription {
    pub(crate) fn new(pattern: String, rx: mpsc::UnboundedReceiver<InboundMessage>) -> Self {
        Self { pattern, rx }
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Next message, or `None` once the bus is gone.
    pub async fn next(&mut self) -> Option<InboundMessage> {
        self.rx.recv().await
    }

    /// A message that is already queued, without waiting.
    pub fn try_next(&mut self) -> Option<InboundMessage> {
        self.rx.try_recv().ok()
    }
}

#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Fire-and-forget publish.
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), BusError>;

    /// Publishes and waits for the first reply.
    async fn request(
        &self,
        subject: &str,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> Result<Vec<u8>, BusError>;

    async fn subscribe(&self, pattern: &str) -> Result<Subscription, BusError>;
}

/// Checks a concrete subject: non-empty tokens, no wildcards.
pub fn validate_subject(subject: &str) -> Result<(), BusError> {
    validate(subject, false)
}

/// Checks a subscription pattern: `>` may only appear as the last token.
pub fn validate_pattern(pattern: &str) -> Result<(), BusError> {
    validate(pattern, true)
}

fn validate(subject: &str, allow_wildcards: bool) -> Result<(), BusError> {
    let invalid = |reason| BusError::InvalidSubject {
        subject: subject.to_string(),
        reason,
    };

    if subject.is_empty() {
        return Err(invalid("empty subject"));
    }

    let tokens: Vec<&str> = subject.split('.').collect();
    let last = tokens.len() - 1;
    for (i, token) in tokens.iter().enumerate() {
        if token.is_empty() {
            return Err(invalid("empty token"));
        }
        if token.contains(char::is_whitespace) {
            return Err(invalid("whitespace in token"));
        }
        match *token {
            "*" | ">" if !allow_wildcards => return Err(invalid("wildcard in subject")),
            ">" if i != last => return Err(invalid("'>' must be the last token")),
            t if t.len() > 1 && t.contains(['*', '>']) => {
                return Err(invalid("wildcard must be a whole token"))
            }
            _ => {}
        }
    }
    Ok(())
}

/// Whether `subject` matches `pattern`.
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pattern_tokens = pattern.split('.');
    let mut subject_tokens = subject.split('.');

    loop {
        match (pattern_tokens.next(), subject_tokens.next()) {
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => {}
            (Some(p), Some(s)) if p == s => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("agentint.*.handshake", "agentint.vm_1.handshake", true)]
    #[case("agentint.*.handshake", "agentint.vm_1.logs", false)]
    #[case("agentint.*.handshake", "agentint.vm_1.handshake.extra", false)]
    #[case("agentint.*.events.>", "agentint.vm_1.events.workload_stopped", true)]
    #[case("agentint.*.events.>", "agentint.vm_1.events.a.b", true)]
    #[case("agentint.*.events.>", "agentint.vm_1.events", false)]
    #[case("kiln.>", "kiln.logs.default.n.w.vm", true)]
    #[case("kiln.logs", "kiln.logs", true)]
    #[case("kiln.logs", "kiln", false)]
    fn test_subject_matches(#[case] pattern: &str, #[case] subject: &str, #[case] expected: bool) {
        assert_eq!(subject_matches(pattern, subject), expected);
    }

    #[rstest]
    #[case("a.b.c", true)]
    #[case("", false)]
    #[case("a..c", false)]
    #[case("a.*.c", false)]
    #[case("a.b c", false)]
    fn test_validate_subject(#[case] subject: &str, #[case] ok: bool) {
        assert_eq!(validate_subject(subject).is_ok(), ok);
    }

    #[rstest]
    #[case("a.*.c", true)]
    #[case("a.>", true)]
    #[case("a.>.c", false)]
    #[case("a.b*", false)]
    fn test_validate_pattern(#[case] pattern: &str, #[case] ok: bool) {
        assert_eq!(validate_pattern(pattern).is_ok(), ok);
    }

    #[test]
    fn test_respond_without_reply_channel() {
        let msg = InboundMessage::new("a.b", b"x".to_vec());
        assert!(!msg.expects_reply());
        assert!(matches!(msg.respond(b"OK".to_vec()), Err(BusError::NoReplyExpected)));
    }
}
