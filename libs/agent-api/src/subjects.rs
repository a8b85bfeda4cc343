//! Subject construction and parsing for internal and external traffic.
//!
//! Internal subjects carry the VM identifier as the token directly after the
//! prefix, so a guest can only ever address its own VM's subjects.

use kiln_id::MachineId;

use crate::error::AgentApiError;

pub const DEFAULT_INTERNAL_PREFIX: &str = "agentint";
pub const DEFAULT_EXTERNAL_PREFIX: &str = "kiln";

const HANDSHAKE: &str = "handshake";
const LOGS: &str = "logs";
const EVENTS: &str = "events";
const DEPLOY: &str = "deploy";
const EXECUTE: &str = "execute";
const UNDEPLOY: &str = "undeploy";

/// The kind of message carried on an internal subject.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageClass {
    Handshake,
    Logs,
    /// Event subjects carry the event type as a trailing token.
    Events(String),
}

/// A decoded internal subject.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InternalSubject {
    pub machine_id: MachineId,
    pub class: MessageClass,
}

pub fn handshake(prefix: &str, machine_id: &MachineId) -> String {
    format!("{prefix}.{machine_id}.{HANDSHAKE}")
}

pub fn logs(prefix: &str, machine_id: &MachineId) -> String {
    format!("{prefix}.{machine_id}.{LOGS}")
}

pub fn events(prefix: &str, machine_id: &MachineId, event_type: &str) -> String {
    format!("{prefix}.{machine_id}.{EVENTS}.{event_type}")
}

/// Host-to-guest workload control, answered by the guest agent.
pub fn deploy(prefix: &str, machine_id: &MachineId) -> String {
    format!("{prefix}.{machine_id}.{DEPLOY}")
}

pub fn execute(prefix: &str, machine_id: &MachineId) -> String {
    format!("{prefix}.{machine_id}.{EXECUTE}")
}

pub fn undeploy(prefix: &str, machine_id: &MachineId) -> String {
    format!("{prefix}.{machine_id}.{UNDEPLOY}")
}

/// Wildcard subscriptions matching every VM.
pub fn handshake_wildcard(prefix: &str) -> String {
    format!("{prefix}.*.{HANDSHAKE}")
}

pub fn logs_wildcard(prefix: &str) -> String {
    format!("{prefix}.*.{LOGS}")
}

pub fn events_wildcard(prefix: &str) -> String {
    format!("{prefix}.*.{EVENTS}.>")
}

/// Parses `{prefix}.{vmId}.{class}[.{subtype}]`.
pub fn parse_internal(prefix: &str, subject: &str) -> Result<InternalSubject, AgentApiError> {
    let rest = subject
        .strip_prefix(prefix)
        .and_then(|s| s.strip_prefix('.'))
        .ok_or_else(|| AgentApiError::subject(subject, "missing internal prefix"))?;

    let tokens: Vec<&str> = rest.split('.').collect();
    let (machine_token, class_tokens) = tokens
        .split_first()
        .ok_or_else(|| AgentApiError::subject(subject, "missing machine id"))?;

    let machine_id = MachineId::parse(machine_token)
        .map_err(|e| AgentApiError::subject(subject, e.to_string()))?;

    let class = match class_tokens {
        [HANDSHAKE] => MessageClass::Handshake,
        [LOGS] => MessageClass::Logs,
        [EVENTS, event_type @ ..] if !event_type.is_empty() => {
            MessageClass::Events(event_type.join("."))
        }
        _ => return Err(AgentApiError::subject(subject, "unknown message class")),
    };

    Ok(InternalSubject { machine_id, class })
}

/// Whether `value` can stand as one token of a subject: non-empty, with no
/// separator, wildcard or whitespace.
pub fn is_valid_token(value: &str) -> bool {
    !value.is_empty()
        && !value
            .chars()
            .any(|c| c == '.' || c == '*' || c == '>' || c.is_whitespace())
}

/// `{external}.logs.{namespace}.{node}.{workload}.{vmId}`
pub fn log_publish(
    prefix: &str,
    namespace: &str,
    node: &str,
    workload: &str,
    machine_id: &MachineId,
) -> String {
    format!("{prefix}.{LOGS}.{namespace}.{node}.{workload}.{machine_id}")
}

/// `{external}.events.{namespace}.{node}.{workload}.{vmId}`
pub fn event_publish(
    prefix: &str,
    namespace: &str,
    node: &str,
    workload: &str,
    machine_id: &MachineId,
) -> String {
    format!("{prefix}.{EVENTS}.{namespace}.{node}.{workload}.{machine_id}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_parse_handshake() {
        let id = MachineId::new();
        let parsed = parse_internal("agentint", &handshake("agentint", &id)).unwrap();
        assert_eq!(parsed.machine_id, id);
        assert_eq!(parsed.class, MessageClass::Handshake);
    }

    #[test]
    fn test_parse_event_with_type() {
        let id = MachineId::new();
        let subject = events("agentint", &id, "workload_stopped");
        let parsed = parse_internal("agentint", &subject).unwrap();
        assert_eq!(
            parsed.class,
            MessageClass::Events("workload_stopped".to_string())
        );
    }

    #[test]
    fn test_parse_with_dotted_prefix() {
        let id = MachineId::new();
        let parsed = parse_internal("host.agent", &logs("host.agent", &id)).unwrap();
        assert_eq!(parsed.class, MessageClass::Logs);
    }

    #[rstest]
    #[case::wrong_prefix("other.vm_01HV4Z4NYPLTRS0JTUA8XDME5F.logs")]
    #[case::unknown_machine("agentint.v9.logs")]
    #[case::unknown_class("agentint.vm_01HV4Z4NYPLTRS0JTUA8XDME5F.metrics")]
    #[case::events_without_type("agentint.vm_01HV4Z4NYPLTRS0JTUA8XDME5F.events")]
    #[case::bare_prefix("agentint")]
    fn test_parse_rejects(#[case] subject: &str) {
        assert!(parse_internal("agentint", subject).is_err());
    }

    #[test]
    fn test_control_subjects_are_per_machine() {
        let id = MachineId::new();
        assert_eq!(deploy("agentint", &id), format!("agentint.{id}.deploy"));
        assert_eq!(execute("agentint", &id), format!("agentint.{id}.execute"));
        assert_eq!(undeploy("agentint", &id), format!("agentint.{id}.undeploy"));
        // Control traffic never matches the relay's parser.
        assert!(parse_internal("agentint", &deploy("agentint", &id)).is_err());
    }

    #[rstest]
    #[case("ns1", true)]
    #[case("my-workload_2", true)]
    #[case("", false)]
    #[case("a.b", false)]
    #[case("*", false)]
    #[case("logs>", false)]
    #[case("two words", false)]
    #[case("tab\t", false)]
    fn test_is_valid_token(#[case] value: &str, #[case] expected: bool) {
        assert_eq!(is_valid_token(value), expected);
    }

    #[test]
    fn test_external_subjects() {
        let id = MachineId::new();
        assert_eq!(
            log_publish("kiln", "ns1", "node_x", "echo", &id),
            format!("kiln.logs.ns1.node_x.echo.{id}")
        );
        assert_eq!(
            event_publish("kiln", "ns1", "node_x", "echo", &id),
            format!("kiln.events.ns1.node_x.echo.{id}")
        );
    }
}
