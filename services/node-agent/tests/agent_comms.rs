//! Integration tests for the internal agent protocol handler.

use std::sync::Arc;
use std::time::Duration;

use kiln_agent_api::{
    subjects, CloudEvent, DeployRequest, HandshakeRequest, WorkloadClaims, HANDSHAKE_ACK,
};
use kiln_id::MachineId;
use kiln_node_agent::bus::{InMemoryBus, MessageBus, Subscription};
use kiln_node_agent::config::{NodeConfigFile, NodeConfiguration};
use kiln_node_agent::pool::{MachineManager, MachineState};
use kiln_node_agent::runtime::MockRuntime;
use kiln_node_agent::Node;
use serde_json::json;
use tempfile::TempDir;

const NODE_KEY: &str = "node-test";
const INTERNAL: &str = "agentint";
const EXTERNAL: &str = "kiln";

const NOOP: &str = r#"(module (func (export "run")))"#;

struct Harness {
    _dir: TempDir,
    internal: Arc<InMemoryBus>,
    external: Arc<InMemoryBus>,
    node: Node,
}

impl Harness {
    async fn start() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let config = NodeConfiguration::resolve(NodeConfigFile {
            default_resource_dir: Some("/opt/kiln".into()),
            machine_pool_size: Some(0),
            work_dir: Some(dir.path().to_path_buf()),
            ..Default::default()
        })
        .unwrap();

        let internal = Arc::new(InMemoryBus::new());
        let external = Arc::new(InMemoryBus::new());
        let runtime = Arc::new(MockRuntime::new().with_guest_agent(internal.clone()));
        let node = Node::new(config, NODE_KEY, runtime, internal.clone(), external.clone());
        node.start().await.unwrap();

        Self {
            _dir: dir,
            internal,
            external,
            node,
        }
    }

    fn manager(&self) -> &Arc<MachineManager> {
        self.node.manager()
    }

    async fn warm_machine(&self) -> MachineId {
        let id = self.manager().provision_vm(None).await.unwrap();
        self.manager()
            .await_handshake(id, Duration::from_secs(2))
            .await
            .unwrap();
        id
    }

    /// A running machine in namespace `ns1` whose workload subject is `echo`.
    async fn running_machine(&self) -> MachineId {
        let id = self.warm_machine().await;
        let request = DeployRequest::new("wasm", "echo", wat::parse_str(NOOP).unwrap())
            .with_namespace("ns1")
            .with_claims(WorkloadClaims {
                subject: "echo".into(),
                name: "Echo".into(),
                issuer: String::new(),
            });
        self.manager().deploy(id, request).await.unwrap();
        id
    }
}

async fn next_message(sub: &mut Subscription) -> kiln_node_agent::bus::InboundMessage {
    tokio::time::timeout(Duration::from_secs(2), sub.next())
        .await
        .expect("timed out waiting for relay")
        .expect("bus closed")
}

/// Gives spawned handlers a chance to run, then checks nothing was relayed.
async fn assert_nothing_relayed(sub: &mut Subscription) {
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(sub.try_next().is_none());
}

#[tokio::test]
async fn test_log_relay_for_running_machine() {
    let harness = Harness::start().await;
    let id = harness.running_machine().await;
    let mut sub = harness.external.subscribe("kiln.logs.>").await.unwrap();

    harness
        .internal
        .publish(
            &subjects::logs(INTERNAL, &id),
            br#"{"text":"hello","level":4}"#.to_vec(),
        )
        .await
        .unwrap();

    let relayed = next_message(&mut sub).await;
    assert_eq!(
        relayed.subject,
        subjects::log_publish(EXTERNAL, "ns1", NODE_KEY, "echo", &id)
    );
    let body: serde_json::Value = serde_json::from_slice(&relayed.payload).unwrap();
    assert_eq!(
        body,
        json!({"text": "hello", "level": 4, "machineId": id.to_string()})
    );

    assert_nothing_relayed(&mut sub).await;
}

#[tokio::test]
async fn test_log_from_unassigned_machine_uses_system_scope() {
    let harness = Harness::start().await;
    let id = harness.warm_machine().await;
    let mut sub = harness.external.subscribe("kiln.logs.>").await.unwrap();

    harness
        .internal
        .publish(
            &subjects::logs(INTERNAL, &id),
            br#"{"text":"booting","level":0}"#.to_vec(),
        )
        .await
        .unwrap();

    let relayed = next_message(&mut sub).await;
    assert_eq!(
        relayed.subject,
        format!("kiln.logs.system.{NODE_KEY}.unassigned.{id}")
    );
}

#[tokio::test]
async fn test_log_from_unknown_machine_is_dropped() {
    let harness = Harness::start().await;
    let mut sub = harness.external.subscribe("kiln.>").await.unwrap();

    harness
        .internal
        .publish(
            &subjects::logs(INTERNAL, &MachineId::new()),
            br#"{"text":"hello","level":4}"#.to_vec(),
        )
        .await
        .unwrap();

    assert_nothing_relayed(&mut sub).await;
}

#[tokio::test]
async fn test_malformed_log_is_dropped_and_relay_continues() {
    let harness = Harness::start().await;
    let id = harness.running_machine().await;
    let mut sub = harness.external.subscribe("kiln.logs.>").await.unwrap();
    let subject = subjects::logs(INTERNAL, &id);

    harness
        .internal
        .publish(&subject, b"{not json".to_vec())
        .await
        .unwrap();
    assert_nothing_relayed(&mut sub).await;

    harness
        .internal
        .publish(&subject, br#"{"text":"still here","level":0}"#.to_vec())
        .await
        .unwrap();
    let relayed = next_message(&mut sub).await;
    let body: serde_json::Value = serde_json::from_slice(&relayed.payload).unwrap();
    assert_eq!(body["text"], "still here");
}

#[tokio::test]
async fn test_event_republished_unmodified() {
    let harness = Harness::start().await;
    let id = harness.running_machine().await;
    let mut sub = harness.external.subscribe("kiln.events.>").await.unwrap();

    let payload = br#"{"specversion":"1.0","id":"e1","source":"guest","type":"metrics","data":{"x":1},"custom":"kept"}"#.to_vec();
    harness
        .internal
        .publish(&subjects::events(INTERNAL, &id, "metrics"), payload.clone())
        .await
        .unwrap();

    let relayed = next_message(&mut sub).await;
    assert_eq!(
        relayed.subject,
        subjects::event_publish(EXTERNAL, "ns1", NODE_KEY, "echo", &id)
    );
    assert_eq!(relayed.payload, payload);
    assert_eq!(
        harness.manager().machine_state(id).await,
        Some(MachineState::Running)
    );
}

#[tokio::test]
async fn test_workload_stopped_event_relayed_then_tears_down() {
    let harness = Harness::start().await;
    let id = harness.running_machine().await;
    let mut sub = harness.external.subscribe("kiln.events.>").await.unwrap();

    let event = CloudEvent::workload_stopped(&id, "echo", 0).encode();
    harness
        .internal
        .publish(&subjects::events(INTERNAL, &id, "workload_stopped"), event.clone())
        .await
        .unwrap();

    let relayed = next_message(&mut sub).await;
    assert_eq!(relayed.payload, event);

    let manager = harness.manager();
    tokio::time::timeout(Duration::from_secs(2), async {
        while manager.machine_state(id).await.is_some() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("machine was not torn down");
}

#[tokio::test]
async fn test_handshake_for_unknown_machine_is_acknowledged() {
    let harness = Harness::start().await;
    let id = MachineId::new();

    let reply = harness
        .internal
        .request(
            &subjects::handshake(INTERNAL, &id),
            HandshakeRequest::new(id, "hello").encode(),
            Duration::from_secs(1),
        )
        .await
        .unwrap();

    assert_eq!(reply, HANDSHAKE_ACK);
    assert!(harness.manager().list_machines().await.is_empty());
    assert!(harness.manager().handshake_at(id).await.is_none());
}

#[tokio::test]
async fn test_malformed_handshake_gets_no_reply() {
    let harness = Harness::start().await;
    let id = MachineId::new();

    let result = harness
        .internal
        .request(
            &subjects::handshake(INTERNAL, &id),
            b"garbage".to_vec(),
            Duration::from_millis(200),
        )
        .await;

    assert!(result.is_err());
    assert!(harness.manager().handshake_at(id).await.is_none());
}

#[tokio::test]
async fn test_handshake_for_another_machine_is_rejected() {
    let harness = Harness::start().await;
    let subject_id = MachineId::new();
    let claimed_id = MachineId::new();

    let result = harness
        .internal
        .request(
            &subjects::handshake(INTERNAL, &subject_id),
            HandshakeRequest::new(claimed_id, "spoofed").encode(),
            Duration::from_millis(200),
        )
        .await;

    assert!(result.is_err());
    assert!(harness.manager().handshake_at(subject_id).await.is_none());
    assert!(harness.manager().handshake_at(claimed_id).await.is_none());
}

#[tokio::test]
async fn test_subscriptions_released_after_shutdown() {
    let harness = Harness::start().await;
    assert_eq!(harness.internal.subscriber_count().await, 3);
    let id = harness.running_machine().await;
    // The guest agent adds its three control subscriptions.
    assert_eq!(harness.internal.subscriber_count().await, 6);

    harness.node.shutdown().await;
    assert_eq!(harness.manager().machine_state(id).await, None);

    let result = harness
        .internal
        .request(
            &subjects::handshake(INTERNAL, &id),
            HandshakeRequest::new(id, "late").encode(),
            Duration::from_millis(100),
        )
        .await;
    assert!(result.is_err());
}
