//! In-process bus.
//!
//! Every subscriber whose pattern matches a published subject receives a
//! copy. Requests are delivered the same way and resolve with the first reply.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, RwLock};
use tracing::trace;

use super::{
    subject_matches, validate_pattern, validate_subject, BusError, InboundMessage, MessageBus,
    Subscription,
};

#[derive(Debug)]
struct Subscriber {
    id: u64,
    pattern: String,
    tx: mpsc::UnboundedSender<InboundMessage>,
}

#[derive(Debug, Default)]
pub struct InMemoryBus {
    subscribers: RwLock<Vec<Subscriber>>,
    next_id: AtomicU64,
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live subscriptions.
    pub async fn subscriber_count(&self) -> usize {
        self.subscribers
            .read()
            .await
            .iter()
            .filter(|s| !s.tx.is_closed())
            .count()
    }

    /// Hands one message to every matching subscriber, returning how many
    /// received it. Subscriptions that were dropped are pruned on the way.
    async fn deliver(
        &self,
        subject: &str,
        payload: &[u8],
        reply: Option<&mpsc::UnboundedSender<Vec<u8>>>,
    ) -> usize {
        let mut subscribers = self.subscribers.write().await;
        subscribers.retain(|s| !s.tx.is_closed());

        let mut delivered = 0;
        for sub in subscribers
            .iter()
            .filter(|s| subject_matches(&s.pattern, subject))
        {
            let msg = match reply {
                Some(reply) => InboundMessage::with_reply(subject, payload.to_vec(), reply.clone()),
                None => InboundMessage::new(subject, payload.to_vec()),
            };
            if sub.tx.send(msg).is_ok() {
                trace!(subscription = sub.id, subject, "Delivered");
                delivered += 1;
            }
        }
        delivered
    }
}

#[async_trait]
impl MessageBus for InMemoryBus {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), BusError> {
        validate_subject(subject)?;
        self.deliver(subject, &payload, None).await;
        Ok(())
    }

    async fn request(
        &self,
        subject: &str,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> Result<Vec<u8>, BusError> {
        validate_subject(subject)?;

        let (reply_tx, mut reply_rx) = mpsc::unbounded_channel();
        if self.deliver(subject, &payload, Some(&reply_tx)).await == 0 {
            return Err(BusError::NoResponders(subject.to_string()));
        }
        drop(reply_tx);

        match tokio::time::timeout(timeout, reply_rx.recv()).await {
            Ok(Some(reply)) => Ok(reply),
            // Every responder dropped the message without replying.
            Ok(None) => Err(BusError::NoResponders(subject.to_string())),
            Err(_) => Err(BusError::Timeout(subject.to_string())),
        }
    }

    async fn subscribe(&self, pattern: &str) -> Result<Subscription, BusError> {
        validate_pattern(pattern)?;

        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.write().await.push(Subscriber {
            id,
            pattern: pattern.to_string(),
            tx,
        });

        Ok(Subscription::new(pattern.to_string(), rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_matching_subscribers_only() {
        let bus = InMemoryBus::new();
        let mut logs = bus.subscribe("agentint.*.logs").await.unwrap();
        let mut all = bus.subscribe("agentint.>").await.unwrap();
        let mut events = bus.subscribe("agentint.*.events.>").await.unwrap();

        bus.publish("agentint.vm_a.logs", b"line".to_vec())
            .await
            .unwrap();

        assert_eq!(logs.next().await.unwrap().payload, b"line");
        assert_eq!(all.next().await.unwrap().subject, "agentint.vm_a.logs");
        assert!(events.try_next().is_none());
    }

    #[tokio::test]
    async fn test_request_reply() {
        let bus = std::sync::Arc::new(InMemoryBus::new());
        let mut sub = bus.subscribe("svc.*.ping").await.unwrap();

        tokio::spawn(async move {
            let msg = sub.next().await.unwrap();
            assert!(msg.expects_reply());
            msg.respond(b"pong".to_vec()).unwrap();
        });

        let reply = bus
            .request("svc.a.ping", b"ping".to_vec(), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(reply, b"pong");
    }

    #[tokio::test]
    async fn test_request_without_responders() {
        let bus = InMemoryBus::new();
        let err = bus
            .request("svc.a.ping", Vec::new(), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::NoResponders(_)));
    }

    #[tokio::test]
    async fn test_request_times_out_when_nobody_replies() {
        let bus = InMemoryBus::new();
        let _sub = bus.subscribe("svc.>").await.unwrap();

        let err = bus
            .request("svc.a.ping", Vec::new(), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_dropped_subscription_is_pruned() {
        let bus = InMemoryBus::new();
        let sub = bus.subscribe("a.b").await.unwrap();
        assert_eq!(bus.subscriber_count().await, 1);

        drop(sub);
        bus.publish("a.b", Vec::new()).await.unwrap();
        assert_eq!(bus.subscriber_count().await, 0);
    }

    #[tokio::test]
    async fn test_publish_rejects_wildcards() {
        let bus = InMemoryBus::new();
        assert!(bus.publish("a.*", Vec::new()).await.is_err());
    }
}
