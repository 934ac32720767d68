use std::io;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::debug;
use uuid::Uuid;

use crate::core::broker::{
    Acknowledger, InboundMessage, MessageId, MessagePublisher, MessageSubscriber, Subscription,
};
use crate::core::error::BrokerError;

/// In-process broker.
///
/// Every `subscribe` call gets its own copy of each message published or
/// injected on the topic. Publishes are recorded and can be made to fail,
/// which is how tests simulate a broker outage.
#[derive(Default)]
pub struct MemoryBroker {
    subscribers: DashMap<String, Vec<flume::Sender<InboundMessage>>>,
    published: Mutex<Vec<(String, Bytes)>>,
    acks: Arc<FinishLog>,
    unavailable: AtomicBool,
    failures_left: AtomicU32,
}

#[derive(Default)]
struct FinishLog {
    finished: Mutex<Vec<MessageId>>,
}

#[async_trait]
impl Acknowledger for FinishLog {
    async fn finish(&self, id: &MessageId) -> Result<(), BrokerError> {
        self.finished.lock().push(id.clone());
        Ok(())
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delivers a raw message to the subscribers of `topic`, as if a
    /// producer had published it. Returns the assigned id.
    pub fn inject(&self, topic: &str, body: impl Into<Bytes>) -> MessageId {
        let id = new_message_id();
        self.fan_out(topic, &id, body.into());
        id
    }

    /// Makes every publish fail (`false`) or succeed (`true`).
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Makes the next `n` publishes fail.
    pub fn fail_next(&self, n: u32) {
        self.failures_left.store(n, Ordering::SeqCst);
    }

    /// Everything successfully published, in order.
    pub fn published(&self) -> Vec<(String, Bytes)> {
        self.published.lock().clone()
    }

    pub fn published_to(&self, topic: &str) -> Vec<Bytes> {
        self.published
            .lock()
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, b)| b.clone())
            .collect()
    }

    /// Ids of inbound messages that were finished.
    pub fn finished(&self) -> Vec<MessageId> {
        self.acks.finished.lock().clone()
    }

    fn fan_out(&self, topic: &str, id: &MessageId, body: Bytes) {
        let Some(mut senders) = self.subscribers.get_mut(topic) else {
            debug!(target: "nsqdelay::memory", topic, "no subscribers, message dropped");
            return;
        };
        senders.retain(|tx| {
            let msg = InboundMessage::new(id.clone(), body.clone(), 1, self.acks.clone());
            tx.send(msg).is_ok()
        });
    }

    fn take_failure(&self) -> bool {
        if self.unavailable.load(Ordering::SeqCst) {
            return true;
        }
        self.failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl MessageSubscriber for MemoryBroker {
    async fn subscribe(&self, topic: &str, _channel: &str) -> Result<Subscription, BrokerError> {
        let (tx, rx) = flume::unbounded();
        let (close_tx, _close_rx) = watch::channel(false);
        self.subscribers.entry(topic.to_string()).or_default().push(tx);
        Ok(Subscription::new(rx, close_tx))
    }
}

#[async_trait]
impl MessagePublisher for MemoryBroker {
    async fn publish(&self, topic: &str, body: Bytes) -> Result<(), BrokerError> {
        if self.take_failure() {
            return Err(BrokerError::Io(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "memory broker unavailable",
            )));
        }
        self.published.lock().push((topic.to_string(), body.clone()));
        self.fan_out(topic, &new_message_id(), body);
        Ok(())
    }
}

fn new_message_id() -> MessageId {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(16);
    MessageId(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn injected_messages_reach_subscribers_and_can_be_finished() {
        let broker = MemoryBroker::new();
        let sub = broker.subscribe("delayed", "ch").await.unwrap();

        let id = broker.inject("delayed", "payload");
        let msg = sub.recv().await.unwrap();
        assert_eq!(msg.id, id);
        assert_eq!(msg.id.0.len(), 16);
        assert_eq!(&msg.body[..], b"payload");

        msg.finish().await.unwrap();
        assert_eq!(broker.finished(), vec![id]);
    }

    #[tokio::test]
    async fn fail_next_then_recover() {
        let broker = MemoryBroker::new();
        broker.fail_next(2);
        assert!(broker.publish("t1", Bytes::from_static(b"a")).await.is_err());
        assert!(broker.publish("t1", Bytes::from_static(b"a")).await.is_err());
        assert!(broker.publish("t1", Bytes::from_static(b"a")).await.is_ok());
        assert_eq!(broker.published_to("t1").len(), 1);
    }

    #[tokio::test]
    async fn unavailable_until_reset() {
        let broker = MemoryBroker::new();
        broker.set_available(false);
        assert!(broker.publish("t1", Bytes::from_static(b"a")).await.is_err());
        broker.set_available(true);
        assert!(broker.publish("t1", Bytes::from_static(b"a")).await.is_ok());
    }
}
