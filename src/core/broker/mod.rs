//! # Broker Module
//!
//! What the delay engine needs from the pub/sub system:
//!
//! - [`MessageSubscriber`]: a stream of inbound messages for a topic/channel,
//!   each acknowledged explicitly.
//! - [`MessagePublisher`]: publish a body to a topic.
//!
//! `nsq` talks the NSQ TCP protocol; `memory` is an in-process stand-in.

pub mod memory;
pub mod nsq;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::watch;

use crate::core::error::BrokerError;

pub use self::memory::MemoryBroker;

/// Broker-native message identifier (NSQ: 16 ASCII bytes).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MessageId(pub String);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MessageId {
    fn from(s: &str) -> Self {
        MessageId(s.to_string())
    }
}

/// Completes an inbound message on the broker side.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn finish(&self, id: &MessageId) -> Result<(), BrokerError>;
}

/// A message received from a subscription. Must be finished exactly once.
pub struct InboundMessage {
    pub id: MessageId,
    pub body: Bytes,
    pub attempts: u16,
    acker: Arc<dyn Acknowledger>,
}

impl InboundMessage {
    pub fn new(id: MessageId, body: Bytes, attempts: u16, acker: Arc<dyn Acknowledger>) -> Self {
        Self {
            id,
            body,
            attempts,
            acker,
        }
    }

    /// Acknowledges the message so the broker does not redeliver it.
    pub async fn finish(self) -> Result<(), BrokerError> {
        self.acker.finish(&self.id).await
    }
}

impl fmt::Debug for InboundMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboundMessage")
            .field("id", &self.id)
            .field("body_len", &self.body.len())
            .field("attempts", &self.attempts)
            .finish()
    }
}

/// Live subscription. Messages arrive on [`Subscription::receiver`];
/// [`Subscription::close`] stops the underlying connections.
pub struct Subscription {
    rx: flume::Receiver<InboundMessage>,
    close_tx: watch::Sender<bool>,
}

impl Subscription {
    pub fn new(rx: flume::Receiver<InboundMessage>, close_tx: watch::Sender<bool>) -> Self {
        Self { rx, close_tx }
    }

    pub fn receiver(&self) -> &flume::Receiver<InboundMessage> {
        &self.rx
    }

    pub async fn recv(&self) -> Option<InboundMessage> {
        self.rx.recv_async().await.ok()
    }

    pub fn close(&self) {
        let _ = self.close_tx.send(true);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.close();
    }
}

#[async_trait]
pub trait MessageSubscriber: Send + Sync {
    async fn subscribe(&self, topic: &str, channel: &str) -> Result<Subscription, BrokerError>;
}

#[async_trait]
pub trait MessagePublisher: Send + Sync {
    async fn publish(&self, topic: &str, body: Bytes) -> Result<(), BrokerError>;
}
