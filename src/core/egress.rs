//! Publishes due messages to their target topics, retrying failures.
//!
//! Each message moves through `PublishAttempt -> Published`, or
//! `PublishAttempt -> RetryScheduled -> PublishAttempt ...`, or ends as a
//! dead letter once the attempt budget is spent. Scheduled retries sit in a
//! min-heap owned by the publishing loop. While that heap is full the loop
//! stops taking new messages, so a broker outage backs up into the scanner
//! and, from there, into the store.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::time::{sleep_until, timeout_at, Instant};
use tracing::{error, info, warn};

use crate::core::broker::MessagePublisher;
use crate::core::dlq::{DeadLetter, DeadLetterQueue};
use crate::core::error::BrokerError;
use crate::core::message::{current_unix_secs, DueMessage};
use crate::core::shutdown::ShutdownSignal;
use crate::core::store::DelayStore;
use crate::metrics;
use crate::util::backoff::RetryBackoff;

const DEFAULT_DRAIN_BUDGET: Duration = Duration::from_secs(15);

struct PendingRetry {
    due_at: Instant,
    seq: u64,
    attempts: u32,
    message: DueMessage,
}

impl PartialEq for PendingRetry {
    fn eq(&self, other: &Self) -> bool {
        self.due_at == other.due_at && self.seq == other.seq
    }
}

impl Eq for PendingRetry {}

impl PartialOrd for PendingRetry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PendingRetry {
    // Reversed so the earliest retry is at the top of the max-heap.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .due_at
            .cmp(&self.due_at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Result of a single publish attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Published,
    RetryScheduled { attempts: u32 },
    DeadLettered { attempts: u32 },
}

struct Drain {
    deadline: Instant,
    publishing: bool,
    now: i64,
    requeued: usize,
}

enum Step {
    Incoming(DueMessage),
    QueueClosed,
    RetryDue,
    Shutdown,
}

pub struct EgressPublisher {
    publisher: Arc<dyn MessagePublisher>,
    store: Arc<dyn DelayStore>,
    dead_letters: Arc<DeadLetterQueue>,
    backoff: RetryBackoff,
    max_pending_retries: usize,
    drain_budget: Duration,
    retries: BinaryHeap<PendingRetry>,
    seq: u64,
}

impl EgressPublisher {
    pub fn new(
        publisher: Arc<dyn MessagePublisher>,
        store: Arc<dyn DelayStore>,
        dead_letters: Arc<DeadLetterQueue>,
        backoff: RetryBackoff,
        max_pending_retries: usize,
    ) -> Self {
        Self {
            publisher,
            store,
            dead_letters,
            backoff,
            max_pending_retries: max_pending_retries.max(1),
            drain_budget: DEFAULT_DRAIN_BUDGET,
            retries: BinaryHeap::new(),
            seq: 0,
        }
    }

    /// Caps the time spent publishing during shutdown. Keep it below the
    /// shutdown timeout so write-back still finishes.
    pub fn with_drain_budget(mut self, budget: Duration) -> Self {
        self.drain_budget = budget;
        self
    }

    pub fn pending_retries(&self) -> usize {
        self.retries.len()
    }

    /// Makes one publish attempt for a message that already failed
    /// `prior_attempts` times, scheduling a retry or dead-lettering it on
    /// failure.
    pub async fn attempt(&mut self, message: DueMessage, prior_attempts: u32) -> Delivery {
        let DueMessage { message: msg, .. } = &message;
        let res = self
            .publisher
            .publish(&msg.topic, Bytes::from(msg.body.clone()))
            .await;

        let err = match res {
            Ok(()) => {
                metrics::inc_published(1);
                info!(
                    target: "nsqdelay::egress",
                    id = %msg.id,
                    topic = %msg.topic,
                    attempt = prior_attempts + 1,
                    "published delayed message"
                );
                return Delivery::Published;
            }
            Err(e) => e,
        };

        metrics::inc_publish_failures(1);
        let attempts = prior_attempts.saturating_add(1);
        if self.backoff.exhausted(attempts) {
            metrics::inc_dead_lettered(1);
            self.dead_letters
                .push(DeadLetter::new(message.message, attempts, &err));
            return Delivery::DeadLettered { attempts };
        }

        let delay = self.backoff.delay_for(attempts);
        warn!(
            target: "nsqdelay::egress",
            id = %msg.id,
            topic = %msg.topic,
            attempt = attempts,
            retry_in = ?delay,
            error = %err,
            "publish failed, retry scheduled"
        );
        self.schedule(message, attempts, Instant::now() + delay);
        Delivery::RetryScheduled { attempts }
    }

    fn schedule(&mut self, message: DueMessage, attempts: u32, due_at: Instant) {
        self.seq = self.seq.wrapping_add(1);
        self.retries.push(PendingRetry {
            due_at,
            seq: self.seq,
            attempts,
            message,
        });
    }

    async fn retry_due(&mut self) {
        let now = Instant::now();
        while self.retries.peek().is_some_and(|r| r.due_at <= now) {
            if let Some(retry) = self.retries.pop() {
                self.attempt(retry.message, retry.attempts).await;
            }
        }
    }

    /// Publishes from `queue` until shutdown, then drains.
    pub async fn run(mut self, queue: flume::Receiver<DueMessage>, mut shutdown: ShutdownSignal) {
        info!(
            target: "nsqdelay::egress",
            max_attempts = self.backoff.max_attempts(),
            max_pending_retries = self.max_pending_retries,
            "egress started"
        );
        let mut queue_open = true;

        loop {
            let next_retry = self.retries.peek().map(|r| r.due_at);
            let accepting = queue_open && self.retries.len() < self.max_pending_retries;

            let step = tokio::select! {
                biased;
                _ = shutdown.recv() => Step::Shutdown,
                _ = sleep_until(next_retry.unwrap_or_else(Instant::now)), if next_retry.is_some() => Step::RetryDue,
                res = queue.recv_async(), if accepting => match res {
                    Ok(message) => Step::Incoming(message),
                    Err(_) => Step::QueueClosed,
                },
            };

            match step {
                Step::Incoming(message) => {
                    self.attempt(message, 0).await;
                }
                Step::RetryDue => self.retry_due().await,
                Step::QueueClosed => {
                    queue_open = false;
                    if self.retries.is_empty() {
                        break;
                    }
                }
                Step::Shutdown => break,
            }
        }

        self.drain(queue).await;
        info!(target: "nsqdelay::egress", "egress stopped");
    }

    /// Settles every queued and retrying message before exit. Messages get
    /// one last publish attempt until the first failure or until the drain
    /// budget runs out; from then on each remaining message is written back
    /// to the store as due now without touching the broker. Returns how many
    /// messages were written back.
    pub async fn drain(&mut self, queue: flume::Receiver<DueMessage>) -> usize {
        let mut drain = Drain {
            deadline: Instant::now() + self.drain_budget,
            publishing: true,
            now: current_unix_secs(),
            requeued: 0,
        };

        // Ends once the scanner has dropped its sender.
        while let Ok(message) = queue.recv_async().await {
            self.settle(message, 0, &mut drain).await;
        }
        while let Some(retry) = self.retries.pop() {
            self.settle(retry.message, retry.attempts, &mut drain).await;
        }

        if drain.requeued > 0 {
            metrics::inc_requeued(drain.requeued as u64);
            info!(target: "nsqdelay::egress", requeued = drain.requeued, "wrote undelivered messages back to store");
        }
        drain.requeued
    }

    async fn settle(&self, message: DueMessage, prior_attempts: u32, drain: &mut Drain) {
        if drain.publishing {
            let err = match timeout_at(drain.deadline, self.final_attempt(&message)).await {
                Ok(Ok(())) => return,
                Ok(Err(e)) => e.to_string(),
                Err(_) => "drain budget exhausted".to_string(),
            };
            warn!(
                target: "nsqdelay::egress",
                id = %message.message.id,
                attempt = prior_attempts + 1,
                error = %err,
                "publish failed during shutdown, writing remaining messages back"
            );
            drain.publishing = false;
        }

        match self.store.insert(&message.member, drain.now).await {
            Ok(()) => drain.requeued += 1,
            Err(e) => error!(
                target: "nsqdelay::egress",
                id = %message.message.id,
                member = %message.member,
                error = %e,
                "failed to write back undelivered message, message lost"
            ),
        }
    }

    async fn final_attempt(&self, message: &DueMessage) -> Result<(), BrokerError> {
        let msg = &message.message;
        self.publisher
            .publish(&msg.topic, Bytes::from(msg.body.clone()))
            .await?;
        metrics::inc_published(1);
        info!(target: "nsqdelay::egress", id = %msg.id, topic = %msg.topic, "published delayed message");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::core::broker::MemoryBroker;
    use crate::core::message::{encode_message, DelayedMessage};
    use crate::core::store::MemoryStore;

    fn due(body: &str) -> DueMessage {
        let mut msg = DelayedMessage::new("t1", body, 5);
        msg.id = "0123456789abcdef".to_string();
        DueMessage::decode(encode_message(&msg).unwrap()).unwrap()
    }

    fn publisher(broker: &Arc<MemoryBroker>, max_attempts: u32) -> EgressPublisher {
        EgressPublisher::new(
            broker.clone(),
            Arc::new(MemoryStore::new()),
            Arc::new(DeadLetterQueue::new(16)),
            RetryBackoff::new(Duration::from_secs(1), Duration::from_secs(4), max_attempts),
            8,
        )
    }

    #[test]
    fn heap_pops_earliest_retry_first() {
        let now = Instant::now();
        let mut heap = BinaryHeap::new();
        for (seq, secs) in [(1, 5), (2, 1), (3, 3), (4, 1)] {
            heap.push(PendingRetry {
                due_at: now + Duration::from_secs(secs),
                seq,
                attempts: 1,
                message: due("x"),
            });
        }
        let order: Vec<u64> = std::iter::from_fn(|| heap.pop().map(|r| r.seq)).collect();
        assert_eq!(order, vec![2, 4, 3, 1]);
    }

    #[tokio::test]
    async fn successful_publish_is_delivered_once() {
        let broker = Arc::new(MemoryBroker::new());
        let mut egress = publisher(&broker, 0);

        assert_eq!(egress.attempt(due("hello"), 0).await, Delivery::Published);
        assert_eq!(broker.published_to("t1"), vec![Bytes::from_static(b"hello")]);
        assert_eq!(egress.pending_retries(), 0);
    }

    #[tokio::test]
    async fn exhausted_budget_dead_letters() {
        let broker = Arc::new(MemoryBroker::new());
        broker.set_available(false);
        let dlq = Arc::new(DeadLetterQueue::new(16));
        let mut egress = EgressPublisher::new(
            broker.clone(),
            Arc::new(MemoryStore::new()),
            dlq.clone(),
            RetryBackoff::new(Duration::from_secs(1), Duration::from_secs(4), 2),
            8,
        );

        assert_eq!(
            egress.attempt(due("x"), 0).await,
            Delivery::RetryScheduled { attempts: 1 }
        );
        assert_eq!(
            egress.attempt(due("x"), 1).await,
            Delivery::DeadLettered { attempts: 2 }
        );
        assert_eq!(dlq.len(), 1);
        assert_eq!(dlq.list(None)[0].message.body, "x");
    }

    #[tokio::test(start_paused = true)]
    async fn unlimited_retries_publish_after_recovery() {
        let broker = Arc::new(MemoryBroker::new());
        broker.fail_next(3);
        let egress = publisher(&broker, 0);
        let coordinator = crate::core::shutdown::ShutdownCoordinator::new(Duration::from_secs(5));
        let (tx, rx) = flume::bounded(4);
        let task = tokio::spawn(egress.run(rx, coordinator.signal()));

        tx.send_async(due("hello")).await.unwrap();
        // Attempts at 0s, 1s, 3s fail; the fourth at 7s succeeds.
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(broker.published_to("t1").is_empty());
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(broker.published_to("t1"), vec![Bytes::from_static(b"hello")]);

        drop(tx);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn drain_writes_undelivered_back_to_store() {
        let broker = Arc::new(MemoryBroker::new());
        broker.set_available(false);
        let store = Arc::new(MemoryStore::new());
        let mut egress = EgressPublisher::new(
            broker.clone(),
            store.clone(),
            Arc::new(DeadLetterQueue::new(16)),
            RetryBackoff::default(),
            8,
        );
        egress.attempt(due("retrying"), 0).await;

        let (tx, rx) = flume::bounded(4);
        tx.send_async(due("queued")).await.unwrap();
        drop(tx);

        assert_eq!(egress.drain(rx).await, 2);
        assert_eq!(store.len().await.unwrap(), 2);
        assert!(broker.published().is_empty());
    }
}
