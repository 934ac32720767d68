//! Periodically moves due entries from the store to the egress queue.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::core::error::StoreError;
use crate::core::message::{current_unix_secs, DueMessage};
use crate::core::shutdown::ShutdownSignal;
use crate::core::store::DelayStore;
use crate::metrics;

/// What one scan cycle did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ScanReport {
    pub popped: usize,
    pub forwarded: usize,
    /// Popped members that did not decode.
    pub discarded: usize,
    /// Popped messages put back into the store because of shutdown.
    pub requeued: usize,
}

pub struct ExpiryScanner {
    store: Arc<dyn DelayStore>,
    queue: flume::Sender<DueMessage>,
    interval: Duration,
    shutdown: ShutdownSignal,
}

impl ExpiryScanner {
    pub fn new(
        store: Arc<dyn DelayStore>,
        queue: flume::Sender<DueMessage>,
        interval: Duration,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            store,
            queue,
            interval,
            shutdown,
        }
    }

    /// Pops everything due at `now` and forwards it, waiting for queue
    /// space as needed. Once shutdown is seen (or the queue closes), the
    /// rest of the batch is written back with score `now`.
    ///
    /// A send in progress is never cancelled: the queue may already hold
    /// the message. Egress keeps receiving until this sender is dropped.
    pub async fn scan_once(&self, now: i64) -> Result<ScanReport, StoreError> {
        let members = self.store.pop_due(now).await?;
        let mut report = ScanReport {
            popped: members.len(),
            ..ScanReport::default()
        };
        if members.is_empty() {
            return Ok(report);
        }
        metrics::inc_scanned(members.len() as u64);

        let mut batch = Vec::with_capacity(members.len());
        for member in members {
            match DueMessage::decode(member) {
                Ok(due) => batch.push(due),
                Err(e) => {
                    report.discarded += 1;
                    warn!(target: "nsqdelay::scanner", error = %e, "discarding undecodable store entry");
                }
            }
        }

        let mut pending = batch.into_iter();
        while let Some(due) = pending.next() {
            if self.shutdown.is_shutdown() {
                report.requeued = self
                    .write_back(std::iter::once(due).chain(pending), now)
                    .await;
                break;
            }
            let (id, topic) = (due.message.id.clone(), due.message.topic.clone());
            match self.queue.send_async(due).await {
                Ok(()) => {
                    report.forwarded += 1;
                    debug!(target: "nsqdelay::scanner", id = %id, topic = %topic, "forwarded due message");
                }
                Err(flume::SendError(due)) => {
                    report.requeued = self
                        .write_back(std::iter::once(due).chain(pending), now)
                        .await;
                    break;
                }
            }
        }

        Ok(report)
    }

    async fn write_back(&self, rest: impl Iterator<Item = DueMessage>, now: i64) -> usize {
        let mut requeued = 0;
        for due in rest {
            match self.store.insert(&due.member, now).await {
                Ok(()) => requeued += 1,
                Err(e) => error!(
                    target: "nsqdelay::scanner",
                    id = %due.message.id,
                    member = %due.member,
                    error = %e,
                    "failed to write back due message, message lost"
                ),
            }
        }
        metrics::inc_requeued(requeued as u64);
        info!(target: "nsqdelay::scanner", requeued, "wrote unforwarded messages back to store");
        requeued
    }

    /// Scans every `interval` until shutdown. The first scan happens one
    /// interval after start.
    pub async fn run(&self) {
        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut shutdown = self.shutdown.clone();
        info!(target: "nsqdelay::scanner", interval = ?self.interval, "scanner started");

        loop {
            tokio::select! {
                biased;
                _ = shutdown.recv() => break,
                _ = ticker.tick() => {}
            }

            let now = current_unix_secs();
            match self.scan_once(now).await {
                Ok(report) if report.popped > 0 => {
                    info!(
                        target: "nsqdelay::scanner",
                        now,
                        popped = report.popped,
                        forwarded = report.forwarded,
                        discarded = report.discarded,
                        "scan complete"
                    );
                }
                Ok(_) => {}
                Err(e) => error!(target: "nsqdelay::scanner", error = %e, "scan failed, skipping cycle"),
            }
            if shutdown.is_shutdown() {
                break;
            }
        }
        info!(target: "nsqdelay::scanner", "scanner stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::message::{encode_message, DelayedMessage};
    use crate::core::shutdown::ShutdownCoordinator;
    use crate::core::store::MemoryStore;

    fn member(topic: &str, body: &str) -> String {
        encode_message(&DelayedMessage::new(topic, body, 5)).unwrap()
    }

    #[tokio::test]
    async fn forwards_only_due_entries() {
        let store = Arc::new(MemoryStore::new());
        store.insert(&member("t1", "a"), 1005).await.unwrap();
        store.insert(&member("t1", "b"), 1010).await.unwrap();
        store.insert("not json", 1000).await.unwrap();

        let coordinator = ShutdownCoordinator::new(Duration::from_secs(1));
        let (tx, rx) = flume::bounded(8);
        let scanner = ExpiryScanner::new(store.clone(), tx, Duration::from_secs(1), coordinator.signal());

        let report = scanner.scan_once(1004).await.unwrap();
        assert_eq!(report.popped, 1);
        assert_eq!(report.discarded, 1);
        assert!(rx.is_empty());

        let report = scanner.scan_once(1006).await.unwrap();
        assert_eq!(report.forwarded, 1);
        assert_eq!(rx.recv_async().await.unwrap().message.body, "a");
        assert_eq!(store.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn shutdown_mid_batch_never_duplicates_a_message() {
        let store = Arc::new(MemoryStore::new());
        for body in ["a", "b", "c"] {
            store.insert(&member("t1", body), 1000).await.unwrap();
        }

        let coordinator = ShutdownCoordinator::new(Duration::from_secs(1));
        let (tx, rx) = flume::bounded(1);
        let scanner = Arc::new(ExpiryScanner::new(
            store.clone(),
            tx,
            Duration::from_secs(1),
            coordinator.signal(),
        ));

        let task = {
            let scanner = scanner.clone();
            tokio::spawn(async move { scanner.scan_once(2000).await })
        };
        // One message fits in the queue; the scanner then blocks on the next.
        while rx.is_empty() {
            tokio::task::yield_now().await;
        }
        let first = rx.recv_async().await.unwrap();
        coordinator.trigger();

        let report = task.await.unwrap().unwrap();
        assert_eq!(report.popped, 3);
        assert_eq!(report.forwarded, 2);
        assert_eq!(report.requeued, 1);

        let mut forwarded = vec![first.member];
        forwarded.extend(rx.drain().map(|due| due.member));
        let stored: Vec<String> = store.entries().into_iter().map(|(_, m)| m).collect();
        assert_eq!(forwarded.len() + stored.len(), 3);
        assert!(stored.iter().all(|m| !forwarded.contains(m)));
        assert!(store.entries().iter().all(|(score, _)| *score == 2000));
    }

    #[tokio::test]
    async fn shutdown_before_forwarding_writes_whole_batch_back() {
        let store = Arc::new(MemoryStore::new());
        for body in ["a", "b"] {
            store.insert(&member("t1", body), 1000).await.unwrap();
        }

        let coordinator = ShutdownCoordinator::new(Duration::from_secs(1));
        let (tx, rx) = flume::bounded(8);
        let scanner = ExpiryScanner::new(store.clone(), tx, Duration::from_secs(1), coordinator.signal());
        coordinator.trigger();

        let report = scanner.scan_once(2000).await.unwrap();
        assert_eq!(report.forwarded, 0);
        assert_eq!(report.requeued, 2);
        assert!(rx.is_empty());
        assert_eq!(store.len().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn closed_queue_writes_batch_back() {
        let store = Arc::new(MemoryStore::new());
        store.insert(&member("t1", "a"), 1000).await.unwrap();

        let coordinator = ShutdownCoordinator::new(Duration::from_secs(1));
        let (tx, rx) = flume::bounded(8);
        drop(rx);
        let scanner = ExpiryScanner::new(store.clone(), tx, Duration::from_secs(1), coordinator.signal());

        let report = scanner.scan_once(2000).await.unwrap();
        assert_eq!(report.requeued, 1);
        assert_eq!(store.score(&member("t1", "a")), Some(2000));
    }

    #[tokio::test(start_paused = true)]
    async fn run_waits_one_interval_before_scanning() {
        let store = Arc::new(MemoryStore::new());
        store.insert(&member("t1", "a"), 0).await.unwrap();

        let coordinator = ShutdownCoordinator::new(Duration::from_secs(1));
        let (tx, rx) = flume::bounded(8);
        let scanner = Arc::new(ExpiryScanner::new(
            store.clone(),
            tx,
            Duration::from_secs(10),
            coordinator.signal(),
        ));
        let task = {
            let scanner = scanner.clone();
            tokio::spawn(async move { scanner.run().await })
        };

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(rx.is_empty());
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(rx.len(), 1);

        coordinator.trigger();
        task.await.unwrap();
    }
}
