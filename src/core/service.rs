//! Wires ingress, scanner and egress into one running pipeline.

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::config::Config;
use crate::core::broker::{MessagePublisher, MessageSubscriber};
use crate::core::dlq::DeadLetterQueue;
use crate::core::egress::EgressPublisher;
use crate::core::ingress::IngressAdapter;
use crate::core::scanner::ExpiryScanner;
use crate::core::shutdown::ShutdownCoordinator;
use crate::core::store::DelayStore;
use crate::util::backoff::RetryBackoff;

#[derive(Debug, Clone)]
pub struct ServiceSettings {
    pub source_topic: String,
    pub channel: String,
    pub scan_interval: Duration,
    pub ingress_concurrency: usize,
    pub queue_capacity: usize,
    pub backoff: RetryBackoff,
    pub max_pending_retries: usize,
    pub dead_letter_capacity: usize,
}

impl From<&Config> for ServiceSettings {
    fn from(cfg: &Config) -> Self {
        Self {
            source_topic: cfg.broker.source_topic.clone(),
            channel: cfg.broker.channel.clone(),
            scan_interval: cfg.scanner.interval(),
            ingress_concurrency: cfg.ingress.max_concurrency,
            queue_capacity: cfg.egress.queue_capacity,
            backoff: RetryBackoff::new(
                cfg.egress.retry_base(),
                cfg.egress.retry_max(),
                cfg.egress.max_attempts,
            ),
            max_pending_retries: cfg.egress.max_pending_retries,
            dead_letter_capacity: cfg.egress.dead_letter_capacity,
        }
    }
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

/// The delay pipeline over abstract broker and store handles.
pub struct DelayService {
    subscriber: Arc<dyn MessageSubscriber>,
    publisher: Arc<dyn MessagePublisher>,
    store: Arc<dyn DelayStore>,
    settings: ServiceSettings,
    dead_letters: Arc<DeadLetterQueue>,
}

impl DelayService {
    pub fn new(
        subscriber: Arc<dyn MessageSubscriber>,
        publisher: Arc<dyn MessagePublisher>,
        store: Arc<dyn DelayStore>,
        settings: ServiceSettings,
    ) -> Self {
        let dead_letters = Arc::new(DeadLetterQueue::new(settings.dead_letter_capacity));
        Self {
            subscriber,
            publisher,
            store,
            settings,
            dead_letters,
        }
    }

    pub fn dead_letters(&self) -> Arc<DeadLetterQueue> {
        self.dead_letters.clone()
    }

    /// Subscribes and runs until `coordinator` triggers, then stops
    /// ingress and the scanner and lets egress drain. Returns `false` if a
    /// task had to be abandoned at the shutdown timeout.
    pub async fn run(self, coordinator: &ShutdownCoordinator) -> anyhow::Result<bool> {
        let s = &self.settings;
        let subscription = self
            .subscriber
            .subscribe(&s.source_topic, &s.channel)
            .await?;

        let (queue_tx, queue_rx) = flume::bounded(s.queue_capacity.max(1));

        let egress = EgressPublisher::new(
            self.publisher.clone(),
            self.store.clone(),
            self.dead_letters.clone(),
            s.backoff,
            s.max_pending_retries,
        )
        .with_drain_budget(coordinator.timeout() / 2);
        let egress_task = tokio::spawn(egress.run(queue_rx, coordinator.signal()));

        let scanner = ExpiryScanner::new(
            self.store.clone(),
            queue_tx,
            s.scan_interval,
            coordinator.signal(),
        );
        let scanner_task = tokio::spawn(async move { scanner.run().await });

        let ingress = IngressAdapter::new(self.store.clone(), s.ingress_concurrency);
        let ingress_signal = coordinator.signal();
        let ingress_task =
            tokio::spawn(async move { ingress.run(subscription, ingress_signal).await });

        info!(
            topic = %s.source_topic,
            channel = %s.channel,
            scan_interval = ?s.scan_interval,
            "delay service running"
        );

        coordinator.signal().recv().await;

        let clean = coordinator
            .join_all(vec![
                ("ingress", ingress_task),
                ("scanner", scanner_task),
                ("egress", egress_task),
            ])
            .await;

        let dlq = self.dead_letters.stats();
        info!(
            dead_lettered = dlq.total_messages,
            dead_letters_held = dlq.current_size,
            "delay service stopped"
        );
        Ok(clean)
    }
}
