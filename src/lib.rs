//! nsqdelay – delayed message delivery for NSQ.
//!
//! Producers publish `{topic, body, send_in}` requests to a source topic.
//! The service stores each one in a Redis sorted set scored by its due
//! time, scans for due entries once per interval and re-publishes them to
//! their target topic, retrying failed publishes with backoff.
//!
//! This crate exports
//!  * `core`    – store, broker client, ingress/scanner/egress pipeline
//!  * `config`  – TOML + environment configuration
//!  * `logging` – tracing subscriber setup
//!  * `metrics` – process-wide counters

// ───────────────────────────────────────────────────────────
// Public modules
// ───────────────────────────────────────────────────────────
pub mod config;
pub mod core;
pub mod logging;
pub mod metrics;
pub mod util;

// ───────────────────────────────────────────────────────────
// Re-exports
// ───────────────────────────────────────────────────────────
pub use config::{load_config, Config};
pub use crate::core::message::DelayedMessage;
pub use crate::core::service::{DelayService, ServiceSettings};

use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};

use crate::core::broker::nsq::{ConsumerConfig, NsqConsumer, NsqProducer, ProducerConfig};
use crate::core::shutdown::ShutdownCoordinator;
use crate::core::store::{queue_name, DelayStore, PoolConfig, RedisPool, RedisStore};

/// Builds the Redis- and NSQ-backed service from `config` and runs it until
/// SIGINT/SIGTERM. Unreachable Redis or nsqd at startup is an error.
pub async fn run(config: Config) -> anyhow::Result<()> {
    config.validate()?;

    let pool = RedisPool::connect(
        &config.store.redis_address,
        PoolConfig {
            max_active: config.store.max_active,
            max_idle: config.store.max_idle,
            idle_timeout: config.store.idle_timeout(),
            checkout_timeout: config.store.checkout_timeout(),
        },
    )
    .await
    .with_context(|| format!("connecting to redis at {}", config.store.redis_address))?;
    let key = queue_name(&config.store.key_prefix, &config.broker.source_topic);
    let store = Arc::new(RedisStore::new(pool.clone(), key));

    let producer = Arc::new(
        NsqProducer::connect(
            config.broker.nsqd_tcp_address.clone(),
            ProducerConfig {
                dial_timeout: config.broker.dial_timeout(),
                publish_timeout: config.broker.publish_timeout(),
            },
        )
        .await
        .with_context(|| format!("connecting to nsqd at {}", config.broker.nsqd_tcp_address))?,
    );

    // Without lookupd, consume from the same nsqd we publish to.
    let nsqd_tcp_addresses = if config.broker.lookupd_http_addresses.is_empty() {
        vec![config.broker.nsqd_tcp_address.clone()]
    } else {
        Vec::new()
    };
    let consumer = Arc::new(NsqConsumer::new(ConsumerConfig {
        lookupd_http_addresses: config.broker.lookupd_http_addresses.clone(),
        nsqd_tcp_addresses,
        max_in_flight: config.broker.max_in_flight,
        lookupd_poll_interval: config.broker.lookupd_poll_interval(),
        dial_timeout: config.broker.dial_timeout(),
    }));

    if let Ok(pending) = store.len().await {
        info!(target: "nsqdelay::store", key = %store.key(), pending, "delay store ready");
    }

    let coordinator = Arc::new(ShutdownCoordinator::new(config.shutdown.timeout()));
    let signals = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move {
            coordinator
                .trigger_on(ShutdownCoordinator::wait_for_signal())
                .await
        })
    };

    let service = DelayService::new(
        consumer,
        producer.clone(),
        store,
        ServiceSettings::from(&config),
    );
    let result = service.run(&coordinator).await;
    signals.abort();

    producer.close().await;
    pool.close();
    info!("final metrics:\n{}", metrics::snapshot());

    match result {
        Ok(true) => Ok(()),
        Ok(false) => {
            warn!("shutdown timed out; some work may not have been written back");
            Ok(())
        }
        Err(e) => Err(e),
    }
}
