mod common;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use nsqdelay::core::shutdown::ShutdownCoordinator;
use nsqdelay::core::store::DelayStore;
use nsqdelay::util::backoff::RetryBackoff;
use nsqdelay::{DelayService, ServiceSettings};
use tokio::time::{sleep, timeout, Instant};

use common::{request, SOURCE_TOPIC};

fn settings() -> ServiceSettings {
    ServiceSettings {
        scan_interval: Duration::from_millis(100),
        ..ServiceSettings::default()
    }
}

async fn wait_until(limit: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        sleep(Duration::from_millis(20)).await;
    }
    cond()
}

#[tokio::test]
async fn delivers_after_delay_and_shuts_down_cleanly() {
    common::init_logging();
    let broker = Arc::new(nsqdelay::core::broker::MemoryBroker::new());
    let store = Arc::new(nsqdelay::core::store::MemoryStore::new());
    let service = DelayService::new(broker.clone(), broker.clone(), store.clone(), settings());
    let coordinator = Arc::new(ShutdownCoordinator::new(Duration::from_secs(5)));

    let run = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move { service.run(&coordinator).await })
    };
    // Let the service subscribe before injecting.
    sleep(Duration::from_millis(50)).await;

    broker.inject(SOURCE_TOPIC, request("t1", "hello", 1));

    assert!(wait_until(Duration::from_secs(5), || !broker.published_to("t1").is_empty()).await);
    assert_eq!(broker.published_to("t1"), vec![Bytes::from_static(b"hello")]);
    assert_eq!(broker.finished().len(), 1);
    assert!(store.is_empty().await.unwrap());

    coordinator.trigger();
    let clean = timeout(Duration::from_secs(5), run).await.unwrap().unwrap().unwrap();
    assert!(clean);
}

#[tokio::test]
async fn broker_outage_keeps_message_until_shutdown_writes_it_back() {
    common::init_logging();
    let broker = Arc::new(nsqdelay::core::broker::MemoryBroker::new());
    broker.set_available(false);
    let store = Arc::new(nsqdelay::core::store::MemoryStore::new());
    let service = DelayService::new(broker.clone(), broker.clone(), store.clone(), settings());
    let coordinator = Arc::new(ShutdownCoordinator::new(Duration::from_secs(5)));

    let run = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move { service.run(&coordinator).await })
    };
    sleep(Duration::from_millis(50)).await;

    broker.inject(SOURCE_TOPIC, request("t1", "stuck", 1));
    assert!(wait_until(Duration::from_secs(2), || broker.finished().len() == 1).await);

    // Popped by the scanner once due, then failing in egress.
    let popped = {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if store.is_empty().await.unwrap() {
                break true;
            }
            if Instant::now() >= deadline {
                break false;
            }
            sleep(Duration::from_millis(20)).await;
        }
    };
    assert!(popped);

    coordinator.trigger();
    timeout(Duration::from_secs(5), run).await.unwrap().unwrap().unwrap();

    assert!(broker.published().is_empty());
    assert_eq!(store.len().await.unwrap(), 1);
}

#[tokio::test]
async fn exhausted_retries_land_in_dead_letters() {
    common::init_logging();
    let broker = Arc::new(nsqdelay::core::broker::MemoryBroker::new());
    broker.set_available(false);
    let store = Arc::new(nsqdelay::core::store::MemoryStore::new());
    let service = DelayService::new(
        broker.clone(),
        broker.clone(),
        store.clone(),
        ServiceSettings {
            backoff: RetryBackoff::new(Duration::from_millis(10), Duration::from_millis(10), 2),
            ..settings()
        },
    );
    let dead_letters = service.dead_letters();
    let coordinator = Arc::new(ShutdownCoordinator::new(Duration::from_secs(5)));

    let run = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move { service.run(&coordinator).await })
    };
    sleep(Duration::from_millis(50)).await;

    broker.inject(SOURCE_TOPIC, request("t1", "doomed", 1));
    assert!(wait_until(Duration::from_secs(5), || dead_letters.len() == 1).await);
    let letters = dead_letters.list(None);
    assert_eq!(letters[0].attempts, 2);
    assert_eq!(letters[0].message.body, "doomed");

    coordinator.trigger();
    assert!(timeout(Duration::from_secs(5), run).await.unwrap().unwrap().unwrap());
    assert!(store.is_empty().await.unwrap());
}
