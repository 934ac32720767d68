//! Runs against a live Redis when `NSQDELAY_TEST_REDIS` names one, e.g.
//! `NSQDELAY_TEST_REDIS=127.0.0.1:6379 cargo test --test redis_store`.
//! Without it every test returns early.

mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use nsqdelay::core::store::{DelayStore, PoolConfig, RedisPool, RedisStore};

const REDIS_ENV: &str = "NSQDELAY_TEST_REDIS";

async fn store(config: PoolConfig) -> Option<Arc<RedisStore>> {
    let Ok(address) = std::env::var(REDIS_ENV) else {
        eprintln!("{REDIS_ENV} not set, skipping");
        return None;
    };
    common::init_logging();
    let pool = RedisPool::connect(&address, config)
        .await
        .expect("redis reachable");
    let key = format!("nsqdelay_test_{}", uuid::Uuid::new_v4().simple());
    Some(Arc::new(RedisStore::new(pool, key)))
}

async fn cleanup(store: &RedisStore) {
    let mut conn = store.pool().get().await.expect("checkout");
    let _: i64 = redis::cmd("DEL")
        .arg(store.key())
        .query_async(&mut *conn)
        .await
        .expect("DEL");
}

#[tokio::test]
async fn due_entries_pop_exactly_at_their_score() {
    let Some(store) = store(PoolConfig::default()).await else { return };

    store.insert("m1", 1005).await.unwrap();
    store.insert("m2", 1010).await.unwrap();
    assert_eq!(store.len().await.unwrap(), 2);

    assert!(store.pop_due(1004).await.unwrap().is_empty());
    assert_eq!(store.pop_due(1005).await.unwrap(), vec!["m1"]);
    assert!(store.pop_due(1006).await.unwrap().is_empty());
    assert_eq!(store.len().await.unwrap(), 1);

    // Re-adding an existing member moves its score.
    store.insert("m2", 2000).await.unwrap();
    assert!(store.pop_due(1999).await.unwrap().is_empty());
    assert_eq!(store.pop_due(2000).await.unwrap(), vec!["m2"]);

    cleanup(&store).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_pops_hand_out_each_member_once() {
    let Some(store) = store(PoolConfig::default()).await else { return };

    const TOTAL: i64 = 2_000;
    for i in 0..TOTAL {
        store.insert(&format!("m{i}"), 1_000 + i % 50).await.unwrap();
    }

    let handles: Vec<_> = (0..8)
        .map(|worker| {
            let store = store.clone();
            tokio::spawn(async move {
                let mut seen = Vec::new();
                for now in (1_000 + worker)..1_060 {
                    seen.extend(store.pop_due(now).await.unwrap());
                }
                seen
            })
        })
        .collect();

    let mut all = Vec::new();
    for h in handles {
        all.extend(h.await.unwrap());
    }
    let unique: HashSet<&String> = all.iter().collect();
    assert_eq!(unique.len(), all.len(), "a member was popped twice");
    assert_eq!(all.len() as i64, TOTAL);
    assert_eq!(store.len().await.unwrap(), 0);

    cleanup(&store).await;
}

#[tokio::test]
async fn large_batch_pops_in_one_call() {
    let Some(store) = store(PoolConfig::default()).await else { return };

    // More members than one ZREM chunk holds.
    const TOTAL: usize = 5_000;
    for i in 0..TOTAL {
        store.insert(&format!("m{i:05}"), 1_000).await.unwrap();
    }
    store.insert("later", 9_000).await.unwrap();

    let popped = store.pop_due(1_000).await.unwrap();
    assert_eq!(popped.len(), TOTAL);
    assert_eq!(store.len().await.unwrap(), 1);

    cleanup(&store).await;
}

#[tokio::test]
async fn pool_recycles_stale_idle_connections() {
    let config = PoolConfig {
        max_active: 2,
        max_idle: 1,
        idle_timeout: Duration::from_millis(50),
        checkout_timeout: Duration::from_secs(2),
    };
    let Some(store) = store(config).await else { return };
    let pool = store.pool();

    store.insert("m", 1).await.unwrap();
    assert_eq!(pool.idle_count(), 1);
    assert_eq!(pool.active_count(), 0);

    tokio::time::sleep(Duration::from_millis(100)).await;
    // The stale idle connection is closed and a fresh one dialed.
    assert_eq!(store.len().await.unwrap(), 1);
    assert_eq!(pool.idle_count(), 1);

    cleanup(&store).await;
}
