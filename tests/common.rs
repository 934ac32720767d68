#![allow(dead_code)]

use std::sync::{Arc, Once};

use nsqdelay::core::broker::{MemoryBroker, MessageSubscriber, Subscription};
use nsqdelay::core::store::MemoryStore;

pub fn init_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = nsqdelay::logging::init_logging("debug");
    });
}

pub const SOURCE_TOPIC: &str = "delayed";

/// A broker, a store and a subscription on the source topic.
pub async fn harness() -> (Arc<MemoryBroker>, Arc<MemoryStore>, Subscription) {
    init_logging();
    let broker = Arc::new(MemoryBroker::new());
    let store = Arc::new(MemoryStore::new());
    let sub = broker
        .subscribe(SOURCE_TOPIC, "nsqdelay_scheduler")
        .await
        .expect("memory subscribe");
    (broker, store, sub)
}

pub fn request(topic: &str, body: &str, send_in: i64) -> String {
    serde_json::json!({ "topic": topic, "body": body, "send_in": send_in }).to_string()
}
