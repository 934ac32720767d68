//! Time-ordered holding area for messages that are not yet due.
//!
//! A store instance owns one logical queue (a sorted set named
//! `key_prefix + source_topic`). Members are serialized [`DelayedMessage`]s
//! and scores are unix timestamps in seconds.
//!
//! [`DelayedMessage`]: crate::core::message::DelayedMessage

pub mod memory;
pub mod pool;
pub mod redis;

use async_trait::async_trait;

use crate::core::error::StoreError;

pub use self::memory::MemoryStore;
pub use self::pool::{PoolConfig, RedisPool};
pub use self::redis::RedisStore;

/// Prefix used for queue names unless configured otherwise.
pub const DEFAULT_KEY_PREFIX: &str = "nsqdelay_";

/// Derives the queue name for a source topic.
pub fn queue_name(prefix: &str, topic: &str) -> String {
    format!("{prefix}{topic}")
}

#[async_trait]
pub trait DelayStore: Send + Sync {
    /// Adds `member` with score `execute_at`.
    async fn insert(&self, member: &str, execute_at: i64) -> Result<(), StoreError>;

    /// Removes and returns every member with score `<= now`.
    ///
    /// Must be atomic: two concurrent calls never return the same member.
    async fn pop_due(&self, now: i64) -> Result<Vec<String>, StoreError>;

    /// Number of members currently held.
    async fn len(&self) -> Result<usize, StoreError>;

    async fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len().await? == 0)
    }
}
