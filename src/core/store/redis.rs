use async_trait::async_trait;
use redis::Script;
use tracing::{debug, trace};

use crate::core::error::StoreError;
use crate::core::store::pool::{PooledConnection, RedisPool};
use crate::core::store::DelayStore;

/// Reads and removes the due range in one server-side step, so a member is
/// handed to exactly one caller and inserts landing mid-scan are not lost.
/// `unpack` is bounded by the Lua stack, so removal goes in chunks of ARGV[2].
const POP_DUE_SCRIPT: &str = r#"
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1])
local step = tonumber(ARGV[2])
for i = 1, #due, step do
    redis.call('ZREM', KEYS[1], unpack(due, i, math.min(i + step - 1, #due)))
end
return due
"#;

const ZREM_CHUNK: usize = 4096;

/// Delay store backed by a Redis sorted set.
pub struct RedisStore {
    pool: RedisPool,
    key: String,
    pop_script: Script,
}

impl RedisStore {
    pub fn new(pool: RedisPool, key: impl Into<String>) -> Self {
        Self {
            pool,
            key: key.into(),
            pop_script: Script::new(POP_DUE_SCRIPT),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn pool(&self) -> &RedisPool {
        &self.pool
    }

    async fn checkout(&self) -> Result<PooledConnection, StoreError> {
        self.pool.get().await
    }
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("key", &self.key)
            .field("pool", &self.pool)
            .finish()
    }
}

#[async_trait]
impl DelayStore for RedisStore {
    async fn insert(&self, member: &str, execute_at: i64) -> Result<(), StoreError> {
        let mut conn = self.checkout().await?;
        let res: Result<i64, _> = redis::cmd("ZADD")
            .arg(&self.key)
            .arg(execute_at)
            .arg(member)
            .query_async(&mut *conn)
            .await;
        match res {
            Ok(added) => {
                trace!(target: "nsqdelay::store", key = %self.key, execute_at, added, "ZADD");
                Ok(())
            }
            Err(e) => {
                conn.mark_broken();
                Err(e.into())
            }
        }
    }

    async fn pop_due(&self, now: i64) -> Result<Vec<String>, StoreError> {
        let mut conn = self.checkout().await?;
        let res: Result<Vec<String>, _> = self
            .pop_script
            .key(&self.key)
            .arg(now)
            .arg(ZREM_CHUNK)
            .invoke_async(&mut *conn)
            .await;
        match res {
            Ok(members) => {
                if !members.is_empty() {
                    debug!(target: "nsqdelay::store", key = %self.key, now, count = members.len(), "popped due members");
                }
                Ok(members)
            }
            Err(e) => {
                conn.mark_broken();
                Err(e.into())
            }
        }
    }

    async fn len(&self) -> Result<usize, StoreError> {
        let mut conn = self.checkout().await?;
        let res: Result<usize, _> = redis::cmd("ZCARD")
            .arg(&self.key)
            .query_async(&mut *conn)
            .await;
        res.map_err(|e| {
            conn.mark_broken();
            e.into()
        })
    }
}
