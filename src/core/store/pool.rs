//! Bounded Redis connection pool.
//!
//! - at most `max_active` connections checked out at once
//! - at most `max_idle` connections kept around when returned
//! - idle connections older than `idle_timeout` are closed instead of reused
//! - every idle connection is `PING`ed before it is handed out
//!
//! Each pooled `MultiplexedConnection` owns its own socket. A checkout gets
//! a handle no other caller holds, so `max_active` bounds the sockets open
//! to Redis and a connection marked broken is dropped without affecting
//! other callers.

use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use redis::aio::MultiplexedConnection;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::timeout;
use tracing::{debug, info};

use crate::core::error::StoreError;

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_active: usize,
    pub max_idle: usize,
    /// Zero disables idle recycling.
    pub idle_timeout: Duration,
    /// Bounds both waiting for a free slot and dialing a new connection.
    pub checkout_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_active: 1000,
            max_idle: 50,
            idle_timeout: Duration::from_secs(3600),
            checkout_timeout: Duration::from_secs(5),
        }
    }
}

struct IdleConnection {
    conn: MultiplexedConnection,
    returned_at: Instant,
}

struct PoolInner {
    client: redis::Client,
    config: PoolConfig,
    permits: Arc<Semaphore>,
    idle: Mutex<VecDeque<IdleConnection>>,
}

impl PoolInner {
    fn release(&self, conn: MultiplexedConnection) {
        if self.permits.is_closed() || self.config.max_idle == 0 {
            return;
        }
        let mut idle = self.idle.lock();
        if idle.len() >= self.config.max_idle {
            idle.pop_front();
        }
        idle.push_back(IdleConnection {
            conn,
            returned_at: Instant::now(),
        });
    }

    fn is_stale(&self, idle: &IdleConnection) -> bool {
        !self.config.idle_timeout.is_zero() && idle.returned_at.elapsed() > self.config.idle_timeout
    }
}

/// Shared handle to the pool. Cloning is cheap.
#[derive(Clone)]
pub struct RedisPool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for RedisPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisPool")
            .field("config", &self.inner.config)
            .field("idle", &self.idle_count())
            .field("active", &self.active_count())
            .finish()
    }
}

impl RedisPool {
    /// Builds a pool without touching the network.
    pub fn new(address: &str, config: PoolConfig) -> Result<Self, StoreError> {
        let client = redis::Client::open(redis_url(address))?;
        let max_active = config.max_active.max(1);
        Ok(Self {
            inner: Arc::new(PoolInner {
                client,
                config,
                permits: Arc::new(Semaphore::new(max_active)),
                idle: Mutex::new(VecDeque::new()),
            }),
        })
    }

    /// Builds a pool and proves the server is reachable.
    pub async fn connect(address: &str, config: PoolConfig) -> Result<Self, StoreError> {
        let pool = Self::new(address, config)?;
        let conn = pool.get().await?;
        drop(conn);
        info!(target: "nsqdelay::store", address, "connected to redis");
        Ok(pool)
    }

    /// Checks out a live connection.
    pub async fn get(&self) -> Result<PooledConnection, StoreError> {
        let wait = self.inner.config.checkout_timeout;
        let permit = timeout(wait, Arc::clone(&self.inner.permits).acquire_owned())
            .await
            .map_err(|_| StoreError::PoolTimeout(wait))?
            .map_err(|_| StoreError::PoolClosed)?;

        loop {
            let candidate = self.inner.idle.lock().pop_back();
            let Some(idle) = candidate else { break };

            if self.inner.is_stale(&idle) {
                debug!(target: "nsqdelay::store", "closing stale idle connection");
                continue;
            }

            let mut conn = idle.conn;
            match ping(&mut conn).await {
                Ok(()) => return Ok(PooledConnection::new(conn, &self.inner, permit)),
                Err(e) => {
                    debug!(target: "nsqdelay::store", error = %e, "dropping idle connection that failed PING");
                }
            }
        }

        let conn = timeout(wait, self.inner.client.get_multiplexed_async_connection())
            .await
            .map_err(|_| StoreError::PoolTimeout(wait))??;
        Ok(PooledConnection::new(conn, &self.inner, permit))
    }

    pub fn idle_count(&self) -> usize {
        self.inner.idle.lock().len()
    }

    pub fn active_count(&self) -> usize {
        self.inner.config.max_active.max(1) - self.inner.permits.available_permits()
    }

    /// Refuses further checkouts and drops idle connections.
    pub fn close(&self) {
        self.inner.permits.close();
        self.inner.idle.lock().clear();
    }
}

/// A checked-out connection. Returned to the pool on drop unless marked
/// broken.
pub struct PooledConnection {
    conn: MultiplexedConnection,
    pool: Arc<PoolInner>,
    broken: bool,
    _permit: OwnedSemaphorePermit,
}

impl PooledConnection {
    fn new(conn: MultiplexedConnection, pool: &Arc<PoolInner>, permit: OwnedSemaphorePermit) -> Self {
        Self {
            conn,
            pool: Arc::clone(pool),
            broken: false,
            _permit: permit,
        }
    }

    /// Prevents the connection from going back to the idle list.
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }
}

impl Deref for PooledConnection {
    type Target = MultiplexedConnection;

    fn deref(&self) -> &Self::Target {
        &self.conn
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.conn
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if !self.broken {
            self.pool.release(self.conn.clone());
        }
    }
}

async fn ping(conn: &mut MultiplexedConnection) -> Result<(), StoreError> {
    let reply: String = redis::cmd("PING").query_async(conn).await?;
    if reply == "PONG" {
        Ok(())
    } else {
        Err(StoreError::Reply(reply))
    }
}

/// Accepts bare `host:port` as well as full `redis://` URLs.
pub fn redis_url(address: &str) -> String {
    if address.contains("://") {
        address.to_string()
    } else {
        format!("redis://{address}")
    }
}
