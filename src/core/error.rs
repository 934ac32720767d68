use std::time::Duration;

use thiserror::Error;

/// Failures talking to the delay store. The store never retries on its own.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("no store connection available within {0:?}")]
    PoolTimeout(Duration),

    #[error("store connection pool is closed")]
    PoolClosed,

    #[error("unexpected store reply: {0}")]
    Reply(String),
}

/// Failures talking to the message broker.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("broker protocol violation: {0}")]
    Protocol(String),

    #[error("broker rejected command: {0}")]
    Rejected(String),

    #[error("broker operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("lookup failed: {0}")]
    Lookup(String),

    #[error("broker connection closed")]
    Closed,
}

impl BrokerError {
    /// Returns `true` when the underlying connection must not be reused.
    pub fn is_fatal_for_connection(&self) -> bool {
        !matches!(self, BrokerError::Rejected(_))
    }
}

/// Reasons a delay request is refused before reaching the store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("topic is empty")]
    EmptyTopic,

    #[error("topic {0:?} is not a valid topic name")]
    InvalidTopicName(String),

    #[error("body is empty")]
    EmptyBody,

    #[error("send_in must be positive, got {0}")]
    NonPositiveDelay(i64),

    #[error("send_in {0} overflows the execution timestamp")]
    DelayOverflow(i64),
}

/// Outcome of a failed ingress attempt. Every variant still acknowledges
/// the inbound broker message.
#[derive(Debug, Error)]
pub enum IngressError {
    #[error("malformed delay request: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("invalid delay request: {0}")]
    Invalid(#[from] ValidationError),

    #[error("store insert failed: {0}")]
    Store(#[from] StoreError),
}
