//! Dead Letter Queue
//!
//! Holds messages whose publish budget ran out. Bounded in memory: when
//! full, the oldest entry is dropped to make room. Nothing here is
//! persisted; operators read entries out of logs or via [`DeadLetterQueue::list`].

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{error, warn};

use crate::core::error::BrokerError;
use crate::core::message::{current_unix_secs, DelayedMessage};

/// Why the last publish attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum FailureCategory {
    /// nsqd unreachable or the connection dropped
    Network,
    Timeout,
    /// nsqd answered with an error frame
    Rejected,
    Protocol,
}

impl From<&BrokerError> for FailureCategory {
    fn from(err: &BrokerError) -> Self {
        match err {
            BrokerError::Io(_) | BrokerError::Closed | BrokerError::Lookup(_) => {
                FailureCategory::Network
            }
            BrokerError::Timeout(_) => FailureCategory::Timeout,
            BrokerError::Rejected(_) => FailureCategory::Rejected,
            BrokerError::Protocol(_) => FailureCategory::Protocol,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub message: DelayedMessage,
    pub attempts: u32,
    pub reason: String,
    pub category: FailureCategory,
    pub dead_lettered_at: i64,
}

impl DeadLetter {
    pub fn new(message: DelayedMessage, attempts: u32, err: &BrokerError) -> Self {
        Self {
            message,
            attempts,
            reason: err.to_string(),
            category: FailureCategory::from(err),
            dead_lettered_at: current_unix_secs(),
        }
    }
}

#[derive(Debug, Default)]
pub struct DlqStats {
    pub total_messages: AtomicU64,
    pub dropped_oldest: AtomicU64,
    pub messages_by_category: DashMap<FailureCategory, AtomicU64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DlqStatsSnapshot {
    pub total_messages: u64,
    pub dropped_oldest: u64,
    pub current_size: u64,
    pub by_category: HashMap<FailureCategory, u64>,
}

impl DlqStats {
    fn record(&self, category: FailureCategory) {
        self.total_messages.fetch_add(1, Ordering::Relaxed);
        self.messages_by_category
            .entry(category)
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }
}

pub struct DeadLetterQueue {
    capacity: usize,
    entries: Mutex<VecDeque<DeadLetter>>,
    stats: DlqStats,
}

impl DeadLetterQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Mutex::new(VecDeque::new()),
            stats: DlqStats::default(),
        }
    }

    pub fn push(&self, entry: DeadLetter) {
        error!(
            target: "nsqdelay::egress",
            id = %entry.message.id,
            topic = %entry.message.topic,
            attempts = entry.attempts,
            reason = %entry.reason,
            "message dead-lettered"
        );
        self.stats.record(entry.category);

        let mut entries = self.entries.lock();
        if entries.len() >= self.capacity {
            if let Some(old) = entries.pop_front() {
                self.stats.dropped_oldest.fetch_add(1, Ordering::Relaxed);
                warn!(
                    target: "nsqdelay::egress",
                    id = %old.message.id,
                    capacity = self.capacity,
                    "dead-letter queue full, dropped oldest entry"
                );
            }
        }
        entries.push_back(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Oldest first.
    pub fn list(&self, limit: Option<usize>) -> Vec<DeadLetter> {
        let entries = self.entries.lock();
        let limit = limit.unwrap_or(entries.len());
        entries.iter().take(limit).cloned().collect()
    }

    pub fn drain(&self) -> Vec<DeadLetter> {
        self.entries.lock().drain(..).collect()
    }

    pub fn stats(&self) -> DlqStatsSnapshot {
        let by_category = self
            .stats
            .messages_by_category
            .iter()
            .map(|e| (*e.key(), e.value().load(Ordering::Relaxed)))
            .collect();
        DlqStatsSnapshot {
            total_messages: self.stats.total_messages.load(Ordering::Relaxed),
            dropped_oldest: self.stats.dropped_oldest.load(Ordering::Relaxed),
            current_size: self.len() as u64,
            by_category,
        }
    }
}
