use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::core::error::StoreError;
use crate::core::store::DelayStore;

/// In-process sorted set with the same semantics as a Redis ZSET:
/// a member appears at most once and re-adding it moves it to the new score.
///
/// Useful for tests and for embedding without Redis. Nothing survives a
/// restart.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<SortedSet>,
}

#[derive(Debug, Default)]
struct SortedSet {
    by_score: BTreeSet<(i64, String)>,
    scores: HashMap<String, i64>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Score of `member`, if present.
    pub fn score(&self, member: &str) -> Option<i64> {
        self.inner.lock().scores.get(member).copied()
    }

    /// Snapshot of all `(score, member)` pairs in score order.
    pub fn entries(&self) -> Vec<(i64, String)> {
        self.inner.lock().by_score.iter().cloned().collect()
    }
}

#[async_trait]
impl DelayStore for MemoryStore {
    async fn insert(&self, member: &str, execute_at: i64) -> Result<(), StoreError> {
        let mut set = self.inner.lock();
        if let Some(old) = set.scores.insert(member.to_string(), execute_at) {
            set.by_score.remove(&(old, member.to_string()));
        }
        set.by_score.insert((execute_at, member.to_string()));
        Ok(())
    }

    async fn pop_due(&self, now: i64) -> Result<Vec<String>, StoreError> {
        let mut set = self.inner.lock();
        let Some(cutoff) = now.checked_add(1) else {
            let all = std::mem::take(&mut set.by_score);
            set.scores.clear();
            return Ok(all.into_iter().map(|(_, m)| m).collect());
        };

        // Everything strictly below (now + 1, "") has score <= now.
        let not_due = set.by_score.split_off(&(cutoff, String::new()));
        let due = std::mem::replace(&mut set.by_score, not_due);
        let mut members = Vec::with_capacity(due.len());
        for (_, member) in due {
            set.scores.remove(&member);
            members.push(member);
        }
        Ok(members)
    }

    async fn len(&self) -> Result<usize, StoreError> {
        Ok(self.inner.lock().scores.len())
    }
}
