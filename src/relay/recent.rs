//! # Recent Relay Sessions
//!
//! A bounded, insertion-ordered record of finished relay connections, kept for
//! the `/api/v1/voice/sessions` endpoint. Nothing in the relay reads it back;
//! it exists purely for operators.
//!
//! ## Eviction:
//! When the store is full, the oldest inserted entry goes first. Re-inserting
//! an existing key replaces the value but keeps the original position.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::sync::Mutex;

/// Map with a fixed capacity and FIFO eviction.
#[derive(Debug)]
pub struct BoundedStore<K, V> {
    capacity: usize,
    order: VecDeque<K>,
    entries: HashMap<K, V>,
}

impl<K, V> BoundedStore<K, V>
where
    K: Eq + Hash + Clone,
{
    /// A capacity of zero is bumped to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            order: VecDeque::with_capacity(capacity),
            entries: HashMap::with_capacity(capacity),
        }
    }

    /// Insert or replace. Returns the evicted entry, if any.
    pub fn insert(&mut self, key: K, value: V) -> Option<(K, V)> {
        if let Some(existing) = self.entries.get_mut(&key) {
            *existing = value;
            return None;
        }

        let evicted = if self.order.len() >= self.capacity {
            self.order
                .pop_front()
                .and_then(|old| self.entries.remove(&old).map(|v| (old, v)))
        } else {
            None
        };

        self.order.push_back(key.clone());
        self.entries.insert(key, value);
        evicted
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.entries.get(key)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Values in insertion order, oldest first.
    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.order.iter().filter_map(|k| self.entries.get(k))
    }
}

/// What one relay connection did, recorded when it stops.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSummary {
    pub id: String,
    pub opened_at: DateTime<Utc>,
    pub closed_at: DateTime<Utc>,
    /// Whether an upstream session was ever established
    pub upstream_opened: bool,
    /// Client messages handed to the upstream session
    pub frames_forwarded: u64,
    /// Upstream events written back to the client
    pub events_relayed: u64,
    pub close_reason: Option<String>,
}

/// Shared store of recent summaries, owned by `AppState`.
#[derive(Debug)]
pub struct RecentSessions {
    store: Mutex<BoundedStore<String, SessionSummary>>,
}

impl RecentSessions {
    pub fn new(capacity: usize) -> Self {
        Self {
            store: Mutex::new(BoundedStore::new(capacity)),
        }
    }

    pub fn record(&self, summary: SessionSummary) {
        let mut store = self.store.lock().unwrap_or_else(|e| e.into_inner());
        store.insert(summary.id.clone(), summary);
    }

    /// Newest first.
    pub fn snapshot(&self) -> Vec<SessionSummary> {
        let store = self.store.lock().unwrap_or_else(|e| e.into_inner());
        let mut summaries: Vec<_> = store.values().cloned().collect();
        summaries.reverse();
        summaries
    }

    pub fn capacity(&self) -> usize {
        self.store.lock().unwrap_or_else(|e| e.into_inner()).capacity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(id: &str) -> SessionSummary {
        let now = Utc::now();
        SessionSummary {
            id: id.to_string(),
            opened_at: now,
            closed_at: now,
            upstream_opened: false,
            frames_forwarded: 0,
            events_relayed: 0,
            close_reason: None,
        }
    }

    #[test]
    fn test_evicts_oldest_inserted() {
        let mut store = BoundedStore::new(2);
        assert!(store.insert("a", 1).is_none());
        assert!(store.insert("b", 2).is_none());
        assert_eq!(store.insert("c", 3), Some(("a", 1)));

        assert_eq!(store.len(), 2);
        assert!(store.get(&"a").is_none());
        assert_eq!(store.values().copied().collect::<Vec<_>>(), vec![2, 3]);
    }

    #[test]
    fn test_reinsert_keeps_position() {
        let mut store = BoundedStore::new(2);
        store.insert("a", 1);
        store.insert("b", 2);
        store.insert("a", 10);

        // "a" is still the oldest entry
        assert_eq!(store.insert("c", 3), Some(("a", 10)));
    }

    #[test]
    fn test_zero_capacity_holds_one() {
        let mut store = BoundedStore::new(0);
        store.insert(1, "x");
        store.insert(2, "y");
        assert_eq!(store.capacity(), 1);
        assert_eq!(store.len(), 1);
        assert_eq!(store.get(&2), Some(&"y"));
    }

    #[test]
    fn test_recent_sessions_snapshot_newest_first() {
        let recent = RecentSessions::new(3);
        for id in ["s1", "s2", "s3", "s4"] {
            recent.record(summary(id));
        }

        let ids: Vec<_> = recent.snapshot().into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec!["s4", "s3", "s2"]);
        assert_eq!(recent.capacity(), 3);
    }
}
