//! Soft-state tables
//!
//! Every cache in the cluster and routing layers is bounded-life: entries
//! are inserted with a time-to-live, refreshed when the peer is heard again,
//! and never handed out after expiry. [`TtlMap`] packages that invariant
//! once — an ordered map plus an expiry min-heap — so callers cannot
//! observe a stale entry.

use crate::time::Timestamp;
use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap};
use std::time::Duration;

struct Entry<V> {
    value: V,
    expires: Timestamp,
}

/// An ordered map whose entries expire `ttl` after their last insert or
/// refresh.
///
/// Expiry is enforced at the accessors: `get`/`iter_live`/`len_live` never
/// expose an expired entry even before [`TtlMap::purge_expired`] physically
/// removes it. Iteration order is key order, which keeps multi-node runs
/// deterministic.
pub struct TtlMap<K, V> {
    entries: BTreeMap<K, Entry<V>>,
    expiry_queue: BinaryHeap<Reverse<(Timestamp, K)>>,
    ttl: Duration,
}

impl<K: Ord + Clone, V> TtlMap<K, V> {
    /// Create a table whose entries live for `ttl`.
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: BTreeMap::new(),
            expiry_queue: BinaryHeap::new(),
            ttl,
        }
    }

    /// The configured time-to-live.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Insert or replace `key`, (re)starting its lifetime at `now`.
    pub fn insert(&mut self, key: K, value: V, now: Timestamp) {
        let expires = now + self.ttl;
        self.expiry_queue.push(Reverse((expires, key.clone())));
        self.entries.insert(key, Entry { value, expires });
    }

    /// Extend the lifetime of an existing entry. Returns false if the entry
    /// is missing or already expired.
    pub fn refresh(&mut self, key: &K, now: Timestamp) -> bool {
        match self.entries.get_mut(key) {
            Some(entry) if entry.expires > now => {
                entry.expires = now + self.ttl;
                self.expiry_queue.push(Reverse((entry.expires, key.clone())));
                true
            }
            _ => false,
        }
    }

    /// Look up a live entry.
    pub fn get(&self, key: &K, now: Timestamp) -> Option<&V> {
        self.entries
            .get(key)
            .filter(|e| e.expires > now)
            .map(|e| &e.value)
    }

    /// Look up a live entry mutably. The lifetime is not extended.
    pub fn get_mut(&mut self, key: &K, now: Timestamp) -> Option<&mut V> {
        self.entries
            .get_mut(key)
            .filter(|e| e.expires > now)
            .map(|e| &mut e.value)
    }

    /// Whether a live entry exists for `key`.
    pub fn contains(&self, key: &K, now: Timestamp) -> bool {
        self.get(key, now).is_some()
    }

    /// Remove an entry regardless of its remaining lifetime.
    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.entries.remove(key).map(|e| e.value)
    }

    /// Drop every entry whose lifetime has ended. Returns how many were
    /// removed.
    pub fn purge_expired(&mut self, now: Timestamp) -> usize {
        let mut removed = 0;
        while let Some(Reverse((expires, key))) = self.expiry_queue.peek().cloned() {
            if expires > now {
                break;
            }
            self.expiry_queue.pop();
            // The heap may hold stale deadlines for refreshed keys; only
            // remove when the map agrees the entry is expired.
            if let Some(entry) = self.entries.get(&key) {
                if entry.expires <= now {
                    self.entries.remove(&key);
                    removed += 1;
                }
            }
        }
        removed
    }

    /// Iterate over live entries in key order.
    pub fn iter_live(&self, now: Timestamp) -> impl Iterator<Item = (&K, &V)> {
        self.entries
            .iter()
            .filter(move |(_, e)| e.expires > now)
            .map(|(k, e)| (k, &e.value))
    }

    /// Number of live entries.
    pub fn len_live(&self, now: Timestamp) -> usize {
        self.iter_live(now).count()
    }

    /// Whether no live entry exists.
    pub fn is_empty_live(&self, now: Timestamp) -> bool {
        self.len_live(now) == 0
    }

    /// Drop everything.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.expiry_queue.clear();
    }
}
