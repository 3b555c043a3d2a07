//! The two cache shapes used across the engine: a bounded LRU map for
//! process-local layers and a bounded TTL map standing in for the shared
//! external store. An instance is one or the other, never both.

use crate::clock::Clock;
use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::sync::{Arc, Mutex};

// ---------------------------------------------------------------------------
// Bounded LRU
// ---------------------------------------------------------------------------

/// Size-capped map with least-recently-used eviction. Not internally
/// synchronized; owners wrap it in a `Mutex`.
pub struct LruCache<K, V> {
    capacity: usize,
    map: HashMap<K, V>,
    order: VecDeque<K>,
}

impl<K: Eq + Hash + Clone, V: Clone> LruCache<K, V> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "lru capacity must be positive");
        Self {
            capacity,
            map: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    pub fn get(&mut self, key: &K) -> Option<V> {
        if let Some(value) = self.map.get(key).cloned() {
            self.touch(key);
            Some(value)
        } else {
            None
        }
    }

    pub fn insert(&mut self, key: K, value: V) {
        if self.map.contains_key(&key) {
            self.map.insert(key.clone(), value);
            self.touch(&key);
            return;
        }
        if self.map.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.map.remove(&oldest);
            }
        }
        self.order.push_back(key.clone());
        self.map.insert(key, value);
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.order.retain(|k| k != key);
        self.map.remove(key)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    fn touch(&mut self, key: &K) {
        self.order.retain(|k| k != key);
        self.order.push_back(key.clone());
    }
}

// ---------------------------------------------------------------------------
// Bounded TTL map
// ---------------------------------------------------------------------------

struct TtlEntry<V> {
    value: V,
    expires_at: DateTime<Utc>,
}

/// TTL-indexed map with a hard capacity cap, internally synchronized; this
/// is the shape of the shared external cache: `put_if_absent` is the atomic
/// set-if-absent, `remove_if_value` is the fenced delete.
pub struct TtlCache<V> {
    capacity: usize,
    clock: Arc<dyn Clock>,
    entries: Mutex<HashMap<String, TtlEntry<V>>>,
}

impl<V: Clone + PartialEq> TtlCache<V> {
    pub fn new(capacity: usize, clock: Arc<dyn Clock>) -> Self {
        assert!(capacity > 0, "ttl capacity must be positive");
        Self {
            capacity,
            clock,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Live entry count. Expired entries still resident count until pruned.
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, key: &str) -> Option<V> {
        let now = self.clock.now();
        let mut entries = self.entries.lock().unwrap();
        match entries.get(key) {
            Some(entry) if entry.expires_at > now => Some(entry.value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    /// Insert or overwrite. Returns false without writing when the map is at
    /// capacity and the key is not already present.
    pub fn put(&self, key: &str, value: V, ttl: Duration) -> bool {
        let expires_at = self.clock.now() + ttl;
        let mut entries = self.entries.lock().unwrap();
        if !entries.contains_key(key) && entries.len() >= self.capacity {
            return false;
        }
        entries.insert(key.to_string(), TtlEntry { value, expires_at });
        true
    }

    /// Atomic set-if-absent. A live entry under the key, or a full map,
    /// refuses the write. Expired entries under the key are replaced.
    pub fn put_if_absent(&self, key: &str, value: V, ttl: Duration) -> bool {
        let now = self.clock.now();
        let mut entries = self.entries.lock().unwrap();
        match entries.get(key) {
            Some(entry) if entry.expires_at > now => false,
            Some(_) => {
                entries.insert(
                    key.to_string(),
                    TtlEntry {
                        value,
                        expires_at: now + ttl,
                    },
                );
                true
            }
            None => {
                if entries.len() >= self.capacity {
                    return false;
                }
                entries.insert(
                    key.to_string(),
                    TtlEntry {
                        value,
                        expires_at: now + ttl,
                    },
                );
                true
            }
        }
    }

    pub fn remove(&self, key: &str) {
        self.entries.lock().unwrap().remove(key);
    }

    /// Delete only if the live value equals `expected`. Returns whether a
    /// deletion happened.
    pub fn remove_if_value(&self, key: &str, expected: &V) -> bool {
        let now = self.clock.now();
        let mut entries = self.entries.lock().unwrap();
        match entries.get(key) {
            Some(entry) if entry.expires_at > now && entry.value == *expected => {
                entries.remove(key);
                true
            }
            _ => false,
        }
    }

    /// Drop expired entries, returning how many were removed.
    pub fn prune_expired(&self) -> usize {
        let now = self.clock.now();
        let mut entries = self.entries.lock().unwrap();
        let before = entries.len();
        entries.retain(|_, entry| entry.expires_at > now);
        before - entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    #[test]
    fn lru_evicts_oldest() {
        let mut lru = LruCache::new(2);
        lru.insert("a", 1);
        lru.insert("b", 2);
        lru.get(&"a");
        lru.insert("c", 3);
        assert_eq!(lru.get(&"a"), Some(1));
        assert_eq!(lru.get(&"b"), None);
        assert_eq!(lru.get(&"c"), Some(3));
    }

    #[test]
    fn ttl_put_if_absent_is_exclusive() {
        let clock = Arc::new(ManualClock::starting_now());
        let cache: TtlCache<String> = TtlCache::new(4, clock.clone());
        assert!(cache.put_if_absent("k", "one".into(), Duration::seconds(10)));
        assert!(!cache.put_if_absent("k", "two".into(), Duration::seconds(10)));
        clock.advance(Duration::seconds(11));
        assert!(cache.put_if_absent("k", "three".into(), Duration::seconds(10)));
        assert_eq!(cache.get("k"), Some("three".to_string()));
    }

    #[test]
    fn ttl_capacity_refuses_new_keys() {
        let clock = Arc::new(ManualClock::starting_now());
        let cache: TtlCache<u32> = TtlCache::new(1, clock);
        assert!(cache.put("a", 1, Duration::seconds(10)));
        assert!(!cache.put("b", 2, Duration::seconds(10)));
        // Overwriting a resident key is always allowed.
        assert!(cache.put("a", 3, Duration::seconds(10)));
    }

    #[test]
    fn ttl_fenced_remove() {
        let clock = Arc::new(ManualClock::starting_now());
        let cache: TtlCache<String> = TtlCache::new(4, clock);
        cache.put("k", "tok-1".into(), Duration::seconds(10));
        assert!(!cache.remove_if_value("k", &"tok-2".to_string()));
        assert!(cache.remove_if_value("k", &"tok-1".to_string()));
        assert_eq!(cache.get("k"), None);
    }

    #[test]
    fn ttl_prune_counts_expired() {
        let clock = Arc::new(ManualClock::starting_now());
        let cache: TtlCache<u32> = TtlCache::new(8, clock.clone());
        cache.put("a", 1, Duration::seconds(5));
        cache.put("b", 2, Duration::seconds(50));
        clock.advance(Duration::seconds(6));
        assert_eq!(cache.prune_expired(), 1);
        assert_eq!(cache.len(), 1);
    }
}
