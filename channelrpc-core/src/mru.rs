//! Fixed-capacity most-recently-used cache.
//!
//! Values are handed out as `Arc`s so an evicted entry stays alive for any
//! caller still holding it. Insertion keeps the first winner: a second insert
//! for a key already present returns the existing value untouched.

use std::borrow::Borrow;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex};

#[derive(Debug)]
struct Entry<V> {
    value: Arc<V>,
    last_used: u64,
}

/// Least-recently-used eviction cache with a fixed capacity.
#[derive(Debug)]
pub struct MruCache<K, V> {
    entries: HashMap<K, Entry<V>>,
    capacity: usize,
    tick: u64,
}

impl<K: Eq + Hash + Clone, V> MruCache<K, V> {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            capacity: capacity.max(1),
            tick: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    /// Look up a value and mark it most recently used.
    pub fn get<Q>(&mut self, key: &Q) -> Option<Arc<V>>
    where
        K: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        let tick = self.next_tick();
        let entry = self.entries.get_mut(key)?;
        entry.last_used = tick;
        Some(Arc::clone(&entry.value))
    }

    /// Insert a value unless the key is already present.
    ///
    /// Returns the value now cached under `key` and whether this call
    /// inserted it. When `false`, the caller's value lost the race and was
    /// dropped.
    pub fn insert(&mut self, key: K, value: V) -> (Arc<V>, bool) {
        self.insert_arc(key, Arc::new(value))
    }

    /// Same as [`insert`](Self::insert) for an already shared value.
    pub fn insert_arc(&mut self, key: K, value: Arc<V>) -> (Arc<V>, bool) {
        if let Some(existing) = self.get(&key) {
            return (existing, false);
        }
        if self.entries.len() >= self.capacity {
            self.evict_one();
        }
        let tick = self.next_tick();
        self.entries.insert(
            key,
            Entry {
                value: Arc::clone(&value),
                last_used: tick,
            },
        );
        (value, true)
    }

    /// Return the cached value, computing and inserting it on a miss.
    pub fn get_or_insert_with<F>(&mut self, key: K, make: F) -> Arc<V>
    where
        F: FnOnce() -> V,
    {
        if let Some(value) = self.get(&key) {
            return value;
        }
        self.insert(key, make()).0
    }

    pub fn remove<Q>(&mut self, key: &Q) -> Option<Arc<V>>
    where
        K: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        self.entries.remove(key).map(|entry| entry.value)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Snapshot of every cached value.
    pub fn values(&self) -> Vec<Arc<V>> {
        self.entries.values().map(|e| Arc::clone(&e.value)).collect()
    }

    fn evict_one(&mut self) {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|(_, entry)| entry.last_used)
            .map(|(key, _)| key.clone());
        if let Some(key) = oldest {
            self.entries.remove(&key);
        }
    }
}

/// An [`MruCache`] behind a short-held mutex.
///
/// The lock is never held across an `.await`; every method takes and releases
/// it within a single call.
#[derive(Debug)]
pub struct SharedMruCache<K, V> {
    inner: Mutex<MruCache<K, V>>,
}

impl<K: Eq + Hash + Clone, V> SharedMruCache<K, V> {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(MruCache::new(capacity)),
        }
    }

    fn with<R>(&self, f: impl FnOnce(&mut MruCache<K, V>) -> R) -> R {
        let mut guard = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }

    pub fn get<Q>(&self, key: &Q) -> Option<Arc<V>>
    where
        K: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        self.with(|cache| cache.get(key))
    }

    pub fn insert(&self, key: K, value: V) -> (Arc<V>, bool) {
        self.with(|cache| cache.insert(key, value))
    }

    pub fn insert_arc(&self, key: K, value: Arc<V>) -> (Arc<V>, bool) {
        self.with(|cache| cache.insert_arc(key, value))
    }

    pub fn get_or_insert_with<F>(&self, key: K, make: F) -> Arc<V>
    where
        F: FnOnce() -> V,
    {
        self.with(|cache| cache.get_or_insert_with(key, make))
    }

    pub fn remove<Q>(&self, key: &Q) -> Option<Arc<V>>
    where
        K: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        self.with(|cache| cache.remove(key))
    }

    pub fn clear(&self) {
        self.with(|cache| cache.clear())
    }

    pub fn len(&self) -> usize {
        self.with(|cache| cache.len())
    }

    pub fn is_empty(&self) -> bool {
        self.with(|cache| cache.is_empty())
    }

    pub fn values(&self) -> Vec<Arc<V>> {
        self.with(|cache| cache.values())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_least_recently_used_is_evicted() {
        let mut cache = MruCache::new(2);
        cache.insert("a", 1);
        cache.insert("b", 2);
        // Touch "a" so "b" becomes the oldest.
        assert_eq!(cache.get("a").as_deref(), Some(&1));
        cache.insert("c", 3);

        assert_eq!(cache.len(), 2);
        assert!(cache.get("b").is_none());
        assert_eq!(cache.get("a").as_deref(), Some(&1));
        assert_eq!(cache.get("c").as_deref(), Some(&3));
    }

    #[test]
    fn test_first_insert_wins() {
        let mut cache = MruCache::new(4);
        let (first, inserted) = cache.insert("k", String::from("first"));
        assert!(inserted);
        let (winner, inserted) = cache.insert("k", String::from("second"));
        assert!(!inserted);
        assert!(Arc::ptr_eq(&first, &winner));
        assert_eq!(*winner, "first");
    }

    #[test]
    fn test_evicted_value_outlives_cache() {
        let mut cache = MruCache::new(1);
        let held = cache.get_or_insert_with("a", || vec![1, 2, 3]);
        cache.insert("b", vec![4]);
        assert!(cache.get("a").is_none());
        assert_eq!(*held, vec![1, 2, 3]);
    }

    #[test]
    fn test_shared_get_or_insert_runs_once() {
        let cache = SharedMruCache::new(8);
        let mut calls = 0;
        let a = cache.get_or_insert_with("x", || {
            calls += 1;
            7
        });
        let b = cache.get_or_insert_with("x", || {
            calls += 1;
            8
        });
        assert_eq!(calls, 1);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.remove("x").as_deref(), Some(&7));
        assert!(cache.is_empty());
    }
}
