//! Read-mostly cache with per-key expiry.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

/// Entry count at which an insert first sweeps out expired entries.
const MIN_SWEEP_LEN: usize = 64;

struct Entry<V> {
    value: V,
    expires_at: Instant,
}

struct Inner<K, V> {
    map: HashMap<K, Entry<V>>,
    /// Bumped by every invalidation
    generation: u64,
    /// Map length that triggers the next sweep
    sweep_at: usize,
}

/// A cache whose entries each expire `ttl` after insertion.
///
/// Reads take the shared lock; only inserts and invalidations take the
/// exclusive lock. Expired entries are swept out by inserts once the map has
/// doubled since the last sweep, so the map stays within twice the live set.
pub struct TtlCache<K, V> {
    inner: RwLock<Inner<K, V>>,
    ttl: Duration,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash,
    V: Clone,
{
    pub fn new(ttl: Duration) -> Self {
        Self {
            inner: RwLock::new(Inner {
                map: HashMap::new(),
                generation: 0,
                sweep_at: MIN_SWEEP_LEN,
            }),
            ttl,
        }
    }

    /// Get a live entry.
    pub fn get(&self, key: &K) -> Option<V> {
        let inner = self.inner.read();
        inner
            .map
            .get(key)
            .filter(|entry| entry.expires_at > Instant::now())
            .map(|entry| entry.value.clone())
    }

    /// The current invalidation generation.
    ///
    /// Take it before loading a value from its source and hand it to
    /// `insert_if_current`, so a load that raced an invalidation is dropped.
    pub fn generation(&self) -> u64 {
        self.inner.read().generation
    }

    pub fn insert(&self, key: K, value: V) {
        let mut inner = self.inner.write();
        self.put(&mut inner, key, value);
    }

    /// Insert unless an invalidation happened since `generation` was taken.
    /// Returns whether the value was stored.
    pub fn insert_if_current(&self, key: K, value: V, generation: u64) -> bool {
        let mut inner = self.inner.write();
        if inner.generation != generation {
            return false;
        }
        self.put(&mut inner, key, value);
        true
    }

    fn put(&self, inner: &mut Inner<K, V>, key: K, value: V) {
        let now = Instant::now();
        if inner.map.len() >= inner.sweep_at {
            inner.map.retain(|_, entry| entry.expires_at > now);
            inner.sweep_at = (inner.map.len() * 2).max(MIN_SWEEP_LEN);
        }
        let expires_at = now + self.ttl;
        inner.map.insert(key, Entry { value, expires_at });
    }

    pub fn invalidate(&self, key: &K) {
        let mut inner = self.inner.write();
        inner.generation += 1;
        inner.map.remove(key);
    }

    pub fn clear(&self) {
        let mut inner = self.inner.write();
        inner.generation += 1;
        inner.map.clear();
    }

    /// Number of stored entries, expired or not.
    pub fn len(&self) -> usize {
        self.inner.read().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
