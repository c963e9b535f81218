//! Sharded concurrent hash map backing the in-process record store.
//!
//! Each key family of the store (TEID records, subscriber records, reverse
//! pointers, slice sets) lives in its own [`ShardedMap`]. A shard is a
//! `RwLock<HashMap<K, V>>`; the key hash picks the shard, so writers on
//! different keys never contend and every per-key merge runs under exactly
//! one write lock. That is what makes a field-level merge atomic for its key
//! without any global lock.
//!
//! Lock poisoning is ignored: a panicking writer leaves a record that is at
//! worst partially merged, which the next merge for that key repairs.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::hash::{Hash, Hasher};
use std::sync::RwLock;

/// Default number of shards. Power of 2 for fast modulo.
pub const DEFAULT_SHARDS: usize = 64;

#[inline]
fn hash_key<K: Hash>(key: &K, shard_count: usize) -> usize {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() as usize) % shard_count
}

/// A single shard, padded to avoid false sharing with its neighbours.
#[repr(align(128))]
struct Shard<K, V> {
    map: RwLock<HashMap<K, V>>,
}

impl<K, V> Shard<K, V> {
    fn new() -> Self {
        Self {
            map: RwLock::new(HashMap::new()),
        }
    }
}

/// Concurrent map with per-shard locking.
pub struct ShardedMap<K, V> {
    shards: Box<[Shard<K, V>]>,
    shard_count: usize,
}

impl<K, V> std::fmt::Debug for ShardedMap<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardedMap")
            .field("shard_count", &self.shard_count)
            .finish_non_exhaustive()
    }
}

impl<K, V> ShardedMap<K, V>
where
    K: Hash + Eq + Clone,
{
    /// Create a map with [`DEFAULT_SHARDS`] shards.
    #[must_use]
    pub fn new() -> Self {
        Self::with_shards(DEFAULT_SHARDS)
    }

    /// Create with a specific shard count, clamped to `[1, 256]`.
    #[must_use]
    pub fn with_shards(n: usize) -> Self {
        let n = n.clamp(1, 256);
        let shards: Vec<Shard<K, V>> = (0..n).map(|_| Shard::new()).collect();
        Self {
            shards: shards.into_boxed_slice(),
            shard_count: n,
        }
    }

    #[must_use]
    pub fn shard_count(&self) -> usize {
        self.shard_count
    }

    #[inline]
    fn shard(&self, key: &K) -> &Shard<K, V> {
        &self.shards[hash_key(key, self.shard_count)]
    }

    /// Insert or replace. Returns the previous value.
    pub fn insert(&self, key: K, value: V) -> Option<V> {
        let mut guard = self
            .shard(&key)
            .map
            .write()
            .unwrap_or_else(|e| e.into_inner());
        guard.insert(key, value)
    }

    /// Clone of the value for `key`.
    pub fn get(&self, key: &K) -> Option<V>
    where
        V: Clone,
    {
        let guard = self.shard(key).map.read().unwrap_or_else(|e| e.into_inner());
        guard.get(key).cloned()
    }

    pub fn contains_key(&self, key: &K) -> bool {
        let guard = self.shard(key).map.read().unwrap_or_else(|e| e.into_inner());
        guard.contains_key(key)
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        let mut guard = self
            .shard(key)
            .map
            .write()
            .unwrap_or_else(|e| e.into_inner());
        guard.remove(key)
    }

    /// Read a value under the shard's read lock without cloning it.
    pub fn read_with<F, R>(&self, key: &K, f: F) -> Option<R>
    where
        F: FnOnce(&V) -> R,
    {
        let guard = self.shard(key).map.read().unwrap_or_else(|e| e.into_inner());
        guard.get(key).map(f)
    }

    /// Mutate the value for `key` under one write lock, creating it with
    /// `init` first when absent. This is the store's atomic merge.
    pub fn upsert_with<I, F, R>(&self, key: K, init: I, f: F) -> R
    where
        I: FnOnce() -> V,
        F: FnOnce(&mut V) -> R,
    {
        let mut guard = self
            .shard(&key)
            .map
            .write()
            .unwrap_or_else(|e| e.into_inner());
        match guard.entry(key) {
            Entry::Occupied(mut slot) => f(slot.get_mut()),
            Entry::Vacant(slot) => f(slot.insert(init())),
        }
    }

    /// Total entries across all shards.
    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|s| s.map.read().unwrap_or_else(|e| e.into_inner()).len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.shards
            .iter()
            .all(|s| s.map.read().unwrap_or_else(|e| e.into_inner()).is_empty())
    }

    /// Snapshot of all key-value pairs, shard by shard.
    pub fn entries(&self) -> Vec<(K, V)>
    where
        V: Clone,
    {
        let mut result = Vec::new();
        for shard in &self.shards {
            let guard = shard.map.read().unwrap_or_else(|e| e.into_inner());
            result.extend(guard.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        result
    }

    /// Keep only entries satisfying `keep`; returns the keys that were dropped.
    pub fn retain<F>(&self, mut keep: F) -> Vec<K>
    where
        F: FnMut(&K, &mut V) -> bool,
    {
        let mut dropped = Vec::new();
        for shard in &self.shards {
            let mut guard = shard.map.write().unwrap_or_else(|e| e.into_inner());
            guard.retain(|k, v| {
                let kept = keep(k, v);
                if !kept {
                    dropped.push(k.clone());
                }
                kept
            });
        }
        dropped
    }

    pub fn clear(&self) {
        for shard in &self.shards {
            shard.map.write().unwrap_or_else(|e| e.into_inner()).clear();
        }
    }
}

impl<K: Hash + Eq + Clone, V> Default for ShardedMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn insert_get_remove() {
        let map: ShardedMap<String, i32> = ShardedMap::with_shards(8);
        assert!(map.is_empty());
        assert_eq!(map.insert("teid:00000001".into(), 1), None);
        assert_eq!(map.insert("teid:00000001".into(), 2), Some(1));
        assert_eq!(map.get(&"teid:00000001".to_string()), Some(2));
        assert!(map.contains_key(&"teid:00000001".to_string()));
        assert_eq!(map.remove(&"teid:00000001".to_string()), Some(2));
        assert!(map.is_empty());
    }

    #[test]
    fn shard_count_is_clamped() {
        assert_eq!(ShardedMap::<u32, u32>::with_shards(0).shard_count(), 1);
        assert_eq!(ShardedMap::<u32, u32>::with_shards(1_000).shard_count(), 256);
    }

    #[test]
    fn upsert_creates_then_merges() {
        let map: ShardedMap<u32, Vec<&str>> = ShardedMap::with_shards(4);
        map.upsert_with(1, Vec::new, |v| v.push("ue_ip"));
        map.upsert_with(1, Vec::new, |v| v.push("imsi"));
        assert_eq!(map.get(&1), Some(vec!["ue_ip", "imsi"]));
        assert_eq!(map.read_with(&1, Vec::len), Some(2));
    }

    #[test]
    fn retain_reports_dropped_keys() {
        let map: ShardedMap<u32, u32> = ShardedMap::with_shards(4);
        for i in 0..10 {
            map.insert(i, i);
        }
        let mut dropped = map.retain(|_, v| *v % 2 == 0);
        dropped.sort_unstable();
        assert_eq!(dropped, vec![1, 3, 5, 7, 9]);
        assert_eq!(map.len(), 5);
        map.clear();
        assert!(map.is_empty());
    }

    #[test]
    fn concurrent_upserts_on_one_key_are_not_lost() {
        let map = Arc::new(ShardedMap::<u32, u64>::with_shards(16));
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let map = Arc::clone(&map);
                std::thread::spawn(move || {
                    for _ in 0..1_000 {
                        map.upsert_with(7, || 0, |v| *v += 1);
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(map.get(&7), Some(8_000));
    }
}
