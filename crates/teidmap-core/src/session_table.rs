//! Bounded tables for transient correlation state.
//!
//! Both assemblers keep per-key state between messages: control-plane
//! sessions by call identifier, tunnel bindings by sequence number and by
//! subscriber IP. A [`SessionTable`] owns that state under an injected
//! [`ExpiryPolicy`]: entries idle longer than `ttl` are dropped by
//! [`SessionTable::sweep`], and inserting into a full table evicts the
//! least recently touched entry.
//!
//! Time is passed in explicitly so tests can drive the clock.

use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Idle expiry and capacity bound for a [`SessionTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpiryPolicy {
    /// Idle time after which an entry is swept. Zero disables time expiry.
    pub ttl: Duration,
    /// Maximum number of live entries. Zero disables the cap.
    pub max_entries: usize,
}

impl ExpiryPolicy {
    /// Never expire, never evict.
    #[must_use]
    pub const fn unbounded() -> Self {
        Self {
            ttl: Duration::ZERO,
            max_entries: 0,
        }
    }
}

impl Default for ExpiryPolicy {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(600),
            max_entries: 65_536,
        }
    }
}

/// Outcome of a sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub expired: usize,
    pub remaining: usize,
}

#[derive(Debug)]
struct Slot<V> {
    value: V,
    touched_at: Instant,
    tick: u64,
}

/// Map with idle expiry and LRU capacity eviction.
#[derive(Debug)]
pub struct SessionTable<K, V> {
    entries: HashMap<K, Slot<V>>,
    /// Touch order: tick -> key. Lowest tick is least recently touched.
    order: BTreeMap<u64, K>,
    next_tick: u64,
    policy: ExpiryPolicy,
    evicted_total: u64,
}

impl<K, V> SessionTable<K, V>
where
    K: Hash + Eq + Clone,
{
    #[must_use]
    pub fn new(policy: ExpiryPolicy) -> Self {
        Self {
            entries: HashMap::new(),
            order: BTreeMap::new(),
            next_tick: 0,
            policy,
            evicted_total: 0,
        }
    }

    #[must_use]
    pub fn policy(&self) -> ExpiryPolicy {
        self.policy
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries dropped to honour `max_entries` since creation.
    pub fn evicted_total(&self) -> u64 {
        self.evicted_total
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    /// Read without refreshing the entry's idle timer.
    pub fn peek(&self, key: &K) -> Option<&V> {
        self.entries.get(key).map(|slot| &slot.value)
    }

    /// Read and refresh the entry's idle timer.
    pub fn get(&mut self, key: &K, now: Instant) -> Option<&V> {
        self.touch(key, now);
        self.entries.get(key).map(|slot| &slot.value)
    }

    /// Mutable access, refreshing the idle timer.
    pub fn get_mut(&mut self, key: &K, now: Instant) -> Option<&mut V> {
        self.touch(key, now);
        self.entries.get_mut(key).map(|slot| &mut slot.value)
    }

    /// Insert or replace. Returns the key evicted to make room, if any.
    pub fn insert(&mut self, key: K, value: V, now: Instant) -> Option<K> {
        if let Some(slot) = self.entries.get_mut(&key) {
            slot.value = value;
            self.touch(&key, now);
            return None;
        }
        let evicted = self.make_room();
        self.insert_new(key, value, now);
        evicted
    }

    /// Mutable access to the entry for `key`, creating it with `init` if absent.
    pub fn get_or_insert_with<F>(&mut self, key: K, now: Instant, init: F) -> &mut V
    where
        F: FnOnce() -> V,
    {
        if self.entries.contains_key(&key) {
            self.touch(&key, now);
        } else {
            self.make_room();
            self.insert_new(key.clone(), init(), now);
        }
        // Present: either found above or just inserted.
        &mut self
            .entries
            .get_mut(&key)
            .unwrap_or_else(|| unreachable!("entry present after insert"))
            .value
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        let slot = self.entries.remove(key)?;
        self.order.remove(&slot.tick);
        Some(slot.value)
    }

    /// Drop every entry idle for longer than the policy's `ttl`.
    pub fn sweep(&mut self, now: Instant) -> SweepReport {
        let ttl = self.policy.ttl;
        if ttl.is_zero() {
            return SweepReport {
                expired: 0,
                remaining: self.entries.len(),
            };
        }
        let stale: Vec<K> = self
            .order
            .values()
            .filter(|key| {
                self.entries
                    .get(*key)
                    .is_some_and(|slot| now.saturating_duration_since(slot.touched_at) > ttl)
            })
            .cloned()
            .collect();
        for key in &stale {
            self.remove(key);
        }
        SweepReport {
            expired: stale.len(),
            remaining: self.entries.len(),
        }
    }

    fn touch(&mut self, key: &K, now: Instant) {
        let tick = self.next_tick;
        if let Some(slot) = self.entries.get_mut(key) {
            self.order.remove(&slot.tick);
            slot.tick = tick;
            slot.touched_at = now;
            self.order.insert(tick, key.clone());
            self.next_tick += 1;
        }
    }

    fn insert_new(&mut self, key: K, value: V, now: Instant) {
        let tick = self.next_tick;
        self.next_tick += 1;
        self.order.insert(tick, key.clone());
        self.entries.insert(
            key,
            Slot {
                value,
                touched_at: now,
                tick,
            },
        );
    }

    fn make_room(&mut self) -> Option<K> {
        let cap = self.policy.max_entries;
        if cap == 0 || self.entries.len() < cap {
            return None;
        }
        let (_, oldest) = self.order.pop_first()?;
        self.entries.remove(&oldest);
        self.evicted_total += 1;
        Some(oldest)
    }
}
