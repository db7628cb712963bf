//! Sharded concurrent map keyed by sensor id.
//!
//! Sensors are spread over a power-of-two number of `RwLock<HashMap>` shards
//! by their low id bits, so unrelated sensors rarely touch the same lock.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::types::SensorId;

/// Default shard count.
pub const DEFAULT_SHARDS: usize = 16;

pub struct ShardedMap<V> {
    shards: Box<[RwLock<HashMap<SensorId, V>>]>,
    mask: u64,
}

impl<V> ShardedMap<V> {
    /// Creates a map with `shards` shards, rounded up to a power of two.
    #[must_use]
    pub fn new(shards: usize) -> Self {
        let n = shards.max(1).next_power_of_two();
        Self {
            shards: (0..n).map(|_| RwLock::new(HashMap::new())).collect(),
            mask: (n - 1) as u64,
        }
    }

    #[inline]
    fn shard(&self, id: SensorId) -> &RwLock<HashMap<SensorId, V>> {
        &self.shards[id.shard(self.mask)]
    }

    /// Inserts or replaces, returning the previous value.
    pub fn insert(&self, id: SensorId, value: V) -> Option<V> {
        self.shard(id).write().insert(id, value)
    }

    pub fn remove(&self, id: SensorId) -> Option<V> {
        self.shard(id).write().remove(&id)
    }

    #[must_use]
    pub fn contains(&self, id: SensorId) -> bool {
        self.shard(id).read().contains_key(&id)
    }

    /// Runs `f` on the value under the shard's read lock.
    pub fn with<R>(&self, id: SensorId, f: impl FnOnce(&V) -> R) -> Option<R> {
        self.shard(id).read().get(&id).map(f)
    }

    /// Keeps only entries for which `keep` returns true, shard by shard.
    ///
    /// Returns the ids that were removed.
    pub fn retain(&self, mut keep: impl FnMut(SensorId, &V) -> bool) -> Vec<SensorId> {
        let mut removed = Vec::new();
        for shard in &*self.shards {
            shard.write().retain(|&id, v| {
                let k = keep(id, v);
                if !k {
                    removed.push(id);
                }
                k
            });
        }
        removed
    }

    #[must_use]
    pub fn keys(&self) -> Vec<SensorId> {
        let mut out = Vec::new();
        for shard in &*self.shards {
            out.extend(shard.read().keys().copied());
        }
        out
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.read().len()).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<V: Clone> ShardedMap<V> {
    #[must_use]
    pub fn get(&self, id: SensorId) -> Option<V> {
        self.shard(id).read().get(&id).cloned()
    }

    /// Returns the existing value or inserts the one built by `make`.
    ///
    /// The flag is true when the value was created by this call.
    pub fn get_or_insert_with(&self, id: SensorId, make: impl FnOnce() -> V) -> (V, bool) {
        let shard = self.shard(id);
        if let Some(v) = shard.read().get(&id) {
            return (v.clone(), false);
        }
        let mut map = shard.write();
        // Another writer may have won between the two locks.
        if let Some(v) = map.get(&id) {
            return (v.clone(), false);
        }
        let v = make();
        map.insert(id, v.clone());
        (v, true)
    }
}

impl<V> Default for ShardedMap<V> {
    fn default() -> Self {
        Self::new(DEFAULT_SHARDS)
    }
}
