use std::collections::HashMap;
use std::sync::Arc;

use crossbeam::utils::CachePadded;
use parking_lot::RwLock;

use crate::store::Store;
use crate::ttl::ExpirationMap;

const DEFAULT_NUM_SHARDS: usize = 256;

/// One stored entry. `expiration` is a unix timestamp in seconds; zero means
/// the entry never expires.
#[derive(Debug, Clone)]
pub(crate) struct StoreItem<V> {
    pub(crate) conflict: u64,
    pub(crate) value: V,
    pub(crate) expiration: i64,
}

impl<V> StoreItem<V> {
    fn expired(&self, now: i64) -> bool {
        self.expiration > 0 && now >= self.expiration
    }
}

/// Hash-sharded key/value store.
///
/// Keys arrive pre-hashed, so shard selection is a plain mask. Every shard
/// owns an independent read/write lock and is padded to its own cache line.
pub(crate) struct ShardedMap<V: Clone> {
    shards: Box<[CachePadded<LockedMap<V>>]>,
    mask: u64,
    em: Arc<ExpirationMap>,
}

impl<V> ShardedMap<V>
where
    V: Clone,
{
    pub(crate) fn new() -> Self {
        Self::with_shards(DEFAULT_NUM_SHARDS)
    }

    pub(crate) fn with_shards(num_shards: usize) -> Self {
        let num_shards = num_shards.max(1).next_power_of_two();
        let em = Arc::new(ExpirationMap::new());
        let shards = (0..num_shards)
            .map(|_| CachePadded::new(LockedMap::new(em.clone())))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            shards,
            mask: num_shards as u64 - 1,
            em,
        }
    }

    #[inline]
    fn shard(&self, key: u64) -> &LockedMap<V> {
        &self.shards[(key & self.mask) as usize]
    }
}

impl<V> Store<V> for ShardedMap<V>
where
    V: Clone + Send + Sync,
{
    fn get(&self, key: u64, conflict: u64, now: i64) -> Option<V> {
        self.shard(key).get(key, conflict, now)
    }

    fn set(&self, key: u64, item: StoreItem<V>) {
        self.shard(key).set(key, item)
    }

    fn update(&self, key: u64, item: &StoreItem<V>) -> Option<V> {
        self.shard(key).update(key, item)
    }

    fn expiration(&self, key: u64) -> i64 {
        self.shard(key).expiration(key)
    }

    fn remove(&self, key: u64, conflict: u64) -> Option<(u64, V)> {
        self.shard(key).remove(key, conflict)
    }

    fn len(&self) -> usize {
        self.shards.iter().map(|shard| shard.len()).sum()
    }

    fn clear(&self, callback: Option<&mut dyn FnMut(u64, &StoreItem<V>)>) {
        if let Some(callback) = callback {
            self.iterate(callback);
        }
        for shard in self.shards.iter() {
            shard.clear();
        }
        self.em.clear();
    }

    fn cleanup(&self, now: i64) -> Vec<(u64, StoreItem<V>)> {
        let due = match self.em.take_due(now) {
            Some(bucket) => bucket,
            None => return Vec::new(),
        };
        let mut expired = Vec::with_capacity(due.len());
        for (key, conflict) in due {
            if let Some(item) = self.shard(key).remove_expired(key, conflict, now) {
                expired.push((key, item));
            }
        }
        expired
    }

    fn iterate(&self, f: &mut dyn FnMut(u64, &StoreItem<V>)) {
        for shard in self.shards.iter() {
            let data = shard.data.read();
            for (key, item) in data.iter() {
                f(*key, item);
            }
        }
    }
}

struct LockedMap<V> {
    data: RwLock<HashMap<u64, StoreItem<V>>>,
    em: Arc<ExpirationMap>,
}

impl<V> LockedMap<V>
where
    V: Clone,
{
    fn new(em: Arc<ExpirationMap>) -> Self {
        Self {
            data: RwLock::new(HashMap::new()),
            em,
        }
    }

    fn get(&self, key: u64, conflict: u64, now: i64) -> Option<V> {
        let data = self.data.read();
        let item = data.get(&key)?;
        if conflict != 0 && conflict != item.conflict {
            return None;
        }
        if item.expired(now) {
            return None;
        }
        Some(item.value.clone())
    }

    fn set(&self, key: u64, item: StoreItem<V>) {
        let mut data = self.data.write();
        match data.get(&key) {
            Some(existing) => {
                if item.conflict != 0 && item.conflict != existing.conflict {
                    return;
                }
                self.em
                    .update(key, item.conflict, existing.expiration, item.expiration);
            }
            None => self.em.add(key, item.conflict, item.expiration),
        }
        data.insert(key, item);
    }

    fn update(&self, key: u64, item: &StoreItem<V>) -> Option<V> {
        let mut data = self.data.write();
        let existing = data.get(&key)?;
        if item.conflict != 0 && item.conflict != existing.conflict {
            return None;
        }
        self.em
            .update(key, item.conflict, existing.expiration, item.expiration);
        data.insert(key, item.clone()).map(|prev| prev.value)
    }

    fn expiration(&self, key: u64) -> i64 {
        self.data
            .read()
            .get(&key)
            .map(|item| item.expiration)
            .unwrap_or(0)
    }

    fn remove(&self, key: u64, conflict: u64) -> Option<(u64, V)> {
        let mut data = self.data.write();
        let item = data.get(&key)?;
        if conflict != 0 && conflict != item.conflict {
            return None;
        }
        self.em.remove(key, item.expiration);
        data.remove(&key).map(|item| (item.conflict, item.value))
    }

    /// Removal restricted to entries that are actually expired: a key whose
    /// expiration moved forward since it was bucketed stays put.
    fn remove_expired(&self, key: u64, conflict: u64, now: i64) -> Option<StoreItem<V>> {
        let mut data = self.data.write();
        let item = data.get(&key)?;
        if item.conflict != conflict || !item.expired(now) {
            return None;
        }
        data.remove(&key)
    }

    fn len(&self) -> usize {
        self.data.read().len()
    }

    fn clear(&self) {
        self.data.write().clear();
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::{ShardedMap, StoreItem};
    use crate::store::Store;

    fn item(conflict: u64, value: &str, expiration: i64) -> StoreItem<String> {
        StoreItem {
            conflict,
            value: value.to_string(),
            expiration,
        }
    }

    #[test]
    fn set_then_get() {
        let map = ShardedMap::new();
        map.set(1, item(9, "a", 0));
        assert_eq!(map.get(1, 9, 0), Some("a".to_string()));
        assert_eq!(map.get(2, 0, 0), None);
    }

    #[test]
    fn conflict_guard_blocks_mismatched_reads() {
        let map = ShardedMap::new();
        map.set(1, item(9, "a", 0));
        assert_eq!(map.get(1, 8, 0), None);
        // Zero skips the guard, as integer keys carry no conflict hash.
        assert_eq!(map.get(1, 0, 0), Some("a".to_string()));
    }

    #[test]
    fn conflict_guard_blocks_mismatched_overwrites() {
        let map = ShardedMap::new();
        map.set(1, item(9, "a", 0));
        map.set(1, item(8, "b", 0));
        assert_eq!(map.get(1, 9, 0), Some("a".to_string()));
    }

    #[test]
    fn expired_entries_read_as_absent_but_stay_stored() {
        let map = ShardedMap::new();
        map.set(1, item(0, "a", 100));
        assert_eq!(map.get(1, 0, 99), Some("a".to_string()));
        assert_eq!(map.get(1, 0, 100), None);
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn update_requires_presence() {
        let map = ShardedMap::new();
        assert_eq!(map.update(1, &item(0, "a", 0)), None);
        assert_eq!(map.len(), 0);

        map.set(1, item(0, "a", 0));
        assert_eq!(map.update(1, &item(0, "b", 0)), Some("a".to_string()));
        assert_eq!(map.get(1, 0, 0), Some("b".to_string()));
    }

    #[test]
    fn remove_returns_conflict_and_value() {
        let map = ShardedMap::new();
        map.set(1, item(9, "a", 0));
        assert_eq!(map.remove(1, 8), None);
        assert_eq!(map.remove(1, 9), Some((9, "a".to_string())));
        assert_eq!(map.get(1, 0, 0), None);
    }

    #[test]
    fn len_counts_across_shards() {
        let map = ShardedMap::new();
        for key in 0..1000u64 {
            map.set(key, item(0, "x", 0));
        }
        assert_eq!(map.len(), 1000);
    }

    #[test]
    fn clear_empties_every_shard() {
        let map = ShardedMap::new();
        for key in 0..100u64 {
            map.set(key, item(0, "x", 0));
        }
        let mut seen = 0;
        map.clear(Some(&mut |_, _| seen += 1));
        assert_eq!(seen, 100);
        assert_eq!(map.len(), 0);
    }

    #[test]
    fn iterate_visits_every_entry() {
        let map = ShardedMap::new();
        for key in 0..100u64 {
            map.set(key, item(0, "x", 0));
        }
        let mut keys = Vec::new();
        map.iterate(&mut |key, _| keys.push(key));
        keys.sort_unstable();
        assert_eq!(keys, (0..100).collect::<Vec<u64>>());
    }

    #[test]
    fn cleanup_sweeps_due_entries() {
        let map = ShardedMap::new();
        map.set(1, item(11, "dying", 3));
        map.set(2, item(22, "alive", 1000));
        map.set(3, item(33, "immortal", 0));

        let expired = map.cleanup(5);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].0, 1);
        assert_eq!(expired[0].1.value, "dying");
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn cleanup_skips_entries_whose_ttl_moved_forward() {
        let map = ShardedMap::new();
        map.set(1, item(11, "a", 3));
        // The overwrite re-buckets the key well past the sweep horizon.
        map.set(1, item(11, "a", 1000));
        assert!(map.cleanup(5).is_empty());
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn shard_count_rounds_to_power_of_two() {
        let map: ShardedMap<u32> = ShardedMap::with_shards(100);
        assert_eq!(map.shards.len(), 128);
    }
}
