use crate::sharded_map::StoreItem;

/// Storage seam between the cache façade and the concrete sharded map.
pub(crate) trait Store<V>: Send + Sync
where
    V: Clone,
{
    /// Conflict-guarded read with lazy expiry: an entry past its expiration
    /// reads as absent but stays in the map until removed.
    fn get(&self, key: u64, conflict: u64, now: i64) -> Option<V>;

    /// Inserts or overwrites. An overwrite with a non-zero conflict hash
    /// that does not match the stored one is dropped.
    fn set(&self, key: u64, item: StoreItem<V>);

    /// Replaces the value only when the key is already present (and the
    /// conflict hash matches); returns the previous value.
    fn update(&self, key: u64, item: &StoreItem<V>) -> Option<V>;

    fn expiration(&self, key: u64) -> i64;

    fn remove(&self, key: u64, conflict: u64) -> Option<(u64, V)>;

    fn len(&self) -> usize;

    /// Drops every entry. When a callback is given, it observes each entry
    /// before the map is emptied.
    fn clear(&self, callback: Option<&mut dyn FnMut(u64, &StoreItem<V>)>);

    /// Removes entries from the expiration bucket that became due before
    /// `now` and returns them.
    fn cleanup(&self, now: i64) -> Vec<(u64, StoreItem<V>)>;

    /// Visits entries shard by shard. Not snapshot-consistent: entries may
    /// move underneath concurrent writers between shards.
    fn iterate(&self, f: &mut dyn FnMut(u64, &StoreItem<V>));
}
