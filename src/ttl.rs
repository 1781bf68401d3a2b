use std::collections::HashMap;

use parking_lot::RwLock;

// Expiring keys are grouped into coarse buckets so the cleanup pass can drop
// a whole bucket at a time instead of scanning every entry.
pub(crate) const BUCKET_DURATION_SECS: i64 = 5;

type Bucket = HashMap<u64, u64>;

pub(crate) fn storage_bucket(unix: i64) -> i64 {
    unix / BUCKET_DURATION_SECS + 1
}

pub(crate) fn clean_bucket(unix: i64) -> i64 {
    storage_bucket(unix) - 1
}

/// Index from expiration bucket to the `key -> conflict` pairs due in it.
/// An expiration of zero means "never" and is not indexed.
#[derive(Debug, Default)]
pub(crate) struct ExpirationMap {
    buckets: RwLock<HashMap<i64, Bucket>>,
}

impl ExpirationMap {
    pub(crate) fn new() -> Self {
        Default::default()
    }

    pub(crate) fn add(&self, key: u64, conflict: u64, expiration: i64) {
        if expiration == 0 {
            return;
        }
        let mut buckets = self.buckets.write();
        buckets
            .entry(storage_bucket(expiration))
            .or_default()
            .insert(key, conflict);
    }

    pub(crate) fn update(&self, key: u64, conflict: u64, old_expiration: i64, new_expiration: i64) {
        if old_expiration == new_expiration {
            return;
        }
        let mut buckets = self.buckets.write();
        if old_expiration != 0 {
            if let Some(bucket) = buckets.get_mut(&storage_bucket(old_expiration)) {
                bucket.remove(&key);
            }
        }
        if new_expiration != 0 {
            buckets
                .entry(storage_bucket(new_expiration))
                .or_default()
                .insert(key, conflict);
        }
    }

    pub(crate) fn remove(&self, key: u64, expiration: i64) {
        if expiration == 0 {
            return;
        }
        let mut buckets = self.buckets.write();
        if let Some(bucket) = buckets.get_mut(&storage_bucket(expiration)) {
            bucket.remove(&key);
        }
    }

    /// Detaches the bucket that became due before `now`, if any.
    pub(crate) fn take_due(&self, now: i64) -> Option<Bucket> {
        self.buckets.write().remove(&clean_bucket(now))
    }

    pub(crate) fn clear(&self) {
        self.buckets.write().clear();
    }
}

#[cfg(test)]
mod test {
    use super::{clean_bucket, storage_bucket, ExpirationMap, BUCKET_DURATION_SECS};

    #[test]
    fn bucket_arithmetic() {
        assert_eq!(storage_bucket(0), 1);
        assert_eq!(storage_bucket(BUCKET_DURATION_SECS - 1), 1);
        assert_eq!(storage_bucket(BUCKET_DURATION_SECS), 2);
        assert_eq!(clean_bucket(BUCKET_DURATION_SECS), 1);
    }

    #[test]
    fn zero_expiration_is_not_indexed() {
        let em = ExpirationMap::new();
        em.add(1, 0, 0);
        assert!(em.buckets.read().is_empty());
    }

    #[test]
    fn due_bucket_is_detached_once() {
        let em = ExpirationMap::new();
        em.add(1, 11, 3);
        em.add(2, 22, 4);
        // Both expirations land in bucket 1, due once now passes the bucket
        // boundary.
        let due = em.take_due(BUCKET_DURATION_SECS).unwrap();
        assert_eq!(due.len(), 2);
        assert_eq!(due[&1], 11);
        assert!(em.take_due(BUCKET_DURATION_SECS).is_none());
    }

    #[test]
    fn update_moves_between_buckets() {
        let em = ExpirationMap::new();
        em.add(1, 11, 3);
        em.update(1, 11, 3, 3 + BUCKET_DURATION_SECS);
        assert!(em.take_due(BUCKET_DURATION_SECS).map_or(true, |b| b.is_empty()));
        let due = em.take_due(2 * BUCKET_DURATION_SECS).unwrap();
        assert_eq!(due[&1], 11);
    }

    #[test]
    fn remove_unindexes_the_key() {
        let em = ExpirationMap::new();
        em.add(1, 11, 3);
        em.remove(1, 3);
        assert!(em.take_due(BUCKET_DURATION_SECS).map_or(true, |b| b.is_empty()));
    }
}
