use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;

/// A bounded free-list of reusable objects, rented and returned by value.
///
/// Pooled objects routinely travel through the write buffer to another
/// thread before coming back, so there is no RAII guard tied to the pool's
/// lifetime: `take` hands out a plain value and `put` returns one. Recycled
/// objects keep whatever state they were returned with; callers reset the
/// fields they care about.
pub struct Pool<T> {
    objects: Mutex<Vec<T>>,
    cap: usize,
}

impl<T> Pool<T> {
    pub fn new<F>(cap: usize, init: F) -> Pool<T>
    where
        F: Fn() -> T,
    {
        let mut objects = Vec::with_capacity(cap);
        for _ in 0..cap {
            objects.push(init());
        }
        Pool {
            objects: Mutex::new(objects),
            cap,
        }
    }

    pub fn len(&self) -> usize {
        self.objects.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.lock().is_empty()
    }

    /// Rents an object, building a fresh one when the free-list is empty.
    pub fn take<F: FnOnce() -> T>(&self, fallback: F) -> T {
        let recycled = self.objects.lock().pop();
        recycled.unwrap_or_else(fallback)
    }

    /// Returns an object to the free-list. Objects beyond the pool's
    /// capacity are dropped instead of retained.
    pub fn put(&self, t: T) {
        let mut objects = self.objects.lock();
        if objects.len() < self.cap {
            objects.push(t);
        }
    }
}

// Smallest size class is 64 bytes; classes double up to 32 MiB.
const MIN_CLASS_BITS: usize = 6;
const NUM_CLASSES: usize = 20;
const PER_CLASS_RETAINED: usize = 64;

// Demand counters are snapshotted and re-estimated once this many requests
// have been observed.
const CALIBRATE_EVERY: u64 = 42 * 1024;

const DEFAULT_SIZE_FLOOR: usize = 1 << MIN_CLASS_BITS;
const MAX_SIZE_CEILING: usize = 1 << (MIN_CLASS_BITS + NUM_CLASSES - 1);

/// A thread-safe byte-buffer pool with free-lists per power-of-two size
/// class.
///
/// Every request is recorded into per-class demand counters; the pool
/// periodically re-derives `default_size` (the running median of requested
/// sizes) and `max_size` (the 95th percentile). Buffers returned through
/// [`ByteBufferPool::put`] that exceed `max_size` are dropped so a few huge
/// outliers cannot pin memory for the lifetime of the pool.
#[derive(Debug)]
pub struct ByteBufferPool {
    classes: Box<[Mutex<Vec<Vec<u8>>>]>,
    demand: Box<[AtomicU64]>,
    observed: AtomicU64,
    calibrating: AtomicBool,
    default_size: AtomicUsize,
    max_size: AtomicUsize,
}

impl ByteBufferPool {
    pub fn new() -> Self {
        let classes = (0..NUM_CLASSES)
            .map(|_| Mutex::new(Vec::new()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let demand = (0..NUM_CLASSES)
            .map(|_| AtomicU64::new(0))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            classes,
            demand,
            observed: AtomicU64::new(0),
            calibrating: AtomicBool::new(false),
            default_size: AtomicUsize::new(DEFAULT_SIZE_FLOOR),
            max_size: AtomicUsize::new(MAX_SIZE_CEILING),
        }
    }

    fn class_of(size: usize) -> usize {
        let size = size.max(1).next_power_of_two();
        (size.trailing_zeros() as usize)
            .saturating_sub(MIN_CLASS_BITS)
            .min(NUM_CLASSES - 1)
    }

    fn class_size(class: usize) -> usize {
        1 << (MIN_CLASS_BITS + class)
    }

    /// Fetches a zeroed buffer of exactly `size` bytes, reusing a pooled
    /// allocation from the matching size class when one is available.
    pub fn get(&self, size: usize) -> Vec<u8> {
        self.record(size);
        let mut buf = self.classes[Self::class_of(size)]
            .lock()
            .pop()
            .unwrap_or_default();
        buf.clear();
        buf.resize(size, 0);
        buf
    }

    /// Fetches a buffer auto-sized to the running median of requested sizes.
    pub fn get_default(&self) -> Vec<u8> {
        self.get(self.default_size())
    }

    /// Returns a buffer to its size class. Buffers larger than the 95th
    /// percentile of observed demand are dropped.
    pub fn put(&self, buf: Vec<u8>) {
        let capacity = buf.capacity();
        if capacity == 0 || capacity > self.max_size() {
            return;
        }
        let mut class = self.classes[Self::class_of(capacity)].lock();
        if class.len() < PER_CLASS_RETAINED {
            class.push(buf);
        }
    }

    /// Running estimate of the median requested size.
    pub fn default_size(&self) -> usize {
        self.default_size.load(Ordering::Relaxed)
    }

    /// Running estimate of the 95th percentile of requested sizes.
    pub fn max_size(&self) -> usize {
        self.max_size.load(Ordering::Relaxed)
    }

    fn record(&self, size: usize) {
        self.demand[Self::class_of(size)].fetch_add(1, Ordering::Relaxed);
        if self.observed.fetch_add(1, Ordering::Relaxed) + 1 >= CALIBRATE_EVERY {
            self.calibrate();
        }
    }

    fn calibrate(&self) {
        if self
            .calibrating
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return;
        }

        let mut counts = [0u64; NUM_CLASSES];
        let mut total = 0u64;
        for (class, counter) in self.demand.iter().enumerate() {
            let count = counter.swap(0, Ordering::Relaxed);
            counts[class] = count;
            total += count;
        }

        if total > 0 {
            let mut cumulative = 0u64;
            let mut median = DEFAULT_SIZE_FLOOR;
            let mut p95 = MAX_SIZE_CEILING;
            let mut median_set = false;
            let mut p95_set = false;
            for (class, count) in counts.iter().enumerate() {
                cumulative += count;
                if !median_set && cumulative * 2 >= total {
                    median = Self::class_size(class);
                    median_set = true;
                }
                if !p95_set && cumulative * 100 >= total * 95 {
                    p95 = Self::class_size(class);
                    p95_set = true;
                }
            }
            self.default_size.store(median, Ordering::Relaxed);
            self.max_size.store(p95, Ordering::Relaxed);
        }

        self.observed.store(0, Ordering::Relaxed);
        self.calibrating.store(false, Ordering::Release);
    }
}

impl Default for ByteBufferPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::{ByteBufferPool, Pool};

    // Mirrors the write-path flow: rent a record, ship it elsewhere by
    // value, hand it back with stale state that the next renter inherits.
    #[test]
    fn rented_objects_round_trip_with_their_state() {
        let pool = Pool::new(2, String::new);
        let mut record = pool.take(String::new);
        assert!(record.is_empty());
        record.push_str("payload");

        let moved_elsewhere = record;
        pool.put(moved_elsewhere);
        assert_eq!(pool.take(String::new), "payload");
    }

    #[test]
    fn take_falls_back_to_the_factory_when_drained() {
        let pool = Pool::new(1, || vec![1u8, 2, 3]);
        assert_eq!(pool.take(Vec::new), vec![1, 2, 3]);
        // Free-list exhausted: the fallback builds a fresh object.
        assert_eq!(pool.take(Vec::new), Vec::<u8>::new());
        assert!(pool.is_empty());
    }

    #[test]
    fn put_beyond_capacity_drops_the_object() {
        let pool = Pool::new(2, || 0u8);
        let first = pool.take(|| 9);
        let second = pool.take(|| 9);
        pool.put(first);
        pool.put(second);
        pool.put(7);
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn byte_pool_recycles_by_class() {
        let pool = ByteBufferPool::new();
        let mut buf = pool.get(100);
        assert_eq!(buf.len(), 100);
        buf[0] = 7;
        pool.put(buf);

        // 100 and 128 land in the same power-of-two class, and the reused
        // buffer comes back zeroed at the requested length.
        let buf = pool.get(128);
        assert_eq!(buf.len(), 128);
        assert!(buf.iter().all(|b| *b == 0));
    }

    #[test]
    fn byte_pool_class_rounding() {
        assert_eq!(ByteBufferPool::class_of(1), 0);
        assert_eq!(ByteBufferPool::class_of(64), 0);
        assert_eq!(ByteBufferPool::class_of(65), 1);
        assert_eq!(ByteBufferPool::class_of(128), 1);
        assert_eq!(ByteBufferPool::class_of(usize::MAX / 2), super::NUM_CLASSES - 1);
    }

    #[test]
    fn calibration_tracks_demand() {
        let pool = ByteBufferPool::new();
        for _ in 0..60 {
            pool.record(256);
        }
        for _ in 0..40 {
            pool.record(4096);
        }
        pool.calibrate();
        assert_eq!(pool.default_size(), 256);
        assert_eq!(pool.max_size(), 4096);

        let buf = pool.get_default();
        assert_eq!(buf.len(), 256);
    }

    #[test]
    fn oversized_buffers_are_not_retained() {
        let pool = ByteBufferPool::new();
        for _ in 0..100 {
            pool.record(64);
        }
        pool.calibrate();
        assert_eq!(pool.max_size(), 64);

        pool.put(vec![0; 1024]);
        assert!(pool.classes[ByteBufferPool::class_of(1024)].lock().is_empty());
    }
}
