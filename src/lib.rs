//! A concurrent, cost-bounded in-process cache with TinyLFU admission and
//! sampled-LFU eviction.
//!
//! Reads are served straight from a sharded map; each read also drops an
//! access notification into a striped buffer that feeds the frequency
//! sketches. Writes are asynchronous: `insert` enqueues onto a bounded
//! lock-free buffer and a single processor thread decides admission, picks
//! victims and applies the result to the map. A freshly inserted key is
//! therefore not guaranteed to be visible to an immediately following `get`;
//! the cache is eventually consistent for writes.

use std::marker::PhantomData;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam::channel::tick;
use crossbeam::utils::Backoff;
use parking_lot::{Mutex, RwLock};

pub mod bloom;
mod cache_key;
mod cm_sketch;
mod error;
mod metrics;
pub mod mpmc;
mod policy;
pub mod pool;
mod ring;
mod sharded_map;
mod store;
mod timer;
mod ttl;

pub use crate::bloom::Bloom;
pub use crate::cache_key::CacheKey;
pub use crate::error::Error;
pub use crate::metrics::{MetricType, Metrics};
pub use crate::timer::{CachedClock, Clock, SystemClock};

use crate::metrics::AdmissionLog;
use crate::mpmc::MpmcQueue;
use crate::policy::LfuPolicy;
use crate::pool::{ByteBufferPool, Pool};
use crate::ring::RingBuffer;
use crate::sharded_map::{ShardedMap, StoreItem};
use crate::store::Store;
use crate::ttl::BUCKET_DURATION_SECS;

pub type Result<T> = std::result::Result<T, Error>;

const DEFAULT_MAX_COST: i64 = 1 << 20;
const DEFAULT_GET_BUFFER_SIZE: usize = 64;
const DEFAULT_SET_BUFFER_SIZE: usize = 32 * 1024;
const DEFAULT_NUM_STRIPES: usize = 32;
const ITEM_POOL_CAPACITY: usize = 64;
const ADMISSION_LOG_KEEP: usize = 100_000;
const IDLE_SLEEP: Duration = Duration::from_micros(100);

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum EntryFlag {
    New,
    Delete,
    Update,
}

/// Set-buffer record. Items are rented from a pool by the write path and
/// handed back by the processor once applied.
struct Item<V> {
    flag: EntryFlag,
    key: u64,
    conflict: u64,
    value: Option<V>,
    cost: i64,
    expiration: i64,
}

impl<V> Item<V> {
    fn empty() -> Self {
        Self {
            flag: EntryFlag::New,
            key: 0,
            conflict: 0,
            value: None,
            cost: 0,
            expiration: 0,
        }
    }
}

/// Snapshot of an entry leaving the cache, handed to [`EventHandler`]
/// callbacks.
#[derive(Debug, Clone)]
pub struct EvictedItem<V> {
    pub key: u64,
    pub conflict: u64,
    pub value: V,
    pub cost: i64,
    pub expiration: i64,
}

/// Derives a cost from a value when the caller passed zero at insert time.
pub trait Cost<V>: Send + Sync {
    fn cost(&self, value: &V) -> i64;
}

/// Observes entries leaving the cache. Both callbacks run on the processor
/// thread; they must not block for long. Calling `insert` from a callback is
/// safe because inserts never block on the processor.
pub trait EventHandler<V>: Send + Sync {
    /// An admitted entry was evicted to make room, or expired.
    fn on_evict(&self, item: EvictedItem<V>);

    /// A candidate lost the admission contest and was never stored.
    fn on_reject(&self, _item: EvictedItem<V>) {}
}

struct ZeroCost;

impl<V> Cost<V> for ZeroCost {
    fn cost(&self, _value: &V) -> i64 {
        0
    }
}

pub struct Config<V> {
    /// Number of frequency counters to track. Should be roughly ten times
    /// the expected number of live entries; `max_cost / 100` when zero.
    pub num_counters: u64,
    /// Total cost budget across all admitted entries. `1 << 20` when
    /// non-positive.
    pub max_cost: i64,
    /// Access notifications buffered per stripe before a flush into the
    /// policy. 64 when zero.
    pub get_buffer_size: usize,
    /// Capacity of the asynchronous write buffer. `32 * 1024` when zero.
    pub set_buffer_size: usize,
    /// Stripe count for the access-notification buffer. 32 when zero.
    pub num_stripes: usize,
    pub enable_metrics: bool,
    /// Time source for TTLs; wall clock when absent.
    pub clock: Option<Arc<dyn Clock>>,
    /// Initial event handler; replaceable later via
    /// [`Cache::set_on_evict`].
    pub handler: Option<Arc<dyn EventHandler<V>>>,
}

impl<V> Default for Config<V> {
    fn default() -> Self {
        Self {
            num_counters: 0,
            max_cost: 0,
            get_buffer_size: 0,
            set_buffer_size: 0,
            num_stripes: 0,
            enable_metrics: true,
            clock: None,
            handler: None,
        }
    }
}

struct InnerCache<V: Clone> {
    store: ShardedMap<V>,
    policy: Arc<LfuPolicy>,
    clock: Arc<dyn Clock>,
    // Swapped at runtime via `Cache::set_on_evict`; the handle is cloned out
    // before each invocation so a callback may itself call the setter.
    handler: RwLock<Option<Arc<dyn EventHandler<V>>>>,
    metrics: Option<Metrics>,
}

impl<V: Clone + Send + Sync> InnerCache<V> {
    fn fire_evict(&self, item: EvictedItem<V>) {
        let handler = self.handler.read().clone();
        if let Some(handler) = handler {
            if catch_unwind(AssertUnwindSafe(|| handler.on_evict(item))).is_err() {
                log::error!("on_evict handler panicked; processor continues");
            }
        }
    }

    fn fire_reject(&self, item: EvictedItem<V>) {
        let handler = self.handler.read().clone();
        if let Some(handler) = handler {
            if catch_unwind(AssertUnwindSafe(|| handler.on_reject(item))).is_err() {
                log::error!("on_reject handler panicked; processor continues");
            }
        }
    }
}

/// Concurrent TinyLFU cache keyed by anything implementing [`CacheKey`].
pub struct Cache<K, V: Clone> {
    inner: Arc<InnerCache<V>>,
    set_buf: Arc<MpmcQueue<Item<V>>>,
    get_buf: RingBuffer,
    item_pool: Arc<Pool<Item<V>>>,
    cost: RwLock<Arc<dyn Cost<V>>>,
    closed: Arc<AtomicBool>,
    processor: Mutex<Option<JoinHandle<()>>>,
    _key: PhantomData<fn(K)>,
}

impl<K, V> Cache<K, V>
where
    K: CacheKey,
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Result<Self> {
        Self::with_config(Config::default(), ZeroCost)
    }

    pub fn with_config(config: Config<V>, cost: impl Cost<V> + 'static) -> Result<Self> {
        let max_cost = if config.max_cost <= 0 {
            DEFAULT_MAX_COST
        } else {
            config.max_cost
        };
        let num_counters = if config.num_counters == 0 {
            (max_cost / 100).max(1) as u64
        } else {
            config.num_counters
        };
        let get_buffer_size = if config.get_buffer_size == 0 {
            DEFAULT_GET_BUFFER_SIZE
        } else {
            config.get_buffer_size
        };
        let set_buffer_size = if config.set_buffer_size == 0 {
            DEFAULT_SET_BUFFER_SIZE
        } else {
            config.set_buffer_size
        };
        let num_stripes = if config.num_stripes == 0 {
            DEFAULT_NUM_STRIPES
        } else {
            config.num_stripes
        };

        let metrics = if config.enable_metrics {
            Some(Metrics::new())
        } else {
            None
        };
        let clock = config
            .clock
            .unwrap_or_else(|| Arc::new(SystemClock) as Arc<dyn Clock>);
        let row_pool = Arc::new(ByteBufferPool::new());
        let policy = Arc::new(LfuPolicy::new(
            num_counters,
            max_cost,
            metrics.clone(),
            row_pool,
        )?);
        let get_buf = RingBuffer::new(policy.clone(), num_stripes, get_buffer_size);
        let set_buf = Arc::new(MpmcQueue::new(set_buffer_size));
        let item_pool = Arc::new(Pool::new(ITEM_POOL_CAPACITY, Item::empty));
        let closed = Arc::new(AtomicBool::new(false));

        let inner = Arc::new(InnerCache {
            store: ShardedMap::new(),
            policy,
            clock,
            handler: RwLock::new(config.handler),
            metrics,
        });

        let processor = process_items(
            closed.clone(),
            set_buf.clone(),
            item_pool.clone(),
            inner.clone(),
        );

        Ok(Self {
            inner,
            set_buf,
            get_buf,
            item_pool,
            cost: RwLock::new(Arc::new(cost)),
            closed,
            processor: Mutex::new(Some(processor)),
            _key: PhantomData,
        })
    }

    /// Looks up a value. Every lookup, hit or miss, counts toward the key's
    /// access frequency.
    pub fn get(&self, key: K) -> Option<V> {
        if self.closed.load(Ordering::Acquire) {
            return None;
        }
        let (key, conflict) = key.key_to_hash();
        self.get_buf.push(key);
        let value = self
            .inner
            .store
            .get(key, conflict, self.inner.clock.now_unix());
        if let Some(metrics) = self.inner.metrics.as_ref() {
            if value.is_some() {
                metrics.add(MetricType::Hit, key, 1);
            } else {
                metrics.add(MetricType::Miss, key, 1);
            }
        }
        value
    }

    /// Inserts without a TTL. See [`Cache::insert_with_ttl`].
    pub fn insert(&self, key: K, value: V, cost: i64) -> bool {
        self.insert_with_ttl(key, value, cost, Duration::ZERO)
    }

    /// Submits a write. Returns `false` when the cache is closed or the
    /// write buffer is full; `true` means the write was accepted, not that
    /// it was (or will be) admitted.
    ///
    /// A zero cost is resolved through the configured cost function, then
    /// floored at 1. TTLs have one-second resolution: a `ttl` under one
    /// second truncates to zero and the entry never expires.
    ///
    /// When the key is already stored, its value is replaced in place
    /// immediately and only the cost book-keeping is reconciled
    /// asynchronously.
    pub fn insert_with_ttl(&self, key: K, value: V, cost: i64, ttl: Duration) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        let (key, conflict) = key.key_to_hash();
        let mut cost = if cost == 0 {
            self.cost.read().cost(&value)
        } else {
            cost
        };
        if cost == 0 {
            cost = 1;
        }
        let expiration = if ttl.as_secs() > 0 {
            self.inner.clock.now_unix() + ttl.as_secs() as i64
        } else {
            0
        };

        let stored = StoreItem {
            conflict,
            value,
            expiration,
        };
        let flag = if self.inner.store.update(key, &stored).is_some() {
            EntryFlag::Update
        } else {
            EntryFlag::New
        };

        let mut item = self.item_pool.take(Item::empty);
        item.flag = flag;
        item.key = key;
        item.conflict = conflict;
        item.value = Some(stored.value);
        item.cost = cost;
        item.expiration = expiration;

        match self.set_buf.enqueue(item) {
            Ok(()) => true,
            Err(item) => {
                let updated = item.flag == EntryFlag::Update;
                self.recycle(item);
                if updated {
                    // The value is already in place; only the cost refresh
                    // was lost.
                    return true;
                }
                if let Some(metrics) = self.inner.metrics.as_ref() {
                    metrics.add(MetricType::DropSets, key, 1);
                }
                false
            }
        }
    }

    /// Removes a key. The mapping disappears immediately; policy state is
    /// reconciled asynchronously. No eviction callback fires.
    pub fn remove(&self, key: K) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let (key, conflict) = key.key_to_hash();
        let _ = self.inner.store.remove(key, conflict);

        let mut item = self.item_pool.take(Item::empty);
        item.flag = EntryFlag::Delete;
        item.key = key;
        item.conflict = conflict;
        if let Err(item) = self.set_buf.enqueue(item) {
            // Full buffer: drop the policy entry synchronously instead of
            // leaking its cost.
            self.inner.policy.remove(key);
            self.recycle(item);
        }
    }

    /// Drops every entry, all pending writes and all policy state. No
    /// eviction callbacks fire.
    pub fn clear(&self) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        self.set_buf.clear();
        self.inner.policy.clear();
        self.inner.store.clear(None);
        if let Some(metrics) = self.inner.metrics.as_ref() {
            metrics.clear();
        }
    }

    /// Number of entries currently stored, including not-yet-swept expired
    /// ones.
    pub fn len(&self) -> usize {
        self.inner.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Replaces the cost function consulted for zero-cost inserts. Takes
    /// effect for writes submitted after the swap.
    pub fn set_cost_fn(&self, cost: impl Cost<V> + 'static) {
        *self.cost.write() = Arc::new(cost);
    }

    /// Replaces the eviction/rejection handler on a live cache. The
    /// processor picks up the new handler for the next event it fires;
    /// events already in flight may still reach the previous one.
    pub fn set_on_evict(&self, handler: impl EventHandler<V> + 'static) {
        *self.inner.handler.write() = Some(Arc::new(handler));
    }

    /// Resizes the cost budget. Takes effect on subsequent admissions; the
    /// cache does not proactively shed entries on shrink.
    pub fn update_max_cost(&self, max_cost: i64) {
        self.inner.policy.update_max_cost(max_cost);
    }

    pub fn max_cost(&self) -> i64 {
        self.inner.policy.max_cost()
    }

    pub fn metrics(&self) -> Option<&Metrics> {
        self.inner.metrics.as_ref()
    }

    /// Shuts the cache down: stops the clock, stops and joins the processor.
    /// Idempotent; all operations on a closed cache are no-ops.
    pub fn close(&self) {
        if self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        self.inner.clock.stop();
        if let Some(processor) = self.processor.lock().take() {
            let _ = processor.join();
        }
    }

    fn recycle(&self, mut item: Item<V>) {
        item.flag = EntryFlag::New;
        item.value = None;
        self.item_pool.put(item);
    }
}

impl<K, V: Clone> Drop for Cache<K, V> {
    fn drop(&mut self) {
        self.closed.store(true, Ordering::Release);
        self.inner.clock.stop();
        if let Some(processor) = self.processor.lock().take() {
            // The processor observes the closed flag on its next loop turn.
            let _ = processor.join();
        }
    }
}

fn process_items<V>(
    closed: Arc<AtomicBool>,
    set_buf: Arc<MpmcQueue<Item<V>>>,
    item_pool: Arc<Pool<Item<V>>>,
    cache: Arc<InnerCache<V>>,
) -> JoinHandle<()>
where
    V: Clone + Send + Sync + 'static,
{
    std::thread::spawn(move || {
        let cleanup_ticker = tick(Duration::from_millis(
            BUCKET_DURATION_SECS as u64 * 1000 / 2,
        ));
        let admission_log = AdmissionLog::new(ADMISSION_LOG_KEEP);
        let backoff = Backoff::new();
        loop {
            if closed.load(Ordering::Acquire) {
                break;
            }
            if let Some(mut item) = set_buf.dequeue() {
                backoff.reset();
                apply_item(&cache, &admission_log, &mut item);
                item.flag = EntryFlag::New;
                item.value = None;
                item_pool.put(item);
                continue;
            }
            if cleanup_ticker.try_recv().is_ok() {
                sweep_expired(&cache, &admission_log);
                continue;
            }
            if backoff.is_completed() {
                std::thread::sleep(IDLE_SLEEP);
            } else {
                backoff.snooze();
            }
        }
    })
}

fn apply_item<V: Clone + Send + Sync>(
    cache: &InnerCache<V>,
    admission_log: &AdmissionLog,
    item: &mut Item<V>,
) {
    match item.flag {
        EntryFlag::New => {
            let (victims, added) = cache.policy.add(item.key, item.cost);
            if added {
                if let Some(value) = item.value.take() {
                    cache.store.set(
                        item.key,
                        StoreItem {
                            conflict: item.conflict,
                            value,
                            expiration: item.expiration,
                        },
                    );
                    if let Some(metrics) = cache.metrics.as_ref() {
                        metrics.add(MetricType::KeyAdd, item.key, 1);
                        admission_log.admitted(item.key);
                    }
                }
            } else if let Some(value) = item.value.take() {
                cache.fire_reject(EvictedItem {
                    key: item.key,
                    conflict: item.conflict,
                    value,
                    cost: item.cost,
                    expiration: item.expiration,
                });
            }
            for victim in victims {
                let expiration = cache.store.expiration(victim.key);
                if let Some((conflict, value)) = cache.store.remove(victim.key, 0) {
                    if let Some(metrics) = cache.metrics.as_ref() {
                        admission_log.evicted(victim.key, metrics);
                    }
                    cache.fire_evict(EvictedItem {
                        key: victim.key,
                        conflict,
                        value,
                        cost: victim.cost,
                        expiration,
                    });
                }
            }
        }
        EntryFlag::Update => cache.policy.update(item.key, item.cost),
        EntryFlag::Delete => {
            cache.policy.remove(item.key);
            let _ = cache.store.remove(item.key, item.conflict);
        }
    }
}

/// Sweeps the expiration bucket that has just come due. Expired entries
/// count as evictions: they release their cost and fire `on_evict`.
fn sweep_expired<V: Clone + Send + Sync>(cache: &InnerCache<V>, admission_log: &AdmissionLog) {
    let now = cache.clock.now_unix();
    for (key, stored) in cache.store.cleanup(now) {
        let cost = cache.policy.cost(key);
        cache.policy.remove(key);
        if let Some(metrics) = cache.metrics.as_ref() {
            admission_log.evicted(key, metrics);
        }
        cache.fire_evict(EvictedItem {
            key,
            conflict: stored.conflict,
            value: stored.value,
            cost,
            expiration: stored.expiration,
        });
    }
}
