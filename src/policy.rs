use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::bloom::Bloom;
use crate::cm_sketch::CmSketch;
use crate::metrics::{MetricType, Metrics};
use crate::pool::ByteBufferPool;
use crate::ring::Consumer;
use crate::Result;

pub(crate) const SAMPLE_SIZE: usize = 5;

// Eviction work per admission is bounded; an admission that still lacks room
// after this many victims goes through anyway and leaves the sampler
// transiently over budget until a later admission sheds more.
pub(crate) const MAX_VICTIMS: usize = 16;

/// A sampled key with its cost: an eviction candidate or a chosen victim.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) struct CostEntry {
    pub(crate) key: u64,
    pub(crate) cost: i64,
}

struct Inner {
    admit: TinyLfu,
    evict: SampledLfu,
    rng: StdRng,
}

/// Admission and eviction decisions behind a single mutex: only one thread
/// is ever inside the policy.
pub(crate) struct LfuPolicy {
    inner: Mutex<Inner>,
    max_cost: Arc<AtomicI64>,
    metrics: Option<Metrics>,
}

impl LfuPolicy {
    pub(crate) fn new(
        num_counters: u64,
        max_cost: i64,
        metrics: Option<Metrics>,
        row_pool: Arc<ByteBufferPool>,
    ) -> Result<Self> {
        let max_cost = Arc::new(AtomicI64::new(max_cost));
        let inner = Inner {
            admit: TinyLfu::new(num_counters, row_pool)?,
            evict: SampledLfu::new(max_cost.clone(), metrics.clone()),
            rng: StdRng::from_entropy(),
        };
        Ok(Self {
            inner: Mutex::new(inner),
            max_cost,
            metrics,
        })
    }

    /// Decides whether `key` at `cost` enters the cache. Returns the victims
    /// evicted to make room and whether the key was admitted. A key the
    /// sampler already tracks only has its cost refreshed and reports
    /// `false` with no victims: the caller treats that as an in-place
    /// update, not an admission.
    pub(crate) fn add(&self, key: u64, cost: i64) -> (Vec<CostEntry>, bool) {
        let mut p = self.inner.lock();

        // Larger than the whole cache; can never be admitted.
        if cost > self.max_cost.load(Ordering::Acquire) {
            return (Vec::new(), false);
        }

        if p.evict.update_if_has(key, cost) {
            return (Vec::new(), false);
        }

        let mut room = p.evict.room_left(cost);
        if room >= 0 {
            p.evict.add(key, cost);
            if let Some(metrics) = self.metrics.as_ref() {
                metrics.add(MetricType::CostAdd, key, cost as u64);
            }
            return (Vec::new(), true);
        }

        let Inner { admit, evict, rng } = &mut *p;
        let incoming_hits = admit.estimate(key);
        let mut victims = Vec::new();

        // Evict the weakest of a small random sample until the incoming key
        // fits, loses the frequency contest, or the victim budget runs out.
        while room < 0 && victims.len() < MAX_VICTIMS {
            let sample = evict.sample(rng);
            let min_entry = match sample
                .iter()
                .min_by_key(|entry| admit.estimate(entry.key))
            {
                Some(entry) => *entry,
                None => break,
            };

            // The incoming key must be strictly hotter than the weakest
            // sampled entry; on a tie the resident wins.
            if incoming_hits <= admit.estimate(min_entry.key) {
                if let Some(metrics) = self.metrics.as_ref() {
                    metrics.add(MetricType::RejectSets, key, 1);
                }
                return (victims, false);
            }

            evict.remove(min_entry.key);
            victims.push(min_entry);
            room = evict.room_left(cost);
        }

        evict.add(key, cost);
        if let Some(metrics) = self.metrics.as_ref() {
            metrics.add(MetricType::CostAdd, key, cost as u64);
        }
        (victims, true)
    }

    pub(crate) fn update(&self, key: u64, cost: i64) {
        let mut p = self.inner.lock();
        p.evict.update_if_has(key, cost);
    }

    pub(crate) fn remove(&self, key: u64) {
        let mut p = self.inner.lock();
        p.evict.remove(key);
    }

    #[allow(dead_code)]
    pub(crate) fn has(&self, key: u64) -> bool {
        let p = self.inner.lock();
        p.evict.key_costs.contains_key(&key)
    }

    /// Tracked cost of a key, or -1 when untracked.
    pub(crate) fn cost(&self, key: u64) -> i64 {
        let p = self.inner.lock();
        p.evict.key_costs.get(&key).copied().unwrap_or(-1)
    }

    pub(crate) fn clear(&self) {
        let mut p = self.inner.lock();
        p.evict.clear();
        p.admit.clear();
    }

    pub(crate) fn max_cost(&self) -> i64 {
        self.max_cost.load(Ordering::Acquire)
    }

    pub(crate) fn update_max_cost(&self, max_cost: i64) {
        self.max_cost.store(max_cost, Ordering::Release);
    }
}

impl Consumer for LfuPolicy {
    /// Folds a batch of access notifications into the frequency state.
    /// Contended batches are dropped rather than blocking the pushing
    /// thread; frequency updates are best-effort.
    fn consume(&self, keys: Vec<u64>) -> bool {
        if keys.is_empty() {
            return true;
        }
        let first = keys[0];
        let count = keys.len() as u64;
        match self.inner.try_lock() {
            Some(mut p) => {
                for key in keys {
                    p.admit.record(key);
                }
                if let Some(metrics) = self.metrics.as_ref() {
                    metrics.add(MetricType::KeepGets, first, count);
                }
                true
            }
            None => {
                if let Some(metrics) = self.metrics.as_ref() {
                    metrics.add(MetricType::DropGets, first, count);
                }
                false
            }
        }
    }
}

/// Cost book-keeping for admitted keys plus random sampling for eviction.
pub(crate) struct SampledLfu {
    max_cost: Arc<AtomicI64>,
    used: i64,
    key_costs: IndexMap<u64, i64>,
    metrics: Option<Metrics>,
}

impl SampledLfu {
    fn new(max_cost: Arc<AtomicI64>, metrics: Option<Metrics>) -> Self {
        Self {
            max_cost,
            used: 0,
            key_costs: IndexMap::new(),
            metrics,
        }
    }

    fn max_cost(&self) -> i64 {
        self.max_cost.load(Ordering::Acquire)
    }

    fn room_left(&self, cost: i64) -> i64 {
        self.max_cost() - (self.used + cost)
    }

    fn add(&mut self, key: u64, cost: i64) {
        if self.update_if_has(key, cost) {
            return;
        }
        self.key_costs.insert(key, cost);
        self.used += cost;
    }

    fn update_if_has(&mut self, key: u64, cost: i64) -> bool {
        match self.key_costs.get_mut(&key) {
            Some(prev) => {
                if let Some(metrics) = self.metrics.as_ref() {
                    metrics.add(MetricType::KeyUpdate, key, 1);
                }
                self.used += cost - *prev;
                *prev = cost;
                true
            }
            None => false,
        }
    }

    fn remove(&mut self, key: u64) -> Option<i64> {
        let cost = self.key_costs.swap_remove(&key)?;
        self.used -= cost;
        if let Some(metrics) = self.metrics.as_ref() {
            metrics.add(MetricType::CostEvict, key, cost as u64);
            metrics.add(MetricType::KeyEvict, key, 1);
        }
        Some(cost)
    }

    /// Up to [`SAMPLE_SIZE`] entries at distinct random indexes. The map
    /// itself iterates in insertion order, so sampling must randomize
    /// explicitly.
    fn sample(&self, rng: &mut StdRng) -> Vec<CostEntry> {
        let len = self.key_costs.len();
        if len <= SAMPLE_SIZE {
            return self
                .key_costs
                .iter()
                .map(|(key, cost)| CostEntry {
                    key: *key,
                    cost: *cost,
                })
                .collect();
        }
        rand::seq::index::sample(rng, len, SAMPLE_SIZE)
            .into_iter()
            .filter_map(|idx| self.key_costs.get_index(idx))
            .map(|(key, cost)| CostEntry {
                key: *key,
                cost: *cost,
            })
            .collect()
    }

    fn clear(&mut self) {
        self.used = 0;
        self.key_costs.clear();
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.key_costs.len()
    }
}

/// Frequency state: a Count-Min sketch for repeat traffic plus a doorkeeper
/// bloom filter that absorbs first touches, so one-hit keys never pollute
/// the sketch.
pub(crate) struct TinyLfu {
    freq: CmSketch,
    door: Bloom,
    incrs: i64,
    reset_at: i64,
}

impl TinyLfu {
    fn new(num_counters: u64, row_pool: Arc<ByteBufferPool>) -> Result<Self> {
        Ok(Self {
            freq: CmSketch::new(num_counters, row_pool),
            door: Bloom::new(num_counters.max(1) as usize, 0.01)?,
            incrs: 0,
            reset_at: num_counters as i64,
        })
    }

    fn record(&mut self, key: u64) {
        self.incrs += 1;
        if self.incrs >= self.reset_at {
            self.reset();
        }
        // First touch only flips the doorkeeper; repeat touches reach the
        // sketch.
        if self.door.add_if_absent(key) {
            self.freq.increment(key);
        }
    }

    fn estimate(&self, key: u64) -> i64 {
        let mut hits = self.freq.estimate(key);
        if self.door.contains(key) {
            hits += 1;
        }
        hits
    }

    /// Ages the frequency state: sketch counters halve and the doorkeeper
    /// starts over.
    fn reset(&mut self) {
        self.incrs = 0;
        self.freq.reset();
        self.door.clear();
    }

    fn clear(&mut self) {
        self.incrs = 0;
        self.freq.clear();
        self.door.clear();
    }
}
