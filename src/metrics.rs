use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crossbeam::utils::CachePadded;
use histogram::Histogram;
use parking_lot::{Mutex, RwLock};

const NUM_METRICS: usize = 11;

// Counter slots per metric; writers are spread across slots keyed by the
// entry hash to keep contention off a single cache line.
const NUM_SLOTS: usize = 256;

#[derive(Hash, Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Debug)]
pub enum MetricType {
    Hit,
    Miss,
    KeyAdd,
    KeyUpdate,
    KeyEvict,
    CostAdd,
    CostEvict,
    DropSets,
    RejectSets,
    DropGets,
    KeepGets,
}

impl MetricType {
    pub(crate) const ALL: [MetricType; NUM_METRICS] = [
        MetricType::Hit,
        MetricType::Miss,
        MetricType::KeyAdd,
        MetricType::KeyUpdate,
        MetricType::KeyEvict,
        MetricType::CostAdd,
        MetricType::CostEvict,
        MetricType::DropSets,
        MetricType::RejectSets,
        MetricType::DropGets,
        MetricType::KeepGets,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MetricType::Hit => "hit",
            MetricType::Miss => "miss",
            MetricType::KeyAdd => "keys-added",
            MetricType::KeyUpdate => "keys-updated",
            MetricType::KeyEvict => "keys-evicted",
            MetricType::CostAdd => "cost-added",
            MetricType::CostEvict => "cost-evicted",
            MetricType::DropSets => "sets-dropped",
            MetricType::RejectSets => "sets-rejected",
            MetricType::DropGets => "gets-dropped",
            MetricType::KeepGets => "gets-kept",
        }
    }
}

struct Inner {
    counters: Vec<Box<[CachePadded<AtomicU64>]>>,
    life: RwLock<Histogram>,
}

/// Cache statistics. Cheap to clone; clones share the same counters.
#[derive(Clone)]
pub struct Metrics {
    inner: Arc<Inner>,
}

fn new_counter_array() -> Box<[CachePadded<AtomicU64>]> {
    (0..NUM_SLOTS)
        .map(|_| CachePadded::new(AtomicU64::new(0)))
        .collect::<Vec<_>>()
        .into_boxed_slice()
}

impl Metrics {
    pub fn new() -> Metrics {
        let counters = (0..NUM_METRICS).map(|_| new_counter_array()).collect();
        Self {
            inner: Arc::new(Inner {
                counters,
                life: RwLock::new(Histogram::configure().max_value(1 << 16).build().unwrap()),
            }),
        }
    }

    pub(crate) fn add(&self, t: MetricType, hash: u64, delta: u64) {
        let slots = &self.inner.counters[t as usize];
        let idx = ((hash % 25) * 10) as usize;
        slots[idx].fetch_add(delta, Ordering::Relaxed);
    }

    pub fn get(&self, t: MetricType) -> u64 {
        self.inner.counters[t as usize]
            .iter()
            .map(|slot| slot.load(Ordering::Relaxed))
            .sum()
    }

    /// Hits over total gets, in `[0, 1]`.
    pub fn ratio(&self) -> f64 {
        let hits = self.get(MetricType::Hit);
        let misses = self.get(MetricType::Miss);
        if hits == 0 && misses == 0 {
            return 0.0;
        }
        hits as f64 / (hits + misses) as f64
    }

    pub fn clear(&self) {
        for slots in self.inner.counters.iter() {
            for slot in slots.iter() {
                slot.store(0, Ordering::Release);
            }
        }
        self.inner.life.write().clear();
    }

    pub(crate) fn track_eviction(&self, lifetime_secs: u64) {
        let _ = self.inner.life.write().increment(lifetime_secs);
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for Metrics {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        for m in MetricType::ALL {
            writeln!(f, "{}: {}", m.as_str(), self.get(m))?;
        }
        writeln!(
            f,
            "gets-total: {}",
            self.get(MetricType::Hit) + self.get(MetricType::Miss)
        )?;
        write!(f, "hit-ratio: {:.2}", self.ratio())
    }
}

/// Remembers when keys were admitted so evictions can report how long the
/// entry lived. Bounded; overflowing simply forgets the oldest epoch.
pub(crate) struct AdmissionLog {
    added: Mutex<HashMap<u64, Instant>>,
    keep: usize,
}

impl AdmissionLog {
    pub(crate) fn new(keep: usize) -> Self {
        Self {
            added: Mutex::new(HashMap::new()),
            keep,
        }
    }

    pub(crate) fn admitted(&self, key: u64) {
        let mut added = self.added.lock();
        if added.len() >= self.keep {
            added.clear();
        }
        added.insert(key, Instant::now());
    }

    pub(crate) fn evicted(&self, key: u64, metrics: &Metrics) {
        if let Some(at) = self.added.lock().remove(&key) {
            metrics.track_eviction(at.elapsed().as_secs());
        }
    }
}
