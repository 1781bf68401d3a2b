use std::sync::Arc;

use arrayvec::ArrayVec;
use rand::RngCore;

use crate::pool::ByteBufferPool;

const CM_DEPTH: usize = 4;

/// Count-Min sketch with 4-bit saturating counters.
///
/// Each of the four rows packs two counters per byte: even column indexes in
/// the low nibble, odd indexes in the high nibble. Counters stick at 15
/// instead of wrapping, and `reset` halves every counter in place, which ages
/// old traffic out of the estimate without reallocating.
#[derive(Debug)]
pub(crate) struct CmSketch {
    rows: ArrayVec<Vec<u8>, CM_DEPTH>,
    seeds: ArrayVec<u64, CM_DEPTH>,
    mask: u64,
    pool: Arc<ByteBufferPool>,
}

impl CmSketch {
    pub(crate) fn new(num_counters: u64, pool: Arc<ByteBufferPool>) -> Self {
        let num_counters = num_counters.max(2).next_power_of_two();
        let mut rng = rand::thread_rng();
        let mut rows = ArrayVec::new();
        let mut seeds = ArrayVec::new();
        for _ in 0..CM_DEPTH {
            rows.push(pool.get(num_counters as usize / 2));
            seeds.push(rng.next_u64());
        }
        Self {
            rows,
            seeds,
            mask: num_counters - 1,
            pool,
        }
    }

    pub(crate) fn increment(&mut self, hashed: u64) {
        for (row, seed) in self.rows.iter_mut().zip(self.seeds.iter()) {
            row.increment((hashed ^ seed) & self.mask);
        }
    }

    /// Minimum of the four probed counters, the standard sketch estimate.
    pub(crate) fn estimate(&self, hashed: u64) -> i64 {
        let mut min = u8::MAX;
        for (row, seed) in self.rows.iter().zip(self.seeds.iter()) {
            let val = row.counter((hashed ^ seed) & self.mask);
            if val < min {
                min = val;
            }
        }
        i64::from(min)
    }

    /// Halves every counter, preserving relative ordering.
    pub(crate) fn reset(&mut self) {
        for row in self.rows.iter_mut() {
            row.reset();
        }
    }

    pub(crate) fn clear(&mut self) {
        for row in self.rows.iter_mut() {
            row.clear_counters();
        }
    }
}

impl Drop for CmSketch {
    fn drop(&mut self) {
        for row in self.rows.drain(..) {
            self.pool.put(row);
        }
    }
}

trait Row {
    fn counter(&self, n: u64) -> u8;
    fn increment(&mut self, n: u64);
    fn reset(&mut self);
    fn clear_counters(&mut self);
}

impl Row for Vec<u8> {
    fn counter(&self, n: u64) -> u8 {
        (self[n as usize / 2] >> ((n & 1) * 4)) & 0x0f
    }

    fn increment(&mut self, n: u64) {
        let i = n as usize / 2;
        // Shift distance: even counters 0, odd counters 4.
        let s = (n & 1) * 4;
        let v = (self[i] >> s) & 0x0f;
        if v < 15 {
            self[i] += 1 << s;
        }
    }

    fn reset(&mut self) {
        for byte in self.iter_mut() {
            *byte = (*byte >> 1) & 0x77;
        }
    }

    fn clear_counters(&mut self) {
        for byte in self.iter_mut() {
            *byte = 0;
        }
    }
}
