use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::Result;

/// Doorkeeper bloom filter backing the admission policy.
///
/// Membership bits live in a flat array of 64-bit words. Probing uses
/// double-hashing: a single 64-bit input hash and its 17-bit rotation yield
/// the full probe sequence, so no rehashing happens per probe. See the
/// analysis in [Kirsch, Mitzenmacher 2006].
///
/// The serialized form is the `{ bitset, k, m }` triple, stable across
/// versions so a filter can be persisted and reloaded.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Bloom {
    bitset: Vec<u64>,
    k: u64,
    m: u64,
}

impl Bloom {
    /// Sizes a filter for `capacity` distinct items at the given false
    /// positive rate: `m = ceil(-n * ln(p) / ln(2)^2)` bits probed by
    /// `k = ceil((m / n) * ln(2))` hash functions.
    pub fn new(capacity: usize, fp_rate: f64) -> Result<Self> {
        if capacity == 0 {
            return Err(Error::InvalidArgument(
                "bloom filter capacity must be non-zero".to_string(),
            ));
        }
        if fp_rate <= 0.0 || fp_rate >= 1.0 {
            return Err(Error::InvalidArgument(format!(
                "bloom filter false positive rate {} outside (0, 1)",
                fp_rate
            )));
        }
        let ln2 = std::f64::consts::LN_2;
        let n = capacity as f64;
        let m = ((-n * fp_rate.ln()) / (ln2 * ln2)).ceil() as u64;
        let k = ((m as f64 / n) * ln2).ceil() as u64;
        let words = ((m + 63) / 64) as usize;
        Ok(Self {
            bitset: vec![0; words],
            k,
            m,
        })
    }

    #[inline]
    fn has_bit(&self, idx: u64) -> bool {
        self.bitset[(idx >> 6) as usize] & (1 << (idx & 63)) != 0
    }

    #[inline]
    fn set_bit(&mut self, idx: u64) {
        self.bitset[(idx >> 6) as usize] |= 1 << (idx & 63);
    }

    /// Records the presence of `hash`.
    pub fn add(&mut self, hash: u64) {
        let delta = hash.rotate_right(17);
        let mut probe = hash;
        for _ in 0..self.k {
            self.set_bit(probe % self.m);
            probe = probe.wrapping_add(delta);
        }
    }

    /// Records `hash` and reports whether every probed bit was already set,
    /// i.e. whether the element was (possibly falsely) present.
    pub fn add_if_absent(&mut self, hash: u64) -> bool {
        let delta = hash.rotate_right(17);
        let mut probe = hash;
        let mut present = true;
        for _ in 0..self.k {
            let idx = probe % self.m;
            if !self.has_bit(idx) {
                present = false;
                self.set_bit(idx);
            }
            probe = probe.wrapping_add(delta);
        }
        present
    }

    /// Checks membership. False positives are possible, false negatives are
    /// not.
    pub fn contains(&self, hash: u64) -> bool {
        let delta = hash.rotate_right(17);
        let mut probe = hash;
        for _ in 0..self.k {
            if !self.has_bit(probe % self.m) {
                return false;
            }
            probe = probe.wrapping_add(delta);
        }
        true
    }

    /// Zeroes every bit; the filter geometry is preserved and nothing is
    /// reallocated.
    pub fn clear(&mut self) {
        for word in self.bitset.iter_mut() {
            *word = 0;
        }
    }

    /// Number of bits in the filter.
    pub fn total_bits(&self) -> u64 {
        self.m
    }

    /// Number of probes per element.
    pub fn hash_count(&self) -> u64 {
        self.k
    }
}

#[cfg(test)]
mod test {
    use super::Bloom;

    #[test]
    fn sizing() {
        let bloom = Bloom::new(1000, 0.01).unwrap();
        // 1000 items at 1% needs ~9585 bits and 7 probes.
        assert_eq!(bloom.total_bits(), 9585);
        assert_eq!(bloom.hash_count(), 7);
        assert_eq!(bloom.bitset.len(), (9585 + 63) / 64);
    }

    #[test]
    fn rejects_degenerate_parameters() {
        assert!(Bloom::new(0, 0.01).is_err());
        assert!(Bloom::new(10, 0.0).is_err());
        assert!(Bloom::new(10, 1.0).is_err());
        assert!(Bloom::new(10, -0.5).is_err());
        assert!(Bloom::new(1, 0.5).is_ok());
    }

    #[test]
    fn membership() {
        let mut bloom = Bloom::new(100, 0.01).unwrap();
        for hash in 1..=50u64 {
            assert!(!bloom.contains(hash.wrapping_mul(0x9e3779b97f4a7c15)));
        }
        for hash in 1..=50u64 {
            bloom.add(hash.wrapping_mul(0x9e3779b97f4a7c15));
        }
        for hash in 1..=50u64 {
            assert!(bloom.contains(hash.wrapping_mul(0x9e3779b97f4a7c15)));
        }
    }

    #[test]
    fn double_add_reports_presence() {
        let mut bloom = Bloom::new(100, 0.01).unwrap();
        assert!(!bloom.add_if_absent(0xdeadbeef));
        assert!(bloom.add_if_absent(0xdeadbeef));
    }

    #[test]
    fn clear_keeps_geometry() {
        let mut bloom = Bloom::new(100, 0.01).unwrap();
        let (m, k) = (bloom.total_bits(), bloom.hash_count());
        bloom.add(42);
        bloom.clear();
        assert!(!bloom.contains(42));
        assert_eq!(bloom.total_bits(), m);
        assert_eq!(bloom.hash_count(), k);
    }

    #[test]
    fn json_round_trip_preserves_membership() {
        let mut bloom = Bloom::new(64, 0.05).unwrap();
        for hash in [3u64, 1 << 40, u64::MAX, 0x517cc1b727220a95] {
            bloom.add(hash);
        }
        let encoded = serde_json::to_string(&bloom).unwrap();
        let decoded: Bloom = serde_json::from_str(&encoded).unwrap();
        assert_eq!(bloom, decoded);
        for probe in 0..1000u64 {
            assert_eq!(bloom.contains(probe), decoded.contains(probe));
        }
    }
}
