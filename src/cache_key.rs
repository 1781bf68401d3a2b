use std::hash::{Hash, Hasher};

use once_cell::sync::Lazy;
use xxhash_rust::xxh3::Xxh3;
use xxhash_rust::xxh64::Xxh64;

// Per-process seed for the primary hash. The conflict hash is deliberately
// unseeded so it stays stable across processes.
static PRIMARY_SEED: Lazy<u64> = Lazy::new(rand::random);

/// Reduces an external key to a `(primary, conflict)` pair of 64-bit hashes.
///
/// The primary hash indexes the store and the frequency sketches; the
/// conflict hash disambiguates primary-hash collisions at read time. Integer
/// keys are their own primary hash and carry a zero conflict hash, which
/// skips the read-side collision guard entirely.
pub trait CacheKey {
    fn key_to_hash(&self) -> (u64, u64);
}

macro_rules! impl_integer_key {
    ($($ty:ty),*) => {
        $(
            impl CacheKey for $ty {
                #[inline]
                fn key_to_hash(&self) -> (u64, u64) {
                    (*self as u64, 0)
                }
            }
        )*
    };
}

impl_integer_key!(i8, u8, i16, u16, i32, u32, i64, u64, isize, usize);

fn hash_pair<T: ?Sized + Hash>(key: &T) -> (u64, u64) {
    let mut primary = Xxh3::with_seed(*PRIMARY_SEED);
    key.hash(&mut primary);
    let mut conflict = Xxh64::new(0);
    key.hash(&mut conflict);
    (primary.finish(), conflict.finish())
}

impl<T: ?Sized + Hash> CacheKey for &T {
    #[inline]
    fn key_to_hash(&self) -> (u64, u64) {
        hash_pair(*self)
    }
}

impl<T: ?Sized + Hash> CacheKey for &mut T {
    #[inline]
    fn key_to_hash(&self) -> (u64, u64) {
        hash_pair(*self)
    }
}

impl CacheKey for String {
    #[inline]
    fn key_to_hash(&self) -> (u64, u64) {
        hash_pair(self.as_str())
    }
}

impl CacheKey for Vec<u8> {
    #[inline]
    fn key_to_hash(&self) -> (u64, u64) {
        hash_pair(self.as_slice())
    }
}
