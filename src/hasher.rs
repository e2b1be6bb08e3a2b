use std::borrow::Borrow;
use std::hash::{BuildHasher, Hash};

use ahash::RandomState;

/// Hashing and equality of a lookup key `Q` against stored keys `K`.
///
/// The map needs `KeyHasher<K, K>` to insert. Every other `Q` it is
/// implemented for becomes a valid lookup type for `find`, `erase`, `count`
/// and friends, which is how heterogeneous lookup is expressed: the
/// implementation used is picked by the type of the lookup key at the call site.
/// The `insert_ref` family accepts the same lookup types, so an existing key
/// is found without building a `K`.
///
/// Implementations must be deterministic, and for any `q: Q` and `k: K` with
/// `eq(k, q)`, `hash(q)` must equal the hash `KeyHasher<K, K>` gives `k`.
/// Breaking this makes lookups miss; it never causes memory unsafety.
pub trait KeyHasher<K, Q: ?Sized = K> {
    fn hash(&self, key: &Q) -> u64;

    fn eq(&self, stored: &K, key: &Q) -> bool;
}

/// `KeyHasher` built on `Hash + Eq` and a `BuildHasher`.
///
/// Works for every `Q` the stored key can be borrowed as, like the
/// standard library maps (`String` keys can be looked up by `&str`).
#[derive(Debug, Clone, Default)]
pub struct StdHash<S = RandomState> {
    build_hasher: S,
}

impl<S> StdHash<S> {
    pub fn new(build_hasher: S) -> Self {
        Self { build_hasher }
    }

    pub fn build_hasher(&self) -> &S {
        &self.build_hasher
    }
}

impl<K, Q, S> KeyHasher<K, Q> for StdHash<S>
where
    K: Borrow<Q>,
    Q: Hash + Eq + ?Sized,
    S: BuildHasher,
{
    #[inline(always)]
    fn hash(&self, key: &Q) -> u64 {
        self.build_hasher.hash_one(key)
    }

    #[inline(always)]
    fn eq(&self, stored: &K, key: &Q) -> bool {
        stored.borrow() == key
    }
}
