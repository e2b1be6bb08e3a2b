use std::fmt;
use std::marker::PhantomData;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

use crate::array::{BorrowedKey, Claim, HashArray, KeySource, OwnedKey};
use crate::config::Config;
use crate::error::{Error, InsertError, Result};
use crate::hasher::{KeyHasher, StdHash};
use crate::iter::{Entry, EntryIndex, Iter};
use crate::probe::{LinearProbe, Probe, QuadraticProbe};

// ================================================================================================
// CONSTANTS
// ================================================================================================

/// Maximum number of submaps a map can chain.
pub const MAX_SUBMAPS: usize = 32;

/// Size estimate used by `Default`.
pub const DEFAULT_SIZE_ESTIMATE: usize = 1024;

// ================================================================================================
// ATOMIC HASH MAP
// ================================================================================================

/// A concurrent hash map that grows by chaining fixed-capacity submaps.
///
/// Lookups never take a lock. Inserts claim a slot with a single CAS and never overwrite
/// an existing entry; values never move once published, so returned [`Entry`] views and
/// [`EntryIndex`] positions stay valid until the map is cleared or dropped.
///
/// All operations take `&self` except [`clear`](Self::clear) and
/// [`get_mut`](Self::get_mut). Share the map across threads by reference or `Arc`.
///
/// Erase is supported but erased slots are never reused, so a map that sees steady churn
/// keeps growing. Size the first submap with a good estimate: lookups past the first
/// submap probe every earlier one.
pub struct AtomicHashMap<K, V, H = StdHash, P = LinearProbe> {
    submaps: Box<[AtomicPtr<HashArray<K, V, P>>]>,
    config: Config,
    hasher: H,
    _owns: PhantomData<Box<HashArray<K, V, P>>>,
}

/// [`AtomicHashMap`] with quadratic probing inside each submap.
pub type QuadraticProbingAtomicHashMap<K, V, H = StdHash> = AtomicHashMap<K, V, H, QuadraticProbe>;

impl<K, V> AtomicHashMap<K, V> {
    /// Create a map whose first submap holds `size_estimate` entries.
    ///
    /// # Panics
    ///
    /// Panics if the first submap cannot be allocated.
    pub fn new(size_estimate: usize) -> Self {
        Self::with_hasher(size_estimate, StdHash::default())
    }

    pub fn with_config(size_estimate: usize, config: Config) -> Result<Self> {
        Self::with_config_and_hasher(size_estimate, config, StdHash::default())
    }
}

impl<K, V, H, P> AtomicHashMap<K, V, H, P> {
    /// Create a map with the default config and the given key hasher.
    ///
    /// # Panics
    ///
    /// Panics if the first submap cannot be allocated.
    pub fn with_hasher(size_estimate: usize, hasher: H) -> Self {
        match Self::with_config_and_hasher(size_estimate, Config::default(), hasher) {
            Ok(map) => map,
            Err(err) => panic!("AtomicHashMap: {err}"),
        }
    }

    /// Create a map with an explicit config and key hasher.
    pub fn with_config_and_hasher(size_estimate: usize, config: Config, hasher: H) -> Result<Self> {
        config.validate()?;
        let primary = HashArray::try_new(config.capacity_for(size_estimate), &config)?;

        let submaps: Box<[AtomicPtr<HashArray<K, V, P>>]> = (0..MAX_SUBMAPS)
            .map(|_| AtomicPtr::new(ptr::null_mut()))
            .collect();
        submaps[0].store(Box::into_raw(Box::new(primary)), Ordering::Release);

        Ok(Self {
            submaps,
            config,
            hasher,
            _owns: PhantomData,
        })
    }

    #[inline(always)]
    fn submap(&self, idx: usize) -> Option<&HashArray<K, V, P>> {
        self.submaps.get(idx).and_then(HashArray::load)
    }

    /// Published submaps in order.
    fn published(&self) -> impl Iterator<Item = (usize, &HashArray<K, V, P>)> + '_ {
        (0..).map_while(move |idx| self.submap(idx).map(|table| (idx, table)))
    }

    /// Number of live entries.
    ///
    /// Sums per-submap counters, so the result is approximate while writers are active.
    pub fn len(&self) -> usize {
        self.published().map(|(_, t)| t.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.published().all(|(_, t)| t.len() == 0)
    }

    /// Total slots across published submaps.
    pub fn capacity(&self) -> usize {
        self.published().map(|(_, t)| t.capacity()).sum()
    }

    pub fn num_submaps(&self) -> usize {
        self.published().count()
    }

    /// New keys that fit before the map has to grow.
    pub fn space_remaining(&self) -> usize {
        self.published().map(|(_, t)| t.space_remaining()).sum()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn hasher(&self) -> &H {
        &self.hasher
    }

    /// Entry at `index`, if it is still live.
    pub fn find_at(&self, index: EntryIndex) -> Option<Entry<'_, K, V>> {
        let submap = index.submap();
        self.submap(submap)?.live_entry(submap, index.offset())
    }

    pub fn iter(&self) -> Iter<'_, K, V, P> {
        self.iter_from(EntryIndex::new(0, 0))
    }

    /// Iterate from `index`, inclusive, to the end of the map.
    pub fn iter_from(&self, index: EntryIndex) -> Iter<'_, K, V, P> {
        Iter::chain(&self.submaps, index)
    }

    /// Remove every entry and release all submaps but the first.
    ///
    /// Invalidates every [`EntryIndex`] handed out so far.
    pub fn clear(&mut self) {
        let released = self.release_submaps(1);
        if let Some(primary) = self.submaps.first_mut() {
            let raw = *primary.get_mut();
            // SAFETY: the first submap is published at construction and never freed before
            // drop; `&mut self` rules out concurrent access.
            if let Some(primary) = unsafe { raw.as_mut() } {
                primary.clear();
            }
        }
        log::debug!("cleared map, released {released} extra submaps");
    }

    /// Free submaps from `from` onwards, returning how many were published.
    fn release_submaps(&mut self, from: usize) -> usize {
        let mut released = 0;
        for submap in self.submaps.iter_mut().skip(from) {
            let raw = std::mem::replace(submap.get_mut(), ptr::null_mut());
            if !raw.is_null() {
                // SAFETY: published pointers come from `Box::into_raw` and are swapped out
                // before being freed, so each is freed once.
                drop(unsafe { Box::from_raw(raw) });
                released += 1;
            }
        }
        released
    }

    /// Publish the submap at `idx` unless another thread already did.
    #[cold]
    fn grow(&self, idx: usize) -> Result<()> {
        let Some(slot) = self.submaps.get(idx) else {
            log::warn!("map exhausted all {MAX_SUBMAPS} submaps");
            return Err(Error::MapFull {
                submaps: MAX_SUBMAPS,
            });
        };
        if !slot.load(Ordering::Acquire).is_null() {
            return Ok(());
        }

        let prev_capacity = idx
            .checked_sub(1)
            .and_then(|prev| self.submap(prev))
            .map_or(0, HashArray::capacity);
        let capacity = self.config.next_capacity(prev_capacity);
        let table = HashArray::try_new(capacity, &self.config).inspect_err(|err| {
            log::warn!("failed to allocate submap {idx}: {err}");
        })?;

        let raw = Box::into_raw(Box::new(table));
        match slot.compare_exchange(ptr::null_mut(), raw, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => log::debug!("published submap {idx} with {capacity} slots"),
            Err(_) => {
                // SAFETY: `raw` was never shared.
                drop(unsafe { Box::from_raw(raw) });
                log::trace!("lost race to publish submap {idx}");
            }
        }
        Ok(())
    }
}

impl<K, V, H, P: Probe> AtomicHashMap<K, V, H, P> {
    /// Insert `key` if absent, growing the map when every submap is full.
    ///
    /// Returns the entry for `key` and whether this call inserted it. An existing entry is
    /// returned unchanged, even if the key lives in an older full submap.
    pub fn insert(&self, key: K, value: V) -> Result<(Entry<'_, K, V>, bool)>
    where
        H: KeyHasher<K>,
    {
        self.insert_with(key, || value)
    }

    /// Like [`insert`](Self::insert), building the value only if the key is claimed.
    ///
    /// If `f` panics the claim is rolled back before the panic propagates.
    /// `f` must not access this map: a concurrent insert of the same key would wait on it.
    pub fn insert_with<F>(&self, key: K, f: F) -> Result<(Entry<'_, K, V>, bool)>
    where
        H: KeyHasher<K>,
        F: FnOnce() -> V,
    {
        self.try_insert_with(key, || Ok::<V, std::convert::Infallible>(f()))
            .map_err(|err| match err {
                InsertError::Map(err) => err,
                InsertError::Value(never) => match never {},
            })
    }

    /// Like [`insert_with`](Self::insert_with) with a fallible constructor.
    ///
    /// On [`InsertError::Value`] the key is left absent.
    pub fn try_insert_with<F, E>(
        &self,
        key: K,
        f: F,
    ) -> std::result::Result<(Entry<'_, K, V>, bool), InsertError<E>>
    where
        H: KeyHasher<K>,
        F: FnOnce() -> std::result::Result<V, E>,
    {
        self.insert_source(OwnedKey(key), f)
    }

    /// Insert by a borrowed key, allocating the owned key only if the entry is new.
    ///
    /// `map.insert_ref("name", v)` on a `String`-keyed map probes with the `&str` and calls
    /// `to_owned` only when the key is absent.
    pub fn insert_ref<Q>(&self, key: &Q, value: V) -> Result<(Entry<'_, K, V>, bool)>
    where
        Q: ?Sized + ToOwned<Owned = K>,
        H: KeyHasher<K, Q>,
    {
        self.insert_ref_with(key, || value)
    }

    /// Like [`insert_ref`](Self::insert_ref), building the value only if the key is claimed.
    pub fn insert_ref_with<Q, F>(&self, key: &Q, f: F) -> Result<(Entry<'_, K, V>, bool)>
    where
        Q: ?Sized + ToOwned<Owned = K>,
        H: KeyHasher<K, Q>,
        F: FnOnce() -> V,
    {
        self.try_insert_ref_with(key, |q: &Q| q.to_owned(), || {
            Ok::<V, std::convert::Infallible>(f())
        })
        .map_err(|err| match err {
            InsertError::Map(err) => err,
            InsertError::Value(never) => match never {},
        })
    }

    /// Insert by a lookup key of any type `H` can compare against stored keys.
    ///
    /// Probing and equality use `key`; `to_key` builds the stored key and runs only when
    /// the key is absent and a slot has been claimed, after `f`. `to_key(key)` must compare
    /// equal to `key`, or later lookups will miss it. Failure or panic in either closure
    /// leaves the key absent.
    pub fn try_insert_ref_with<Q, C, F, E>(
        &self,
        key: &Q,
        to_key: C,
        f: F,
    ) -> std::result::Result<(Entry<'_, K, V>, bool), InsertError<E>>
    where
        Q: ?Sized,
        H: KeyHasher<K, Q>,
        C: FnOnce(&Q) -> K,
        F: FnOnce() -> std::result::Result<V, E>,
    {
        self.insert_source(BorrowedKey { key, to_key }, f)
    }

    fn insert_source<S, F, E>(
        &self,
        key: S,
        make: F,
    ) -> std::result::Result<(Entry<'_, K, V>, bool), InsertError<E>>
    where
        S: KeySource<K>,
        H: KeyHasher<K, S::Lookup>,
        F: FnOnce() -> std::result::Result<V, E>,
    {
        let mut key = key;
        let mut make = make;
        let mut idx = 0;

        loop {
            while let Some(table) = self.submap(idx) {
                match table
                    .insert_internal(&self.hasher, key, make)
                    .map_err(InsertError::Value)?
                {
                    // SAFETY: the slot was published by this call or observed OCCUPIED.
                    Claim::Inserted(slot) => return Ok((unsafe { table.entry_at(idx, slot) }, true)),
                    Claim::Found(slot) => return Ok((unsafe { table.entry_at(idx, slot) }, false)),
                    Claim::Full(k, f) => {
                        key = k;
                        make = f;
                    }
                }
                idx += 1;
            }
            // Submaps before `idx` are sealed, so the key cannot appear in them anymore.
            self.grow(idx)?;
        }
    }

    /// Submap and slot of the live entry for `key`.
    fn locate<Q>(&self, key: &Q) -> Option<(usize, usize)>
    where
        Q: ?Sized,
        H: KeyHasher<K, Q>,
    {
        self.published()
            .find_map(|(idx, table)| table.find_internal(&self.hasher, key).map(|slot| (idx, slot)))
    }

    pub fn find<Q>(&self, key: &Q) -> Option<Entry<'_, K, V>>
    where
        Q: ?Sized,
        H: KeyHasher<K, Q>,
    {
        let (submap, slot) = self.locate(key)?;
        let table = self.submap(submap)?;
        // SAFETY: find_internal only returns slots observed OCCUPIED.
        Some(unsafe { table.entry_at(submap, slot) })
    }

    /// Erase `key`, returning whether this call removed it.
    pub fn erase<Q>(&self, key: &Q) -> bool
    where
        Q: ?Sized,
        H: KeyHasher<K, Q>,
    {
        self.published()
            .any(|(_, table)| table.erase_internal(&self.hasher, key))
    }

    /// `1` if `key` is present, else `0`.
    pub fn count<Q>(&self, key: &Q) -> usize
    where
        Q: ?Sized,
        H: KeyHasher<K, Q>,
    {
        usize::from(self.contains_key(key))
    }

    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        Q: ?Sized,
        H: KeyHasher<K, Q>,
    {
        self.locate(key).is_some()
    }

    pub fn get_mut<Q>(&mut self, key: &Q) -> Option<&mut V>
    where
        Q: ?Sized,
        H: KeyHasher<K, Q>,
    {
        let (submap, slot) = self.locate(key)?;
        let raw = *self.submaps.get_mut(submap)?.get_mut();
        // SAFETY: published pointers stay valid until freed through `&mut self`, which this
        // call holds.
        let table = unsafe { raw.as_mut() }?;
        table.value_mut(slot)
    }
}

impl<K, V, H, P> Drop for AtomicHashMap<K, V, H, P> {
    fn drop(&mut self) {
        self.release_submaps(0);
    }
}

impl<K, V, H: Default, P> Default for AtomicHashMap<K, V, H, P> {
    fn default() -> Self {
        Self::with_hasher(DEFAULT_SIZE_ESTIMATE, H::default())
    }
}

impl<'a, K, V, H, P> IntoIterator for &'a AtomicHashMap<K, V, H, P> {
    type Item = Entry<'a, K, V>;
    type IntoIter = Iter<'a, K, V, P>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl<K: fmt::Debug, V: fmt::Debug, H, P> fmt::Debug for AtomicHashMap<K, V, H, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.iter().map(|e| e.pair()))
            .finish()
    }
}
