//! Fixed-capacity open-addressed table: the standalone `AtomicHashArray` and
//! the submap type of `AtomicHashMap`.

use std::cell::UnsafeCell;
use std::fmt;
use std::marker::PhantomData;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicPtr, AtomicU8, AtomicUsize, Ordering};
use std::thread;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::hasher::{KeyHasher, StdHash};
use crate::iter::{Entry, EntryIndex, Iter};
use crate::probe::{LinearProbe, Probe};

// ================================================================================================
// CONSTANTS
// ================================================================================================

/// Slot has never held an entry
const EMPTY: u8 = 0;

/// Slot is claimed by an inserter that has not published yet
const LOCKED: u8 = 1;

/// Slot holds a live entry
const OCCUPIED: u8 = 2;

/// Slot held an entry that was erased; never reused until `clear`
const ERASED: u8 = 3;

/// Table accepts new keys
const OPEN: u8 = 0;

/// Entry budget is spent; claims already in flight may still publish
const NO_NEW_INSERTS: u8 = 1;

/// Entry budget is spent and no claim is in flight: an empty slot proves absence
const SEALED: u8 = 2;

/// pure CPU hints before any yield
const SPIN_BEFORE_YIELD: i32 = 128;

// ================================================================================================
// SLOT
// ================================================================================================

struct Slot<K, V> {
    state: AtomicU8,
    key: UnsafeCell<MaybeUninit<K>>,
    value: UnsafeCell<MaybeUninit<V>>,
}

// SAFETY: key and value are written only by the thread holding the LOCKED claim and become
// visible to other threads through the release store of OCCUPIED. After that they are only
// read through shared references until the owner has exclusive access again.
unsafe impl<K: Send + Sync, V: Send + Sync> Sync for Slot<K, V> {}

impl<K, V> Slot<K, V> {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(EMPTY),
            key: UnsafeCell::new(MaybeUninit::uninit()),
            value: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }

    /// # Safety
    /// The slot must have been observed OCCUPIED or ERASED with acquire ordering.
    #[inline(always)]
    unsafe fn key(&self) -> &K {
        (*self.key.get()).assume_init_ref()
    }

    /// # Safety
    /// Same as [`Slot::key`].
    #[inline(always)]
    unsafe fn value(&self) -> &V {
        (*self.value.get()).assume_init_ref()
    }

    /// Drop whatever the slot holds and mark it empty.
    fn reset(&mut self) {
        let state = self.state.get_mut();
        if *state == OCCUPIED || *state == ERASED {
            // SAFETY: both states are only reached after key and value were written, and
            // `&mut self` rules out concurrent readers.
            unsafe {
                self.key.get_mut().assume_init_drop();
                self.value.get_mut().assume_init_drop();
            }
        }
        *self.state.get_mut() = EMPTY;
    }
}

impl<K, V> Drop for Slot<K, V> {
    fn drop(&mut self) {
        self.reset();
    }
}

// ================================================================================================
// INTERNAL TABLE
// ================================================================================================

/// Key argument of an insert: what to probe with, and how to get the stored key.
pub(crate) trait KeySource<K> {
    type Lookup: ?Sized;

    fn lookup(&self) -> &Self::Lookup;

    /// Called only once a slot is claimed.
    fn into_key(self) -> K;
}

/// An owned key, stored as is.
pub(crate) struct OwnedKey<K>(pub(crate) K);

impl<K> KeySource<K> for OwnedKey<K> {
    type Lookup = K;

    #[inline(always)]
    fn lookup(&self) -> &K {
        &self.0
    }

    #[inline(always)]
    fn into_key(self) -> K {
        self.0
    }
}

/// A borrowed lookup key, converted to a stored key only when it is inserted.
pub(crate) struct BorrowedKey<'q, Q: ?Sized, C> {
    pub(crate) key: &'q Q,
    pub(crate) to_key: C,
}

impl<K, Q, C> KeySource<K> for BorrowedKey<'_, Q, C>
where
    Q: ?Sized,
    C: FnOnce(&Q) -> K,
{
    type Lookup = Q;

    #[inline(always)]
    fn lookup(&self) -> &Q {
        self.key
    }

    #[inline(always)]
    fn into_key(self) -> K {
        (self.to_key)(self.key)
    }
}

/// Result of a raw insert attempt.
pub(crate) enum Claim<K, F> {
    /// The key was claimed and published at this slot
    Inserted(usize),
    /// The key was already live at this slot
    Found(usize),
    /// The key is absent and the table takes no new keys; ownership goes back to the caller
    Full(K, F),
}

pub(crate) struct HashArray<K, V, P = LinearProbe> {
    slots: Box<[Slot<K, V>]>,
    mask: usize,
    max_entries: usize,
    /// Published, not erased
    live: AtomicUsize,
    /// Erased slots; they keep consuming the entry budget
    erased: AtomicUsize,
    /// Entry budget in use: live + erased + claims in flight
    reserved: AtomicUsize,
    /// Claims between reservation and publish/rollback
    pending: AtomicUsize,
    fill: AtomicU8,
    _probe: PhantomData<fn() -> P>,
}

impl<K, V, P> HashArray<K, V, P> {
    /// Allocate a table of `capacity` slots (a power of two).
    pub(crate) fn try_new(capacity: usize, config: &Config) -> Result<Self> {
        debug_assert!(capacity.is_power_of_two() && capacity >= 2);
        let mut slots = Vec::new();
        slots
            .try_reserve_exact(capacity)
            .map_err(|_| Error::Allocation { slots: capacity })?;
        slots.extend((0..capacity).map(|_| Slot::new()));

        Ok(Self {
            slots: slots.into_boxed_slice(),
            mask: capacity - 1,
            max_entries: config.max_entries(capacity),
            live: AtomicUsize::new(0),
            erased: AtomicUsize::new(0),
            reserved: AtomicUsize::new(0),
            pending: AtomicUsize::new(0),
            fill: AtomicU8::new(OPEN),
            _probe: PhantomData,
        })
    }

    /// Dereference a published submap pointer.
    #[inline(always)]
    pub(crate) fn load(ptr: &AtomicPtr<Self>) -> Option<&Self> {
        let raw = ptr.load(Ordering::Acquire);
        // SAFETY: non-null pointers come from `Box::into_raw` and are freed only through
        // `&mut` access to the owning map, which cannot coexist with the borrow of `ptr`.
        unsafe { raw.as_ref() }
    }

    #[inline(always)]
    pub(crate) fn capacity(&self) -> usize {
        self.slots.len()
    }

    #[inline(always)]
    pub(crate) fn max_entries(&self) -> usize {
        self.max_entries
    }

    #[inline(always)]
    pub(crate) fn len(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }

    #[inline(always)]
    pub(crate) fn num_erases(&self) -> usize {
        self.erased.load(Ordering::Relaxed)
    }

    pub(crate) fn space_remaining(&self) -> usize {
        self.max_entries
            .saturating_sub(self.reserved.load(Ordering::Relaxed))
    }

    #[inline(always)]
    fn home(&self, hash: u64) -> usize {
        (hash as usize) & self.mask
    }

    /// Build the view of a slot whose entry has been published.
    ///
    /// # Safety
    /// The slot must have been observed OCCUPIED (or published by the caller).
    #[inline(always)]
    pub(crate) unsafe fn entry_at(&self, submap: usize, idx: usize) -> Entry<'_, K, V> {
        let slot = &self.slots[idx];
        Entry::new(slot.key(), slot.value(), EntryIndex::new(submap, idx))
    }

    /// View of the slot at `idx` if it currently holds a live entry.
    pub(crate) fn live_entry(&self, submap: usize, idx: usize) -> Option<Entry<'_, K, V>> {
        let slot = self.slots.get(idx)?;
        if slot.state.load(Ordering::Acquire) != OCCUPIED {
            return None;
        }
        // SAFETY: observed OCCUPIED with acquire ordering just above.
        Some(unsafe { self.entry_at(submap, idx) })
    }

    /// First live slot at or after `from`.
    pub(crate) fn next_occupied(&self, from: usize) -> Option<usize> {
        (from..self.slots.len())
            .find(|&idx| self.slots[idx].state.load(Ordering::Acquire) == OCCUPIED)
    }

    pub(crate) fn value_mut(&mut self, idx: usize) -> Option<&mut V> {
        let slot = self.slots.get_mut(idx)?;
        if *slot.state.get_mut() != OCCUPIED {
            return None;
        }
        // SAFETY: OCCUPIED slots hold an initialized value and `&mut self` is exclusive.
        Some(unsafe { slot.value.get_mut().assume_init_mut() })
    }

    /// Drop all entries and reopen the table. Requires exclusive access.
    pub(crate) fn clear(&mut self) {
        for slot in self.slots.iter_mut() {
            slot.reset();
        }
        *self.live.get_mut() = 0;
        *self.erased.get_mut() = 0;
        *self.reserved.get_mut() = 0;
        *self.pending.get_mut() = 0;
        *self.fill.get_mut() = OPEN;
    }

    /// Take one unit of the entry budget.
    #[inline(always)]
    fn reserve(&self) -> bool {
        self.reserved
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                (n < self.max_entries).then_some(n + 1)
            })
            .is_ok()
    }

    /// Wait until no claim is in flight, then seal the table.
    fn await_seal(&self) {
        let mut spins = 0;
        loop {
            match self.fill.load(Ordering::SeqCst) {
                OPEN | SEALED => return,
                _ => {
                    if self.pending.load(Ordering::SeqCst) == 0 {
                        if self
                            .fill
                            .compare_exchange(
                                NO_NEW_INSERTS,
                                SEALED,
                                Ordering::SeqCst,
                                Ordering::SeqCst,
                            )
                            .is_ok()
                        {
                            log::trace!(
                                "sealed submap of {} slots at {} entries",
                                self.capacity(),
                                self.reserved.load(Ordering::Relaxed)
                            );
                        }
                        return;
                    }
                    delay(&mut spins);
                }
            }
        }
    }
}

impl<K, V, P: Probe> HashArray<K, V, P> {
    /// Claim-or-find `key`, building the stored key and the value only if the key is claimed.
    ///
    /// Probing and equality use the lookup form of `key`. Never overwrites a live entry. If
    /// `make` or the key conversion fails or panics, the claim is rolled back and the slot
    /// returns to EMPTY.
    pub(crate) fn insert_internal<S, H, F, E>(
        &self,
        hasher: &H,
        key: S,
        make: F,
    ) -> std::result::Result<Claim<S, F>, E>
    where
        S: KeySource<K>,
        H: KeyHasher<K, S::Lookup>,
        F: FnOnce() -> std::result::Result<V, E>,
    {
        let mut idx = self.home(<H as KeyHasher<K, S::Lookup>>::hash(hasher, key.lookup()));
        let mut probes = 0usize;
        let mut spins = 0;

        loop {
            let slot = &self.slots[idx];
            match slot.state.load(Ordering::Acquire) {
                LOCKED => {
                    // The claim may be for this very key; wait until it resolves.
                    delay(&mut spins);
                    continue;
                }
                OCCUPIED => {
                    // SAFETY: observed OCCUPIED with acquire ordering.
                    if <H as KeyHasher<K, S::Lookup>>::eq(hasher, unsafe { slot.key() }, key.lookup()) {
                        return Ok(Claim::Found(idx));
                    }
                }
                ERASED => {}
                _ => {
                    match self.fill.load(Ordering::SeqCst) {
                        SEALED => {
                            // The slot may have been claimed between the two loads; once
                            // sealed it cannot change from EMPTY anymore.
                            if slot.state.load(Ordering::Acquire) == EMPTY {
                                return Ok(Claim::Full(key, make));
                            }
                            continue;
                        }
                        NO_NEW_INSERTS => {
                            self.await_seal();
                            continue;
                        }
                        _ => {}
                    }

                    self.pending.fetch_add(1, Ordering::SeqCst);
                    if self.fill.load(Ordering::SeqCst) != OPEN {
                        self.pending.fetch_sub(1, Ordering::SeqCst);
                        self.await_seal();
                        continue;
                    }
                    if !self.reserve() {
                        let _ = self.fill.compare_exchange(
                            OPEN,
                            NO_NEW_INSERTS,
                            Ordering::SeqCst,
                            Ordering::SeqCst,
                        );
                        self.pending.fetch_sub(1, Ordering::SeqCst);
                        // Claims still in flight may publish this key; re-read after they settle.
                        self.await_seal();
                        continue;
                    }
                    if slot
                        .state
                        .compare_exchange(EMPTY, LOCKED, Ordering::Acquire, Ordering::Relaxed)
                        .is_err()
                    {
                        self.reserved.fetch_sub(1, Ordering::Relaxed);
                        self.pending.fetch_sub(1, Ordering::SeqCst);
                        continue;
                    }
                    return self.publish_claimed(idx, key, make).map(|()| Claim::Inserted(idx));
                }
            }

            probes += 1;
            if probes > self.mask {
                return Ok(Claim::Full(key, make));
            }
            idx = P::next(idx, probes, self.mask);
        }
    }

    /// Fill a LOCKED slot and publish it as OCCUPIED.
    fn publish_claimed<S, F, E>(&self, idx: usize, key: S, make: F) -> std::result::Result<(), E>
    where
        S: KeySource<K>,
        F: FnOnce() -> std::result::Result<V, E>,
    {
        let mut claim = ClaimGuard {
            array: self,
            idx,
            published: false,
        };
        let value = make()?;
        let key = key.into_key();

        let slot = &self.slots[idx];
        // SAFETY: this thread won the EMPTY -> LOCKED transition, so it is the only writer and
        // no reader touches the contents of a LOCKED slot.
        unsafe {
            (*slot.key.get()).write(key);
            (*slot.value.get()).write(value);
        }
        self.live.fetch_add(1, Ordering::Relaxed);
        slot.state.store(OCCUPIED, Ordering::Release);
        claim.published = true;
        Ok(())
    }

    /// Slot holding the live entry for `key`.
    ///
    /// LOCKED slots are probed past: a claim still in flight has not been inserted yet, and
    /// a key published past a slot can never sit behind one that is LOCKED now.
    pub(crate) fn find_internal<Q, H>(&self, hasher: &H, key: &Q) -> Option<usize>
    where
        Q: ?Sized,
        H: KeyHasher<K, Q>,
    {
        let mut idx = self.home(<H as KeyHasher<K, Q>>::hash(hasher, key));
        let mut probes = 0usize;

        loop {
            let slot = &self.slots[idx];
            match slot.state.load(Ordering::Acquire) {
                EMPTY => return None,
                OCCUPIED => {
                    // SAFETY: observed OCCUPIED with acquire ordering.
                    if <H as KeyHasher<K, Q>>::eq(hasher, unsafe { slot.key() }, key) {
                        return Some(idx);
                    }
                }
                _ => {}
            }

            probes += 1;
            if probes > self.mask {
                return None;
            }
            idx = P::next(idx, probes, self.mask);
        }
    }

    /// Erase the live entry for `key`. Exactly one of several racing erasers wins.
    pub(crate) fn erase_internal<Q, H>(&self, hasher: &H, key: &Q) -> bool
    where
        Q: ?Sized,
        H: KeyHasher<K, Q>,
    {
        let Some(idx) = self.find_internal(hasher, key) else {
            return false;
        };
        let erased = self.slots[idx]
            .state
            .compare_exchange(OCCUPIED, ERASED, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok();
        if erased {
            self.live.fetch_sub(1, Ordering::Relaxed);
            self.erased.fetch_add(1, Ordering::Relaxed);
        }
        erased
    }
}

/// Rolls a claim back unless it was published, and ends the pending claim either way.
struct ClaimGuard<'a, K, V, P> {
    array: &'a HashArray<K, V, P>,
    idx: usize,
    published: bool,
}

impl<K, V, P> Drop for ClaimGuard<'_, K, V, P> {
    fn drop(&mut self) {
        if !self.published {
            self.array.slots[self.idx]
                .state
                .store(EMPTY, Ordering::Release);
            self.array.reserved.fetch_sub(1, Ordering::Relaxed);
        }
        self.array.pending.fetch_sub(1, Ordering::SeqCst);
    }
}

// ================================================================================================
// STANDALONE ARRAY
// ================================================================================================

/// A single fixed-capacity concurrent hash table.
///
/// This is the building block `AtomicHashMap` chains together. Used on its own it never
/// grows: once `max_entries` keys (live or erased) have been inserted, inserts of new keys
/// return `None`. Erased slots are not reused until [`clear`](Self::clear).
///
/// Share it across threads by reference or through an `Arc`.
pub struct AtomicHashArray<K, V, H = StdHash, P = LinearProbe> {
    table: HashArray<K, V, P>,
    config: Config,
    hasher: H,
}

impl<K, V> AtomicHashArray<K, V> {
    /// Create an array sized for `size_estimate` entries with the default config.
    ///
    /// # Panics
    ///
    /// Panics if the slots cannot be allocated.
    pub fn new(size_estimate: usize) -> Self {
        match Self::with_config(size_estimate, Config::default()) {
            Ok(array) => array,
            Err(err) => panic!("AtomicHashArray::new: {err}"),
        }
    }

    pub fn with_config(size_estimate: usize, config: Config) -> Result<Self> {
        Self::with_config_and_hasher(size_estimate, config, StdHash::default())
    }
}

impl<K, V, H, P> AtomicHashArray<K, V, H, P> {
    /// Create an array with an explicit config and key hasher.
    pub fn with_config_and_hasher(size_estimate: usize, config: Config, hasher: H) -> Result<Self> {
        config.validate()?;
        let table = HashArray::try_new(config.capacity_for(size_estimate), &config)?;
        Ok(Self {
            table,
            config,
            hasher,
        })
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of slots.
    pub fn capacity(&self) -> usize {
        self.table.capacity()
    }

    /// Number of inserts (live or later erased) the array admits.
    pub fn max_entries(&self) -> usize {
        self.table.max_entries()
    }

    pub fn num_erases(&self) -> usize {
        self.table.num_erases()
    }

    /// New keys that can still be inserted before the array is full.
    pub fn space_remaining(&self) -> usize {
        self.table.space_remaining()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn hasher(&self) -> &H {
        &self.hasher
    }

    /// Entry at an index previously returned by this array.
    pub fn find_at(&self, index: EntryIndex) -> Option<Entry<'_, K, V>> {
        if index.submap() != 0 {
            return None;
        }
        self.table.live_entry(0, index.offset())
    }

    /// Iterate live entries in slot order.
    pub fn iter(&self) -> Iter<'_, K, V, P> {
        Iter::single(&self.table)
    }

    /// Remove every entry.
    pub fn clear(&mut self) {
        self.table.clear();
    }
}

impl<K, V, H, P: Probe> AtomicHashArray<K, V, H, P> {
    /// Insert `key` if absent.
    ///
    /// Returns the entry for `key` and whether this call inserted it. An existing entry is
    /// returned unchanged. `None` means the key is absent and the array is full.
    pub fn insert(&self, key: K, value: V) -> Option<(Entry<'_, K, V>, bool)>
    where
        H: KeyHasher<K>,
    {
        self.insert_with(key, || value)
    }

    /// Like [`insert`](Self::insert), building the value only if the key is claimed.
    ///
    /// If `f` panics the claim is rolled back before the panic propagates.
    /// `f` must not access this array.
    pub fn insert_with<F>(&self, key: K, f: F) -> Option<(Entry<'_, K, V>, bool)>
    where
        H: KeyHasher<K>,
        F: FnOnce() -> V,
    {
        match self.try_insert_with(key, || Ok::<V, std::convert::Infallible>(f())) {
            Ok(outcome) => outcome,
            Err(never) => match never {},
        }
    }

    /// Like [`insert_with`](Self::insert_with) with a fallible constructor.
    ///
    /// On `Err` the key is left absent and the error is returned.
    pub fn try_insert_with<F, E>(
        &self,
        key: K,
        f: F,
    ) -> std::result::Result<Option<(Entry<'_, K, V>, bool)>, E>
    where
        H: KeyHasher<K>,
        F: FnOnce() -> std::result::Result<V, E>,
    {
        let outcome = match self.table.insert_internal(&self.hasher, OwnedKey(key), f)? {
            // SAFETY: the slot was published by this call or observed OCCUPIED.
            Claim::Inserted(idx) => Some((unsafe { self.table.entry_at(0, idx) }, true)),
            Claim::Found(idx) => Some((unsafe { self.table.entry_at(0, idx) }, false)),
            Claim::Full(..) => None,
        };
        Ok(outcome)
    }

    /// Insert by a borrowed key, allocating the owned key only if the entry is new.
    pub fn insert_ref<Q>(&self, key: &Q, value: V) -> Option<(Entry<'_, K, V>, bool)>
    where
        Q: ?Sized + ToOwned<Owned = K>,
        H: KeyHasher<K, Q>,
    {
        let source = BorrowedKey {
            key,
            to_key: |q: &Q| q.to_owned(),
        };
        let make = || Ok::<V, std::convert::Infallible>(value);
        match self.table.insert_internal(&self.hasher, source, make) {
            // SAFETY: the slot was published by this call or observed OCCUPIED.
            Ok(Claim::Inserted(idx)) => Some((unsafe { self.table.entry_at(0, idx) }, true)),
            Ok(Claim::Found(idx)) => Some((unsafe { self.table.entry_at(0, idx) }, false)),
            Ok(Claim::Full(..)) => None,
            Err(never) => match never {},
        }
    }

    pub fn find<Q>(&self, key: &Q) -> Option<Entry<'_, K, V>>
    where
        Q: ?Sized,
        H: KeyHasher<K, Q>,
    {
        let idx = self.table.find_internal(&self.hasher, key)?;
        // SAFETY: find_internal only returns slots observed OCCUPIED.
        Some(unsafe { self.table.entry_at(0, idx) })
    }

    /// Erase `key`, returning whether an entry was removed.
    pub fn erase<Q>(&self, key: &Q) -> bool
    where
        Q: ?Sized,
        H: KeyHasher<K, Q>,
    {
        self.table.erase_internal(&self.hasher, key)
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
        self.table.find_internal(&self.hasher, key).is_some()
    }

    pub fn get_mut<Q>(&mut self, key: &Q) -> Option<&mut V>
    where
        Q: ?Sized,
        H: KeyHasher<K, Q>,
    {
        let idx = self.table.find_internal(&self.hasher, key)?;
        self.table.value_mut(idx)
    }
}

impl<'a, K, V, H, P> IntoIterator for &'a AtomicHashArray<K, V, H, P> {
    type Item = Entry<'a, K, V>;
    type IntoIter = Iter<'a, K, V, P>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl<K: fmt::Debug, V: fmt::Debug, H, P> fmt::Debug for AtomicHashArray<K, V, H, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.iter().map(|e| (e.key(), e.value())))
            .finish()
    }
}

// ================================================================================================
// UTILITY FUNCTIONS
// ================================================================================================

#[inline(always)]
fn try_spin(spins: &mut i32) -> bool {
    if *spins < SPIN_BEFORE_YIELD {
        *spins += *spins + 1;
        std::hint::spin_loop();
        true
    } else {
        false
    }
}

#[inline(always)]
pub(crate) fn delay(spins: &mut i32) {
    if !try_spin(spins) {
        *spins = 0;
        thread::yield_now();
    }
}
