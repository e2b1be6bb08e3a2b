//! Entry views, entry indices and iteration over live entries.

use std::fmt;
use std::iter::FusedIterator;
use std::sync::atomic::AtomicPtr;

use crate::array::HashArray;
use crate::probe::LinearProbe;

const SUBMAP_SHIFT: u32 = 48;
const OFFSET_MASK: u64 = (1 << SUBMAP_SHIFT) - 1;

/// Stable position of an entry: submap number and slot offset packed into one word.
///
/// An index stays valid until the map is cleared or dropped, even if the entry is
/// erased in between (lookups through it then return `None`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryIndex(u64);

impl EntryIndex {
    pub(crate) fn new(submap: usize, offset: usize) -> Self {
        debug_assert!((offset as u64) <= OFFSET_MASK);
        Self(((submap as u64) << SUBMAP_SHIFT) | offset as u64)
    }

    /// Rebuild an index from [`EntryIndex::to_raw`].
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn to_raw(self) -> u64 {
        self.0
    }

    pub fn submap(self) -> usize {
        (self.0 >> SUBMAP_SHIFT) as usize
    }

    pub fn offset(self) -> usize {
        (self.0 & OFFSET_MASK) as usize
    }
}

/// Shared view of one entry.
pub struct Entry<'a, K, V> {
    key: &'a K,
    value: &'a V,
    index: EntryIndex,
}

impl<'a, K, V> Entry<'a, K, V> {
    pub(crate) fn new(key: &'a K, value: &'a V, index: EntryIndex) -> Self {
        Self { key, value, index }
    }

    pub fn key(&self) -> &'a K {
        self.key
    }

    pub fn value(&self) -> &'a V {
        self.value
    }

    /// Where the entry lives; look it up again with `find_at`.
    pub fn index(&self) -> EntryIndex {
        self.index
    }

    pub fn pair(&self) -> (&'a K, &'a V) {
        (self.key, self.value)
    }
}

impl<K, V> Clone for Entry<'_, K, V> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<K, V> Copy for Entry<'_, K, V> {}

impl<K: fmt::Debug, V: fmt::Debug> fmt::Debug for Entry<'_, K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entry")
            .field("key", self.key)
            .field("value", self.value)
            .field("index", &self.index)
            .finish()
    }
}

/// Iterator over live entries, submap by submap in slot order.
///
/// Weakly consistent under concurrent writers: every entry that stays live for the whole
/// iteration is yielded exactly once, entries inserted or erased meanwhile may or may not
/// be. Empty submaps are skipped.
pub struct Iter<'a, K, V, P = LinearProbe> {
    current: Option<&'a HashArray<K, V, P>>,
    submap: usize,
    slot: usize,
    chain: &'a [AtomicPtr<HashArray<K, V, P>>],
}

impl<'a, K, V, P> Iter<'a, K, V, P> {
    /// Iterate a standalone table.
    pub(crate) fn single(table: &'a HashArray<K, V, P>) -> Self {
        Self {
            current: Some(table),
            submap: 0,
            slot: 0,
            chain: &[],
        }
    }

    /// Iterate a chain of submaps starting at `start`, inclusive.
    pub(crate) fn chain(chain: &'a [AtomicPtr<HashArray<K, V, P>>], start: EntryIndex) -> Self {
        let submap = start.submap();
        Self {
            current: chain.get(submap).and_then(HashArray::load),
            submap,
            slot: start.offset(),
            chain,
        }
    }
}

impl<'a, K, V, P> Iterator for Iter<'a, K, V, P> {
    type Item = Entry<'a, K, V>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let table = self.current?;
            if let Some(idx) = table.next_occupied(self.slot) {
                self.slot = idx + 1;
                // SAFETY: next_occupied observed the slot OCCUPIED.
                return Some(unsafe { table.entry_at(self.submap, idx) });
            }
            self.submap += 1;
            self.slot = 0;
            self.current = self.chain.get(self.submap).and_then(HashArray::load);
        }
    }
}

impl<K, V, P> FusedIterator for Iter<'_, K, V, P> {}
