//! atomicmap: a growable concurrent hash map built from fixed-capacity open-addressed
//! submaps, with lock-free lookups and CAS-published growth.
//!
//! Inserts never overwrite, values never move, and entries are addressable by a stable
//! [`EntryIndex`]. Erase marks slots as tombstones that are only reclaimed by `clear`,
//! which makes the map a good fit for insert-mostly workloads (interning tables, id
//! registries, caches that are rebuilt rather than evicted).
//!
//! ```
//! use atomicmap_rs::AtomicHashMap;
//!
//! let map: AtomicHashMap<String, u32> = AtomicHashMap::new(64);
//! let (entry, inserted) = map.insert("one".to_string(), 1).unwrap();
//! assert!(inserted);
//! assert_eq!(*entry.value(), 1);
//!
//! // Later inserts of the same key keep the first value. `insert_ref` looks the
//! // key up by `&str` and only allocates a `String` when it is new.
//! let (entry, inserted) = map.insert_ref("one", 100).unwrap();
//! assert!(!inserted);
//! assert_eq!(*entry.value(), 1);
//!
//! assert_eq!(map.find("one").map(|e| *e.value()), Some(1));
//! assert!(map.erase("one"));
//! assert!(map.find("one").is_none());
//! ```

mod array;
mod config;
mod error;
mod hasher;
mod iter;
mod map;
mod probe;

pub use array::AtomicHashArray;
pub use config::{Config, DEFAULT_GROWTH_FACTOR, DEFAULT_MAX_LOAD_FACTOR};
pub use error::{Error, InsertError, Result};
pub use hasher::{KeyHasher, StdHash};
pub use iter::{Entry, EntryIndex, Iter};
pub use map::{AtomicHashMap, QuadraticProbingAtomicHashMap, DEFAULT_SIZE_ESTIMATE, MAX_SUBMAPS};
pub use probe::{LinearProbe, Probe, QuadraticProbe};
