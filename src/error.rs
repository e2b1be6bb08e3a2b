//! Error types for map construction and growth.

use thiserror::Error;

/// Errors reported by [`AtomicHashMap`](crate::AtomicHashMap) and
/// [`AtomicHashArray`](crate::AtomicHashArray).
///
/// A full submap is never reported here: the map recovers from it by growing.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The configuration passed to a constructor is out of range.
    #[error("invalid configuration: {message}")]
    InvalidConfig {
        /// What was wrong with it
        message: String,
    },

    /// Allocating the slots of a new submap failed.
    #[error("submap allocation failed: requested {slots} slots")]
    Allocation {
        /// Number of slots requested
        slots: usize,
    },

    /// Every submap index is in use and all of them are full.
    #[error("map is full: all {submaps} submaps are at max load")]
    MapFull {
        /// Number of submaps in the exhausted chain
        submaps: usize,
    },
}

impl Error {
    /// Create an invalid configuration error
    pub fn invalid_config<S: Into<String>>(message: S) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }
}

/// Error returned by the `try_insert_with` family.
///
/// `Value` carries the error of the caller's value constructor. When it is
/// returned the claimed slot has been rolled back and the key is not present.
#[derive(Error, Debug)]
pub enum InsertError<E> {
    /// The map could not make room for the entry
    #[error(transparent)]
    Map(#[from] Error),

    /// The value constructor failed
    #[error("value construction failed: {0}")]
    Value(E),
}

impl<E> InsertError<E> {
    /// Returns the constructor's error, if that is what failed.
    pub fn into_value(self) -> Option<E> {
        match self {
            InsertError::Value(e) => Some(e),
            InsertError::Map(_) => None,
        }
    }
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;
