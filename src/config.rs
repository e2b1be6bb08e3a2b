use crate::error::{Error, Result};

/// Default fraction of a submap's slots that may hold entries before it is full.
pub const DEFAULT_MAX_LOAD_FACTOR: f64 = 0.8;

/// Default ratio between the capacity of a new submap and its predecessor.
pub const DEFAULT_GROWTH_FACTOR: f64 = 2.0;

/// Settings shared by every submap of a map.
///
/// `max_load_factor` bounds how many slots of a submap may be used (live or
/// erased) before it stops accepting new keys. `growth_factor` scales the
/// capacity of each newly published submap relative to the previous one; `1.0`
/// grows by a fixed increment, producing many equally sized submaps.
///
/// A map chains at most [`MAX_SUBMAPS`](crate::MAX_SUBMAPS) submaps. With
/// `growth_factor = 1.0` that caps it at `MAX_SUBMAPS` times the first
/// submap's entry budget (`floor(capacity * max_load_factor)`), after which
/// inserts of new keys return [`Error::MapFull`]. A map created with
/// `with_config(100, Config::default().growth_factor(1.0))` holds 128-slot
/// submaps of 102 entries each, so at most 3264 keys.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Config {
    pub max_load_factor: f64,
    pub growth_factor: f64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_load_factor: DEFAULT_MAX_LOAD_FACTOR,
            growth_factor: DEFAULT_GROWTH_FACTOR,
        }
    }
}

impl Config {
    pub fn max_load_factor(mut self, max_load_factor: f64) -> Self {
        self.max_load_factor = max_load_factor;
        self
    }

    /// Any value above `1.0` at least doubles each submap, since capacities are
    /// powers of two. See the type docs for the `1.0` ceiling.
    pub fn growth_factor(mut self, growth_factor: f64) -> Self {
        self.growth_factor = growth_factor;
        self
    }

    /// Check that both factors are in range.
    pub fn validate(&self) -> Result<()> {
        if !(self.max_load_factor > 0.0 && self.max_load_factor < 1.0) {
            return Err(Error::invalid_config(format!(
                "max_load_factor must be in (0, 1), got {}",
                self.max_load_factor
            )));
        }
        if !self.growth_factor.is_finite() || self.growth_factor < 1.0 {
            return Err(Error::invalid_config(format!(
                "growth_factor must be a finite value >= 1, got {}",
                self.growth_factor
            )));
        }
        Ok(())
    }

    /// Slot count of a submap sized to hold `size_estimate` entries at max load.
    pub(crate) fn capacity_for(&self, size_estimate: usize) -> usize {
        let wanted = (size_estimate as f64 / self.max_load_factor).ceil() as usize;
        round_capacity(wanted)
    }

    /// Slot count of the submap published after one of `prev_capacity` slots.
    pub(crate) fn next_capacity(&self, prev_capacity: usize) -> usize {
        let wanted = (prev_capacity as f64 * self.growth_factor).ceil() as usize;
        round_capacity(wanted.max(prev_capacity))
    }

    /// Number of entries a submap of `capacity` slots admits.
    pub(crate) fn max_entries(&self, capacity: usize) -> usize {
        let max = (capacity as f64 * self.max_load_factor) as usize;
        max.clamp(1, capacity - 1)
    }
}

/// Smallest submap; leaves one slot free at any load factor.
const MIN_CAPACITY: usize = 2;

fn round_capacity(wanted: usize) -> usize {
    wanted
        .max(MIN_CAPACITY)
        .checked_next_power_of_two()
        .unwrap_or(usize::MAX / 2 + 1)
}
