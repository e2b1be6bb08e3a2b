//! Probe sequences for locating a key's slot.
//!
//! Tables are always a power of two in size, so both sequences reduce the
//! index with `mask` and reach every slot before repeating.

/// Computes the next slot to examine.
///
/// `probes` is the number of slots already examined (at least 1 when called).
pub trait Probe {
    fn next(idx: usize, probes: usize, mask: usize) -> usize;
}

/// Scan consecutive slots, wrapping at the end of the table.
#[derive(Debug, Clone, Copy, Default)]
pub struct LinearProbe;

impl Probe for LinearProbe {
    #[inline(always)]
    fn next(idx: usize, _probes: usize, mask: usize) -> usize {
        (idx + 1) & mask
    }
}

/// Jump by growing strides (1, 2, 3, ...), i.e. triangular offsets from the home slot.
///
/// Breaks up the primary clusters linear probing builds under skewed hashes,
/// at the cost of cache locality.
#[derive(Debug, Clone, Copy, Default)]
pub struct QuadraticProbe;

impl Probe for QuadraticProbe {
    #[inline(always)]
    fn next(idx: usize, probes: usize, mask: usize) -> usize {
        (idx + probes) & mask
    }
}
