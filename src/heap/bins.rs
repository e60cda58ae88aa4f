//! Size-segregated free lists for the embedded heap (spec.md §4.10).
//!
//! Grounded in `original_source/EHEAP/eheap.h`'s two-array bin scheme: a
//! "small bin array" (SBA) of exact-size bins for common small allocations,
//! and an "upper bin array" (UBA) of ascending power-of-two-ish size-range
//! bins for everything larger, each original `HBCB` bin head reduced here to
//! a single `Option<u32>` free-list head (the list links themselves live on
//! the chunks, via [`super::chunk::ChunkView::bin_next`]/`bin_prev`). A
//! [`crate::utils::prio_bitmap::PrioBitmap`]-style occupancy summary (the
//! same two-level bit-scan idea `original_source`'s `EHV.fl[]`/`topx` use)
//! lets a search skip straight to the smallest non-empty bin able to satisfy
//! a request, matching spec.md §4.10's "first-fit within a size class,
//! best-fit across classes" allocation order.

use crate::config::{HEAP_SBA_LEN, HEAP_UBA_LEN};
use crate::heap::chunk::MIN_FREE_CHUNK;

/// A chunk of exactly this size (and every multiple of 8 above it, up to the
/// top of the SBA range) gets an exact-size bin; anything larger falls into
/// a UBA range bin.
const SBA_STEP: u32 = 8;
const SBA_MAX: u32 = MIN_FREE_CHUNK + (HEAP_SBA_LEN as u32 - 1) * SBA_STEP;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinIndex {
    Sba(usize),
    Uba(usize),
}

impl BinIndex {
    /// Flatten to a single index for storage on the chunk itself
    /// ([`super::chunk::ChunkView::bin_index`]), SBA bins first.
    pub fn to_flat(self) -> u32 {
        match self {
            BinIndex::Sba(i) => i as u32,
            BinIndex::Uba(i) => (HEAP_SBA_LEN + i) as u32,
        }
    }

    pub fn from_flat(flat: u32) -> Self {
        let flat = flat as usize;
        if flat < HEAP_SBA_LEN {
            BinIndex::Sba(flat)
        } else {
            BinIndex::Uba(flat - HEAP_SBA_LEN)
        }
    }
}

/// Which bin a free chunk of the given total (header-inclusive) size must be
/// filed in. `size` is assumed already 8-byte aligned and at least
/// `MIN_FREE_CHUNK` (a chunk too small to be freed standalone is kept as
/// spare space on its neighbor instead, see spec.md §4.10 "Splitting").
pub fn bin_for_size(size: u32) -> BinIndex {
    if size <= SBA_MAX {
        BinIndex::Sba(((size - MIN_FREE_CHUNK) / SBA_STEP) as usize)
    } else {
        // UBA bins double in range per step, starting just above SBA_MAX, so
        // a search of bin k is guaranteed to find only chunks usable for a
        // request that rounded up to bin k's lower bound.
        let mut bound = SBA_MAX;
        let mut idx = 0usize;
        while idx + 1 < HEAP_UBA_LEN && size > bound {
            bound = bound.saturating_mul(2).max(bound + SBA_STEP);
            idx += 1;
        }
        BinIndex::Uba(idx)
    }
}

/// For an allocation search: the lowest-indexed bin guaranteed to hold only
/// chunks large enough for `size` (so any chunk popped from it, or a higher
/// bin, satisfies the request without a per-chunk size check other than the
/// exact SBA match).
pub fn search_start(size: u32) -> BinIndex {
    bin_for_size(size)
}

pub struct BinSet {
    sba: [Option<u32>; HEAP_SBA_LEN],
    uba: [Option<u32>; HEAP_UBA_LEN],
    /// Bit `i` set means SBA bin `i` is non-empty (bits `HEAP_SBA_LEN..`
    /// mirror UBA occupancy), letting [`Self::find_at_or_above`] skip empty
    /// bins in one step instead of a linear scan (`EHV` keeps the analogous
    /// summary word in the original).
    occupied: u64,
}

impl BinSet {
    pub const fn new() -> Self {
        Self {
            sba: [None; HEAP_SBA_LEN],
            uba: [None; HEAP_UBA_LEN],
            occupied: 0,
        }
    }

    fn head(&self, idx: BinIndex) -> &Option<u32> {
        match idx {
            BinIndex::Sba(i) => &self.sba[i],
            BinIndex::Uba(i) => &self.uba[i],
        }
    }

    fn head_mut(&mut self, idx: BinIndex) -> &mut Option<u32> {
        match idx {
            BinIndex::Sba(i) => &mut self.sba[i],
            BinIndex::Uba(i) => &mut self.uba[i],
        }
    }

    pub fn head_of(&self, idx: BinIndex) -> Option<u32> {
        *self.head(idx)
    }

    pub fn set_head(&mut self, idx: BinIndex, off: Option<u32>) {
        let flat = idx.to_flat();
        if off.is_some() {
            self.occupied |= 1 << flat;
        } else {
            self.occupied &= !(1 << flat);
        }
        *self.head_mut(idx) = off;
    }

    /// Smallest non-empty bin at or above `from`, scanning SBA then UBA, for
    /// a best-fit search that starts at `search_start(requested_size)`.
    pub fn find_at_or_above(&self, from: BinIndex) -> Option<BinIndex> {
        let from_flat = from.to_flat();
        let mask = self.occupied & !((1u64 << from_flat) - 1);
        if mask == 0 {
            return None;
        }
        Some(BinIndex::from_flat(mask.trailing_zeros()))
    }

    pub fn is_empty(&self) -> bool {
        self.occupied == 0
    }
}

impl Default for BinSet {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;
    use std::collections::BTreeSet;

    /// Checks `find_at_or_above` against a plain `BTreeSet` of occupied flat
    /// indices under random set/clear sequences.
    #[quickcheck]
    fn find_at_or_above_matches_btreeset_reference(ops: Vec<(usize, bool)>) -> bool {
        let total = HEAP_SBA_LEN + HEAP_UBA_LEN;
        let mut bins = BinSet::new();
        let mut model: BTreeSet<usize> = BTreeSet::new();

        for (i, present) in ops {
            let flat = i % total;
            let idx = BinIndex::from_flat(flat as u32);
            if present {
                bins.set_head(idx, Some(1));
                model.insert(flat);
            } else {
                bins.set_head(idx, None);
                model.remove(&flat);
            }
            for from in 0..total {
                let expected = model.range(from..).next().copied();
                let got = bins
                    .find_at_or_above(BinIndex::from_flat(from as u32))
                    .map(|b| b.to_flat() as usize);
                if got != expected {
                    return false;
                }
            }
        }
        true
    }

    #[test]
    fn exact_sba_size_maps_to_its_own_bin() {
        assert_eq!(bin_for_size(MIN_FREE_CHUNK), BinIndex::Sba(0));
        assert_eq!(bin_for_size(MIN_FREE_CHUNK + 8), BinIndex::Sba(1));
    }

    #[test]
    fn oversize_falls_into_uba() {
        match bin_for_size(SBA_MAX + 8) {
            BinIndex::Uba(_) => {}
            other => panic!("expected Uba, got {other:?}"),
        }
    }

    #[test]
    fn find_at_or_above_skips_empty_bins() {
        let mut bins = BinSet::new();
        bins.set_head(BinIndex::Sba(5), Some(100));
        assert_eq!(bins.find_at_or_above(BinIndex::Sba(0)), Some(BinIndex::Sba(5)));
        assert_eq!(bins.find_at_or_above(BinIndex::Sba(6)), None);
    }

    #[test]
    fn flat_round_trips() {
        for idx in [BinIndex::Sba(3), BinIndex::Uba(2)] {
            assert_eq!(BinIndex::from_flat(idx.to_flat()), idx);
        }
    }
}
