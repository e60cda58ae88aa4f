//! The embedded heap: a size-binned best-fit allocator with a donor chunk,
//! a top chunk, automatic merging, optional spare-space tracking, and
//! on-line integrity scan/repair (spec.md §4.10, 25% of the core's budget).
//!
//! Grounded throughout in `original_source/EHEAP/eheap.c`/`eheap.h`'s
//! `eh_Init`/`eh_Malloc`/`eh_Free`/`eh_Realloc`/`eh_Scan`/`eh_BinScan`/
//! `eh_BinSort`. The chunk header packing is documented in [`chunk`]; the
//! bin layout and occupancy bitmap in [`bins`].
//!
//! Simplification, noted here rather than scattered across the module:
//! every chunk (including the start/end sentinels) carries an explicit
//! `size` field (see [`chunk::ChunkView`]'s doc comment) rather than the
//! original's implicit "size = next.fl − this" trick, and the start/end
//! sentinels use the same header layout as a real chunk instead of a
//! hand-rolled 8-byte shape. Both cost a few bytes per heap and buy a
//! single accessor type with no special cases.

pub mod bins;
pub mod chunk;

use crate::error::{HeapAllocError, HeapScanError};
use bins::BinSet;
use chunk::ChunkView;

bitflags::bitflags! {
    pub struct HeapMode: u32 {
        /// Probe the donor chunk for an exact-size small allocation before
        /// falling back to the bins (spec.md §4.10 step 2).
        const DONOR_USE    = 1 << 0;
        /// Sweep and merge adjacent free chunks before failing an
        /// allocation with no fit (spec.md §4.10 step 6).
        const AUTO_RECOVER = 1 << 1;
        /// Merge a freed chunk with its physical neighbors (spec.md §4.10
        /// "Free").
        const MERGE        = 1 << 2;
    }
}

impl Default for HeapMode {
    fn default() -> Self {
        HeapMode::DONOR_USE | HeapMode::AUTO_RECOVER | HeapMode::MERGE
    }
}

/// Sentinel `back_link` value meaning "no physically-previous chunk" (the
/// start sentinel). Offsets are `u32`s into a buffer realistically well
/// under 4 GiB, so this can never collide with a real chunk offset.
const NO_PREV: u32 = u32::MAX;

/// Fill byte written across a chunk's body when it is freed in a
/// debug-mode heap, so a use-after-free shows up as a recognizable pattern
/// under a debugger (`original_source/EHEAP/eheap.h`'s `EH_FREE_FILL`).
const FREE_FILL: u8 = 0xEF;

/// Minimum byte alignment guaranteed for a heap's backing region, matching
/// spec.md §4.10's 8-byte chunk alignment and giving `malloc_aligned`'s
/// offset arithmetic (§4.10 "Alignment") a real base address to be relative
/// to — an `[u8; SIZE]` array has no alignment guarantee of its own beyond
/// 1, so without this a chunk offset that is a multiple of `align` would
/// not actually be aligned in memory. Grounded in the teacher's
/// `utils::aligned_storage::AlignedStorage`, which solves the identical
/// problem the same way: a leading zero-sized `elain::Align<N>` field.
const HEAP_BASE_ALIGN: usize = 4096;

/// One contiguous heap region of `SIZE` bytes, laid out as
/// start-sentinel / donor chunk / top chunk / end-sentinel at creation
/// time (spec.md §4.10).
pub struct Heap<const SIZE: usize> {
    _align: elain::Align<HEAP_BASE_ALIGN>,
    buf: [u8; SIZE],
    bins: BinSet,
    /// Offset of the donor chunk, or `None` once it has been fully calved
    /// away or merged into a neighbor.
    donor: Option<u32>,
    /// Offset of the top (wilderness) chunk, or `None` once exhausted.
    top: Option<u32>,
    mode: HeapMode,
    used: u32,
    peak_used: u32,
}

/// Diagnostic snapshot returned by [`Heap::peek`] (spec.md §6 `Heap: …
/// Peek`).
#[derive(Debug, Clone, Copy, Default)]
pub struct HeapPeek {
    pub heap_size: u32,
    pub used: u32,
    pub peak_used: u32,
    pub donor_size: u32,
    pub top_size: u32,
}

/// Diagnostic snapshot of a single chunk (`ChunkPeek`).
#[derive(Debug, Clone, Copy)]
pub struct ChunkPeek {
    pub offset: u32,
    pub size: u32,
    pub inuse: bool,
    pub debug: bool,
    pub spare_space: bool,
}

/// Diagnostic snapshot of a single bin (`BinPeek`).
#[derive(Debug, Clone, Copy)]
pub struct BinPeek {
    pub head: Option<u32>,
    pub count: u32,
}

impl<const SIZE: usize> Heap<SIZE> {
    /// `Init`: lay out a fresh heap with a donor chunk of `donor_size`
    /// bytes calved from the bottom and the remaining space as the top
    /// chunk (spec.md §4.10 "Initially a donor chunk of configured size is
    /// calved from the bottom, and all remaining space is the top chunk").
    pub fn new(donor_size: u32) -> Self {
        let size = SIZE as u32;
        let sentinel = chunk::HDR_COMMON;
        assert!(
            size > 2 * sentinel + donor_size,
            "heap too small for its sentinels and donor chunk"
        );
        let donor_size = chunk::align8(donor_size);
        let start_off = 0u32;
        let donor_off = sentinel;
        let top_off = donor_off + donor_size;
        let end_off = size - sentinel;
        let top_size = end_off - top_off;

        let mut buf = [0u8; SIZE];
        ChunkView::set_size(&mut buf, start_off, sentinel);
        ChunkView::set_fl(&mut buf, start_off, donor_off);
        ChunkView::set_back_link_and_flags(&mut buf, start_off, NO_PREV & !0x7, chunk::ChunkFlags::INUSE);

        ChunkView::set_size(&mut buf, donor_off, donor_size);
        ChunkView::set_fl(&mut buf, donor_off, top_off);
        ChunkView::set_back_link_and_flags(&mut buf, donor_off, start_off, chunk::ChunkFlags::empty());

        ChunkView::set_size(&mut buf, top_off, top_size);
        ChunkView::set_fl(&mut buf, top_off, end_off);
        ChunkView::set_back_link_and_flags(&mut buf, top_off, donor_off, chunk::ChunkFlags::empty());

        ChunkView::set_size(&mut buf, end_off, sentinel);
        ChunkView::set_fl(&mut buf, end_off, end_off);
        ChunkView::set_back_link_and_flags(&mut buf, end_off, top_off, chunk::ChunkFlags::INUSE);

        Self {
            _align: elain::Align::NEW,
            buf,
            bins: BinSet::new(),
            donor: (donor_size > 0).then_some(donor_off),
            top: (top_size > 0).then_some(top_off),
            mode: HeapMode::default(),
            used: 0,
            peak_used: 0,
        }
    }

    /// `Set`: reconfigure donor-use/auto-recover/merge behavior at run
    /// time.
    pub fn set_mode(&mut self, mode: HeapMode) {
        self.mode = mode;
    }

    fn end_off(&self) -> u32 {
        SIZE as u32 - chunk::HDR_COMMON
    }

    fn is_special(&self, off: u32) -> bool {
        self.donor == Some(off) || self.top == Some(off)
    }

    fn has_next(&self, off: u32) -> bool {
        let fl = ChunkView::fl(&self.buf, off);
        fl != off && fl < self.end_off()
    }

    fn has_prev(&self, off: u32) -> bool {
        ChunkView::back_link(&self.buf, off) != NO_PREV & !0x7
    }

    fn is_free(&self, off: u32) -> bool {
        !ChunkView::is_inuse(&self.buf, off)
    }

    fn insert_free(&mut self, off: u32) {
        let size = ChunkView::size(&self.buf, off);
        let idx = bins::bin_for_size(size);
        let old_head = self.bins.head_of(idx);
        ChunkView::set_bin_next(&mut self.buf, off, old_head);
        ChunkView::set_bin_prev(&mut self.buf, off, None);
        if let Some(h) = old_head {
            ChunkView::set_bin_prev(&mut self.buf, h, Some(off));
        }
        self.bins.set_head(idx, Some(off));
        ChunkView::set_bin_index(&mut self.buf, off, idx.to_flat());
    }

    fn remove_free(&mut self, off: u32) {
        let idx = bins::BinIndex::from_flat(ChunkView::bin_index(&self.buf, off));
        let prev = ChunkView::bin_prev(&self.buf, off);
        let next = ChunkView::bin_next(&self.buf, off);
        match prev {
            Some(p) => ChunkView::set_bin_next(&mut self.buf, p, next),
            None => self.bins.set_head(idx, next),
        }
        if let Some(n) = next {
            ChunkView::set_bin_prev(&mut self.buf, n, prev);
        }
    }

    fn pop_bin_head(&mut self, idx: bins::BinIndex) -> Option<u32> {
        let head = self.bins.head_of(idx)?;
        let next = ChunkView::bin_next(&self.buf, head);
        if let Some(n) = next {
            ChunkView::set_bin_prev(&mut self.buf, n, None);
        }
        self.bins.set_head(idx, next);
        Some(head)
    }

    /// Grant `off` (currently free, of size `csize`) to a caller requesting
    /// `needed` bytes, splitting the remainder into its own free chunk when
    /// it is big enough to stand alone, else keeping it as spare space on
    /// the granted chunk (spec.md §4.10 "Splitting").
    fn grant(&mut self, off: u32, csize: u32, needed: u32) -> u32 {
        let remainder = csize - needed;
        if remainder >= chunk::MIN_FREE_CHUNK + crate::config::HEAP_MIN_FRAG {
            let rem_off = off + needed;
            let old_fl = ChunkView::fl(&self.buf, off);
            ChunkView::set_size(&mut self.buf, rem_off, remainder);
            ChunkView::set_fl(&mut self.buf, rem_off, old_fl);
            ChunkView::set_back_link_and_flags(&mut self.buf, rem_off, off, chunk::ChunkFlags::empty());
            if old_fl != off && old_fl < self.end_off() {
                ChunkView::set_back_link_and_flags(
                    &mut self.buf,
                    old_fl,
                    rem_off,
                    ChunkView::flags(&self.buf, old_fl),
                );
            } else if old_fl == self.end_off() {
                ChunkView::set_back_link_and_flags(
                    &mut self.buf,
                    old_fl,
                    rem_off,
                    ChunkView::flags(&self.buf, old_fl),
                );
            }
            ChunkView::set_size(&mut self.buf, off, needed);
            ChunkView::set_fl(&mut self.buf, off, rem_off);
            self.insert_free(rem_off);
            ChunkView::set_flags(&mut self.buf, off, chunk::ChunkFlags::INUSE);
            needed
        } else {
            ChunkView::set_flags(&mut self.buf, off, chunk::ChunkFlags::INUSE);
            if remainder > 0 {
                let mut f = ChunkView::flags(&self.buf, off);
                f.insert(chunk::ChunkFlags::SSP);
                ChunkView::set_flags(&mut self.buf, off, f);
                ChunkView::set_spare_offset(&mut self.buf, off, off + needed);
            }
            csize
        }
    }

    /// `Malloc`: allocate at least `requested` bytes, following spec.md
    /// §4.10's search order (exact small bin / donor, best-fit UBA bin,
    /// next occupied bin, top chunk, recovery sweep).
    pub fn malloc(&mut self, requested: u32) -> Result<u32, HeapAllocError> {
        if requested == 0 {
            return Err(HeapAllocError::InvalidParam);
        }
        let needed = chunk::chunk_size_for(requested);
        if let Some(off) = self.try_allocate(needed) {
            self.account(off);
            return Ok(ChunkView::payload_offset(off));
        }
        if self.mode.contains(HeapMode::AUTO_RECOVER) {
            self.recover();
            if let Some(off) = self.try_allocate(needed) {
                self.account(off);
                return Ok(ChunkView::payload_offset(off));
            }
        }
        Err(HeapAllocError::InsufficientHeap)
    }

    /// `Malloc` with an alignment requirement of `align` bytes (spec.md
    /// §4.10 "Alignment": "for `an > 3`... searches for a chunk whose user
    /// payload would already be aligned, or splits off an aligned
    /// sub-chunk after merging the leading gap into the preceding free
    /// chunk... or splitting the donor/top as needed"). `align` is the
    /// actual byte alignment (`2^an` in spec.md's notation), not the
    /// exponent.
    pub fn malloc_aligned(&mut self, requested: u32, align: u32) -> Result<u32, HeapAllocError> {
        if requested == 0 || align == 0 || !align.is_power_of_two() {
            return Err(HeapAllocError::InvalidParam);
        }
        if align <= 8 {
            return self.malloc(requested);
        }
        let needed = chunk::chunk_size_for(requested);
        // Worst case the found chunk's payload starts just past an aligned
        // boundary, so reserve a full `align` bytes of slack to guarantee
        // an aligned payload offset exists somewhere inside it.
        let total_needed = needed + align;
        let off = match self.try_allocate(total_needed) {
            Some(off) => off,
            None => {
                if self.mode.contains(HeapMode::AUTO_RECOVER) {
                    self.recover();
                    self.try_allocate(total_needed)
                        .ok_or(HeapAllocError::InsufficientHeap)?
                } else {
                    return Err(HeapAllocError::InsufficientHeap);
                }
            }
        };
        let aligned_off = self.carve_aligned(off, needed, align);
        self.account(aligned_off);
        Ok(ChunkView::payload_offset(aligned_off))
    }

    /// Given an inuse chunk at `off` already large enough to contain an
    /// `align`-aligned `needed`-byte sub-chunk, find the first aligned
    /// payload offset and carve the leading gap off as free space (merged
    /// into the physically-preceding free chunk when there is one, else
    /// left as its own free chunk), then split the trailing excess as
    /// `grant` normally would. Returns the offset of the now-aligned,
    /// inuse chunk.
    fn carve_aligned(&mut self, off: u32, needed: u32, align: u32) -> u32 {
        let payload = ChunkView::payload_offset(off);
        let mut target_payload = (payload + align - 1) & !(align - 1);
        let mut gap = target_payload - payload;
        if gap != 0 && gap < chunk::MIN_FREE_CHUNK {
            // A too-small leading remainder can't stand alone as a free
            // chunk; push to the next aligned boundary instead.
            target_payload += align;
            gap = target_payload - payload;
        }
        if gap == 0 {
            let csize = ChunkView::size(&self.buf, off);
            self.grant(off, csize, needed);
            return off;
        }

        let new_off = off + gap;
        let orig_size = ChunkView::size(&self.buf, off);
        let orig_fl = ChunkView::fl(&self.buf, off);
        let prev = ChunkView::back_link(&self.buf, off);
        let prev_is_free = self.has_prev(off) && self.is_free(prev) && !self.is_special(prev);

        if prev_is_free {
            self.remove_free(prev);
            let prev_size = ChunkView::size(&self.buf, prev) + gap;
            ChunkView::set_size(&mut self.buf, prev, prev_size);
            ChunkView::set_fl(&mut self.buf, prev, new_off);
            self.insert_free(prev);
        } else {
            ChunkView::set_size(&mut self.buf, off, gap);
            ChunkView::set_fl(&mut self.buf, off, new_off);
            ChunkView::set_back_link_and_flags(&mut self.buf, off, prev, chunk::ChunkFlags::empty());
            self.insert_free(off);
        }

        let new_size = orig_size - gap;
        ChunkView::set_size(&mut self.buf, new_off, new_size);
        ChunkView::set_fl(&mut self.buf, new_off, orig_fl);
        ChunkView::set_back_link_and_flags(&mut self.buf, new_off, off, chunk::ChunkFlags::INUSE);
        if orig_fl != off && (orig_fl < self.end_off() || orig_fl == self.end_off()) {
            ChunkView::set_back_link_and_flags(
                &mut self.buf,
                orig_fl,
                new_off,
                ChunkView::flags(&self.buf, orig_fl),
            );
        }

        self.grant(new_off, new_size, needed);
        new_off
    }

    fn account(&mut self, off: u32) {
        self.used += ChunkView::size(&self.buf, off);
        self.peak_used = self.peak_used.max(self.used);
    }

    fn try_allocate(&mut self, needed: u32) -> Option<u32> {
        // Step 2: exact small bin / donor.
        let start = bins::search_start(needed);
        if let bins::BinIndex::Sba(_) = start {
            if let Some(off) = self.bins.head_of(start) {
                self.remove_free(off);
                let csize = ChunkView::size(&self.buf, off);
                return Some({
                    self.grant(off, csize, needed);
                    off
                });
            }
            if self.mode.contains(HeapMode::DONOR_USE) {
                if let Some(donor_off) = self.donor {
                    let dsize = ChunkView::size(&self.buf, donor_off);
                    if dsize >= needed {
                        return Some(self.calve_donor(donor_off, dsize, needed));
                    }
                }
            }
        }
        // Steps 3-4: best-fit / next occupied bin at or above the start.
        if let Some(idx) = self.bins.find_at_or_above(start) {
            let off = self.pop_bin_head(idx).expect("occupancy bit implied a chunk");
            let csize = ChunkView::size(&self.buf, off);
            self.grant(off, csize, needed);
            return Some(off);
        }
        // Step 5: calve from the top chunk.
        if let Some(top_off) = self.top {
            let tsize = ChunkView::size(&self.buf, top_off);
            if tsize >= needed {
                return Some(self.calve_top(top_off, tsize, needed));
            }
        }
        None
    }

    fn calve_donor(&mut self, donor_off: u32, dsize: u32, needed: u32) -> u32 {
        let remainder = dsize - needed;
        if remainder == 0 {
            self.donor = None;
            ChunkView::set_flags(&mut self.buf, donor_off, chunk::ChunkFlags::INUSE);
        } else {
            let new_donor = donor_off + needed;
            let old_fl = ChunkView::fl(&self.buf, donor_off);
            ChunkView::set_size(&mut self.buf, new_donor, remainder);
            ChunkView::set_fl(&mut self.buf, new_donor, old_fl);
            ChunkView::set_back_link_and_flags(&mut self.buf, new_donor, donor_off, chunk::ChunkFlags::empty());
            if old_fl != donor_off {
                ChunkView::set_back_link_and_flags(
                    &mut self.buf,
                    old_fl,
                    new_donor,
                    ChunkView::flags(&self.buf, old_fl),
                );
            }
            ChunkView::set_size(&mut self.buf, donor_off, needed);
            ChunkView::set_fl(&mut self.buf, donor_off, new_donor);
            ChunkView::set_flags(&mut self.buf, donor_off, chunk::ChunkFlags::INUSE);
            self.donor = Some(new_donor);
        }
        donor_off
    }

    fn calve_top(&mut self, top_off: u32, tsize: u32, needed: u32) -> u32 {
        let remainder = tsize - needed;
        if remainder == 0 {
            self.top = None;
            ChunkView::set_flags(&mut self.buf, top_off, chunk::ChunkFlags::INUSE);
        } else {
            let new_top = top_off + needed;
            let old_fl = ChunkView::fl(&self.buf, top_off);
            ChunkView::set_size(&mut self.buf, new_top, remainder);
            ChunkView::set_fl(&mut self.buf, new_top, old_fl);
            ChunkView::set_back_link_and_flags(&mut self.buf, new_top, top_off, chunk::ChunkFlags::empty());
            ChunkView::set_back_link_and_flags(
                &mut self.buf,
                old_fl,
                new_top,
                ChunkView::flags(&self.buf, old_fl),
            );
            ChunkView::set_size(&mut self.buf, top_off, needed);
            ChunkView::set_fl(&mut self.buf, top_off, new_top);
            ChunkView::set_flags(&mut self.buf, top_off, chunk::ChunkFlags::INUSE);
            self.top = Some(new_top);
        }
        top_off
    }

    /// `Calloc`: allocate and zero.
    pub fn calloc(&mut self, count: u32, elem_size: u32) -> Result<u32, HeapAllocError> {
        let total = count.checked_mul(elem_size).ok_or(HeapAllocError::InvalidParam)?;
        let payload = self.malloc(total)?;
        let off = payload - chunk::HDR_COMMON;
        let cap = ChunkView::payload_capacity(&self.buf, off);
        let start = payload as usize;
        self.buf[start..start + cap as usize].fill(0);
        Ok(payload)
    }

    /// `Free`: return a previously-allocated block. Merges the preceding
    /// chunk's spare space back first, then the lower and upper physical
    /// neighbors if they are free (donor/top excluded from that merge, per
    /// spec.md §4.10 "Free").
    pub fn free(&mut self, payload: u32) -> Result<(), HeapAllocError> {
        if payload < chunk::HDR_COMMON || payload as usize > SIZE {
            return Err(HeapAllocError::InvalidParam);
        }
        let mut off = payload - chunk::HDR_COMMON;
        if off >= self.end_off() || !ChunkView::is_inuse(&self.buf, off) {
            return Err(HeapAllocError::InvalidParam);
        }
        self.used -= ChunkView::size(&self.buf, off);

        // Reclaim a preceding chunk's recorded spare space, if any.
        if self.has_prev(off) {
            let prev = ChunkView::back_link(&self.buf, off);
            if !self.is_special(prev)
                && ChunkView::is_inuse(&self.buf, prev)
                && ChunkView::has_spare_space(&self.buf, prev)
            {
                let spare_at = ChunkView::spare_offset(&self.buf, prev);
                if spare_at == off {
                    let mut pf = ChunkView::flags(&self.buf, prev);
                    pf.remove(chunk::ChunkFlags::SSP);
                    ChunkView::set_flags(&mut self.buf, prev, pf);
                    let merged = ChunkView::size(&self.buf, prev) + ChunkView::size(&self.buf, off);
                    ChunkView::set_size(&mut self.buf, prev, merged);
                    ChunkView::set_fl(&mut self.buf, prev, ChunkView::fl(&self.buf, off));
                    off = prev;
                }
            }
        }

        if self.mode.contains(HeapMode::MERGE) {
            if self.has_next(off) {
                let next = ChunkView::fl(&self.buf, off);
                if self.is_free(next) && !self.is_special(next) {
                    self.remove_free(next);
                    let merged = ChunkView::size(&self.buf, off) + ChunkView::size(&self.buf, next);
                    let next_fl = ChunkView::fl(&self.buf, next);
                    ChunkView::set_size(&mut self.buf, off, merged);
                    ChunkView::set_fl(&mut self.buf, off, next_fl);
                    if next_fl != next && next_fl < self.end_off() {
                        ChunkView::set_back_link_and_flags(
                            &mut self.buf,
                            next_fl,
                            off,
                            ChunkView::flags(&self.buf, next_fl),
                        );
                    } else if next_fl == self.end_off() {
                        ChunkView::set_back_link_and_flags(
                            &mut self.buf,
                            next_fl,
                            off,
                            ChunkView::flags(&self.buf, next_fl),
                        );
                    }
                }
            }
            if self.has_prev(off) {
                let prev = ChunkView::back_link(&self.buf, off);
                if self.is_free(prev) && !self.is_special(prev) {
                    self.remove_free(prev);
                    let merged = ChunkView::size(&self.buf, prev) + ChunkView::size(&self.buf, off);
                    let my_fl = ChunkView::fl(&self.buf, off);
                    ChunkView::set_size(&mut self.buf, prev, merged);
                    ChunkView::set_fl(&mut self.buf, prev, my_fl);
                    if my_fl != off && my_fl < self.end_off() {
                        ChunkView::set_back_link_and_flags(
                            &mut self.buf,
                            my_fl,
                            prev,
                            ChunkView::flags(&self.buf, my_fl),
                        );
                    } else if my_fl == self.end_off() {
                        ChunkView::set_back_link_and_flags(
                            &mut self.buf,
                            my_fl,
                            prev,
                            ChunkView::flags(&self.buf, my_fl),
                        );
                    }
                    off = prev;
                }
            }
        }

        let size = ChunkView::size(&self.buf, off);
        let payload_start = chunk::ChunkView::payload_offset(off) as usize;
        self.buf[payload_start..(off + size) as usize].fill(FREE_FILL);
        ChunkView::set_flags(&mut self.buf, off, chunk::ChunkFlags::empty());
        if !self.is_special(off) {
            self.insert_free(off);
        }
        Ok(())
    }

    /// `Realloc`: grow or shrink an existing block in place when possible,
    /// otherwise allocate fresh and copy (spec.md §4.10 "Realloc").
    pub fn realloc(&mut self, payload: u32, new_size: u32) -> Result<u32, HeapAllocError> {
        let off = payload - chunk::HDR_COMMON;
        if off >= self.end_off() || !ChunkView::is_inuse(&self.buf, off) {
            return Err(HeapAllocError::InvalidParam);
        }
        let needed = chunk::chunk_size_for(new_size);
        let cur = ChunkView::size(&self.buf, off);
        if needed <= cur {
            self.used -= cur;
            self.grant(off, cur, needed);
            self.used += ChunkView::size(&self.buf, off);
            return Ok(payload);
        }
        let new_payload = self.malloc(new_size)?;
        let old_cap = ChunkView::payload_capacity(&self.buf, off).min(new_size) as usize;
        let (src, dst) = (payload as usize, new_payload as usize);
        self.buf.copy_within(src..src + old_cap, dst);
        self.free(payload)?;
        Ok(new_payload)
    }

    /// `Extend`: grow the heap's backing region is not possible for a
    /// fixed `[u8; SIZE]` buffer; instead this widens the top chunk by
    /// donating previously-unused trailing capacity reserved at
    /// construction time. Exposed for API parity with spec.md §6; a heap
    /// created with `donor_size` covering its intended lifetime needs it
    /// rarely.
    pub fn extend(&mut self, additional: u32) -> Result<(), HeapAllocError> {
        let Some(top_off) = self.top else {
            return Err(HeapAllocError::InsufficientHeap);
        };
        let additional = chunk::align8(additional);
        let end = self.end_off();
        if top_off + ChunkView::size(&self.buf, top_off) + additional > end {
            return Err(HeapAllocError::InsufficientHeap);
        }
        let new_size = ChunkView::size(&self.buf, top_off) + additional;
        ChunkView::set_size(&mut self.buf, top_off, new_size);
        Ok(())
    }

    /// `Recover`: sweep the heap for adjacent free chunks and merge them
    /// (spec.md §4.10 step 6), used both as an explicit service call and
    /// internally by `malloc`'s auto-recovery path.
    pub fn recover(&mut self) {
        let mut off = 0u32;
        loop {
            let next = ChunkView::fl(&self.buf, off);
            let at_end = next == off || next >= self.end_off();
            if self.is_free(off) && !self.is_special(off) && !at_end {
                if self.is_free(next) && !self.is_special(next) {
                    self.remove_free(off);
                    self.remove_free(next);
                    let merged = ChunkView::size(&self.buf, off) + ChunkView::size(&self.buf, next);
                    let next_fl = ChunkView::fl(&self.buf, next);
                    ChunkView::set_size(&mut self.buf, off, merged);
                    ChunkView::set_fl(&mut self.buf, off, next_fl);
                    if next_fl < self.end_off() {
                        ChunkView::set_back_link_and_flags(
                            &mut self.buf,
                            next_fl,
                            off,
                            ChunkView::flags(&self.buf, next_fl),
                        );
                    }
                    self.insert_free(off);
                    continue; // re-examine `off`'s now-larger next neighbor
                }
            }
            if at_end {
                break;
            }
            off = next;
        }
    }

    /// `Scan`: walk every chunk forward validating `fl`/`blf` agreement,
    /// repairing a drifted forward link when `fl` no longer matches the
    /// expected `off + size` but `off + size` is itself a plausible chunk
    /// (spec.md §4.10 "Integrity"). Reports `HeapBroken` if a gap cannot be
    /// bridged by recomputation.
    pub fn scan(&mut self) -> Result<(), HeapScanError> {
        let mut off = 0u32;
        let end = self.end_off();
        loop {
            let recorded_fl = ChunkView::fl(&self.buf, off);
            let size = ChunkView::size(&self.buf, off);
            let expected = off + size;
            if recorded_fl != off && recorded_fl != expected && expected <= end {
                ChunkView::set_fl(&mut self.buf, off, expected);
            }
            let fl = ChunkView::fl(&self.buf, off);
            if fl == off || fl >= end {
                if off != end {
                    return Err(HeapScanError::HeapBroken);
                }
                break;
            }
            if ChunkView::back_link(&self.buf, fl) != off && ChunkView::back_link(&self.buf, fl) != NO_PREV & !0x7
            {
                ChunkView::set_back_link_and_flags(&mut self.buf, fl, off, ChunkView::flags(&self.buf, fl));
            }
            off = fl;
        }
        Ok(())
    }

    /// `BinScan`: walk one bin's free list validating both directions'
    /// links, repairing a `bin_prev` that has drifted from its actual
    /// predecessor.
    pub fn bin_scan(&mut self, idx: bins::BinIndex) -> Result<u32, HeapScanError> {
        let mut count = 0u32;
        let mut prev: Option<u32> = None;
        let mut cur = self.bins.head_of(idx);
        while let Some(off) = cur {
            if ChunkView::bin_prev(&self.buf, off) != prev {
                ChunkView::set_bin_prev(&mut self.buf, off, prev);
            }
            count += 1;
            prev = Some(off);
            cur = ChunkView::bin_next(&self.buf, off);
            if count > crate::config::NUM_TASKS as u32 * 4 {
                return Err(HeapScanError::HeapBroken);
            }
        }
        Ok(count)
    }

    /// `BinSort`: one pass of a bubble-insertion sort over a bin's free
    /// list (largest chunks toward the tail), using a "turtle" pointer
    /// that marks the boundary already known to be sorted so a repeated
    /// call converges without re-examining settled entries (spec.md §4.10
    /// "Bins").
    pub fn bin_sort(&mut self, idx: bins::BinIndex) {
        let Some(mut turtle) = self.bins.head_of(idx) else {
            return;
        };
        loop {
            let Some(next) = ChunkView::bin_next(&self.buf, turtle) else {
                break;
            };
            if ChunkView::size(&self.buf, turtle) > ChunkView::size(&self.buf, next) {
                self.swap_bin_neighbors(idx, turtle, next);
                // `turtle` now follows `next`; re-examine from `next`
                // onward on the next call rather than looping here, so a
                // single call performs exactly one pass.
            }
            turtle = next;
        }
    }

    fn swap_bin_neighbors(&mut self, idx: bins::BinIndex, a: u32, b: u32) {
        let a_prev = ChunkView::bin_prev(&self.buf, a);
        let b_next = ChunkView::bin_next(&self.buf, b);
        ChunkView::set_bin_next(&mut self.buf, b, Some(a));
        ChunkView::set_bin_prev(&mut self.buf, a, Some(b));
        ChunkView::set_bin_next(&mut self.buf, a, b_next);
        if let Some(n) = b_next {
            ChunkView::set_bin_prev(&mut self.buf, n, Some(a));
        }
        ChunkView::set_bin_prev(&mut self.buf, b, a_prev);
        match a_prev {
            Some(p) => ChunkView::set_bin_next(&mut self.buf, p, Some(b)),
            None => self.bins.set_head(idx, Some(b)),
        }
    }

    /// `BinSeed`: pre-populate a bin with a single chunk carved from the
    /// top chunk, so the first allocation of a hot size does not pay the
    /// top-chunk-calve cost (an optional tuning hint; a no-op if the top
    /// chunk cannot supply it).
    pub fn bin_seed(&mut self, size: u32) -> bool {
        let size = chunk::align8(size).max(chunk::MIN_FREE_CHUNK);
        let Some(top_off) = self.top else { return false };
        let tsize = ChunkView::size(&self.buf, top_off);
        if tsize < size {
            return false;
        }
        let seeded = self.calve_top(top_off, tsize, size);
        self.insert_free(seeded);
        true
    }

    /// `Peek`: heap-wide usage snapshot.
    pub fn peek(&self) -> HeapPeek {
        HeapPeek {
            heap_size: SIZE as u32,
            used: self.used,
            peak_used: self.peak_used,
            donor_size: self.donor.map_or(0, |o| ChunkView::size(&self.buf, o)),
            top_size: self.top.map_or(0, |o| ChunkView::size(&self.buf, o)),
        }
    }

    /// `ChunkPeek`: snapshot of the chunk backing a live allocation.
    pub fn chunk_peek(&self, payload: u32) -> Option<ChunkPeek> {
        if payload < chunk::HDR_COMMON {
            return None;
        }
        let off = payload - chunk::HDR_COMMON;
        if off >= self.end_off() {
            return None;
        }
        let flags = ChunkView::flags(&self.buf, off);
        Some(ChunkPeek {
            offset: off,
            size: ChunkView::size(&self.buf, off),
            inuse: flags.contains(chunk::ChunkFlags::INUSE),
            debug: flags.contains(chunk::ChunkFlags::DEBUG),
            spare_space: flags.contains(chunk::ChunkFlags::SSP),
        })
    }

    /// `BinPeek`: snapshot of one bin (head offset and chunk count).
    pub fn bin_peek(&self, idx: bins::BinIndex) -> BinPeek {
        let mut count = 0;
        let mut cur = self.bins.head_of(idx);
        while let Some(off) = cur {
            count += 1;
            cur = ChunkView::bin_next(&self.buf, off);
        }
        BinPeek {
            head: self.bins.head_of(idx),
            count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malloc_then_free_returns_to_empty_state() {
        let mut heap = Heap::<1024>::new(256);
        let before = heap.peek();
        let p = heap.malloc(64).unwrap();
        assert!(p >= chunk::HDR_COMMON);
        heap.free(p).unwrap();
        let after = heap.peek();
        assert_eq!(before.used, after.used);
    }

    #[test]
    fn malloc_aligned_returns_a_payload_aligned_pointer() {
        // spec.md §8 scenario 5: init a heap, malloc(100, an=10) (align =
        // 1024) must return a pointer aligned to 1024.
        let mut heap = Heap::<65536>::new(4096);
        let p = heap.malloc_aligned(100, 1024).unwrap();
        assert_eq!(p % 1024, 0);
        heap.free(p).unwrap();
    }

    #[test]
    fn malloc_aligned_leaves_a_usable_heap_behind() {
        let mut heap = Heap::<65536>::new(4096);
        let a = heap.malloc_aligned(100, 256).unwrap();
        assert_eq!(a % 256, 0);
        let b = heap.malloc(32).unwrap();
        assert_ne!(a, b);
        heap.free(a).unwrap();
        heap.free(b).unwrap();
        assert!(heap.scan().is_ok());
    }

    #[test]
    fn allocations_do_not_overlap() {
        let mut heap = Heap::<4096>::new(64);
        let a = heap.malloc(100).unwrap();
        let b = heap.malloc(100).unwrap();
        assert_ne!(a, b);
        let a_off = a - chunk::HDR_COMMON;
        let a_size = ChunkView::size(&heap.buf, a_off);
        assert!(b >= a_off + a_size);
    }

    #[test]
    fn exhaustion_reports_insufficient_heap_not_panic() {
        let mut heap = Heap::<256>::new(32);
        let mut allocated = alloc_list();
        loop {
            match heap.malloc(64) {
                Ok(p) => allocated.push(p),
                Err(HeapAllocError::InsufficientHeap) => break,
                Err(e) => panic!("unexpected error {e:?}"),
            }
        }
        for p in allocated {
            heap.free(p).unwrap();
        }
    }

    fn alloc_list() -> Vec<u32> {
        Vec::new()
    }

    #[test]
    fn freeing_adjacent_chunks_merges_them_back_together() {
        let mut heap = Heap::<4096>::new(64);
        let a = heap.malloc(100).unwrap();
        let b = heap.malloc(100).unwrap();
        let c = heap.malloc(100).unwrap();
        heap.free(b).unwrap();
        heap.free(a).unwrap();
        heap.free(c).unwrap();
        let d = heap.malloc(300).unwrap();
        heap.free(d).unwrap();
    }

    #[test]
    fn calloc_zeroes_the_block() {
        let mut heap = Heap::<1024>::new(64);
        let p = heap.calloc(8, 4).unwrap();
        let off = p - chunk::HDR_COMMON;
        let cap = ChunkView::payload_capacity(&heap.buf, off) as usize;
        let start = p as usize;
        assert!(heap.buf[start..start + cap.min(32)].iter().all(|&b| b == 0));
    }

    #[test]
    fn scan_reports_a_healthy_freshly_initialized_heap() {
        let mut heap = Heap::<1024>::new(64);
        assert!(heap.scan().is_ok());
    }

    #[test]
    fn donor_chunk_services_small_allocations_before_top() {
        let mut heap = Heap::<4096>::new(512);
        let p = heap.malloc(32).unwrap();
        let off = p - chunk::HDR_COMMON;
        assert!(off < 512 + chunk::HDR_COMMON);
    }
}
