//! Chunk header layout and accessors for the embedded heap (spec.md §3
//! "Heap chunk", §4.10).
//!
//! Grounded in `original_source/EHEAP/eheap.h`'s `CCB`/`CICB` structs: every
//! chunk carries a forward link `fl`, a backward link packed with flags in
//! its low bits (`blf`), and a size; free chunks additionally carry two bin
//! links and a bin index. The original packs `blf` as a raw pointer with 3
//! flag bits stolen from its low end (pointers are at least 8-byte aligned,
//! so those bits are otherwise unused); this module keeps the identical
//! packing but over `u32` byte offsets into the heap's backing buffer
//! instead of raw pointers (spec.md §9: "a packed struct with an explicit
//! `(prev_index, flags)` pair... encapsulated behind a chunk-accessor
//! type") — [`ChunkView`] *is* that accessor type, so no other module ever
//! masks `blf` bits directly.

bitflags::bitflags! {
    pub struct ChunkFlags: u32 {
        const INUSE = 1 << 0;
        const DEBUG = 1 << 1;
        /// Spare-space-present: this inuse chunk's split remainder was too
        /// small to become its own free chunk, so its size was recorded
        /// here instead of being split out (spec.md §4.10 "Splitting").
        const SSP   = 1 << 2;
    }
}

const FLAG_MASK: u32 = 0x7;

/// Sentinel offset meaning "no link" in a bin's free list (bin links are
/// `Option<u32>` at the call-site API; this is only the wire encoding).
pub const NONE: u32 = u32::MAX;

/// Bytes occupied by the fields every chunk has regardless of state: `size`,
/// `fl`, `blf`, plus one padding word so the payload that follows (and the
/// free-chunk bin fields overlaid on it) stay 8-byte aligned relative to an
/// 8-aligned chunk start.
pub const HDR_COMMON: u32 = 16;
/// Additional bytes a *free* chunk uses for its two bin links and bin index,
/// overlaid on what would otherwise be user payload (plus one padding word,
/// for the same alignment reason as `HDR_COMMON`).
pub const FREE_EXTRA: u32 = 16;
/// Smallest a free chunk can ever be (header + bin linkage, no payload).
pub const MIN_FREE_CHUNK: u32 = HDR_COMMON + FREE_EXTRA;

#[inline]
fn ru32(buf: &[u8], off: u32) -> u32 {
    let o = off as usize;
    u32::from_le_bytes(buf[o..o + 4].try_into().unwrap())
}

#[inline]
fn wu32(buf: &mut [u8], off: u32, v: u32) {
    let o = off as usize;
    buf[o..o + 4].copy_from_slice(&v.to_le_bytes());
}

/// A stateless accessor for the chunk at a given byte offset within a
/// heap's backing buffer. Every field read/write goes through here so the
/// `blf` bit-packing (spec.md §9) is never duplicated at a call site.
pub struct ChunkView;

impl ChunkView {
    pub fn size(buf: &[u8], off: u32) -> u32 {
        ru32(buf, off)
    }

    pub fn set_size(buf: &mut [u8], off: u32, v: u32) {
        wu32(buf, off, v);
    }

    /// Offset of the physically-next chunk. Stored explicitly (not derived
    /// from `size`) so [`super::scan`] can detect and repair the case where
    /// it has drifted from `off + size` (spec.md §4.10 "Integrity").
    pub fn fl(buf: &[u8], off: u32) -> u32 {
        ru32(buf, off + 4)
    }

    pub fn set_fl(buf: &mut [u8], off: u32, v: u32) {
        wu32(buf, off + 4, v);
    }

    fn blf_raw(buf: &[u8], off: u32) -> u32 {
        ru32(buf, off + 8)
    }

    fn set_blf_raw(buf: &mut [u8], off: u32, v: u32) {
        wu32(buf, off + 8, v);
    }

    /// Offset of the physically-previous chunk.
    pub fn back_link(buf: &[u8], off: u32) -> u32 {
        Self::blf_raw(buf, off) & !FLAG_MASK
    }

    pub fn flags(buf: &[u8], off: u32) -> ChunkFlags {
        ChunkFlags::from_bits_truncate(Self::blf_raw(buf, off) & FLAG_MASK)
    }

    pub fn set_back_link_and_flags(buf: &mut [u8], off: u32, back: u32, flags: ChunkFlags) {
        debug_assert_eq!(back & FLAG_MASK, 0, "chunk offsets must be 8-byte aligned");
        Self::set_blf_raw(buf, off, (back & !FLAG_MASK) | flags.bits());
    }

    pub fn set_flags(buf: &mut [u8], off: u32, flags: ChunkFlags) {
        let back = Self::back_link(buf, off);
        Self::set_back_link_and_flags(buf, off, back, flags);
    }

    pub fn is_inuse(buf: &[u8], off: u32) -> bool {
        Self::flags(buf, off).contains(ChunkFlags::INUSE)
    }

    pub fn set_inuse(buf: &mut [u8], off: u32, inuse: bool) {
        let mut f = Self::flags(buf, off);
        f.set(ChunkFlags::INUSE, inuse);
        Self::set_flags(buf, off, f);
    }

    pub fn has_spare_space(buf: &[u8], off: u32) -> bool {
        Self::flags(buf, off).contains(ChunkFlags::SSP)
    }

    // --- free-chunk-only fields (overlay the first bytes of the payload) ---

    pub fn bin_next(buf: &[u8], off: u32) -> Option<u32> {
        match ru32(buf, off + HDR_COMMON) {
            NONE => None,
            v => Some(v),
        }
    }

    pub fn set_bin_next(buf: &mut [u8], off: u32, v: Option<u32>) {
        wu32(buf, off + HDR_COMMON, v.unwrap_or(NONE));
    }

    pub fn bin_prev(buf: &[u8], off: u32) -> Option<u32> {
        match ru32(buf, off + HDR_COMMON + 4) {
            NONE => None,
            v => Some(v),
        }
    }

    pub fn set_bin_prev(buf: &mut [u8], off: u32, v: Option<u32>) {
        wu32(buf, off + HDR_COMMON + 4, v.unwrap_or(NONE));
    }

    /// Which bin (SBA or UBA index, disambiguated by [`super::bins`]) this
    /// free chunk currently sits in. Stored as a plain index rather than the
    /// original's `binx8` (index pre-multiplied by 8 for pointer-arithmetic
    /// convenience in C) — that packing buys nothing once every bin lookup
    /// already goes through [`super::bins::BinSet`].
    pub fn bin_index(buf: &[u8], off: u32) -> u32 {
        ru32(buf, off + HDR_COMMON + 8)
    }

    pub fn set_bin_index(buf: &mut [u8], off: u32, v: u32) {
        wu32(buf, off + HDR_COMMON + 8, v);
    }

    /// Offset of the user payload within this chunk (immediately after the
    /// common header; free-chunk bin fields are overlaid on top of it and
    /// are only read while the chunk is free).
    pub fn payload_offset(off: u32) -> u32 {
        off + HDR_COMMON
    }

    pub fn payload_capacity(buf: &[u8], off: u32) -> u32 {
        Self::size(buf, off) - HDR_COMMON
    }

    /// Trailing pointer to the start of an inuse chunk's spare space (spec.md
    /// §4.10 "Splitting": "a smaller excess becomes spare space remembered by
    /// the chunk's SSP flag plus a trailing pointer to its start"). Stored in
    /// the chunk's last word rather than its head, since the head is the
    /// user payload for an inuse chunk and only the tail is ever unused once
    /// the caller's data may extend right up to the spare boundary.
    pub fn spare_offset(buf: &[u8], off: u32) -> u32 {
        let tail = off + Self::size(buf, off) - 4;
        ru32(buf, tail)
    }

    pub fn set_spare_offset(buf: &mut [u8], off: u32, spare_off: u32) {
        let tail = off + Self::size(buf, off) - 4;
        wu32(buf, tail, spare_off);
    }
}

/// Round `n` up to a multiple of 8.
pub fn align8(n: u32) -> u32 {
    (n + 7) & !7
}

/// Compute the total (header-inclusive) chunk size needed to satisfy a user
/// request of `requested` bytes (spec.md §4.10 step 1: "Round `sz` up to
/// ≥16 and 8-byte aligned; add overhead").
pub fn chunk_size_for(requested: u32) -> u32 {
    let user = align8(requested.max(16));
    align8(user + HDR_COMMON)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blf_packs_back_link_and_flags_together() {
        let mut buf = [0u8; 64];
        ChunkView::set_back_link_and_flags(&mut buf, 32, 8, ChunkFlags::INUSE | ChunkFlags::SSP);
        assert_eq!(ChunkView::back_link(&buf, 32), 8);
        assert_eq!(
            ChunkView::flags(&buf, 32),
            ChunkFlags::INUSE | ChunkFlags::SSP
        );
        assert!(ChunkView::is_inuse(&buf, 32));
        assert!(ChunkView::has_spare_space(&buf, 32));
    }

    #[test]
    fn chunk_size_rounds_up_and_adds_overhead() {
        assert_eq!(chunk_size_for(1), align8(16 + HDR_COMMON));
        assert_eq!(chunk_size_for(100), align8(104 + HDR_COMMON));
    }
}
