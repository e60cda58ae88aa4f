//! MPU hand-off for protected messages — interface only (spec.md §4.11,
//! out of scope per spec.md §1's Non-goals list: "MPU micro-API internals").
//!
//! What stays in scope is the *shape* of the hand-off: a message carries an
//! MPA slot number, and delivering/releasing it writes/clears that slot.
//! Programming the actual MPU registers is a platform personality-shell
//! concern; [`MpuPort`] is the seam a concrete board support crate
//! implements, mirroring how the teacher keeps its timer/interrupt port
//! behind a trait rather than hand-rolling register access inline.

/// Which of a task's two MPA slots a protected message occupies
/// (spec.md §4.11: "active slot for untrusted mode... auxiliary slot for
/// trusted mode with system-data blocks").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MpaSlot {
    Active,
    Auxiliary,
}

/// A region descriptor as written into an MPA slot. Field shapes (base,
/// size encoding, attribute bits) are architecture-specific; this crate
/// only ever treats it as an opaque value to stash and hand back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MpuRegion(pub u32, pub u32);

/// Board/architecture hook for programming the MPU itself. The kernel core
/// calls this only when a receive slot falls within the active-region
/// window (spec.md §4.11); everything else is MPA bookkeeping the core
/// owns directly and is out of scope for this trait.
pub trait MpuPort {
    fn program(&mut self, slot: MpaSlot, region: MpuRegion);
    fn clear(&mut self, slot: MpaSlot);
}

/// An `MpuPort` that does nothing, for kernels built without memory
/// protection (spec.md §1 Non-goals) or for host-side tests.
pub struct NoMpu;

impl MpuPort for NoMpu {
    fn program(&mut self, _slot: MpaSlot, _region: MpuRegion) {}
    fn clear(&mut self, _slot: MpaSlot) {}
}
