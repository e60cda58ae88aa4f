//! Constants for the elapsed-time rollover rule (spec.md §4.3, "Elapsed-time
//! rollover").
//!
//! Unlike the teacher's microsecond-resolution `Duration`, this kernel's
//! timing is purely tick-based (differential timer counts, `smx_etime`,
//! ticks-per-second), so time here is a plain `u32` tick counter: `etime`
//! lives on `Kernel` (`kernel.rs`), advanced by `Kernel::tick`, and the fold
//! itself is `Timeouts::maybe_fold_rollover` (`timeout.rs`), since folding
//! `etime` and every outstanding timeout must happen as one atomic step.

/// Sentinel meaning "no timeout" in the timeout array (`INF` in spec.md
/// §3/§4.3).
pub const INFINITE: u32 = u32::MAX;

/// High bit past which `etime` (and every live timeout) is folded down, per
/// spec.md §4.3's rollover rule: "when `etime >= 2^31` and every non-infinite
/// timeout is also >= `2^31`, the high bit... is cleared atomically".
pub const ROLLOVER_BIT: u32 = 1 << 31;
