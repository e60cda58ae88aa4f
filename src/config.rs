//! Compile-time kernel limits.
//!
//! The original source configures pool sizes with `#define`s in
//! `bcfg.h`; a generic `Traits`/`KernelConfig` trait would buy nothing here
//! since a program links exactly one kernel instance, so these are plain
//! `const`s instead.

/// Number of distinct ready-queue / task priority levels. Level 0 is the
/// highest priority.
pub const NUM_PRIORITIES: usize = 32;

/// Maximum number of tasks the kernel can host simultaneously.
pub const NUM_TASKS: usize = 64;

pub const NUM_SEMAPHORES: usize = 32;
pub const NUM_MUTEXES: usize = 16;
pub const NUM_EVENT_GROUPS: usize = 16;
pub const NUM_EVENT_QUEUES: usize = 16;
pub const NUM_EXCHANGES: usize = 16;
pub const NUM_PIPES: usize = 8;
pub const NUM_TIMERS: usize = 32;
pub const NUM_MESSAGES: usize = 64;

/// Capacity of the LSR deferred-work ring. Overflow is a hard error
/// (`KernelError::LsrQueueOverflow`), per spec.md §4.2.
pub const LSR_QUEUE_LEN: usize = 16;

/// Capacity of the diagnostic event ring (`errmgr.rs`).
pub const EVENT_BUF_LEN: usize = 64;

/// Capacity of the error ring (`errmgr.rs`).
pub const ERROR_BUF_LEN: usize = 16;

/// Capacity of the diagnostic handle table (`handle_table.rs`).
pub const HANDLE_TABLE_LEN: usize = 64;

/// Depth cap on iterative mutex priority-chain propagation
/// (spec.md §9, "Priority propagation across mutex chains"). Exceeding this
/// is reported as `KernelError::PriorityChainTooDeep`, never silently
/// truncated.
pub const MUTEX_PROPAGATION_DEPTH_CAP: usize = 8;

/// Number of small-bin-array (exact-size, 8-byte-stepped) bins in the
/// embedded heap. See spec.md §4.10 and §3 "Heap chunk".
pub const HEAP_SBA_LEN: usize = 32;

/// Number of upper-bin-array (ascending user-size) bins in the embedded
/// heap.
pub const HEAP_UBA_LEN: usize = 16;

/// Minimum leftover size, in bytes, below which a split remnant is kept as
/// "spare space" on the allocated chunk rather than split out as its own
/// free chunk (`EH_MIN_FRAG` in the original source).
pub const HEAP_MIN_FRAG: u32 = 16;

/// Largest cell width, in bytes, a pipe can be created with. Pipes in the
/// original source size their buffer to `width * length` bytes wherever the
/// caller's block pool puts it; a fixed-capacity kernel build instead caps
/// both dimensions so a pipe's cell storage can live inline in its PICB.
pub const PIPE_MAX_WIDTH: usize = 16;
/// Largest number of cells a pipe can be created with.
pub const PIPE_MAX_LENGTH: usize = 16;

/// Scheduler tick rate, in ticks per second, reported by `SysPeek` (spec.md
/// §6 "System: Peek"). A build-time constant here rather than a runtime
/// value since this crate never drives a hardware timer itself.
pub const TICKS_PER_SECOND: u32 = 1000;
