//! Kernel error taxonomy (spec.md §7).
//!
//! Mirrors the teacher's `define_suberror!` pattern: a flat root error enum
//! carries every code a caller might ever see, and individual entry points
//! use narrower local "suberror" enums that `From`-convert into it, so a
//! function's signature documents exactly which subset of codes it can
//! return.

use core::fmt;

/// The full error taxonomy from spec.md §7.
#[repr(i8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    // Invalid handle / control-block
    InvalidObject = 1,
    // Parameter errors
    InvalidParam,
    InvalidPriority,
    InvalidTime,
    UnknownSize,
    WrongMode,
    // Resource exhaustion
    OutOfControlBlocks,
    OutOfStacks,
    InsufficientHeap,
    LsrQueueOverflow,
    // Protocol errors
    MutexNotOwner,
    MutexAlreadyFree,
    NotMessageOwner,
    WaitNotAllowed,
    OperationNotAllowed,
    PrivilegeViolation,
    TokenViolation,
    ServiceCallInIsr,
    WouldDeadlock,
    PriorityChainTooDeep,
    // Integrity
    BrokenQueue,
    HeapBroken,
    HeapFixed,
    HeapFenceBroken,
    StackOverflow,
    SemaphoreCounterOverflow,
    // CPU faults (raised by architecture fault handlers, never by this crate
    // directly; kept in the shared taxonomy per spec.md §7)
    BusFault,
    HardFault,
    MemManageFault,
    UsageFault,
    // Wait outcomes
    Timeout,
    Interrupted,
    // Diagnostics
    HandleTableFull,
    HandleTableDuplicate,
}

impl KernelError {
    /// One past the highest discriminant in use, for sizing a dense
    /// per-code counter array (`errmgr.rs`). Discriminant 0 is never
    /// assigned, so this is also the array length that makes `err as
    /// usize` a valid index for every variant.
    pub const COUNT: usize = 35;
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

macro_rules! define_suberror {
    (
        $( #[$meta:meta] )*
        $vis:vis enum $Name:ident { $( $Variant:ident ),* $(,)? }
    ) => {
        $( #[$meta] )*
        #[repr(i8)]
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        $vis enum $Name {
            $( $Variant ),*
        }

        impl From<$Name> for KernelError {
            fn from(e: $Name) -> Self {
                match e {
                    $( $Name::$Variant => KernelError::$Variant ),*
                }
            }
        }
    };
}

define_suberror! {
    /// Failure modes of acquiring a mutex (`Get`/`GetStop`/timed get).
    pub enum LockMutexError {
        InvalidObject,
        WouldDeadlock,
        InvalidPriority,
        WaitNotAllowed,
        Timeout,
        Interrupted,
    }
}

define_suberror! {
    /// Failure modes of releasing a mutex (`Rel`).
    pub enum UnlockMutexError {
        InvalidObject,
        MutexNotOwner,
        MutexAlreadyFree,
    }
}

define_suberror! {
    /// Failure modes of a semaphore wait (`Test`/`TestStop`).
    pub enum WaitSemaphoreError {
        InvalidObject,
        WaitNotAllowed,
        Timeout,
        Interrupted,
    }
}

define_suberror! {
    /// Failure modes of a semaphore signal.
    pub enum SignalSemaphoreError {
        InvalidObject,
        SemaphoreCounterOverflow,
    }
}

define_suberror! {
    /// Failure modes of heap allocation.
    pub enum HeapAllocError {
        InsufficientHeap,
        InvalidParam,
    }
}

define_suberror! {
    /// Failure modes of heap integrity scan.
    pub enum HeapScanError {
        HeapBroken,
        HeapFenceBroken,
    }
}

pub type KResult<T> = Result<T, KernelError>;
