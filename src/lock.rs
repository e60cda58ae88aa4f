//! The CPU-lock critical section cell.
//!
//! Modeled on the teacher's `klock.rs`, but de-genericized: this kernel is a
//! single monomorphic instance rather than a portable framework parameterized
//! over a `Traits` type, so there is exactly one CPU-lock token in the
//! program and `CpuLockCell` does not need a type parameter identifying it.
//!
//! The actual interrupt-masking primitives (the architecture hook that
//! really disables/enables interrupts) are out of scope per spec.md §1
//! ("interrupt controller access primitives... CPU-exception entry/exit
//! assembly"); they are represented here only as the [`Arch`] trait, which a
//! board support crate implements.

use core::fmt;
use tokenlock::UnsyncTokenLock;

/// Implemented by the architecture/board-support layer to provide the one
/// primitive this kernel core needs from the outside world: a way to mask
/// and unmask interrupts around a critical section. Everything else
/// (vector tables, fault entry asm, the MPU micro-API) lives outside this
/// crate.
pub trait Arch {
    /// Disable interrupts (or raise to the kernel's mask level) and return
    /// whether they were already disabled.
    fn enter_cpu_lock() -> bool;
    /// Restore interrupts to the state before the matching `enter_cpu_lock`.
    fn leave_cpu_lock();
}

enum CpuLockTag {}

/// The key that "unlocks" [`CpuLockCell`]. A singleton: at most one instance
/// may exist at a time (see [`lock_cpu`]), which is what lets `&`/`&mut`
/// access to it stand in for "interrupts are masked".
pub type CpuLockToken = tokenlock::UnsyncSingletonToken<CpuLockTag>;

/// The keyhole type for the `UnsyncTokenLock` backing [`CpuLockCell`],
/// "unlocked" by [`CpuLockToken`].
type CpuLockKeyhole = tokenlock::SingletonTokenId<CpuLockTag>;

/// A cell that can only be accessed while holding the CPU lock.
///
/// This is the direct analogue of every `blf`/link/flags field in the
/// original source that is only ever touched with interrupts masked: instead
/// of "the programmer remembers to disable interrupts first", the type
/// system requires a [`CpuLockToken`] (or a [`CpuLockTokenRefMut`]) to reach
/// the value at all.
pub struct CpuLockCell<T: ?Sized>(UnsyncTokenLock<T, CpuLockKeyhole>);

impl<T> CpuLockCell<T> {
    pub const fn new(x: T) -> Self {
        Self(UnsyncTokenLock::new(CpuLockKeyhole::INIT, x))
    }
}

impl<T: ?Sized> CpuLockCell<T> {
    #[inline]
    pub fn get_mut<'a>(&'a self, token: &'a mut CpuLockToken) -> &'a mut T {
        self.0.write(token)
    }

    #[inline]
    pub fn get<'a>(&'a self, token: &'a CpuLockToken) -> &'a T {
        self.0.read(token)
    }
}

impl<T: fmt::Debug> fmt::Debug for CpuLockCell<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CpuLockCell").field("0", &"..").finish()
    }
}

/// An RAII handle representing "interrupts are currently masked". Dropping
/// it re-enables interrupts via [`Arch::leave_cpu_lock`].
pub struct CpuLockGuard<A: Arch> {
    token: CpuLockToken,
    _arch: core::marker::PhantomData<A>,
}

impl<A: Arch> CpuLockGuard<A> {
    pub fn token_mut(&mut self) -> &mut CpuLockToken {
        &mut self.token
    }
}

impl<A: Arch> Drop for CpuLockGuard<A> {
    fn drop(&mut self) {
        A::leave_cpu_lock();
    }
}

/// Enter the CPU lock, masking interrupts, and return a guard. Mirrors the
/// teacher's `lock_cpu`.
///
/// Board support code must call this only when the CPU lock is not already
/// held. `CpuLockToken` is a singleton: minting a second one while a
/// `CpuLockGuard` is still alive would let two `&mut CpuLockToken`s alias the
/// same `CpuLockCell` contents.
pub fn lock_cpu<A: Arch>() -> CpuLockGuard<A> {
    let was_locked = A::enter_cpu_lock();
    debug_assert!(!was_locked, "lock_cpu called while already locked");
    // SAFETY: `enter_cpu_lock` just masked interrupts, and the assertion
    // above rules out a `CpuLockGuard` (and thus a live `CpuLockToken`)
    // already existing, so this is the only token in the program right now.
    let token = unsafe { CpuLockToken::new_unchecked() };
    CpuLockGuard {
        token,
        _arch: core::marker::PhantomData,
    }
}

/// Borrowed-mutable-reference form of [`CpuLockToken`], for use in function
/// signatures instead of `&mut CpuLockGuard` (the teacher's convention:
/// "always prefer these over `&mut CpuLockGuard`").
pub type CpuLockTokenRefMut<'a> = &'a mut CpuLockToken;
