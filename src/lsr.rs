//! The link service routine (LSR) deferred-work queue (spec.md §4.2).
//!
//! A bounded ring of `(handler, argument)` pairs. `invoke` is the only
//! operation ISRs are allowed to call directly, and it only ever touches the
//! ring under the CPU lock for the duration of the enqueue itself. The
//! actual "run after all ISRs have unwound" hand-off is an architecture hook
//! (out of scope, spec.md §1); this module exposes `drain`, which the board
//! support layer calls once per return-from-interrupt.

use arrayvec::ArrayVec;

use crate::config::LSR_QUEUE_LEN;
use crate::error::{KResult, KernelError};
use crate::lock::CpuLockToken;

pub type LsrFn = fn(u32);

#[derive(Clone, Copy)]
struct Entry {
    handler: LsrFn,
    arg: u32,
}

/// The LSR ring. Overflow is a hard error (`KernelError::LsrQueueOverflow`,
/// spec.md §4.2: "Overflow is a hard error").
pub struct LsrQueue {
    ring: ArrayVec<Entry, LSR_QUEUE_LEN>,
    /// `LSR_sOn`/`LSR_sOff` (spec.md §6): while suspended, [`Self::drain`]
    /// leaves the ring untouched instead of running it, so enqueued work
    /// simply waits for the next `sOn`. `invoke` still enqueues while
    /// suspended — only dispatch is held back.
    enabled: bool,
}

impl LsrQueue {
    pub const fn new() -> Self {
        Self {
            ring: ArrayVec::new_const(),
            enabled: true,
        }
    }

    /// `LSR_sOff`: suspend LSR dispatch.
    pub fn suspend(&mut self) {
        self.enabled = false;
    }

    /// `LSR_sOn`: resume LSR dispatch.
    pub fn resume(&mut self) {
        self.enabled = true;
    }

    pub fn is_suspended(&self) -> bool {
        !self.enabled
    }

    /// Enqueue an LSR invocation. Safe to call from an ISR: the only work
    /// done is a bounded-capacity push under the CPU lock.
    pub fn invoke(&mut self, _token: &mut CpuLockToken, handler: LsrFn, arg: u32) -> KResult<()> {
        self.ring
            .try_push(Entry { handler, arg })
            .map_err(|_| KernelError::LsrQueueOverflow)
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    /// Run every queued LSR FIFO, with interrupts enabled, until the ring is
    /// empty (spec.md §4.2: "that pass dequeues LSRs FIFO and runs each with
    /// interrupts enabled until `lqctr == 0`"). Returns the number run.
    ///
    /// The caller (the architecture's return-from-interrupt hook) is
    /// responsible for calling the scheduler exactly once after this
    /// returns, not before every individual LSR, per spec.md §4.2.
    pub fn drain(&mut self) -> usize {
        if !self.enabled {
            return 0;
        }
        let mut n = 0;
        // New LSRs may be enqueued by the very handlers we're running (e.g.
        // a keep-time LSR re-arming itself), so re-check length each pass
        // instead of iterating a fixed snapshot.
        while !self.ring.is_empty() {
            let Entry { handler, arg } = self.ring.remove(0);
            handler(arg);
            n += 1;
        }
        n
    }
}

impl Default for LsrQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicU32, Ordering};

    static SEEN: AtomicU32 = AtomicU32::new(0);

    fn record(arg: u32) {
        SEEN.fetch_add(arg, Ordering::SeqCst);
    }

    #[test]
    fn drain_runs_everything_fifo_and_empties_the_ring() {
        SEEN.store(0, Ordering::SeqCst);
        let mut q = LsrQueue::new();
        unsafe {
            let mut token = CpuLockToken::new_unchecked();
            q.invoke(&mut token, record, 1).unwrap();
            q.invoke(&mut token, record, 2).unwrap();
            q.invoke(&mut token, record, 3).unwrap();
        }
        let n = q.drain();
        assert_eq!(n, 3);
        assert_eq!(SEEN.load(Ordering::SeqCst), 6);
        assert!(q.is_empty());
    }

    #[test]
    fn suspended_queue_defers_dispatch_until_resumed() {
        SEEN.store(0, Ordering::SeqCst);
        let mut q = LsrQueue::new();
        q.suspend();
        unsafe {
            let mut token = CpuLockToken::new_unchecked();
            q.invoke(&mut token, record, 5).unwrap();
        }
        assert_eq!(q.drain(), 0);
        assert_eq!(SEEN.load(Ordering::SeqCst), 0);
        q.resume();
        assert_eq!(q.drain(), 1);
        assert_eq!(SEEN.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn overflow_is_reported() {
        let mut q = LsrQueue::new();
        unsafe {
            let mut token = CpuLockToken::new_unchecked();
            for _ in 0..LSR_QUEUE_LEN {
                q.invoke(&mut token, record, 0).unwrap();
            }
            assert_eq!(
                q.invoke(&mut token, record, 0),
                Err(KernelError::LsrQueueOverflow)
            );
        }
    }
}
