//! Event groups: a 32-bit flag word with AND/OR/AND-OR wait modes (spec.md
//! §3 "Event group", §4.8).
//!
//! Grounded in `original_source/XSMX/xeg.c` (`smx_EventFlagsSet`,
//! `smx_EventFlagsPulse`, `smx_EventFlagsTest_F`, `andor_test`); the teacher
//! repo has no direct analogue, so the wait-satisfaction predicate and pulse
//! semantics are authored fresh in the teacher's general "control block +
//! wait queue" shape (same as [`crate::sync::semaphore`]).

use crate::config::NUM_EVENT_GROUPS;
use crate::error::{KResult, KernelError};
use crate::lock::CpuLockToken;
use crate::pool::{Id, Pool};
use crate::task::{TaskId, TaskTable};
use crate::wait::{QueueOrder, WaitQueue, WakeReason};

pub type EventGroupId = Id<EventGroupCb>;
pub type EventGroupTable = Pool<EventGroupCb, NUM_EVENT_GROUPS>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitMode {
    /// Satisfied once every bit in the waiter's mask is set.
    And,
    /// Satisfied once any bit in the waiter's mask is set.
    Or,
    /// `test_mask` is a bitmap of consecutive-ones terms separated by single
    /// zero bits; satisfied once at least one entire term is set (spec.md
    /// §4.8, `andor_test` in the original).
    AndOr,
}

/// Scan `mask` for maximal runs of consecutive 1-bits ("terms"); for each
/// term that is entirely present in `flags`, OR it into the result. Direct
/// port of `andor_test()` in `original_source/XSMX/xeg.c`, expressed without
/// the C version's bit-at-a-time probe loop.
fn andor_test(flags: u32, mask: u32) -> u32 {
    let mut save = 0u32;
    let mut remaining = mask;
    while remaining != 0 {
        let probe = remaining.trailing_zeros();
        let run_start = 1u32.checked_shl(probe).unwrap_or(0);
        let mut term = 0u32;
        let mut bit = run_start;
        while bit != 0 && remaining & bit != 0 {
            term |= bit;
            bit = bit.checked_shl(1).unwrap_or(0);
        }
        if flags & term == term {
            save |= term;
        }
        remaining &= !term;
    }
    save
}

/// Apply `mode` to decide which bits of `test_mask` currently match `flags`,
/// or `0` for no match.
fn matched_bits(flags: u32, test_mask: u32, mode: WaitMode) -> u32 {
    match mode {
        WaitMode::And => {
            if flags & test_mask == test_mask {
                test_mask
            } else {
                0
            }
        }
        WaitMode::Or => flags & test_mask,
        WaitMode::AndOr => andor_test(flags, test_mask),
    }
}

struct Waiter {
    task: TaskId,
    test_mask: u32,
    post_clear_mask: u32,
    mode: WaitMode,
}

/// Pending waiters are kept in a small inline list rather than reusing
/// [`WaitQueue`] directly: satisfaction depends on each waiter's own mask, so
/// the group must re-test every waiter on every `Set`, not just pop the
/// front of a priority queue.
pub struct EventGroupCb {
    flags: u32,
    wait_queue: WaitQueue,
    waiters: arrayvec::ArrayVec<Waiter, { crate::config::NUM_TASKS }>,
    pub on_signal: Option<fn(u32)>,
}

impl EventGroupCb {
    pub fn new(initial: u32) -> Self {
        Self {
            flags: initial,
            wait_queue: WaitQueue::new(QueueOrder::Priority),
            waiters: arrayvec::ArrayVec::new(),
            on_signal: None,
        }
    }

    pub fn flags(&self) -> u32 {
        self.flags
    }

    /// `Set` (spec.md §4.8): pre-clear `pre_clear_mask`, OR in the newly-set
    /// bits of `set_mask`, then walk the wait queue. Each matched waiter is
    /// resumed with the matching-bit subset in its `rv` slot; bits it asked
    /// to post-clear are accumulated and cleared from the group once the
    /// whole walk finishes (spec.md: "accumulated and cleared... at the end
    /// of the walk"), exactly as `smx_EventFlagsSet`/`smx_EventFlagsSearch_F`
    /// do it.
    pub fn set(
        &mut self,
        tasks: &mut TaskTable,
        token: &mut CpuLockToken,
        set_mask: u32,
        pre_clear_mask: u32,
    ) {
        self.flags &= !pre_clear_mask;
        let new_mask = set_mask & !self.flags;
        self.flags |= new_mask;
        if new_mask != 0 {
            self.release_satisfied(tasks, token);
        }
        if let Some(cb) = self.on_signal {
            cb(self.flags);
        }
    }

    /// `Pulse`: OR in the newly-set bits of `pulse_mask` just long enough to
    /// wake any waiter they satisfy, then clear those same bits again —
    /// bits already set before the pulse are left untouched throughout
    /// (spec.md §4.8 "Pulse variant"; `smx_EventFlagsPulse`).
    pub fn pulse(&mut self, tasks: &mut TaskTable, token: &mut CpuLockToken, pulse_mask: u32) {
        let new_mask = pulse_mask & !self.flags;
        self.flags |= new_mask;
        if new_mask != 0 {
            self.release_satisfied(tasks, token);
        }
        self.flags &= !new_mask;
        if let Some(cb) = self.on_signal {
            cb(self.flags);
        }
    }

    fn release_satisfied(&mut self, tasks: &mut TaskTable, token: &mut CpuLockToken) {
        let mut post_clear_accum = 0u32;
        let mut i = 0;
        while i < self.waiters.len() {
            let sflags = matched_bits(self.flags, self.waiters[i].test_mask, self.waiters[i].mode);
            if sflags != 0 {
                let w = self.waiters.remove(i);
                self.wait_queue.remove(tasks, token, w.task);
                post_clear_accum |= sflags & w.post_clear_mask;
                tasks.get(w.task).set_rv(token, sflags);
                tasks.get(w.task).set_wait_result(token, WakeReason::Satisfied);
            } else {
                i += 1;
            }
        }
        self.flags &= !post_clear_accum;
    }

    /// Register the caller as waiting for `test_mask` under `mode`, with
    /// `post_clear_mask` applied (intersected with the matching bits) once
    /// satisfied. Returns `Some(matched_bits)` if already satisfied — the
    /// caller need not actually block — or `None` if it must wait.
    pub fn wait(
        &mut self,
        tasks: &mut TaskTable,
        token: &mut CpuLockToken,
        task: TaskId,
        test_mask: u32,
        post_clear_mask: u32,
        mode: WaitMode,
    ) -> KResult<Option<u32>> {
        if test_mask == 0 {
            return Err(KernelError::InvalidParam);
        }
        let sflags = matched_bits(self.flags, test_mask, mode);
        if sflags != 0 {
            self.flags &= !(sflags & post_clear_mask);
            return Ok(Some(sflags));
        }
        self.wait_queue.insert(tasks, token, task);
        self.waiters
            .try_push(Waiter {
                task,
                test_mask,
                post_clear_mask,
                mode,
            })
            .map_err(|_| KernelError::OutOfControlBlocks)?;
        Ok(None)
    }

    /// Resume every waiting task with a `NULL`/failure return, flags
    /// unchanged (`smx_EventGroupResumeTasks_F`, used by object deletion and
    /// by an explicit resume-all request).
    pub fn clear_waiters(&mut self, tasks: &mut TaskTable, token: &mut CpuLockToken) {
        for w in self.waiters.drain(..) {
            tasks.get(w.task).set_rv(token, 0);
            tasks.get(w.task).set_wait_result(token, WakeReason::Interrupted);
        }
        self.wait_queue.drain(tasks, token, |_, _, _| {});
    }

    /// Remove a single waiter before it is satisfied (used by a timed wait's
    /// timeout path).
    pub fn cancel_wait(&mut self, tasks: &mut TaskTable, token: &mut CpuLockToken, task: TaskId) {
        if let Some(idx) = self.waiters.iter().position(|w| w.task == task) {
            self.waiters.remove(idx);
            self.wait_queue.remove(tasks, token, task);
        }
    }
}

pub fn create(table: &mut EventGroupTable, initial: u32) -> KResult<EventGroupId> {
    table
        .insert(EventGroupCb::new(initial))
        .ok_or(KernelError::OutOfControlBlocks)
}
