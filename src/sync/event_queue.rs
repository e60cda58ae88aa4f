//! Event queues: a FIFO of tasks each waiting for an absolute signal count,
//! stored as a differential relative to the previous queued task (spec.md
//! §3 "Event queue", §4.9).
//!
//! The differential encoding and the cascade-on-zero resume algorithm are
//! the same shape as [`crate::timer`]'s delta list — grounded in the same
//! `original_source/XSMX/xtmr.c` technique, applied here to
//! `original_source/XSMX/xeq.c`'s event queue instead of wall-clock ticks.
//! Invariant carried from spec.md §3: the sum of every queued differential
//! equals the absolute trigger count of the last (most-deeply-queued) task.

use crate::config::NUM_EVENT_QUEUES;
use crate::error::{KResult, KernelError};
use crate::lock::CpuLockToken;
use crate::pool::{Id, Pool};
use crate::task::{TaskId, TaskTable};
use crate::wait::WakeReason;

pub type EventQueueId = Id<EventQueueCb>;
pub type EventQueueTable = Pool<EventQueueCb, NUM_EVENT_QUEUES>;

struct Waiter {
    task: TaskId,
    /// Remaining signal count relative to the waiter before this one (or
    /// relative to zero, for the head).
    diff: u32,
}

pub struct EventQueueCb {
    /// Total signals delivered since creation, for `Count`/`Peek`.
    count: u32,
    waiters: arrayvec::ArrayVec<Waiter, { crate::config::NUM_TASKS }>,
}

impl EventQueueCb {
    pub fn new() -> Self {
        Self {
            count: 0,
            waiters: arrayvec::ArrayVec::new(),
        }
    }

    /// `Count`/`Peek`: total signals observed so far.
    pub fn count(&self) -> u32 {
        self.count
    }

    /// `Wait`: block until `target` total signals have been observed. If
    /// `target` has already been reached, returns `true` immediately and the
    /// caller need not block.
    pub fn wait(&mut self, task: TaskId, target: u32) -> KResult<bool> {
        if target <= self.count {
            return Ok(true);
        }
        let remaining = target - self.count;
        let mut cum = 0u32;
        let mut idx = 0;
        while idx < self.waiters.len() {
            let next_cum = cum + self.waiters[idx].diff;
            if next_cum >= remaining {
                break;
            }
            cum = next_cum;
            idx += 1;
        }
        let diff_here = remaining - cum;
        if idx < self.waiters.len() {
            self.waiters[idx].diff -= diff_here;
        }
        self.waiters
            .try_insert(idx, Waiter { task, diff: diff_here })
            .map_err(|_| KernelError::OutOfControlBlocks)?;
        Ok(false)
    }

    /// `Signal`: deliver `n` more signals. Resumes the head waiter once its
    /// differential reaches zero, cascading to any immediately-following
    /// waiters whose differential was also already zero (simultaneous
    /// triggers, spec.md §4.9).
    pub fn signal(&mut self, tasks: &mut TaskTable, token: &mut CpuLockToken, n: u32) {
        self.count += n;
        let mut remaining = n;
        while remaining > 0 && !self.waiters.is_empty() {
            if self.waiters[0].diff > remaining {
                self.waiters[0].diff -= remaining;
                break;
            }
            remaining -= self.waiters[0].diff;
            let w = self.waiters.remove(0);
            tasks.get(w.task).set_wait_result(token, WakeReason::Satisfied);
        }
        // Any waiters left with a zero differential trigger simultaneously
        // with the one that just fired.
        while self.waiters.first().is_some_and(|w| w.diff == 0) {
            let w = self.waiters.remove(0);
            tasks.get(w.task).set_wait_result(token, WakeReason::Satisfied);
        }
    }

    /// `Delete`/`Clear`: resume every waiter with a failure return. Per
    /// spec.md §4.9 a departing waiter's residual differential is folded
    /// into its successor so the invariant (`sum of differentials ==
    /// absolute trigger count of the deepest waiter`) still holds for
    /// whoever is left; since `clear` removes everyone at once this
    /// reduces to simply resetting the list.
    pub fn clear(&mut self, tasks: &mut TaskTable, token: &mut CpuLockToken) {
        for w in self.waiters.drain(..) {
            tasks.get(w.task).set_wait_result(token, WakeReason::Interrupted);
        }
    }

    /// Remove a single waiter before it is satisfied (used by a timed
    /// wait's timeout path), folding its differential into its successor.
    pub fn cancel_wait(&mut self, task: TaskId) {
        let Some(idx) = self.waiters.iter().position(|w| w.task == task) else {
            return;
        };
        let w = self.waiters.remove(idx);
        if let Some(next) = self.waiters.get_mut(idx) {
            next.diff += w.diff;
        }
    }
}

impl Default for EventQueueCb {
    fn default() -> Self {
        Self::new()
    }
}

pub fn create(table: &mut EventQueueTable) -> KResult<EventQueueId> {
    table.insert(EventQueueCb::new()).ok_or(KernelError::OutOfControlBlocks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;

    #[derive(Clone, Debug)]
    enum Op {
        Wait(u32),
        Signal(u32),
    }

    impl quickcheck::Arbitrary for Op {
        fn arbitrary(g: &mut quickcheck::Gen) -> Self {
            if bool::arbitrary(g) {
                Op::Wait(u32::arbitrary(g) % 50 + 1)
            } else {
                Op::Signal(u32::arbitrary(g) % 20 + 1)
            }
        }
    }

    /// Bounded so the number of `Wait` ops never exceeds the fixed-capacity
    /// task table/waiter list (`NUM_TASKS`).
    #[derive(Clone, Debug)]
    struct Ops(Vec<Op>);

    impl quickcheck::Arbitrary for Ops {
        fn arbitrary(g: &mut quickcheck::Gen) -> Self {
            let mut ops = Vec::arbitrary(g);
            ops.truncate(30);
            Ops(ops)
        }
    }

    /// Checks the differential-countdown invariant under random interleaved
    /// `Wait`/`Signal` sequences: a waiter is resumed exactly once its
    /// absolute target is reached by the running signal count, never
    /// before and never more than once.
    #[quickcheck]
    fn matches_reference_model_under_random_operations(ops: Ops) -> bool {
        let mut eq = EventQueueCb::new();
        let mut tasks = TaskTable::new();
        let mut pending: Vec<(TaskId, u32)> = Vec::new();
        unsafe {
            let mut token = CpuLockToken::new_unchecked();
            for op in ops.0 {
                match op {
                    Op::Wait(offset) => {
                        let t = tasks.spawn_for_test(5);
                        let target = eq.count() + offset;
                        if eq.wait(t, target).unwrap() {
                            if tasks.get(t).take_wait_result(&mut token).is_some() {
                                return false;
                            }
                        } else {
                            pending.push((t, target));
                        }
                    }
                    Op::Signal(n) => {
                        eq.signal(&mut tasks, &mut token, n);
                    }
                }
                let mut still_pending = Vec::new();
                for (t, target) in pending.drain(..) {
                    let got = tasks.get(t).take_wait_result(&mut token);
                    if target <= eq.count() {
                        if got != Some(WakeReason::Satisfied) {
                            return false;
                        }
                    } else {
                        if got.is_some() {
                            return false;
                        }
                        still_pending.push((t, target));
                    }
                }
                pending = still_pending;
            }
        }
        true
    }

    #[test]
    fn signal_resumes_waiter_once_target_reached() {
        let mut eq = EventQueueCb::new();
        let mut tasks = TaskTable::new();
        unsafe {
            let mut token = CpuLockToken::new_unchecked();
            let t = tasks.spawn_for_test(5);
            assert_eq!(eq.wait(t, 3).unwrap(), false);
            eq.signal(&mut tasks, &mut token, 2);
            assert_eq!(tasks.get(t).take_wait_result(&mut token), None);
            eq.signal(&mut tasks, &mut token, 1);
            assert_eq!(
                tasks.get(t).take_wait_result(&mut token),
                Some(WakeReason::Satisfied)
            );
        }
    }

    #[test]
    fn already_met_target_does_not_block() {
        let mut eq = EventQueueCb::new();
        let mut tasks = TaskTable::new();
        unsafe {
            let mut token = CpuLockToken::new_unchecked();
            eq.signal(&mut tasks, &mut token, 5);
            let t = tasks.spawn_for_test(5);
            assert_eq!(eq.wait(t, 3).unwrap(), true);
        }
    }

    #[test]
    fn simultaneous_triggers_cascade_on_one_signal() {
        let mut eq = EventQueueCb::new();
        let mut tasks = TaskTable::new();
        unsafe {
            let mut token = CpuLockToken::new_unchecked();
            let a = tasks.spawn_for_test(5);
            let b = tasks.spawn_for_test(5);
            eq.wait(a, 2).unwrap();
            eq.wait(b, 2).unwrap();
            eq.signal(&mut tasks, &mut token, 2);
            assert_eq!(
                tasks.get(a).take_wait_result(&mut token),
                Some(WakeReason::Satisfied)
            );
            assert_eq!(
                tasks.get(b).take_wait_result(&mut token),
                Some(WakeReason::Satisfied)
            );
        }
    }

    #[test]
    fn clear_fails_every_waiter() {
        let mut eq = EventQueueCb::new();
        let mut tasks = TaskTable::new();
        unsafe {
            let mut token = CpuLockToken::new_unchecked();
            let a = tasks.spawn_for_test(5);
            eq.wait(a, 10).unwrap();
            eq.clear(&mut tasks, &mut token);
            assert_eq!(
                tasks.get(a).take_wait_result(&mut token),
                Some(WakeReason::Interrupted)
            );
        }
    }
}
