//! The ready queue: one FIFO per priority level plus a cached pointer at the
//! highest non-empty level (spec.md §3 "Ready queue", §4.1).
//!
//! Grounded in the teacher's `task/readyqueue.rs` `BitmapQueue`: a
//! [`crate::utils::prio_bitmap::PrioBitmap`] tracks which levels are
//! non-empty so `top()` is an O(1)-ish bit scan instead of a linear walk,
//! and each level is an intrusive singly-linked FIFO threaded through
//! `Tcb::queue_link` (see `task/mod.rs`) rather than an owned list of task
//! handles, so pushing/popping never allocates and never touches a level
//! other than the one being mutated.

use crate::config::NUM_PRIORITIES;
use crate::lock::CpuLockToken;
use crate::utils::prio_bitmap::PrioBitmap;

use super::{TaskId, TaskPool};

const BITMAP_WORDS: usize = (NUM_PRIORITIES + usize::BITS as usize - 1) / usize::BITS as usize;

/// Outcome of [`ReadyQueue::pop_front_task`]: whether the previously running
/// task should keep running, or a new task (possibly `None`, meaning "idle")
/// should be switched to. Mirrors the teacher's `ScheduleDecision`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleDecision {
    Keep,
    SwitchTo(Option<TaskId>),
}

pub struct ReadyQueue {
    heads: [Option<TaskId>; NUM_PRIORITIES],
    tails: [Option<TaskId>; NUM_PRIORITIES],
    bitmap: PrioBitmap<BITMAP_WORDS>,
}

impl ReadyQueue {
    pub const fn new() -> Self {
        Self {
            heads: [None; NUM_PRIORITIES],
            tails: [None; NUM_PRIORITIES],
            bitmap: PrioBitmap::new(NUM_PRIORITIES),
        }
    }

    /// The highest non-empty priority level, or `None` if the ready queue is
    /// entirely empty (`rqtop` in spec.md, except we return `Option` instead
    /// of "the lowest level when empty" since callers always branch on
    /// emptiness anyway).
    pub fn top_priority(&self) -> Option<usize> {
        self.bitmap.find_set()
    }

    pub fn is_empty(&self) -> bool {
        self.bitmap.is_empty()
    }

    /// True if some ready task has strictly higher priority (lower numeric
    /// value) than `than_priority` — used to decide whether an unblocked or
    /// re-prioritized task should preempt the current one.
    pub fn has_task_above(&self, than_priority: usize) -> bool {
        matches!(self.top_priority(), Some(p) if p < than_priority)
    }

    pub fn push_back(
        &mut self,
        pool: &mut TaskPool,
        token: &mut CpuLockToken,
        id: TaskId,
        priority: usize,
    ) {
        pool.get_mut(id).expect("stale TaskId").set_queue_link(token, None);
        match self.tails[priority] {
            Some(tail) => pool.get_mut(tail).expect("stale TaskId").set_queue_link(token, Some(id)),
            None => self.heads[priority] = Some(id),
        }
        self.tails[priority] = Some(id);
        self.bitmap.set(priority);
    }

    /// Pop the task at the front of `priority`. Returns the schedule
    /// decision appropriate when the caller was previously running a task at
    /// `prev_priority` (or `None` if nothing was running): `Keep` if the
    /// popped task is not actually higher priority than what was running
    /// (used by callers that peek `top_priority()` first and only pop when
    /// warranted), `SwitchTo` otherwise.
    pub fn pop_front_task(
        &mut self,
        pool: &mut TaskPool,
        token: &mut CpuLockToken,
        prev_priority: Option<usize>,
    ) -> ScheduleDecision {
        let Some(top) = self.top_priority() else {
            return ScheduleDecision::SwitchTo(None);
        };
        if let Some(prev) = prev_priority {
            if prev <= top {
                return ScheduleDecision::Keep;
            }
        }
        let id = self.heads[top].expect("bitmap said level was non-empty");
        let next = pool.get(id).expect("stale TaskId").queue_link(token);
        self.heads[top] = next;
        if next.is_none() {
            self.tails[top] = None;
            self.bitmap.clear(top);
        }
        pool.get_mut(id).expect("stale TaskId").set_queue_link(token, None);
        ScheduleDecision::SwitchTo(Some(id))
    }

    /// `TaskBump` (SPEC_FULL.md §E): move a ready task to the tail of its
    /// own priority level without changing its priority — a no-op if it is
    /// already the sole or last entry there.
    pub fn bump(&mut self, pool: &mut TaskPool, token: &mut CpuLockToken, id: TaskId, priority: usize) {
        if self.tails[priority] == Some(id) {
            return;
        }
        self.remove(pool, token, id, priority);
        self.push_back(pool, token, id, priority);
    }

    /// Remove a specific task from wherever it sits in its level's FIFO
    /// (used when a task's priority changes while ready, or it is stopped
    /// or deleted while ready).
    pub fn remove(
        &mut self,
        pool: &mut TaskPool,
        token: &mut CpuLockToken,
        id: TaskId,
        priority: usize,
    ) {
        if self.heads[priority] == Some(id) {
            let next = pool.get(id).expect("stale TaskId").queue_link(token);
            self.heads[priority] = next;
            if next.is_none() {
                self.tails[priority] = None;
                self.bitmap.clear(priority);
            }
            pool.get_mut(id).expect("stale TaskId").set_queue_link(token, None);
            return;
        }
        let mut cur = self.heads[priority];
        while let Some(c) = cur {
            let next = pool.get(c).expect("stale TaskId").queue_link(token);
            if next == Some(id) {
                let after = pool.get(id).expect("stale TaskId").queue_link(token);
                pool.get_mut(c).expect("stale TaskId").set_queue_link(token, after);
                if after.is_none() {
                    self.tails[priority] = Some(c);
                }
                pool.get_mut(id).expect("stale TaskId").set_queue_link(token, None);
                return;
            }
            cur = next;
        }
    }
}

impl Default for ReadyQueue {
    fn default() -> Self {
        Self::new()
    }
}
